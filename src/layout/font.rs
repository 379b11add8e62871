use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::sync::Arc;
use ttf_parser::Face;
use ttf_parser::name_id;
use usvg::fontdb;

use crate::bubble::BubbleKind;

/// Glyphs whose combined extent defines the line height.
const REFERENCE_GLYPHS: [char; 2] = ['A', 'y'];

/// Pixel measurements the fitter needs from a font.
pub trait TextMeasure {
    fn text_width(&self, text: &str, font_size: f32) -> f32;
    /// Distance from the top of a line to its baseline.
    fn ascent(&self, font_size: f32) -> f32;
    /// Ascent plus the deepest descent of the reference glyphs.
    fn line_height(&self, font_size: f32) -> f32;
}

#[derive(Clone)]
pub struct FontMetrics {
    data: Arc<Vec<u8>>,
    units_per_em: u16,
    space_advance: u16,
    ascender: i16,
    reference_bottom: i16,
    family: Option<String>,
    face_index: u32,
}

impl std::fmt::Debug for FontMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontMetrics")
            .field("family", &self.family)
            .field("units_per_em", &self.units_per_em)
            .field("face_index", &self.face_index)
            .finish()
    }
}

impl FontMetrics {
    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn scale(&self, font_size: f32) -> f32 {
        font_size / self.units_per_em.max(1) as f32
    }
}

impl TextMeasure for FontMetrics {
    fn text_width(&self, text: &str, font_size: f32) -> f32 {
        let Ok(face) = Face::parse(&self.data, self.face_index) else {
            return EstimatedMetrics.text_width(text, font_size);
        };
        let mut advance = 0u32;
        for ch in text.chars() {
            if ch == '\n' {
                continue;
            }
            if ch == ' ' {
                advance = advance.saturating_add(self.space_advance as u32);
                continue;
            }
            let glyph_advance = face
                .glyph_index(ch)
                .and_then(|glyph| face.glyph_hor_advance(glyph))
                .unwrap_or(self.space_advance);
            advance = advance.saturating_add(glyph_advance as u32);
        }
        advance as f32 * self.scale(font_size)
    }

    fn ascent(&self, font_size: f32) -> f32 {
        self.ascender as f32 * self.scale(font_size)
    }

    fn line_height(&self, font_size: f32) -> f32 {
        (self.ascender as f32 - self.reference_bottom as f32) * self.scale(font_size)
    }
}

/// Character-class estimate used when no font file is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimatedMetrics;

impl EstimatedMetrics {
    const ASCENT: f32 = 0.95;
    const DESCENT: f32 = 0.2;
}

impl TextMeasure for EstimatedMetrics {
    fn text_width(&self, text: &str, font_size: f32) -> f32 {
        text.chars().map(estimate_char_units).sum::<f32>() * font_size
    }

    fn ascent(&self, font_size: f32) -> f32 {
        font_size * Self::ASCENT
    }

    fn line_height(&self, font_size: f32) -> f32 {
        font_size * (Self::ASCENT + Self::DESCENT)
    }
}

fn estimate_char_units(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.25
    } else if ch.is_ascii_alphanumeric() {
        0.55
    } else if ch.is_ascii() {
        0.35
    } else if matches!(
        ch as u32,
        0x4E00..=0x9FFF | 0x3040..=0x30FF | 0x31F0..=0x31FF | 0xAC00..=0xD7AF
    ) {
        1.0
    } else {
        0.9
    }
}

/// A font as used by the renderer: metrics for layout, family for SVG.
#[derive(Debug, Clone, Default)]
pub struct OverlayFont {
    pub metrics: Option<FontMetrics>,
    pub family: Option<String>,
}

impl OverlayFont {
    pub fn measure(&self) -> &dyn TextMeasure {
        match &self.metrics {
            Some(metrics) => metrics,
            None => &EstimatedMetrics,
        }
    }

    pub fn font_data(&self) -> Option<&[u8]> {
        self.metrics.as_ref().map(|metrics| metrics.data())
    }
}

/// One font per bubble kind.
#[derive(Debug, Clone, Default)]
pub struct OverlayFonts {
    pub normal: OverlayFont,
    pub shout: OverlayFont,
    pub whisper: OverlayFont,
}

impl OverlayFonts {
    pub fn for_kind(&self, kind: BubbleKind) -> &OverlayFont {
        match kind {
            BubbleKind::Normal => &self.normal,
            BubbleKind::Shout => &self.shout,
            BubbleKind::Whisper => &self.whisper,
        }
    }

    /// Distinct font files to register with the rasteriser.
    pub fn font_data(&self) -> Vec<&[u8]> {
        let mut seen: Vec<&[u8]> = Vec::new();
        for font in [&self.normal, &self.shout, &self.whisper] {
            if let Some(data) = font.font_data()
                && !seen
                    .iter()
                    .any(|known| std::ptr::eq(*known, data) || *known == data)
            {
                seen.push(data);
            }
        }
        seen
    }
}

pub fn load_font_metrics(path: &Path) -> Result<FontMetrics> {
    let data =
        std::fs::read(path).with_context(|| format!("failed to read font: {}", path.display()))?;
    load_font_metrics_from_data(&data)
        .map_err(|err| anyhow!("failed to parse font: {} ({})", path.display(), err))
}

#[cfg(target_os = "macos")]
pub fn overlay_fallback_fonts() -> &'static [&'static str] {
    &["NotoSans", "Apple SD Gothic Neo", "sans-serif"]
}

#[cfg(target_os = "windows")]
pub fn overlay_fallback_fonts() -> &'static [&'static str] {
    &["NotoSans", "Malgun Gothic", "sans-serif"]
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub fn overlay_fallback_fonts() -> &'static [&'static str] {
    &["NotoSans", "DejaVu Sans", "sans-serif"]
}

/// Resolves a font from an explicit file, a family name, or the fallback list.
pub fn resolve_overlay_font(
    font_path: Option<&Path>,
    font_family: Option<&str>,
    fallback: &[&str],
) -> Result<OverlayFont> {
    if let Some(path) = font_path {
        let metrics = load_font_metrics(path)?;
        let family = metrics
            .family()
            .map(|name| name.to_string())
            .or_else(|| font_family.map(|name| name.to_string()));
        return Ok(OverlayFont {
            metrics: Some(metrics),
            family,
        });
    }

    let mut db = fontdb::Database::new();
    db.load_system_fonts();

    if let Some(family) = font_family {
        return load_font_from_family(&db, family);
    }

    for candidate in fallback {
        if let Ok(resolved) = load_font_from_family(&db, candidate) {
            return Ok(resolved);
        }
    }

    Err(anyhow!("no fallback fonts found"))
}

/// Metrics of the first parseable face in `data` (collections included).
fn load_font_metrics_from_data(data: &[u8]) -> Result<FontMetrics> {
    let count = ttf_parser::fonts_in_collection(data).unwrap_or(1);
    for index in 0..count {
        let Ok(face) = Face::parse(data, index) else {
            continue;
        };
        let units_per_em = face.units_per_em().max(1);
        let space_advance = face
            .glyph_index(' ')
            .and_then(|id| face.glyph_hor_advance(id))
            .unwrap_or(units_per_em / 2);
        let reference_bottom = REFERENCE_GLYPHS
            .iter()
            .filter_map(|ch| face.glyph_index(*ch))
            .filter_map(|glyph| face.glyph_bounding_box(glyph))
            .map(|bbox| bbox.y_min)
            .min()
            .unwrap_or_else(|| face.descender())
            .min(0);
        return Ok(FontMetrics {
            data: Arc::new(data.to_vec()),
            units_per_em,
            space_advance,
            ascender: face.ascender(),
            reference_bottom,
            family: extract_family_name(&face),
            face_index: index,
        });
    }
    Err(anyhow!("failed to parse font data"))
}

fn load_font_from_family(db: &fontdb::Database, family: &str) -> Result<OverlayFont> {
    let families = if family.eq_ignore_ascii_case("sans-serif") {
        vec![fontdb::Family::SansSerif]
    } else {
        vec![fontdb::Family::Name(family)]
    };
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let data = db
        .with_face_data(id, |data, _index| data.to_vec())
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    let metrics = load_font_metrics_from_data(&data)?;
    let resolved_family = metrics
        .family()
        .map(|name| name.to_string())
        .unwrap_or_else(|| family.to_string());
    Ok(OverlayFont {
        metrics: Some(metrics),
        family: Some(resolved_family),
    })
}

fn extract_family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}
