use tracing::{debug, info};

use super::{BBoxPx, BubbleKind, GeometryError, RawDetection, Region};

/// Cleanup rules applied to raw detections before merging.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub min_confidence: f32,
    pub padding: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub font_hint_floor: u32,
    pub font_hint_scale: f32,
    pub font_hint_blend: f32,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            padding: 10,
            min_width: 50,
            min_height: 30,
            font_hint_floor: 40,
            font_hint_scale: 3.0,
            font_hint_blend: 0.7,
        }
    }
}

/// Turns detector output into page regions.
///
/// Low-confidence, undersized and degenerate boxes are dropped here so the
/// merge step only ever sees valid rectangles inside the page.
pub fn ingest_detections(
    detections: &[RawDetection],
    page_width: u32,
    page_height: u32,
    options: &IngestOptions,
) -> Vec<Region> {
    let mut regions = Vec::new();
    for (idx, detection) in detections.iter().enumerate() {
        match region_from_detection(detection, page_width, page_height, options) {
            Ok(region) => {
                debug!(
                    "detection {}: '{}' (confidence={:.2}) -> {}x{} at ({}, {}), hint={}",
                    idx,
                    region.source_text,
                    region.confidence,
                    region.bbox.w,
                    region.bbox.h,
                    region.bbox.x,
                    region.bbox.y,
                    region.font_hint
                );
                regions.push(region);
            }
            Err(err) => debug!("detection {} discarded: {}", idx, err),
        }
    }
    normalize_font_hints(&mut regions, options);
    info!("ingested {} of {} detections", regions.len(), detections.len());
    regions
}

fn region_from_detection(
    detection: &RawDetection,
    page_width: u32,
    page_height: u32,
    options: &IngestOptions,
) -> Result<Region, GeometryError> {
    if detection.confidence < options.min_confidence {
        return Err(GeometryError::LowConfidence {
            confidence: detection.confidence,
            min: options.min_confidence,
        });
    }

    let (min_x, max_x) = span(detection.quad.iter().map(|point| point[0]));
    let (min_y, max_y) = span(detection.quad.iter().map(|point| point[1]));
    let pad = options.padding as i64;

    let x = (min_x as i64).saturating_sub(pad);
    let y = (min_y as i64).saturating_sub(pad);
    let text_height = (max_y - min_y) as i64;
    let width = ((max_x - min_x) as i64).saturating_add(pad.saturating_mul(2));
    let height = text_height.saturating_add(pad.saturating_mul(2));
    check_min_size(width, height, options)?;

    let x1 = x.clamp(0, page_width as i64);
    let y1 = y.clamp(0, page_height as i64);
    let x2 = x.saturating_add(width).clamp(0, page_width as i64);
    let y2 = y.saturating_add(height).clamp(0, page_height as i64);
    if x2 <= x1 || y2 <= y1 {
        return Err(GeometryError::Degenerate {
            width: x2 - x1,
            height: y2 - y1,
        });
    }
    // Clamping to the page edge can shrink a box below the minimum again.
    check_min_size(x2 - x1, y2 - y1, options)?;
    let bbox = BBoxPx::new(x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32)?;

    let estimated = (text_height.max(0) as f32 * options.font_hint_scale) as u32;
    Ok(Region {
        bbox,
        kind: classify_kind(&detection.text),
        source_text: detection.text.trim().to_string(),
        confidence: detection.confidence.clamp(0.0, 1.0),
        font_hint: estimated.max(options.font_hint_floor).max(1),
    })
}

fn check_min_size(width: i64, height: i64, options: &IngestOptions) -> Result<(), GeometryError> {
    if width < options.min_width as i64 || height < options.min_height as i64 {
        return Err(GeometryError::TooSmall {
            width,
            height,
            min_width: options.min_width,
            min_height: options.min_height,
        });
    }
    Ok(())
}

fn span(values: impl Iterator<Item = f32>) -> (f32, f32) {
    values.fold((f32::MAX, f32::MIN), |(lo, hi), value| {
        (lo.min(value), hi.max(value))
    })
}

/// Pulls every hint towards the page median so bubbles read at similar sizes.
fn normalize_font_hints(regions: &mut [Region], options: &IngestOptions) {
    if regions.is_empty() {
        return;
    }
    let mut hints = regions.iter().map(|region| region.font_hint).collect::<Vec<_>>();
    hints.sort_unstable();
    let median = hints[hints.len() / 2];
    let target = median.max(options.font_hint_floor) as f32;
    let blend = options.font_hint_blend.clamp(0.0, 1.0);
    debug!(
        "font hints: range {}-{}, median {} -> target {}",
        hints[0],
        hints[hints.len() - 1],
        median,
        target
    );

    for region in regions.iter_mut() {
        let original = region.font_hint;
        let normalized = (blend * target + (1.0 - blend) * original as f32) as u32;
        region.font_hint = normalized.max(options.font_hint_floor).max(1);
        debug!("font hint {} -> {}", original, region.font_hint);
    }
}

/// Shouting is marked by exclamation, whispers and thoughts by ellipses or
/// parentheses.
pub fn classify_kind(text: &str) -> BubbleKind {
    if text.contains('!') || text.contains('！') {
        return BubbleKind::Shout;
    }
    if text.contains("...") || text.contains('…') || text.contains('(') || text.contains(')') {
        return BubbleKind::Whisper;
    }
    BubbleKind::Normal
}
