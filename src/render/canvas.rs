use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{DynamicImage, ImageFormat};
use resvg::render;
use std::io::Cursor;
use std::sync::Arc;
use tiny_skia::Pixmap;
use usvg::{Options, Tree, fontdb};

use crate::bubble::{BBoxPx, Region};
use crate::layout::{LayoutPlan, OverlayFonts};

/// Where the render passes draw.
pub trait Surface {
    /// Pass 1: hide the source text under an opaque fill.
    fn erase(&mut self, bbox: BBoxPx);
    /// Pass 2: draw the laid-out translation inside the region.
    fn draw_text(&mut self, region: &Region, plan: &LayoutPlan);
}

/// Translucent backing plate behind the text block.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateStyle {
    pub color: String,
    pub opacity: f32,
    pub padding: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub erase_color: String,
    pub text_color: String,
    /// `None` draws text straight onto the erased fill.
    pub plate: Option<PlateStyle>,
    pub text_inset: f32,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            erase_color: "#ffffff".to_string(),
            text_color: "#000000".to_string(),
            plate: Some(PlateStyle {
                color: "#ffffff".to_string(),
                opacity: 0.47,
                padding: 3.0,
            }),
            text_inset: 5.0,
        }
    }
}

/// SVG document over the source page. Elements are painted in the order
/// they are added.
pub struct PageCanvas {
    width: u32,
    height: u32,
    data_uri: String,
    style: OverlayStyle,
    fonts: OverlayFonts,
    elements: Vec<String>,
    clip_count: usize,
}

impl PageCanvas {
    pub fn new(
        image_bytes: &[u8],
        image_mime: &str,
        width: u32,
        height: u32,
        style: OverlayStyle,
        fonts: OverlayFonts,
    ) -> Self {
        let data_uri = format!("data:{};base64,{}", image_mime, BASE64.encode(image_bytes));
        Self {
            width,
            height,
            data_uri,
            style,
            fonts,
            elements: Vec::new(),
            clip_count: 0,
        }
    }

    pub fn finish(self) -> String {
        let mut svg = String::new();
        svg.push_str(&format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
            w = self.width,
            h = self.height
        ));
        svg.push_str(&format!(
            r#"<image href="{uri}" xlink:href="{uri}" x="0" y="0" width="{w}" height="{h}" preserveAspectRatio="none"/>"#,
            uri = self.data_uri,
            w = self.width,
            h = self.height
        ));
        for element in &self.elements {
            svg.push_str(element);
        }
        svg.push_str("</svg>");
        svg
    }
}

impl Surface for PageCanvas {
    fn erase(&mut self, bbox: BBoxPx) {
        self.elements.push(format!(
            r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="{fill}"/>"#,
            x = bbox.x,
            y = bbox.y,
            w = bbox.w,
            h = bbox.h,
            fill = escape_xml(&self.style.erase_color)
        ));
    }

    fn draw_text(&mut self, region: &Region, plan: &LayoutPlan) {
        let bbox = region.bbox;
        let text_x = bbox.x as f32 + self.style.text_inset;
        let text_top = bbox.y as f32 + plan.origin_y;

        if let Some(plate) = &self.style.plate {
            self.elements.push(format!(
                r#"<rect x="{x}" y="{y}" width="{w}" height="{h}" fill="{fill}" fill-opacity="{opacity}"/>"#,
                x = text_x - plate.padding,
                y = text_top - plate.padding,
                w = plan.text_width + plate.padding * 2.0,
                h = plan.text_height + plate.padding * 2.0,
                fill = escape_xml(&plate.color),
                opacity = plate.opacity
            ));
        }

        let clip_id = format!("bubble-clip-{}", self.clip_count);
        self.clip_count += 1;
        let mut block = format!(
            r#"<clipPath id="{id}"><rect x="{x}" y="{y}" width="{w}" height="{h}"/></clipPath>"#,
            id = clip_id,
            x = bbox.x,
            y = bbox.y,
            w = bbox.w,
            h = bbox.h
        );
        let family = self
            .fonts
            .for_kind(region.kind)
            .family
            .as_deref()
            .map(|family| format!(r#" font-family="{}""#, escape_xml(family)))
            .unwrap_or_default();
        block.push_str(&format!(
            r#"<text font-size="{size}" fill="{color}"{family} clip-path="url(#{clip})">"#,
            size = plan.font_size,
            color = escape_xml(&self.style.text_color),
            family = family,
            clip = clip_id
        ));
        for (idx, line) in plan.lines.iter().enumerate() {
            let baseline = text_top + plan.ascent + plan.line_height * idx as f32;
            block.push_str(&format!(
                r#"<tspan x="{x}" y="{y}">{text}</tspan>"#,
                x = text_x,
                y = baseline,
                text = escape_xml(line)
            ));
        }
        block.push_str("</text>");
        self.elements.push(block);
    }
}

/// Rasterises the canvas and encodes it as `format`.
pub fn render_svg_bytes(svg: &str, format: ImageFormat, font_data: &[&[u8]]) -> Result<Vec<u8>> {
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    for data in font_data {
        db.load_font_data(data.to_vec());
    }
    let options = Options {
        fontdb: Arc::new(db),
        ..Options::default()
    };
    let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse SVG")?;
    let size = tree.size().to_int_size();
    let mut pixmap =
        Pixmap::new(size.width(), size.height()).ok_or_else(|| anyhow!("empty SVG size"))?;
    render(&tree, tiny_skia::Transform::identity(), &mut pixmap.as_mut());
    let rgba = image::RgbaImage::from_raw(size.width(), size.height(), pixmap.data().to_vec())
        .ok_or_else(|| anyhow!("failed to build image buffer from SVG"))?;
    let image = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(rgba).to_rgb8()),
        _ => DynamicImage::ImageRgba8(rgba),
    };
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), format)
        .with_context(|| "failed to encode rendered page")?;
    Ok(bytes)
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
