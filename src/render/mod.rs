mod canvas;
mod sequence;

pub use canvas::{OverlayStyle, PageCanvas, PlateStyle, Surface, render_svg_bytes};
pub use sequence::{PlacedRegion, RenderedPage, order_regions, render_page};

use crate::settings::{LayoutMode, OverlaySettings};

impl OverlayStyle {
    pub fn from_settings(overlay: &OverlaySettings, mode: LayoutMode) -> Self {
        let plate = mode.draws_plate().then(|| PlateStyle {
            color: overlay.plate_color.clone(),
            opacity: overlay.plate_opacity.clamp(0.0, 1.0),
            padding: overlay.plate_padding as f32,
        });
        Self {
            erase_color: overlay.erase_color.clone(),
            text_color: overlay.text_color.clone(),
            plate,
            text_inset: overlay.text_inset as f32,
        }
    }
}
