mod geom;
mod ingest;
mod merge;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use geom::{contains, iou, union_bbox};
pub use ingest::{IngestOptions, classify_kind, ingest_detections};
pub use merge::merge_regions;

/// Axis-aligned rectangle in page pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBoxPx {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BBoxPx {
    /// Builds a rectangle, rejecting zero-area input.
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Result<Self, GeometryError> {
        if w == 0 || h == 0 {
            return Err(GeometryError::Degenerate {
                width: w as i64,
                height: h as i64,
            });
        }
        Ok(Self { x, y, w, h })
    }

    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BubbleKind {
    Normal,
    Shout,
    Whisper,
}

impl BubbleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BubbleKind::Normal => "normal",
            BubbleKind::Shout => "shout",
            BubbleKind::Whisper => "whisper",
        }
    }
}

/// One speech bubble on the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub bbox: BBoxPx,
    pub kind: BubbleKind,
    pub source_text: String,
    pub confidence: f32,
    pub font_hint: u32,
}

/// A detection as reported by the OCR collaborator, before any cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub quad: [[f32; 2]; 4],
    pub text: String,
    pub confidence: f32,
}

impl RawDetection {
    pub fn from_bbox(bbox: BBoxPx, text: impl Into<String>, confidence: f32) -> Self {
        let (x1, y1) = (bbox.x as f32, bbox.y as f32);
        let (x2, y2) = (bbox.right() as f32, bbox.bottom() as f32);
        Self {
            quad: [[x1, y1], [x2, y1], [x2, y2], [x1, y2]],
            text: text.into(),
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("degenerate rectangle ({width}x{height})")]
    Degenerate { width: i64, height: i64 },
    #[error("confidence {confidence:.2} below {min:.2}")]
    LowConfidence { confidence: f32, min: f32 },
    #[error("rectangle {width}x{height} smaller than {min_width}x{min_height}")]
    TooSmall {
        width: i64,
        height: i64,
        min_width: u32,
        min_height: u32,
    },
}
