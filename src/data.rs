use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::Path;

pub const PNG_MIME: &str = "image/png";

/// Binary payload handed to an oracle alongside text.
#[derive(Debug, Clone, PartialEq)]
pub struct DataAttachment {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub name: Option<String>,
}

impl DataAttachment {
    /// Encodes an in-memory image as PNG.
    pub fn png(image: &DynamicImage, name: impl Into<String>) -> Result<Self> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .with_context(|| "failed to encode image as png")?;
        Ok(Self {
            bytes,
            mime: PNG_MIME.to_string(),
            name: Some(name.into()),
        })
    }
}

/// Reads an image file, keeping its original encoding.
pub fn load_image_attachment(path: &Path) -> Result<DataAttachment> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read image: {}", path.display()))?;
    let mime = sniff_image_mime(&bytes)
        .ok_or_else(|| anyhow!("unsupported image format: {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .map(|value| value.to_string());
    Ok(DataAttachment {
        bytes,
        mime: mime.to_string(),
        name,
    })
}

pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes).ok().map(|format| format.to_mime_type())
}
