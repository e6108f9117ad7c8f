//! Image codec adapter: bytes in, `RgbImage` out, and back to PNG.

use std::io::Cursor;
use std::path::Path;

use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use tracing::debug;

use crate::error::{Error, Result};

/// Side length of the square the generators were trained at.
pub const DEFAULT_RESOLUTION: u32 = 128;

/// Bicubic (Catmull-Rom) is the closest match to PIL's `Image.BICUBIC`.
pub const RESIZE_FILTER: FilterType = FilterType::CatmullRom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Video,
}

impl UploadKind {
    /// Classify an upload from its file-name hint. Only `.mp4` (any case) is video.
    pub fn from_file_name(name: &str) -> Self {
        let is_mp4 = Path::new(name)
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("mp4"))
            .unwrap_or(false);

        if is_mp4 {
            Self::Video
        } else {
            Self::Image
        }
    }
}

/// Decode any format `image` understands and drop alpha / convert to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(Error::Decode("input is empty".to_string()));
    }

    let decoded = image::load_from_memory(bytes)?;
    debug!(
        width = decoded.width(),
        height = decoded.height(),
        color = ?decoded.color(),
        "decoded input image"
    );
    Ok(decoded.to_rgb8())
}

/// Resize to `resolution × resolution`, ignoring aspect ratio.
/// Returns the input untouched when it already has the target size.
pub fn resize_square(image: &RgbImage, resolution: u32) -> RgbImage {
    if image.width() == resolution && image.height() == resolution {
        return image.clone();
    }
    image::imageops::resize(image, resolution, resolution, RESIZE_FILTER)
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buf.into_inner())
}
