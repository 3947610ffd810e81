use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, GenericImageView};

use crate::error::{EngineError, Result};

const MAX_VISION_DIM: u32 = 1920;

/// Screenshot re-encoded for the vision endpoints.
///
/// Large captures are shrunk to at most `MAX_VISION_DIM` wide; `scale` maps
/// coordinates in the shrunk image back onto the real screen.
#[derive(Debug, Clone)]
pub struct VisionImage {
    pub base64: String,
    pub scale: f64,
    pub width: u32,
    pub height: u32,
}

pub fn prepare_for_vision(raw: &[u8]) -> Result<VisionImage> {
    let img = image::load_from_memory(raw)
        .map_err(|e| EngineError::Driver(format!("screenshot decode failed: {}", e)))?;

    let (orig_w, _) = img.dimensions();
    let scale = if orig_w > MAX_VISION_DIM {
        orig_w as f64 / MAX_VISION_DIM as f64
    } else {
        1.0
    };

    let resized = if scale > 1.0 {
        img.resize(MAX_VISION_DIM, u32::MAX, image::imageops::FilterType::Triangle)
    } else {
        img
    };
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let (width, height) = rgb.dimensions();

    let mut buffer = Cursor::new(Vec::new());
    rgb.write_to(&mut buffer, image::ImageOutputFormat::Jpeg(80))
        .map_err(|e| EngineError::Driver(format!("screenshot encode failed: {}", e)))?;

    Ok(VisionImage {
        base64: general_purpose::STANDARD.encode(buffer.get_ref()),
        scale,
        width,
        height,
    })
}

#[cfg(test)]
pub(crate) fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(width, height, image::Rgb([200, 10, 10])));
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, image::ImageOutputFormat::Png).unwrap();
    buffer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_capture_keeps_scale() {
        let vision = prepare_for_vision(&png_fixture(64, 32)).unwrap();
        assert_eq!(vision.scale, 1.0);
        assert_eq!((vision.width, vision.height), (64, 32));
        assert!(!vision.base64.is_empty());
    }

    #[test]
    fn wide_capture_is_shrunk() {
        let vision = prepare_for_vision(&png_fixture(3840, 100)).unwrap();
        assert_eq!(vision.width, 1920);
        assert!((vision.scale - 2.0).abs() < 1e-9);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(prepare_for_vision(b"not an image").is_err());
    }
}
