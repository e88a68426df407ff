use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};

use liveface_core::ImageFrame;

use crate::error::ArtifactError;

/// Downscale a frame so its longest edge is at most `max_dim`, then encode it
/// as JPEG.
pub fn encode_jpeg(frame: &ImageFrame, max_dim: u32, quality: u8) -> Result<Vec<u8>, ArtifactError> {
    let malformed = || ArtifactError::MalformedFrame {
        width: frame.width,
        height: frame.height,
        len: frame.data.len(),
    };
    if !frame.is_well_formed() || frame.width == 0 || frame.height == 0 {
        return Err(malformed());
    }
    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(malformed)?;

    let longest = frame.width.max(frame.height);
    let image = if max_dim > 0 && longest > max_dim {
        let scale = max_dim as f32 / longest as f32;
        let width = ((frame.width as f32 * scale).round() as u32).max(1);
        let height = ((frame.height as f32 * scale).round() as u32).max(1);
        image::imageops::resize(&image, width, height, FilterType::Triangle)
    } else {
        image
    };

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> ImageFrame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 128]);
            }
        }
        ImageFrame::new(width, height, data)
    }

    #[test]
    fn test_encodes_jpeg() {
        let bytes = encode_jpeg(&gradient(64, 48), 640, 85).unwrap();
        // JPEG SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_downscales_longest_edge() {
        let bytes = encode_jpeg(&gradient(200, 100), 50, 85).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (50, 25));
    }

    #[test]
    fn test_rejects_malformed_buffer() {
        let frame = ImageFrame::new(10, 10, vec![0; 12]);
        assert!(matches!(
            encode_jpeg(&frame, 640, 85),
            Err(ArtifactError::MalformedFrame { .. })
        ));
    }
}
