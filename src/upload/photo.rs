use std::io::Cursor;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

/// Shrinks a photo for transfer over rural uplinks: cap the longest side at
/// `max_dimension` (aspect ratio preserved, never upscaled) and re-encode as
/// JPEG at the given quality.
pub fn prepare_for_upload(bytes: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes).context("failed to decode photo")?;

    let resized = if decoded.width() > max_dimension || decoded.height() > max_dimension {
        decoded.resize(max_dimension, max_dimension, FilterType::Triangle)
    } else {
        decoded
    };

    // JPEG has no alpha channel.
    let flattened = DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    flattened
        .write_with_encoder(encoder)
        .context("failed to re-encode photo as jpeg")?;
    Ok(out.into_inner())
}

/// Photo references carry platform URIs; the filesystem wants a bare path.
pub fn local_path(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([180, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn large_photos_shrink_to_the_cap() {
        let prepared = prepare_for_upload(&png_bytes(800, 600), 400, 50).unwrap();

        // JPEG magic.
        assert_eq!(&prepared[..2], &[0xFF, 0xD8]);

        let reopened = image::load_from_memory(&prepared).unwrap();
        assert_eq!(reopened.width(), 400);
        assert_eq!(reopened.height(), 300);
    }

    #[test]
    fn small_photos_keep_their_dimensions() {
        let prepared = prepare_for_upload(&png_bytes(100, 80), 400, 50).unwrap();
        let reopened = image::load_from_memory(&prepared).unwrap();
        assert_eq!((reopened.width(), reopened.height()), (100, 80));
    }

    #[test]
    fn garbage_input_is_an_error() {
        assert!(prepare_for_upload(b"not an image", 400, 50).is_err());
    }

    #[test]
    fn uri_scheme_is_stripped() {
        assert_eq!(local_path("file:///tmp/photo.jpg"), "/tmp/photo.jpg");
        assert_eq!(local_path("/tmp/photo.jpg"), "/tmp/photo.jpg");
    }
}
