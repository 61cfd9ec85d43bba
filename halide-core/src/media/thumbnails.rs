//! Thumbnail generation.

use std::fs;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct ThumbnailOptions {
    /// Longest edge of the output in pixels.
    pub size_px: u32,
    /// JPEG quality, 1-100.
    pub quality: u8,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            size_px: 256,
            quality: 85,
        }
    }
}

/// Decode `source`, resize to fit `size_px` preserving aspect ratio, and
/// write a JPEG to `dest`. Parent directories are created as needed.
pub fn generate_thumbnail(source: &Path, dest: &Path, opts: &ThumbnailOptions) -> Result<()> {
    let img = image::open(source)?;
    let resized = resize_to_fit(&img, opts.size_px);

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut output = fs::File::create(dest)?;
    let encoder = JpegEncoder::new_with_quality(&mut output, opts.quality);
    resized.to_rgb8().write_with_encoder(encoder)?;
    Ok(())
}

fn resize_to_fit(img: &DynamicImage, target: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    let (new_width, new_height) = if width >= height {
        let ratio = f64::from(target) / f64::from(width.max(1));
        (target, ((f64::from(height) * ratio) as u32).max(1))
    } else {
        let ratio = f64::from(target) / f64::from(height.max(1));
        (((f64::from(width) * ratio) as u32).max(1), target)
    };
    img.resize_exact(new_width, new_height, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_test_image(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let v = ((x + y) % 256) as u8;
            Rgb([v, v, v])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn landscape_thumbnail_fits_the_target_edge() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("wide.png");
        write_test_image(&source, 640, 360);

        let dest = dir.path().join("thumbs/wide.jpg");
        generate_thumbnail(&source, &dest, &ThumbnailOptions::default()).unwrap();

        let thumb = image::open(&dest).unwrap();
        assert_eq!(thumb.dimensions().0, 256);
        assert!(thumb.dimensions().1 < 256);
    }

    #[test]
    fn portrait_thumbnail_fits_the_target_edge() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("tall.png");
        write_test_image(&source, 300, 600);

        let dest = dir.path().join("tall.jpg");
        let opts = ThumbnailOptions {
            size_px: 128,
            quality: 70,
        };
        generate_thumbnail(&source, &dest, &opts).unwrap();

        let thumb = image::open(&dest).unwrap();
        assert_eq!(thumb.dimensions().1, 128);
        assert!(thumb.dimensions().0 < 128);
    }

    #[test]
    fn undecodable_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("garbage.jpg");
        std::fs::write(&source, b"not jpeg bytes").unwrap();
        let dest = dir.path().join("out.jpg");
        assert!(generate_thumbnail(&source, &dest, &ThumbnailOptions::default()).is_err());
    }
}
