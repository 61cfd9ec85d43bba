//! Heuristic image quality scoring.
//!
//! Combines Laplacian-variance sharpness, mean-luminance exposure, and an
//! aspect-ratio composition heuristic into a 0-100 score.

use std::path::Path;

use image::{DynamicImage, GenericImageView, GrayImage};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityBreakdown {
    /// 0.0-1.0
    pub sharpness: f64,
    /// 0.0-1.0
    pub exposure: f64,
    /// 0.0-1.0
    pub composition: f64,
    /// Weighted overall score, 0-100.
    pub overall: i32,
}

pub fn score_path(path: &Path) -> Result<QualityBreakdown> {
    let img = image::open(path)?;
    Ok(score_image(&img))
}

pub fn score_image(img: &DynamicImage) -> QualityBreakdown {
    let sharpness = sharpness_score(img);
    let exposure = exposure_score(img);
    let composition = composition_score(img);

    let overall = 100.0 * (sharpness * 0.4 + exposure * 0.3 + composition * 0.3);
    QualityBreakdown {
        sharpness,
        exposure,
        composition,
        overall: (overall.round() as i32).clamp(0, 100),
    }
}

fn sharpness_score(img: &DynamicImage) -> f64 {
    let gray = img.to_luma8();
    // Variance of the Laplacian response; 1000 is a rough calibration point
    // for "fully sharp" consumer photos.
    (laplacian_variance(&gray) / 1000.0).min(1.0)
}

fn laplacian_variance(image: &GrayImage) -> f64 {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut sum = 0.0;
    let mut count = 0u64;
    for y in 1..(height - 1) {
        for x in 1..(width - 1) {
            let center = f64::from(image.get_pixel(x, y)[0]);
            let response = 4.0 * center
                - f64::from(image.get_pixel(x - 1, y)[0])
                - f64::from(image.get_pixel(x + 1, y)[0])
                - f64::from(image.get_pixel(x, y - 1)[0])
                - f64::from(image.get_pixel(x, y + 1)[0]);
            sum += response * response;
            count += 1;
        }
    }
    sum / count as f64
}

fn exposure_score(img: &DynamicImage) -> f64 {
    let rgb = img.to_rgb8();
    let total = f64::from(rgb.width()) * f64::from(rgb.height());
    if total == 0.0 {
        return 0.0;
    }

    let brightness: f64 = rgb
        .pixels()
        .map(|p| 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]))
        .sum();
    let normalized = brightness / total / 255.0;

    // Distance from mid-grey, mapped so 0.5 scores 1.0 and both clipping
    // extremes score 0.0.
    (1.0 - (normalized - 0.5).abs() * 2.0).max(0.0)
}

fn composition_score(img: &DynamicImage) -> f64 {
    let (width, height) = img.dimensions();
    if height == 0 {
        return 0.0;
    }
    let ratio = f64::from(width) / f64::from(height);
    match ratio {
        r if (r - 1.618).abs() < 0.1 => 1.0,
        r if (r - 1.5).abs() < 0.1 => 0.9,
        r if (r - 1.333).abs() < 0.1 => 0.8,
        r if (r - 1.0).abs() < 0.1 => 0.7,
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn flat_grey_image_scores_poorly_on_sharpness() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 40, Rgb([128, 128, 128])));
        let score = score_image(&img);
        assert_eq!(score.sharpness, 0.0);
        // Mid-grey is optimally exposed.
        assert!(score.exposure > 0.99);
        assert!((0..=100).contains(&score.overall));
    }

    #[test]
    fn checkerboard_is_sharper_than_flat() {
        let flat = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([100, 100, 100])));
        let checker = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        }));
        assert!(score_image(&checker).sharpness > score_image(&flat).sharpness);
    }

    #[test]
    fn extreme_exposure_scores_zero() {
        let black = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([0, 0, 0])));
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([255, 255, 255])));
        assert_eq!(score_image(&black).exposure, 0.0);
        assert!(score_image(&white).exposure < 0.01);
    }

    #[test]
    fn classic_aspect_ratios_score_higher_than_odd_ones() {
        let three_two = DynamicImage::ImageRgb8(RgbImage::new(600, 400));
        let banner = DynamicImage::ImageRgb8(RgbImage::new(1000, 100));
        assert!(
            score_image(&three_two).composition > score_image(&banner).composition
        );
    }
}
