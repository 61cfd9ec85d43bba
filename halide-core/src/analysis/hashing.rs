//! Perceptual hash primitives.
//!
//! Three 64-bit hashes over an 8x8 grid, rendered as 16 lowercase hex
//! digits:
//!
//! - dHash: gradient-based, robust to crops and resizes
//! - aHash: mean-based, simple but effective
//! - wHash: Haar-wavelet low-frequency approximation, most robust to
//!   recompression
//!
//! Pure functions, no orchestration or persistence. Decode failures surface
//! as errors for the caller to record against the item.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Luma};

use halide_model::ModelError;

use crate::error::{HalideError, Result};

/// All hashes are 8x8 = 64 bits.
pub const HASH_BITS: u32 = 64;

const HASH_SIZE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerceptualHashes {
    pub dhash: String,
    pub ahash: String,
    pub whash: String,
}

/// Compute all three hashes for an image file.
pub fn compute_all_hashes(path: &Path) -> Result<PerceptualHashes> {
    let img = image::open(path)?;
    Ok(PerceptualHashes {
        dhash: to_hex(dhash(&img)),
        ahash: to_hex(ahash(&img)),
        whash: to_hex(whash(&img)),
    })
}

/// Difference hash: each bit compares a pixel against its right neighbour in
/// a 9x8 luminance grid.
pub fn dhash(img: &DynamicImage) -> u64 {
    let gray = img.to_luma8();
    let small = imageops::resize(&gray, HASH_SIZE + 1, HASH_SIZE, FilterType::Lanczos3);

    let mut hash = 0u64;
    for row in 0..HASH_SIZE {
        for col in 0..HASH_SIZE {
            let left = small.get_pixel(col, row)[0];
            let right = small.get_pixel(col + 1, row)[0];
            hash = (hash << 1) | u64::from(left > right);
        }
    }
    hash
}

/// Average hash: each bit compares a pixel against the 8x8 grid mean.
pub fn ahash(img: &DynamicImage) -> u64 {
    let gray = img.to_luma8();
    let small = imageops::resize(&gray, HASH_SIZE, HASH_SIZE, FilterType::Lanczos3);

    let sum: u64 = small.pixels().map(|p| u64::from(p[0])).sum();
    let mean = sum as f64 / f64::from(HASH_SIZE * HASH_SIZE);

    let mut hash = 0u64;
    for row in 0..HASH_SIZE {
        for col in 0..HASH_SIZE {
            let value = f64::from(small.get_pixel(col, row)[0]);
            hash = (hash << 1) | u64::from(value > mean);
        }
    }
    hash
}

/// Wavelet hash: one-level 2-D Haar transform of a 32x32 luminance grid,
/// low-frequency approximation resized to 8x8 and thresholded by its median.
pub fn whash(img: &DynamicImage) -> u64 {
    let gray = img.to_luma8();
    let side = HASH_SIZE * 4;
    let small = imageops::resize(&gray, side, side, FilterType::Lanczos3);

    // Low-pass half of the Haar transform: each 2x2 block collapses to
    // (a + b + c + d) / 2. The scale factor is irrelevant under a median
    // threshold but kept to match the standard transform.
    let half = side / 2;
    let mut approx: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::new(half, half);
    for y in 0..half {
        for x in 0..half {
            let sum = f32::from(small.get_pixel(2 * x, 2 * y)[0])
                + f32::from(small.get_pixel(2 * x + 1, 2 * y)[0])
                + f32::from(small.get_pixel(2 * x, 2 * y + 1)[0])
                + f32::from(small.get_pixel(2 * x + 1, 2 * y + 1)[0]);
            approx.put_pixel(x, y, Luma([sum / 2.0]));
        }
    }

    let coeffs = imageops::resize(&approx, HASH_SIZE, HASH_SIZE, FilterType::Lanczos3);

    let mut values: Vec<f32> = coeffs.pixels().map(|p| p[0]).collect();
    let mut sorted = values.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    let median = (sorted[mid - 1] + sorted[mid]) / 2.0;

    let mut hash = 0u64;
    for value in values.drain(..) {
        hash = (hash << 1) | u64::from(value > median);
    }
    hash
}

/// Number of differing bits between two 64-bit hashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Hamming distance over hex-rendered hashes.
pub fn hamming_distance_hex(a: &str, b: &str) -> Result<u32> {
    Ok(hamming_distance(parse_hex(a)?, parse_hex(b)?))
}

/// Similarity percentage, 100 = identical. Rounded toward zero.
pub fn similarity_score(a: u64, b: u64) -> i32 {
    let distance = hamming_distance(a, b);
    (100.0 * (1.0 - f64::from(distance) / f64::from(HASH_BITS))) as i32
}

pub fn similarity_score_hex(a: &str, b: &str) -> Result<i32> {
    Ok(similarity_score(parse_hex(a)?, parse_hex(b)?))
}

pub fn to_hex(hash: u64) -> String {
    format!("{hash:016x}")
}

pub fn parse_hex(hash: &str) -> Result<u64> {
    if hash.len() != 16 {
        return Err(HalideError::Model(ModelError::InvalidHash(hash.to_string())));
    }
    u64::from_str_radix(hash, 16)
        .map_err(|_| HalideError::Model(ModelError::InvalidHash(hash.to_string())))
}
