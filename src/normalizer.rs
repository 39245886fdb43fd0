//! Preparation of raw color frames for the core: resize to the working
//! geometry, box-smooth, convert to luminance and equalize the histogram.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use rayon::prelude::*;

use crate::config::NormalizerConfig;
use crate::frame::NormalizedFrame;

// BT.601 luma weights in 14-bit fixed point.
const LUMA_SHIFT: u32 = 14;
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;

#[derive(Clone, Copy, Debug)]
pub struct FrameNormalizer {
    config: NormalizerConfig,
}

impl FrameNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn normalize(&self, frame: &RgbImage) -> NormalizedFrame {
        let resized = if frame.dimensions() == (self.config.width, self.config.height) {
            frame.clone()
        } else {
            imageops::resize(frame, self.config.width, self.config.height, FilterType::Triangle)
        };

        let color = box_blur(&resized, self.config.blur_kernel);
        let gray = to_luma(&color);
        let luma = if self.config.equalize {
            equalize_histogram(&gray)
        } else {
            gray
        };

        NormalizedFrame { color, luma }
    }
}

/// Mirror an out-of-range index back into `0..len` without repeating the
/// edge sample (`dcb|abcd|cba`).
fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let period = 2 * last;
    let i = index.rem_euclid(period);
    let i = if i > last { period - i } else { i };
    i as usize
}

/// Normalized `kernel`×`kernel` mean filter over all three channels.
pub fn box_blur(image: &RgbImage, kernel: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if kernel <= 1 || width == 0 || height == 0 {
        return image.clone();
    }

    let w = width as usize;
    let h = height as usize;
    let half = (kernel / 2) as isize;
    let area = kernel as u64 * kernel as u64;
    let src = image.as_raw();

    // Horizontal window sums, one row per task.
    let mut row_sums = vec![0u64; w * h * 3];
    row_sums
        .par_chunks_mut(w * 3)
        .enumerate()
        .for_each(|(y, sums)| {
            let row = &src[y * w * 3..(y + 1) * w * 3];
            for x in 0..w {
                let mut acc = [0u64; 3];
                for dx in -half..=half {
                    let sx = reflect_101(x as isize + dx, w);
                    for c in 0..3 {
                        acc[c] += row[sx * 3 + c] as u64;
                    }
                }
                sums[x * 3..x * 3 + 3].copy_from_slice(&acc);
            }
        });

    let mut out = RgbImage::new(width, height);
    let dst: &mut [u8] = &mut out;
    dst.par_chunks_mut(w * 3).enumerate().for_each(|(y, row)| {
        for (i, value) in row.iter_mut().enumerate() {
            let mut acc = 0u64;
            for dy in -half..=half {
                let sy = reflect_101(y as isize + dy, h);
                acc += row_sums[sy * w * 3 + i];
            }
            *value = ((acc + area / 2) / area) as u8;
        }
    });

    out
}

/// Rounded BT.601 luminance.
pub fn to_luma(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let weighted = r as u32 * LUMA_R + g as u32 * LUMA_G + b as u32 * LUMA_B;
        image::Luma([((weighted + (1 << (LUMA_SHIFT - 1))) >> LUMA_SHIFT) as u8])
    })
}

/// Global histogram equalization.
///
/// The darkest occupied level maps to 0 and the brightest to 255. A frame
/// with a single intensity is returned as is.
pub fn equalize_histogram(image: &GrayImage) -> GrayImage {
    let total = image.as_raw().len();
    if total == 0 {
        return image.clone();
    }

    let mut hist = [0u32; 256];
    for &value in image.as_raw() {
        hist[value as usize] += 1;
    }

    let lut = match build_lut(&hist, total as u32) {
        Some(lut) => lut,
        None => return image.clone(),
    };

    let mut out = image.clone();
    for value in out.iter_mut() {
        *value = lut[*value as usize];
    }
    out
}

fn build_lut(hist: &[u32; 256], total: u32) -> Option<[u8; 256]> {
    let first = hist.iter().position(|&c| c > 0)?;
    let cdf_min = hist[first];
    if cdf_min == total {
        return None;
    }

    let scale = 255.0 / (total - cdf_min) as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for level in first + 1..256 {
        cdf += hist[level];
        lut[level] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    Some(lut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(-2, 5), 2);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(6, 5), 2);
        assert_eq!(reflect_101(3, 5), 3);
        assert_eq!(reflect_101(-2, 1), 0);
        assert_eq!(reflect_101(-3, 2), 1);
        assert_eq!(reflect_101(65540, 4), 2);
    }

    #[test]
    fn test_box_blur_keeps_constant_image() {
        let image = RgbImage::from_pixel(9, 6, Rgb([12, 200, 77]));
        assert_eq!(box_blur(&image, 5), image);
    }

    #[test]
    fn test_box_blur_averages_neighbourhood() {
        // Single bright pixel in the middle of a 5x5 black frame.
        let mut image = RgbImage::new(5, 5);
        image.put_pixel(2, 2, Rgb([225, 0, 90]));

        let blurred = box_blur(&image, 3);

        assert_eq!(blurred.get_pixel(2, 2), &Rgb([25, 0, 10]));
        assert_eq!(blurred.get_pixel(1, 1), &Rgb([25, 0, 10]));
        assert_eq!(blurred.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_box_blur_wider_than_frame() {
        let black = RgbImage::new(4, 4);
        assert_eq!(box_blur(&black, 65537), black);

        let flat = RgbImage::from_pixel(2, 3, Rgb([255, 255, 255]));
        assert_eq!(box_blur(&flat, 9), flat);
    }

    #[test]
    fn test_kernel_one_is_identity() {
        let image = RgbImage::from_fn(4, 4, |x, y| Rgb([x as u8, y as u8, 7]));
        assert_eq!(box_blur(&image, 1), image);
    }

    #[test]
    fn test_luma_weights() {
        let image = RgbImage::from_raw(4, 1, vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255]).unwrap();
        let gray = to_luma(&image);
        assert_eq!(gray.as_raw(), &vec![76, 150, 29, 255]);
    }

    #[test]
    fn test_equalize_stretches_range() {
        let image = GrayImage::from_raw(4, 1, vec![100, 101, 102, 103]).unwrap();
        let equalized = equalize_histogram(&image);
        assert_eq!(equalized.as_raw(), &vec![0, 85, 170, 255]);
    }

    #[test]
    fn test_equalize_uniform_frame_unchanged() {
        let image = GrayImage::from_pixel(3, 3, Luma([42]));
        assert_eq!(equalize_histogram(&image), image);
    }

    #[test]
    fn test_normalize_resizes_to_working_geometry() {
        let config = NormalizerConfig::new(8, 6, 5, true).unwrap();
        let normalizer = FrameNormalizer::new(config);
        let frame = RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 128]));

        let normalized = normalizer.normalize(&frame);

        assert_eq!(normalized.color.dimensions(), (8, 6));
        assert_eq!(normalized.luma.dimensions(), (8, 6));
        let raw = normalized.luma.as_raw();
        assert_eq!(raw.iter().min(), Some(&0));
        assert_eq!(raw.iter().max(), Some(&255));
    }
}
