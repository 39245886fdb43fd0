use image::GrayImage;
use rayon::prelude::*;

use crate::config::validate_threshold;
use crate::error::CoreError;
use crate::frame::{MASK_BACKGROUND, MASK_FOREGROUND};

/// Per-frame output of the segmenter.
#[derive(Clone, Debug, PartialEq)]
pub struct Segmentation {
    /// `|background - frame|` per pixel.
    pub difference: GrayImage,
    /// 255 where the difference exceeds the threshold, 0 elsewhere.
    pub mask: GrayImage,
}

impl Segmentation {
    pub fn foreground_ratio(&self) -> f64 {
        foreground_ratio(&self.mask)
    }
}

/// Splits frames into static background and moving foreground by
/// thresholding their absolute difference against a fixed background image.
#[derive(Clone, Debug)]
pub struct ForegroundSegmenter {
    background: GrayImage,
    threshold: f32,
}

impl ForegroundSegmenter {
    pub fn new(background: GrayImage, threshold: f32) -> Result<Self, CoreError> {
        validate_threshold(threshold)?;
        Ok(Self { background, threshold })
    }

    pub fn background(&self) -> &GrayImage {
        &self.background
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Pixels whose difference equals the threshold stay background.
    pub fn segment(&self, frame: &GrayImage) -> Result<Segmentation, CoreError> {
        let (width, height) = self.background.dimensions();
        if frame.dimensions() != (width, height) {
            return Err(CoreError::mismatch(None, (width, height), frame.dimensions()));
        }

        let mut difference = GrayImage::new(width, height);
        let mut mask = GrayImage::new(width, height);
        let row_len = width as usize;
        if row_len == 0 {
            return Ok(Segmentation { difference, mask });
        }

        let threshold = self.threshold;
        let difference_rows: &mut [u8] = &mut difference;
        let mask_rows: &mut [u8] = &mut mask;

        difference_rows
            .par_chunks_mut(row_len)
            .zip(mask_rows.par_chunks_mut(row_len))
            .zip(self.background.as_raw().par_chunks(row_len))
            .zip(frame.as_raw().par_chunks(row_len))
            .for_each(|(((diff_row, mask_row), bg_row), frame_row)| {
                for x in 0..row_len {
                    let distance = bg_row[x].abs_diff(frame_row[x]);
                    diff_row[x] = distance;
                    mask_row[x] = if distance as f32 > threshold {
                        MASK_FOREGROUND
                    } else {
                        MASK_BACKGROUND
                    };
                }
            });

        Ok(Segmentation { difference, mask })
    }
}

/// Fraction of mask pixels marked as foreground.
pub fn foreground_ratio(mask: &GrayImage) -> f64 {
    let total = mask.as_raw().len();
    if total == 0 {
        return 0.0;
    }
    let set = mask.as_raw().iter().filter(|&&v| v == MASK_FOREGROUND).count();
    set as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_threshold_is_strict() {
        let background = GrayImage::from_pixel(3, 1, Luma([100]));
        let frame = GrayImage::from_raw(3, 1, vec![130, 131, 69]).unwrap();
        let segmenter = ForegroundSegmenter::new(background, 30.0).unwrap();

        let result = segmenter.segment(&frame).unwrap();

        assert_eq!(result.difference.as_raw(), &vec![30, 31, 31]);
        assert_eq!(result.mask.as_raw(), &vec![0, 255, 255]);
    }

    #[test]
    fn test_difference_is_symmetric() {
        let background = GrayImage::from_raw(2, 1, vec![0, 255]).unwrap();
        let frame = GrayImage::from_raw(2, 1, vec![255, 0]).unwrap();
        let segmenter = ForegroundSegmenter::new(background, 30.0).unwrap();

        let result = segmenter.segment(&frame).unwrap();

        assert_eq!(result.difference.as_raw(), &vec![255, 255]);
        assert_eq!(result.mask.as_raw(), &vec![255, 255]);
    }

    #[test]
    fn test_identical_frame_has_empty_mask() {
        let frame = GrayImage::from_fn(7, 5, |x, y| Luma([(x * 31 + y * 17) as u8]));
        let segmenter = ForegroundSegmenter::new(frame.clone(), 30.0).unwrap();

        let result = segmenter.segment(&frame).unwrap();

        assert!(result.mask.pixels().all(|p| p[0] == 0));
        assert!(result.difference.pixels().all(|p| p[0] == 0));
        assert_eq!(result.foreground_ratio(), 0.0);
    }

    #[test]
    fn test_mask_is_binary() {
        let background = GrayImage::from_fn(16, 16, |x, _| Luma([(x * 16) as u8]));
        let frame = GrayImage::from_fn(16, 16, |_, y| Luma([(y * 16) as u8]));
        let segmenter = ForegroundSegmenter::new(background, 10.5).unwrap();

        let result = segmenter.segment(&frame).unwrap();

        assert!(result.mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
        // Diagonal pixels are identical, everything else differs by >= 16.
        assert_eq!(result.foreground_ratio(), (256.0 - 16.0) / 256.0);
    }

    #[test]
    fn test_zero_threshold_flags_any_change() {
        let background = GrayImage::from_raw(2, 1, vec![10, 10]).unwrap();
        let frame = GrayImage::from_raw(2, 1, vec![10, 11]).unwrap();
        let segmenter = ForegroundSegmenter::new(background, 0.0).unwrap();

        assert_eq!(segmenter.segment(&frame).unwrap().mask.as_raw(), &vec![0, 255]);
    }

    #[test]
    fn test_rejects_mismatched_frame() {
        let segmenter = ForegroundSegmenter::new(GrayImage::new(4, 4), 30.0).unwrap();
        assert_eq!(
            segmenter.segment(&GrayImage::new(4, 5)),
            Err(CoreError::mismatch(None, (4, 4), (4, 5)))
        );
    }

    #[test]
    fn test_rejects_invalid_threshold() {
        assert!(matches!(
            ForegroundSegmenter::new(GrayImage::new(1, 1), -0.5),
            Err(CoreError::Configuration(_))
        ));
        assert!(ForegroundSegmenter::new(GrayImage::new(1, 1), f32::NAN).is_err());
    }
}
