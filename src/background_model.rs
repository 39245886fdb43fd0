use image::GrayImage;
use rayon::prelude::*;
use std::time::Instant;
use tracing::debug;

use crate::error::CoreError;

const INTENSITY_LEVELS: usize = 256;

/// How the per-pixel temporal median is computed. Both give identical output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackgroundStrategy {
    /// Gather every sample of a pixel and select the median element.
    #[default]
    Select,
    /// Count samples into 256 intensity bins per pixel and walk the counts.
    Histogram,
}

/// Rank (0-based, ascending) of the lower median among `count` samples.
///
/// Odd counts give the middle element, even counts the lower of the two
/// middle elements. No rank exists for zero samples.
#[inline]
pub(crate) fn lower_median_rank(count: usize) -> Option<usize> {
    count.checked_sub(1).map(|last| last / 2)
}

/// Lower median of a sample list, `None` when it is empty. Reorders `samples`.
#[inline]
pub(crate) fn lower_median(samples: &mut [u8]) -> Option<u8> {
    let rank = lower_median_rank(samples.len())?;
    Some(*samples.select_nth_unstable(rank).1)
}

/// Returns the common geometry of `frames`, or the first violation.
pub fn sequence_dimensions(frames: &[GrayImage]) -> Result<(u32, u32), CoreError> {
    let first = frames.first().ok_or(CoreError::EmptySequence)?;
    let expected = first.dimensions();

    if let Some((index, frame)) = frames
        .iter()
        .enumerate()
        .find(|(_, frame)| frame.dimensions() != expected)
    {
        return Err(CoreError::mismatch(Some(index), expected, frame.dimensions()));
    }

    Ok(expected)
}

/// Streaming per-pixel intensity histogram.
///
/// Memory is fixed at `width * height * 256` counters regardless of how many
/// frames are accumulated, and the median it reports is exact.
#[derive(Clone)]
pub struct MedianHistogram {
    width: u32,
    height: u32,
    counts: Vec<u32>,
    frame_count: usize,
}

impl MedianHistogram {
    pub fn new(width: u32, height: u32) -> Self {
        let pixel_count = width as usize * height as usize;

        Self {
            width,
            height,
            counts: vec![0; pixel_count * INTENSITY_LEVELS],
            frame_count: 0,
        }
    }

    pub fn accumulate(&mut self, frame: &GrayImage) -> Result<(), CoreError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(CoreError::mismatch(
                Some(self.frame_count),
                (self.width, self.height),
                frame.dimensions(),
            ));
        }

        let row_len = self.width as usize;
        if row_len > 0 {
            self.counts
                .par_chunks_mut(row_len * INTENSITY_LEVELS)
                .zip(frame.as_raw().par_chunks(row_len))
                .for_each(|(bins, pixels)| {
                    for (x, &value) in pixels.iter().enumerate() {
                        bins[x * INTENSITY_LEVELS + value as usize] += 1;
                    }
                });
        }

        self.frame_count += 1;
        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn median(&self) -> Result<GrayImage, CoreError> {
        let rank = lower_median_rank(self.frame_count).ok_or(CoreError::EmptySequence)? as u32;
        let row_len = self.width as usize;
        let mut background = GrayImage::new(self.width, self.height);
        if row_len == 0 {
            return Ok(background);
        }

        let pixels: &mut [u8] = &mut background;
        pixels
            .par_chunks_mut(row_len)
            .zip(self.counts.par_chunks(row_len * INTENSITY_LEVELS))
            .for_each(|(row, bins)| {
                for (out, pixel_bins) in row.iter_mut().zip(bins.chunks_exact(INTENSITY_LEVELS)) {
                    *out = level_at_rank(pixel_bins, rank);
                }
            });

        Ok(background)
    }
}

/// Smallest intensity whose cumulative count passes `rank`.
fn level_at_rank(bins: &[u32], rank: u32) -> u8 {
    let mut seen = 0u32;
    for (level, &count) in bins.iter().enumerate() {
        seen += count;
        if seen > rank {
            return level as u8;
        }
    }
    u8::MAX
}

/// Builds the background image as the per-pixel temporal median of a whole
/// captured sequence.
///
/// Work is split one output row per task on the current rayon pool; each
/// worker reuses its own sample buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemporalMedianEstimator {
    strategy: BackgroundStrategy,
}

impl TemporalMedianEstimator {
    pub fn new(strategy: BackgroundStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> BackgroundStrategy {
        self.strategy
    }

    pub fn estimate(&self, frames: &[GrayImage]) -> Result<GrayImage, CoreError> {
        let (width, height) = sequence_dimensions(frames)?;
        let start_time = Instant::now();

        let background = match self.strategy {
            BackgroundStrategy::Select => Self::estimate_by_selection(frames, width, height),
            BackgroundStrategy::Histogram => {
                let mut histogram = MedianHistogram::new(width, height);
                for frame in frames {
                    histogram.accumulate(frame)?;
                }
                histogram.median()?
            }
        };

        debug!(
            frames = frames.len(),
            width,
            height,
            strategy = ?self.strategy,
            "Temporal median computed in {:.2}ms",
            start_time.elapsed().as_secs_f64() * 1000.0
        );

        Ok(background)
    }

    fn estimate_by_selection(frames: &[GrayImage], width: u32, height: u32) -> GrayImage {
        let row_len = width as usize;
        let mut background = GrayImage::new(width, height);
        if row_len == 0 {
            return background;
        }

        let pixels: &mut [u8] = &mut background;
        pixels.par_chunks_mut(row_len).enumerate().for_each_init(
            || Vec::with_capacity(frames.len()),
            |samples: &mut Vec<u8>, (y, row)| {
                let offset = y * row_len;
                for (x, out) in row.iter_mut().enumerate() {
                    samples.clear();
                    samples.extend(frames.iter().map(|frame| frame.as_raw()[offset + x]));
                    if let Some(value) = lower_median(samples) {
                        *out = value;
                    }
                }
            },
        );

        background
    }
}

/// Convenience wrapper around [`TemporalMedianEstimator::estimate`].
pub fn estimate_background(frames: &[GrayImage], strategy: BackgroundStrategy) -> Result<GrayImage, CoreError> {
    TemporalMedianEstimator::new(strategy).estimate(frames)
}
