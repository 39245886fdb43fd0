use image::{GrayImage, RgbImage};

use crate::error::CoreError;

pub const MASK_FOREGROUND: u8 = 255;
pub const MASK_BACKGROUND: u8 = 0;

/// A captured frame after normalization: the smoothed color frame kept for
/// display and the equalized luminance frame the core works on.
#[derive(Clone, Debug)]
pub struct NormalizedFrame {
    pub color: RgbImage,
    pub luma: GrayImage,
}

/// Temporally ordered luminance frames of one fixed size.
///
/// Index is the timestamp. Frames can only be appended.
#[derive(Clone, Debug)]
pub struct FrameSequence {
    width: u32,
    height: u32,
    frames: Vec<GrayImage>,
}

impl FrameSequence {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: Vec::new(),
        }
    }

    /// Builds a sequence whose geometry is taken from the first frame.
    pub fn from_frames(frames: Vec<GrayImage>) -> Result<Self, CoreError> {
        let first = frames.first().ok_or(CoreError::EmptySequence)?;
        let mut sequence = Self::new(first.width(), first.height());
        sequence.frames.reserve(frames.len());
        for frame in frames {
            sequence.push(frame)?;
        }
        Ok(sequence)
    }

    pub fn push(&mut self, frame: GrayImage) -> Result<(), CoreError> {
        if frame.dimensions() != self.dimensions() {
            return Err(CoreError::mismatch(
                Some(self.frames.len()),
                self.dimensions(),
                frame.dimensions(),
            ));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn frames(&self) -> &[GrayImage] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_keeps_temporal_order() {
        let mut sequence = FrameSequence::new(2, 2);
        for value in [5u8, 9, 1] {
            sequence.push(GrayImage::from_pixel(2, 2, image::Luma([value]))).unwrap();
        }
        let firsts: Vec<u8> = sequence.frames().iter().map(|f| f.get_pixel(0, 0)[0]).collect();
        assert_eq!(firsts, vec![5, 9, 1]);
        assert_eq!(sequence.len(), 3);
    }

    #[test]
    fn test_push_rejects_other_geometry() {
        let mut sequence = FrameSequence::new(4, 4);
        sequence.push(GrayImage::new(4, 4)).unwrap();
        let err = sequence.push(GrayImage::new(4, 3)).unwrap_err();
        assert_eq!(err, CoreError::mismatch(Some(1), (4, 4), (4, 3)));
        assert_eq!(sequence.len(), 1);
    }

    #[test]
    fn test_from_frames() {
        assert_eq!(FrameSequence::from_frames(Vec::new()).unwrap_err(), CoreError::EmptySequence);

        let sequence = FrameSequence::from_frames(vec![GrayImage::new(3, 2), GrayImage::new(3, 2)]).unwrap();
        assert_eq!(sequence.dimensions(), (3, 2));
        assert!(!sequence.is_empty());

        assert!(FrameSequence::from_frames(vec![GrayImage::new(3, 2), GrayImage::new(2, 3)]).is_err());
    }
}
