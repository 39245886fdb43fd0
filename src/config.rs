use std::path::PathBuf;

use crate::error::CoreError;

pub const DEFAULT_WIDTH: u32 = 427;
pub const DEFAULT_HEIGHT: u32 = 240;
pub const DEFAULT_THRESHOLD: f32 = 30.0;
pub const DEFAULT_BLUR_KERNEL: u32 = 5;
pub const DEFAULT_FPS: f64 = 20.0;
pub const DEFAULT_OUTPUT: &str = "result.mp4";

/// Settings consumed by the median estimator and the segmenter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoreConfig {
    pub width: u32,
    pub height: u32,
    pub threshold: f32,
}

impl CoreConfig {
    pub fn new(width: u32, height: u32, threshold: f32) -> Result<Self, CoreError> {
        validate_dimensions(width, height)?;
        validate_threshold(threshold)?;
        Ok(Self { width, height, threshold })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Settings for preparing raw color frames before they reach the core.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizerConfig {
    pub width: u32,
    pub height: u32,
    /// Box blur side length, odd and no larger than the frame. 1 disables smoothing.
    pub blur_kernel: u32,
    pub equalize: bool,
}

impl NormalizerConfig {
    pub fn new(width: u32, height: u32, blur_kernel: u32, equalize: bool) -> Result<Self, CoreError> {
        validate_dimensions(width, height)?;
        if blur_kernel == 0 || blur_kernel % 2 == 0 {
            return Err(CoreError::Configuration(format!(
                "blur kernel must be a positive odd number, got {}",
                blur_kernel
            )));
        }
        if blur_kernel > width.min(height) {
            return Err(CoreError::Configuration(format!(
                "blur kernel {} does not fit the {}x{} working frame",
                blur_kernel, width, height
            )));
        }
        Ok(Self { width, height, blur_kernel, equalize })
    }
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            blur_kernel: DEFAULT_BLUR_KERNEL,
            equalize: true,
        }
    }
}

/// Where the visualization is written and at what frame rate.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub fps: f64,
}

impl OutputConfig {
    pub fn new(path: impl Into<PathBuf>, fps: f64) -> Result<Self, CoreError> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(CoreError::Configuration(format!(
                "output frame rate must be a positive number, got {}",
                fps
            )));
        }
        Ok(Self { path: path.into(), fps })
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_OUTPUT),
            fps: DEFAULT_FPS,
        }
    }
}

pub(crate) fn validate_threshold(threshold: f32) -> Result<(), CoreError> {
    if !threshold.is_finite() {
        return Err(CoreError::Configuration(format!(
            "difference threshold must be finite, got {}",
            threshold
        )));
    }
    if threshold < 0.0 {
        return Err(CoreError::Configuration(format!(
            "difference threshold must be non-negative, got {}",
            threshold
        )));
    }
    Ok(())
}

fn validate_dimensions(width: u32, height: u32) -> Result<(), CoreError> {
    if width == 0 || height == 0 {
        return Err(CoreError::Configuration(format!(
            "normalized dimensions must be non-zero, got {}x{}",
            width, height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_reference_geometry() {
        let config = CoreConfig::default();
        assert_eq!(config.dimensions(), (427, 240));
        assert_eq!(config.threshold, 30.0);
        assert_eq!(CoreConfig::new(427, 240, 30.0), Ok(config));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        assert!(matches!(CoreConfig::new(4, 4, -1.0), Err(CoreError::Configuration(_))));
        assert!(matches!(CoreConfig::new(4, 4, f32::NAN), Err(CoreError::Configuration(_))));
        assert!(matches!(CoreConfig::new(4, 4, f32::INFINITY), Err(CoreError::Configuration(_))));
        assert!(CoreConfig::new(4, 4, 0.0).is_ok());
    }

    #[test]
    fn test_rejects_zero_dimensions() {
        assert!(CoreConfig::new(0, 240, 30.0).is_err());
        assert!(NormalizerConfig::new(427, 0, 5, true).is_err());
    }

    #[test]
    fn test_blur_kernel_must_be_odd() {
        assert!(NormalizerConfig::new(8, 8, 4, true).is_err());
        assert!(NormalizerConfig::new(8, 8, 0, true).is_err());
        assert!(NormalizerConfig::new(8, 8, 1, false).is_ok());
    }

    #[test]
    fn test_blur_kernel_must_fit_frame() {
        assert!(matches!(
            NormalizerConfig::new(4, 4, 65537, false),
            Err(CoreError::Configuration(_))
        ));
        assert!(NormalizerConfig::new(9, 5, 7, true).is_err());
        assert!(NormalizerConfig::new(9, 5, 5, true).is_ok());
    }

    #[test]
    fn test_output_fps_must_be_positive() {
        for fps in [0.0, -20.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(OutputConfig::new("out.mp4", fps), Err(CoreError::Configuration(_))));
        }
        let output = OutputConfig::new("out.mp4", 29.97).unwrap();
        assert_eq!(output.path, PathBuf::from("out.mp4"));
        assert_eq!(OutputConfig::default().fps, 20.0);
    }
}
