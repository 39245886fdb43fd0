use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::imageops;
use image::{GrayImage, Rgb, RgbImage};
use std::path::Path;

use crate::error::CoreError;
use crate::frame::MASK_BACKGROUND;

const LABEL_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_SCALE: f32 = 20.0;
const LABEL_X: i32 = 20;
const LABEL_Y: i32 = 12;

pub const SOURCE_LABEL: &str = "Source Video";
pub const BACKGROUND_LABEL: &str = "Grayscale Background Image";
pub const DIFFERENCE_LABEL: &str = "Difference HeatMap";
pub const FOREGROUND_LABEL: &str = "Foreground Object";

/// TrueType font used to caption the quadrants.
pub struct LabelFont {
    font: FontVec,
}

impl LabelFont {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read font file {:?}", path))?;
        let font = FontVec::try_from_vec(bytes).with_context(|| format!("Invalid TrueType/OpenType font {:?}", path))?;
        Ok(Self { font })
    }
}

/// Lays out one 2W×2H frame per timestep:
///
/// ```text
/// +--------------+--------------+
/// | source       | background   |
/// +--------------+--------------+
/// | difference   | foreground   |
/// +--------------+--------------+
/// ```
pub struct Compositor {
    width: u32,
    height: u32,
    // Canvas with the constant background quadrant already drawn.
    template: RgbImage,
    labels: Option<LabelFont>,
}

impl Compositor {
    pub fn new(background: &GrayImage, labels: Option<LabelFont>) -> Self {
        let (width, height) = background.dimensions();
        let mut template = RgbImage::new(width * 2, height * 2);

        let mut background_tile = gray_to_rgb(background);
        if let Some(font) = &labels {
            draw_label(&mut background_tile, font, BACKGROUND_LABEL);
        }
        imageops::replace(&mut template, &background_tile, width as i64, 0);

        Self {
            width,
            height,
            template,
            labels,
        }
    }

    pub fn canvas_dimensions(&self) -> (u32, u32) {
        self.template.dimensions()
    }

    pub fn compose(&self, color: &RgbImage, difference: &GrayImage, mask: &GrayImage) -> Result<RgbImage, CoreError> {
        let expected = (self.width, self.height);
        for actual in [color.dimensions(), difference.dimensions(), mask.dimensions()] {
            if actual != expected {
                return Err(CoreError::mismatch(None, expected, actual));
            }
        }

        let mut source_tile = color.clone();
        let mut difference_tile = gray_to_rgb(difference);
        let mut foreground_tile = RgbImage::from_fn(self.width, self.height, |x, y| {
            if mask.get_pixel(x, y)[0] != MASK_BACKGROUND {
                *color.get_pixel(x, y)
            } else {
                Rgb([0, 0, 0])
            }
        });

        if let Some(font) = &self.labels {
            draw_label(&mut source_tile, font, SOURCE_LABEL);
            draw_label(&mut difference_tile, font, DIFFERENCE_LABEL);
            draw_label(&mut foreground_tile, font, FOREGROUND_LABEL);
        }

        let mut canvas = self.template.clone();
        imageops::replace(&mut canvas, &source_tile, 0, 0);
        imageops::replace(&mut canvas, &difference_tile, 0, self.height as i64);
        imageops::replace(&mut canvas, &foreground_tile, self.width as i64, self.height as i64);
        Ok(canvas)
    }
}

fn draw_label(tile: &mut RgbImage, font: &LabelFont, text: &str) {
    imageproc::drawing::draw_text_mut(tile, LABEL_COLOR, LABEL_X, LABEL_Y, PxScale::from(LABEL_SCALE), &font.font, text);
}

pub fn gray_to_rgb(image: &GrayImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y)[0];
        Rgb([v, v, v])
    })
}
