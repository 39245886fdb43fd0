use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::background_model::BackgroundStrategy;
use crate::config::{CoreConfig, NormalizerConfig, OutputConfig};
use crate::error::CoreError;
use crate::pipeline::PipelineConfig;

#[derive(Parser, Debug)]
#[command(name = "median-motion")]
#[command(about = "Extracts a static background from a video and segments moving foreground")]
#[command(long_about = "Captures a whole video sequence, estimates the background as the per-pixel temporal median of the luminance frames, thresholds each frame's difference against it into a motion mask and writes a 2x2 visualization (source, background, difference, foreground).")]
pub struct Args {
    #[arg(
        short = 'i',
        long = "input",
        help = "Video file, directory of images, `synthetic[:FRAMES]` or `webcam[:INDEX]`"
    )]
    pub input: String,

    #[arg(
        short = 'o',
        long = "output",
        default_value = "result.mp4",
        help = "Output video file, or a directory for a PNG sequence"
    )]
    pub output: PathBuf,

    #[arg(
        short = 'w',
        long = "width",
        default_value = "427",
        help = "Normalized frame width in pixels"
    )]
    pub width: u32,

    #[arg(
        long = "height",
        default_value = "240",
        help = "Normalized frame height in pixels"
    )]
    pub height: u32,

    #[arg(
        short = 't',
        long = "threshold",
        default_value = "30",
        allow_negative_numbers = true,
        help = "Absolute luminance difference above which a pixel is foreground"
    )]
    pub threshold: f32,

    #[arg(
        long = "blur",
        default_value = "5",
        help = "Box blur kernel size applied before grayscale conversion (odd, 1 disables)"
    )]
    pub blur: u32,

    #[arg(
        long = "no-equalize",
        help = "Skip histogram equalization of the luminance frames"
    )]
    pub no_equalize: bool,

    #[arg(
        long = "strategy",
        default_value = "select",
        help = "How the per-pixel temporal median is computed"
    )]
    pub strategy: Strategy,

    #[arg(
        long = "max-frames",
        help = "Stop capturing after this many frames (required for live sources unless interrupted)"
    )]
    pub max_frames: Option<usize>,

    #[arg(
        long = "threads",
        help = "Worker threads for background estimation and segmentation [default: number of CPUs]"
    )]
    pub threads: Option<usize>,

    #[arg(
        long = "fps",
        default_value = "20",
        allow_negative_numbers = true,
        help = "Frame rate of the encoded output video"
    )]
    pub fps: f64,

    #[arg(
        long = "font",
        help = "TrueType font used to caption the visualization quadrants"
    )]
    pub font: Option<PathBuf>,

    #[arg(
        long = "queue-size",
        default_value = "8",
        help = "Composited frames buffered ahead of the output writer"
    )]
    pub queue_size: usize,

    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help = "Increase verbosity level (use multiple times for more verbose output)"
    )]
    pub verbose: u8,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    #[value(name = "select")]
    Select,
    #[value(name = "histogram")]
    Histogram,
}

impl From<Strategy> for BackgroundStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Select => BackgroundStrategy::Select,
            Strategy::Histogram => BackgroundStrategy::Histogram,
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn core_config(&self) -> Result<CoreConfig, CoreError> {
        CoreConfig::new(self.width, self.height, self.threshold)
    }

    pub fn normalizer_config(&self) -> Result<NormalizerConfig, CoreError> {
        NormalizerConfig::new(self.width, self.height, self.blur, !self.no_equalize)
    }

    pub fn output_config(&self) -> Result<OutputConfig, CoreError> {
        OutputConfig::new(&self.output, self.fps)
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, CoreError> {
        Ok(PipelineConfig {
            core: self.core_config()?,
            strategy: self.strategy.into(),
            threads: self.threads.unwrap_or_else(num_cpus::get),
            queue_size: self.queue_size,
        })
    }

    pub fn setup_logging(&self) {
        use tracing_subscriber::{EnvFilter, FmtSubscriber};

        let level = match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(level))
            )
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("Failed to set tracing subscriber");
    }
}
