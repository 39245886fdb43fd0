use anyhow::{bail, Context, Result};
use image::{GrayImage, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::background_model::{BackgroundStrategy, TemporalMedianEstimator};
use crate::compositor::{Compositor, LabelFont};
use crate::config::{CoreConfig, OutputConfig};
use crate::error::CoreError;
use crate::frame::FrameSequence;
use crate::normalizer::FrameNormalizer;
use crate::segmentation::ForegroundSegmenter;
use crate::sink::{SinkError, VideoSink};
use crate::source::FrameSource;

/// Everything captured before background estimation starts.
pub struct CapturedSequence {
    /// Smoothed color frames, shown in the visualization.
    pub color_frames: Vec<RgbImage>,
    /// Equalized luminance frames fed to the core.
    pub luma: FrameSequence,
}

impl CapturedSequence {
    pub fn len(&self) -> usize {
        self.luma.len()
    }

    pub fn is_empty(&self) -> bool {
        self.luma.is_empty()
    }
}

/// Composited frame travelling from the segmentation task to the sink task.
pub struct CompositeFrame {
    pub index: usize,
    pub image: RgbImage,
    pub foreground_ratio: f64,
}

/// Pipeline configuration
#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    pub core: CoreConfig,
    pub strategy: BackgroundStrategy,
    pub threads: usize,
    pub queue_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            strategy: BackgroundStrategy::default(),
            threads: num_cpus::get(),
            queue_size: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStats {
    pub frames: usize,
    pub frames_written: u64,
    pub background_time: Duration,
    pub segmentation_time: Duration,
    pub mean_foreground_ratio: f64,
}

/// Pull frames from `source` until it runs dry, `limit` frames were taken or
/// `stop` is raised, normalizing each one on the way in.
pub fn capture_sequence(
    source: &mut dyn FrameSource,
    normalizer: &FrameNormalizer,
    limit: Option<usize>,
    stop: &AtomicBool,
) -> Result<CapturedSequence> {
    let config = normalizer.config();
    let mut luma = FrameSequence::new(config.width, config.height);
    let mut color_frames = Vec::new();
    let start_time = Instant::now();

    info!("Capturing from {}", source.describe());

    loop {
        if limit.is_some_and(|limit| luma.len() >= limit) {
            info!("Frame limit of {} reached", luma.len());
            break;
        }
        if stop.load(Ordering::Relaxed) {
            warn!("Capture interrupted after {} frames", luma.len());
            break;
        }

        let Some(raw) = source
            .next_frame()
            .with_context(|| format!("Failed to read frame {}", luma.len()))?
        else {
            break;
        };

        let normalized = normalizer.normalize(&raw);
        luma.push(normalized.luma)
            .context("Normalized frame does not match the working geometry")?;
        color_frames.push(normalized.color);

        if luma.len() % 100 == 0 {
            debug!("Captured {} frames", luma.len());
        }
    }

    info!(
        "Captured {} frames in {:.2}s",
        luma.len(),
        start_time.elapsed().as_secs_f64()
    );

    Ok(CapturedSequence { color_frames, luma })
}

/// Background estimation followed by ordered per-frame segmentation and
/// compositing, with a separate task feeding the sink.
pub struct ProcessingPipeline {
    config: PipelineConfig,
    pool: Arc<rayon::ThreadPool>,
}

impl ProcessingPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads.max(1))
            .thread_name(|i| format!("median-worker-{}", i))
            .build()
            .context("Failed to build worker pool")?;

        info!(
            "Pipeline configured: {}x{}, threshold={}, strategy={:?}, threads={}",
            config.core.width,
            config.core.height,
            config.core.threshold,
            config.strategy,
            pool.current_num_threads()
        );

        Ok(Self {
            config,
            pool: Arc::new(pool),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Temporal median of the whole sequence, computed on the worker pool.
    pub fn estimate_background(&self, sequence: &FrameSequence) -> Result<GrayImage, CoreError> {
        Self::estimate_on(&self.pool, &self.config, sequence)
    }

    fn estimate_on(pool: &rayon::ThreadPool, config: &PipelineConfig, sequence: &FrameSequence) -> Result<GrayImage, CoreError> {
        if sequence.is_empty() {
            return Err(CoreError::EmptySequence);
        }
        if sequence.dimensions() != config.core.dimensions() {
            return Err(CoreError::mismatch(None, config.core.dimensions(), sequence.dimensions()));
        }

        let estimator = TemporalMedianEstimator::new(config.strategy);
        pool.install(|| estimator.estimate(sequence.frames()))
    }

    /// Estimate the background, then segment and composite every frame into
    /// `output`. The output is only opened once the background exists, and it
    /// is discarded again if anything fails or `cancel` is raised.
    pub async fn run(
        &self,
        captured: CapturedSequence,
        output: &OutputConfig,
        labels: Option<LabelFont>,
        cancel: Arc<AtomicBool>,
    ) -> Result<PipelineStats> {
        let frames = captured.len();
        info!("Estimating background from {} frames", frames);

        let pool = self.pool.clone();
        let config = self.config;
        let (captured, background, background_time) = tokio::task::spawn_blocking(move || {
            let start_time = Instant::now();
            let background = Self::estimate_on(&pool, &config, &captured.luma);
            (captured, background, start_time.elapsed())
        })
        .await
        .context("Background estimation task panicked")?;
        let background = background.context("Background estimation failed")?;

        info!("Background estimated in {}ms", background_time.as_millis());

        if cancel.load(Ordering::Relaxed) {
            bail!("Interrupted before writing the visualization");
        }

        let canvas = (config.core.width * 2, config.core.height * 2);
        let sink = VideoSink::open(output, canvas)
            .await
            .with_context(|| format!("Failed to open output {:?}", output.path))?;

        let (frame_tx, frame_rx) = mpsc::channel::<CompositeFrame>(config.queue_size.max(1));
        info!("Writing visualization to {}", sink.describe());
        let sink_task = tokio::spawn(Self::sink_task(frame_rx, sink));

        let pool = self.pool.clone();
        let segmentation_task = tokio::task::spawn_blocking(move || {
            Self::segmentation_task(&pool, &config, background, captured, labels, &cancel, frame_tx)
        });

        let segmentation = segmentation_task.await.context("Segmentation task panicked")?;
        let sink = sink_task.await.context("Sink task panicked")?;

        let (segmentation_time, ratio_sum) = match segmentation {
            Ok(done) => done,
            Err(e) => {
                if let Ok(sink) = sink {
                    warn!("Discarding {}", sink.describe());
                    sink.discard().await;
                }
                return Err(e.context("Foreground segmentation failed"));
            }
        };
        let frames_written = sink
            .context("Failed to write visualization")?
            .finish()
            .await
            .context("Failed to write visualization")?;

        let stats = PipelineStats {
            frames,
            frames_written,
            background_time,
            segmentation_time,
            mean_foreground_ratio: if frames > 0 { ratio_sum / frames as f64 } else { 0.0 },
        };

        info!(
            "Processed {} frames ({} written): background {}ms, segmentation {}ms, mean foreground {:.2}%",
            stats.frames,
            stats.frames_written,
            stats.background_time.as_millis(),
            stats.segmentation_time.as_millis(),
            stats.mean_foreground_ratio * 100.0
        );

        Ok(stats)
    }

    /// Segments and composites every frame in temporal order. Returns the
    /// elapsed time and the sum of per-frame foreground ratios.
    fn segmentation_task(
        pool: &rayon::ThreadPool,
        config: &PipelineConfig,
        background: GrayImage,
        captured: CapturedSequence,
        labels: Option<LabelFont>,
        cancel: &AtomicBool,
        tx: mpsc::Sender<CompositeFrame>,
    ) -> Result<(Duration, f64)> {
        let start_time = Instant::now();
        let compositor = Compositor::new(&background, labels);
        let segmenter = ForegroundSegmenter::new(background, config.core.threshold)?;
        let total = captured.len();
        let mut ratio_sum = 0.0;

        for (index, (color, luma)) in captured
            .color_frames
            .iter()
            .zip(captured.luma.frames())
            .enumerate()
        {
            if cancel.load(Ordering::Relaxed) {
                bail!("Interrupted at frame {} of {}", index, total);
            }

            let frame_start = Instant::now();
            let segmentation = pool.install(|| segmenter.segment(luma))?;
            let image = compositor.compose(color, &segmentation.difference, &segmentation.mask)?;
            let foreground_ratio = segmentation.foreground_ratio();
            ratio_sum += foreground_ratio;

            debug!(
                frame = index,
                foreground = foreground_ratio,
                "Segmented frame in {:.2}ms",
                frame_start.elapsed().as_secs_f64() * 1000.0
            );

            let composite = CompositeFrame {
                index,
                image,
                foreground_ratio,
            };
            if tx.blocking_send(composite).is_err() {
                warn!("Sink closed - stopping segmentation at frame {}", index);
                break;
            }
        }

        Ok((start_time.elapsed(), ratio_sum))
    }

    /// Sink task - writes composited frames in the order they arrive and
    /// hands the sink back once the channel closes. A failed write discards
    /// the output.
    async fn sink_task(mut rx: mpsc::Receiver<CompositeFrame>, mut sink: VideoSink) -> Result<VideoSink, SinkError> {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.push(&frame.image).await {
                return Err(sink.abort(e).await);
            }
            debug!(frame = frame.index, "Frame written to sink");
        }
        Ok(sink)
    }
}
