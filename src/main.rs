use anyhow::{Context, Result};
use median_motion::cli::Args;
use median_motion::compositor::LabelFont;
use median_motion::normalizer::FrameNormalizer;
use median_motion::pipeline::{capture_sequence, ProcessingPipeline};
use median_motion::source::open_source;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();
    args.setup_logging();

    info!("Starting median-motion");

    let result = run_application(args).await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run_application(args: Args) -> Result<()> {
    let pipeline_config = args.pipeline_config().context("Invalid configuration")?;
    let output = args.output_config().context("Invalid configuration")?;
    let normalizer = FrameNormalizer::new(args.normalizer_config().context("Invalid configuration")?);
    let labels = match &args.font {
        Some(path) => Some(LabelFont::from_file(path)?),
        None => None,
    };

    // The first Ctrl-C ends the capture early, or cancels processing once
    // capture is over. A second one exits at once.
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if stop_flag.swap(true, Ordering::SeqCst) {
                error!("Interrupted again - exiting");
                std::process::exit(130);
            }
            warn!("Interrupt received - stopping (press Ctrl-C again to exit immediately)");
        }
    });

    let mut source = open_source(&args.input).context("Failed to open input")?;
    let captured = tokio::task::block_in_place(|| {
        capture_sequence(source.as_mut(), &normalizer, args.max_frames, &stop)
    })?;
    drop(source);

    // An interrupt that truncated the capture does not cancel processing.
    stop.store(false, Ordering::SeqCst);

    let pipeline = ProcessingPipeline::new(pipeline_config)?;
    let stats = pipeline.run(captured, &output, labels, stop).await?;

    println!(
        "{} frames processed, {} written to {:?} (mean foreground {:.2}%)",
        stats.frames,
        stats.frames_written,
        output.path,
        stats.mean_foreground_ratio * 100.0
    );

    Ok(())
}
