use image::{ImageFormat, RgbImage};
use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use crate::config::OutputConfig;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("failed to write frame to ffmpeg stdin: {0}")]
    Write(String),
    #[error("failed to wait for ffmpeg: {0}")]
    Wait(String),
    #[error("ffmpeg exited with non-zero status: {0}")]
    FfmpegFailed(String),
    #[error("{cause}; ffmpeg reported: {stderr}")]
    Aborted { cause: Box<SinkError>, stderr: String },
    #[error("frame {index} is {actual:?}, encoder expects {expected:?}")]
    FrameSize {
        index: u64,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("failed to encode frame {index}: {message}")]
    Encode { index: u64, message: String },
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where composited frames end up.
pub enum VideoSink {
    Images(ImageSequenceSink),
    Ffmpeg(FfmpegEncoder),
}

impl VideoSink {
    /// A path without extension (or an existing directory) becomes a PNG
    /// sequence, anything else is encoded by ffmpeg.
    pub async fn open(output: &OutputConfig, dimensions: (u32, u32)) -> Result<Self, SinkError> {
        let path = output.path.as_path();
        if path.is_dir() || path.extension().is_none() {
            Ok(VideoSink::Images(ImageSequenceSink::create(path, dimensions).await?))
        } else {
            Ok(VideoSink::Ffmpeg(FfmpegEncoder::start(path, dimensions, output.fps).await?))
        }
    }

    pub async fn push(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
        match self {
            VideoSink::Images(sink) => sink.push(frame).await,
            VideoSink::Ffmpeg(encoder) => encoder.push_frame(frame).await,
        }
    }

    pub async fn finish(self) -> Result<u64, SinkError> {
        match self {
            VideoSink::Images(sink) => Ok(sink.frame_count()),
            VideoSink::Ffmpeg(encoder) => encoder.finish().await,
        }
    }

    /// Throw away everything written so far. For ffmpeg the child is killed
    /// and reaped, and whatever it printed on stderr is returned.
    pub async fn discard(self) -> Option<String> {
        match self {
            VideoSink::Images(sink) => {
                sink.discard().await;
                None
            }
            VideoSink::Ffmpeg(encoder) => Some(encoder.discard().await).filter(|stderr| !stderr.is_empty()),
        }
    }

    /// Discard the output after `cause` and fold ffmpeg's diagnostics into it.
    pub async fn abort(self, cause: SinkError) -> SinkError {
        match self.discard().await {
            Some(stderr) => SinkError::Aborted {
                cause: Box::new(cause),
                stderr,
            },
            None => cause,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            VideoSink::Images(sink) => format!("PNG sequence in {:?}", sink.dir),
            VideoSink::Ffmpeg(encoder) => format!("ffmpeg MJPEG {:?}", encoder.output_path),
        }
    }
}

/// Writes `frame_00000.png`, `frame_00001.png`, ... into a directory.
pub struct ImageSequenceSink {
    dir: PathBuf,
    created_dir: bool,
    dimensions: (u32, u32),
    frame_count: u64,
}

impl ImageSequenceSink {
    pub async fn create(dir: &Path, dimensions: (u32, u32)) -> Result<Self, SinkError> {
        let created_dir = !dir.exists();
        tokio::fs::create_dir_all(dir).await.map_err(|source| SinkError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        info!(dir = dir.display().to_string(), "writing PNG frame sequence");
        Ok(Self {
            dir: dir.to_path_buf(),
            created_dir,
            dimensions,
            frame_count: 0,
        })
    }

    fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{:05}.png", index))
    }

    pub async fn push(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
        let index = self.frame_count;
        if frame.dimensions() != self.dimensions {
            return Err(SinkError::FrameSize {
                index,
                expected: self.dimensions,
                actual: frame.dimensions(),
            });
        }

        let mut png = Vec::new();
        frame
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| SinkError::Encode {
                index,
                message: e.to_string(),
            })?;

        let path = self.frame_path(index);
        tokio::fs::write(&path, png)
            .await
            .map_err(|source| SinkError::Io { path, source })?;

        self.frame_count += 1;
        Ok(())
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Remove the frames written so far, and the directory if it was ours.
    pub async fn discard(self) {
        for index in 0..self.frame_count {
            remove_partial(&self.frame_path(index)).await;
        }
        if self.created_dir {
            if let Err(e) = tokio::fs::remove_dir(&self.dir).await {
                warn!(dir = self.dir.display().to_string(), "could not remove output directory: {}", e);
            }
        }
        debug!(frames = self.frame_count, "discarded PNG frame sequence");
    }
}

/// Pipes raw RGB24 frames into an `ffmpeg` child encoding MJPEG.
pub struct FfmpegEncoder {
    child: Child,
    stdin: ChildStdin,
    output_path: PathBuf,
    dimensions: (u32, u32),
    frame_count: u64,
}

impl FfmpegEncoder {
    pub async fn start(output_path: &Path, dimensions: (u32, u32), fps: f64) -> Result<Self, SinkError> {
        let size = format!("{}x{}", dimensions.0, dimensions.1);
        let fps_str = fps.to_string();

        let mut cmd = Command::new("ffmpeg");
        cmd.args([
            "-v", "error",
            "-f", "rawvideo",
            "-pix_fmt", "rgb24",
            "-s", &size,
            "-r", &fps_str,
            "-i", "pipe:0",
            "-c:v", "mjpeg",
            "-q:v", "3",
            "-y",
        ])
        .arg(output_path);

        debug!(
            size = size.as_str(),
            fps,
            output = output_path.display().to_string(),
            "starting ffmpeg encoder"
        );

        Self::spawn(cmd, output_path, dimensions)
    }

    /// Run `cmd` as the encoder process. Its stdin receives the raw frames.
    pub fn spawn(mut cmd: Command, output_path: &Path, dimensions: (u32, u32)) -> Result<Self, SinkError> {
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SinkError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError::Spawn("could not get stdin handle".into()))?;

        Ok(Self {
            child,
            stdin,
            output_path: output_path.to_path_buf(),
            dimensions,
            frame_count: 0,
        })
    }

    pub async fn push_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
        if frame.dimensions() != self.dimensions {
            return Err(SinkError::FrameSize {
                index: self.frame_count,
                expected: self.dimensions,
                actual: frame.dimensions(),
            });
        }

        self.stdin
            .write_all(frame.as_raw())
            .await
            .map_err(|e| SinkError::Write(e.to_string()))?;
        self.frame_count += 1;
        Ok(())
    }

    /// Close stdin and wait for ffmpeg to flush the file.
    pub async fn finish(self) -> Result<u64, SinkError> {
        drop(self.stdin);

        let output = self
            .child
            .wait_with_output()
            .await
            .map_err(|e| SinkError::Wait(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "ffmpeg exited with error");
            remove_partial(&self.output_path).await;
            return Err(SinkError::FfmpegFailed(stderr.into_owned()));
        }

        info!(
            frame_count = self.frame_count,
            output = self.output_path.display().to_string(),
            "video encoding complete"
        );
        Ok(self.frame_count)
    }

    /// Kill and reap ffmpeg, delete the partial file and return its stderr.
    pub async fn discard(mut self) -> String {
        if let Err(e) = self.child.start_kill() {
            debug!("ffmpeg already exited: {}", e);
        }
        drop(self.stdin);

        let stderr = match self.child.wait_with_output().await {
            Ok(output) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            Err(e) => {
                warn!("failed to reap ffmpeg: {}", e);
                String::new()
            }
        };

        remove_partial(&self.output_path).await;
        debug!(
            frames = self.frame_count,
            output = self.output_path.display().to_string(),
            "discarded encoder output"
        );
        stderr
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = path.display().to_string(), "could not remove partial output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn png_output(path: PathBuf) -> OutputConfig {
        OutputConfig::new(path, 20.0).unwrap()
    }

    #[tokio::test]
    async fn test_image_sequence_sink_writes_numbered_pngs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");

        let mut sink = VideoSink::open(&png_output(out.clone()), (4, 2)).await.unwrap();
        assert!(matches!(sink, VideoSink::Images(_)));
        sink.push(&RgbImage::from_pixel(4, 2, Rgb([1, 2, 3]))).await.unwrap();
        sink.push(&RgbImage::from_pixel(4, 2, Rgb([4, 5, 6]))).await.unwrap();
        assert_eq!(sink.finish().await.unwrap(), 2);

        let second = image::open(out.join("frame_00001.png")).unwrap().to_rgb8();
        assert_eq!(second.get_pixel(3, 1), &Rgb([4, 5, 6]));
        assert!(out.join("frame_00000.png").exists());
        assert!(!out.join("frame_00002.png").exists());
    }

    #[tokio::test]
    async fn test_aborted_image_sequence_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");

        let mut sink = VideoSink::open(&png_output(out.clone()), (4, 2)).await.unwrap();
        sink.push(&RgbImage::new(4, 2)).await.unwrap();
        assert!(out.join("frame_00000.png").exists());

        let cause = sink.push(&RgbImage::new(3, 3)).await.unwrap_err();
        assert!(matches!(cause, SinkError::FrameSize { index: 1, .. }));

        let err = sink.abort(cause).await;
        assert!(matches!(err, SinkError::FrameSize { .. }));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_discard_keeps_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let mut sink = VideoSink::open(&png_output(dir.path().to_path_buf()), (2, 2)).await.unwrap();
        sink.push(&RgbImage::new(2, 2)).await.unwrap();
        sink.push(&RgbImage::new(2, 2)).await.unwrap();
        assert_eq!(sink.discard().await, None);

        assert!(dir.path().exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(!dir.path().join("frame_00000.png").exists());
        assert!(!dir.path().join("frame_00001.png").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_encoder_reports_its_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("result.mp4");

        // Stands in for an ffmpeg that rejects its arguments and exits early.
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo 'Unknown encoder mjpeg' >&2; exit 1"]);
        let mut encoder = FfmpegEncoder::spawn(cmd, &out, (512, 512)).unwrap();

        // Larger than a pipe buffer, so the write cannot complete before the child is gone.
        let cause = encoder.push_frame(&RgbImage::new(512, 512)).await.unwrap_err();
        assert!(matches!(cause, SinkError::Write(_)));

        let err = VideoSink::Ffmpeg(encoder).abort(cause).await;
        assert!(matches!(err, SinkError::Aborted { .. }));
        let message = err.to_string();
        assert!(message.starts_with("failed to write frame to ffmpeg stdin"), "{}", message);
        assert!(message.contains("Unknown encoder mjpeg"), "{}", message);
        assert!(!out.exists());
    }

    #[test]
    fn test_frame_size_error_message() {
        let err = SinkError::FrameSize {
            index: 2,
            expected: (8, 4),
            actual: (4, 4),
        };
        assert_eq!(err.to_string(), "frame 2 is (4, 4), encoder expects (8, 4)");
    }
}
