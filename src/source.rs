use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];
const DEFAULT_SYNTHETIC_FRAMES: usize = 60;

/// Anything that yields raw color frames in temporal order.
pub trait FrameSource {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;

    fn describe(&self) -> String;
}

/// Opens a source from a command-line spec:
/// `synthetic[:FRAMES]`, `webcam[:INDEX]`, a directory of images, or a video file.
pub fn open_source(spec: &str) -> Result<Box<dyn FrameSource>> {
    if let Some(rest) = spec.strip_prefix("synthetic") {
        let frames = match rest.strip_prefix(':') {
            Some(count) => count
                .parse()
                .with_context(|| format!("Invalid synthetic frame count: {}", count))?,
            None if rest.is_empty() => DEFAULT_SYNTHETIC_FRAMES,
            None => bail!("Unrecognized input: {}", spec),
        };
        return Ok(Box::new(SyntheticSource::new(640, 360, frames)));
    }

    if let Some(rest) = spec.strip_prefix("webcam") {
        let index = match rest.strip_prefix(':') {
            Some(index) => index
                .parse()
                .with_context(|| format!("Invalid webcam index: {}", index))?,
            None => 0,
        };
        return open_webcam(index);
    }

    let path = Path::new(spec);
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::new(path)?));
    }
    if path.is_file() {
        return Ok(Box::new(FfmpegSource::open(path)?));
    }

    bail!("Input {:?} is neither a directory, a video file, `synthetic` nor `webcam`", spec)
}

#[cfg(feature = "webcam")]
fn open_webcam(index: u32) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(webcam::WebcamCapture::new(index)?))
}

#[cfg(not(feature = "webcam"))]
fn open_webcam(_index: u32) -> Result<Box<dyn FrameSource>> {
    bail!("Webcam capture is not available: rebuild with `--features webcam`")
}

/// Still images in a directory, ordered by file name.
pub struct ImageSequenceSource {
    root: PathBuf,
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequenceSource {
    pub fn new(root: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(root).with_context(|| format!("Failed to read directory {:?}", root))? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if path.is_file() && is_image {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            warn!("No images found in {:?}", root);
        } else {
            info!("Found {} images in {:?}", paths.len(), root);
        }

        Ok(Self {
            root: root.to_path_buf(),
            paths,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;

        let frame = image::open(path)
            .with_context(|| format!("Failed to decode image {:?}", path))?
            .to_rgb8();
        debug!("Loaded {:?} ({}x{})", path, frame.width(), frame.height());
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("image sequence {:?}", self.root)
    }
}

/// Video file decoded by an `ffmpeg` child process into raw RGB24 frames.
pub struct FfmpegSource {
    path: PathBuf,
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
}

impl FfmpegSource {
    pub fn open(path: &Path) -> Result<Self> {
        let (width, height) = probe_dimensions(path)?;

        let mut child = Command::new("ffmpeg")
            .args(decoder_args(path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("Failed to spawn ffmpeg; is it installed and on PATH?")?;

        let stdout = child.stdout.take().context("Could not get ffmpeg stdout handle")?;

        info!("Decoding {:?} with ffmpeg ({}x{})", path, width, height);

        Ok(Self {
            path: path.to_path_buf(),
            child,
            stdout,
            width,
            height,
        })
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut buffer = vec![0u8; self.width as usize * self.height as usize * 3];
        match self.stdout.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("Failed to read frame from ffmpeg"),
        }

        let frame = RgbImage::from_raw(self.width, self.height, buffer)
            .context("Failed to create image buffer from decoded frame")?;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("video file {:?}", self.path)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("ffmpeg decoder already exited: {}", e);
        }
        let _ = self.child.wait();
    }
}

/// ffprobe reports the coded size, so the decoder must not rotate frames
/// according to the stream's display matrix.
fn decoder_args(path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "error", "-nostdin", "-noautorotate", "-i"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(path.as_os_str().to_owned());
    args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"].map(OsString::from));
    args
}

fn probe_dimensions(path: &Path) -> Result<(u32, u32)> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0:s=x",
        ])
        .arg(path)
        .output()
        .context("Failed to run ffprobe; is ffmpeg installed and on PATH?")?;

    if !output.status.success() {
        bail!(
            "ffprobe failed for {:?}: {}",
            path,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
        .with_context(|| format!("No video stream found in {:?}", path))
}

fn parse_probe_output(text: &str) -> Option<(u32, u32)> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let (width, height) = line.split_once('x')?;
    let width = width.trim().parse().ok()?;
    let height = height.trim().trim_end_matches('x').parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Deterministic scene: a static diagonal gradient with a bright square
/// sliding left to right.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    total_frames: usize,
    frame_count: usize,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, total_frames: usize) -> Self {
        Self {
            width,
            height,
            total_frames,
            frame_count: 0,
        }
    }

    /// Top-left corner and side length of the square in frame `index`.
    pub fn square_at(&self, index: usize) -> (u32, u32, u32) {
        let side = (self.width.min(self.height) / 4).max(1);
        let travel = self.width.saturating_sub(side);
        let x = if self.total_frames > 1 {
            (travel as u64 * index as u64 / (self.total_frames as u64 - 1)) as u32
        } else {
            0
        };
        let y = (self.height - side) / 2;
        (x, y, side)
    }

    fn render(&self, index: usize) -> RgbImage {
        let (sx, sy, side) = self.square_at(index);
        let span = (self.width + self.height).max(1);

        RgbImage::from_fn(self.width, self.height, |x, y| {
            if x >= sx && x < sx + side && y >= sy && y < sy + side {
                Rgb([240, 230, 60])
            } else {
                let shade = (40 + 120 * (x + y) / span) as u8;
                Rgb([shade, shade / 2 + 20, 90])
            }
        })
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.frame_count >= self.total_frames {
            return Ok(None);
        }
        let frame = self.render(self.frame_count);
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("synthetic scene {}x{} ({} frames)", self.width, self.height, self.total_frames)
    }
}

#[cfg(feature = "webcam")]
mod webcam {
    use super::FrameSource;
    use anyhow::{Context, Result};
    use image::RgbImage;
    use nokhwa::{
        pixel_format::RgbFormat,
        utils::{CameraIndex, RequestedFormat, RequestedFormatType},
        Camera,
    };
    use tracing::{debug, info, warn};

    /// Live camera feed. Never ends on its own: bound it with a frame limit
    /// or interrupt the capture.
    pub struct WebcamCapture {
        camera: Camera,
        index: u32,
        width: u32,
        height: u32,
        frame_count: u64,
    }

    impl WebcamCapture {
        pub fn new(index: u32) -> Result<Self> {
            let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
            let mut camera = Camera::new(CameraIndex::Index(index), requested).context("Failed to create camera")?;
            camera.open_stream().context("Failed to open camera stream")?;

            let resolution = camera.resolution();
            let (width, height) = (resolution.width(), resolution.height());
            info!("Successfully opened webcam {} ({}x{})", index, width, height);

            Ok(Self {
                camera,
                index,
                width,
                height,
                frame_count: 0,
            })
        }
    }

    impl FrameSource for WebcamCapture {
        fn next_frame(&mut self) -> Result<Option<RgbImage>> {
            let frame = self.camera.frame().context("Failed to capture camera frame")?;
            let decoded = frame
                .decode_image::<RgbFormat>()
                .context("Failed to decode camera frame")?;
            let buffer = RgbImage::from_raw(self.width, self.height, decoded.into_raw())
                .context("Failed to create image buffer from camera data")?;

            self.frame_count += 1;
            debug!("Captured webcam frame {}: {}x{}", self.frame_count, self.width, self.height);
            Ok(Some(buffer))
        }

        fn describe(&self) -> String {
            format!("webcam {} ({}x{})", self.index, self.width, self.height)
        }
    }

    impl Drop for WebcamCapture {
        fn drop(&mut self) {
            if let Err(e) = self.camera.stop_stream() {
                warn!("Failed to stop camera during drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_keeps_coded_orientation() {
        let args = decoder_args(Path::new("clip.mov"));
        let position = |flag: &str| args.iter().position(|arg| arg == flag);

        let input = position("-i").unwrap();
        assert!(position("-noautorotate").unwrap() < input);
        assert_eq!(args[input + 1], OsString::from("clip.mov"));
        assert_eq!(args.last(), Some(&OsString::from("pipe:1")));
    }

    #[test]
    fn test_parse_probe_output() {
        assert_eq!(parse_probe_output("1920x1080\n"), Some((1920, 1080)));
        assert_eq!(parse_probe_output("\n640x360x\n"), Some((640, 360)));
        assert_eq!(parse_probe_output(""), None);
        assert_eq!(parse_probe_output("0x480"), None);
        assert_eq!(parse_probe_output("N/A"), None);
    }

    #[test]
    fn test_synthetic_source_is_finite() {
        let mut source = SyntheticSource::new(32, 16, 3);
        let mut count = 0;
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!(frame.dimensions(), (32, 16));
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_synthetic_square_moves() {
        let source = SyntheticSource::new(40, 20, 5);
        let (first, _, side) = source.square_at(0);
        let (last, _, _) = source.square_at(4);
        assert_eq!(first, 0);
        assert_eq!(last + side, 40);
    }

    #[test]
    fn test_open_source_specs() {
        assert!(open_source("synthetic:4").unwrap().describe().contains("4 frames"));
        assert!(open_source("synthetic").is_ok());
        assert!(open_source("synthetic:abc").is_err());
        assert!(open_source("syntheticX").is_err());
        assert!(open_source("/definitely/not/here.mp4").is_err());
    }

    #[test]
    fn test_image_sequence_source_reads_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [("b.png", 20u8), ("a.png", 10), ("c.txt", 0)] {
            let path = dir.path().join(name);
            if name.ends_with(".png") {
                RgbImage::from_pixel(3, 2, Rgb([value, value, value])).save(&path).unwrap();
            } else {
                std::fs::write(&path, b"not an image").unwrap();
            }
        }

        let mut source = ImageSequenceSource::new(dir.path()).unwrap();
        assert_eq!(source.len(), 2);
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(first.get_pixel(0, 0)[0], 10);
        assert_eq!(second.get_pixel(0, 0)[0], 20);
        assert!(source.next_frame().unwrap().is_none());
    }
}
