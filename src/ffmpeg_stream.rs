use crate::error::{Error, Result};
use crate::model::VideoSource;
use bytes::BytesMut;
use fraction::ToPrimitive;
use futures::stream::{self, BoxStream};
use futures_util::StreamExt;
use image::{ImageBuffer, Rgb};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::codec::{Decoder, FramedRead};

pub type Bgr = Rgb<u8>;
pub type FrameBuffer = ImageBuffer<Bgr, Vec<u8>>;
pub type FrameStream = BoxStream<'static, io::Result<Frame>>;

/// Frame rate assumed when a source does not tell.
pub const DEFAULT_FPS: f32 = 30.0;

const FRAME_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Frame rate as the rational ffprobe reports, e.g. `30000/1001`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u64,
    pub den: u64,
}

impl FrameRate {
    pub const DEFAULT: FrameRate = FrameRate { num: 30, den: 1 };

    pub fn fps(&self) -> f32 {
        self.num as f32 / self.den as f32
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VideoInfo {
    pub dimensions: Dimensions,
    pub rate: FrameRate,
    pub frame_count: Option<usize>,
}

/// Splits raw bgr24 output into whole frames.
pub struct VideoFrame {
    capacity: usize,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            capacity: (width * height * 3) as usize,
        }
    }
}

impl Decoder for VideoFrame {
    type Error = io::Error;
    type Item = BytesMut;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.capacity() < self.capacity {
            src.reserve(self.capacity)
        }
        if src.len() >= self.capacity {
            Ok(Some(src.split_to(self.capacity)))
        } else {
            Ok(None)
        }
    }
}

/// Decoded video frame with its position in the source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub index: usize,
    // NOTE: We store bgr image in rgb buffer!
    pub image: FrameBuffer,
}

impl Frame {
    pub fn new(index: usize, image: FrameBuffer) -> Self {
        Self { index, image }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.image.width(), self.image.height())
    }

    /// Runs `f` on an opencv view of the frame pixels. Drawing on the view
    /// changes the frame.
    pub fn with_mat<R>(
        &mut self,
        f: impl FnOnce(&mut opencv::core::Mat) -> opencv::Result<R>,
    ) -> opencv::Result<R> {
        let rows = self.image.height() as i32;
        let cols = self.image.width() as i32;
        let data = self.image.as_mut_ptr();
        // the Mat only borrows the buffer and is dropped before `self.image`
        let mut mat = unsafe {
            opencv::core::Mat::new_rows_cols_with_data(
                rows,
                cols,
                opencv::core::CV_8UC3,
                data as *mut _,
                opencv::core::Mat_AUTO_STEP,
            )?
        };
        f(&mut mat)
    }
}

fn parse_rate(value: &str) -> Option<FrameRate> {
    let rate = value.trim().parse::<fraction::Fraction>().ok()?;
    rate.to_f32().filter(|f| f.is_finite() && *f > 0.0)?;
    let (num, den) = (*rate.numer()?, *rate.denom()?);
    Some(FrameRate { num, den })
}

/// Resolution, frame rate and (when the container tells) frame count of the
/// first video stream.
pub fn probe_video(video_path: &Path) -> Result<VideoInfo> {
    let output = std::process::Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_frames",
            "-of",
            "default=noprint_wrappers=1",
        ])
        .arg(video_path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Video(format!("could not run ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(Error::Video(format!(
            "ffprobe failed on {}: {}",
            video_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let entries: HashMap<&str, &str> = stdout
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let dimension = |key: &str| -> Result<u32> {
        entries
            .get(key)
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                Error::Video(format!("{} has no video stream {key}", video_path.display()))
            })
    };
    let dimensions = Dimensions::new(dimension("width")?, dimension("height")?);

    let rate = match entries.get("r_frame_rate").and_then(|v| parse_rate(v)) {
        Some(val) => val,
        None => {
            warn!("could not determine fps of video {}", video_path.display());
            FrameRate::DEFAULT
        }
    };

    let frame_count = entries.get("nb_frames").and_then(|v| v.parse::<usize>().ok());

    Ok(VideoInfo {
        dimensions,
        rate,
        frame_count,
    })
}

pub fn get_video_fps(video_path: &Path) -> f32 {
    match probe_video(video_path) {
        Ok(info) => info.rate.fps(),
        Err(e) => {
            warn!("{e}, assume {DEFAULT_FPS} fps");
            DEFAULT_FPS
        }
    }
}

/// Streams every frame of `video_path` as bgr24 through an ffmpeg child.
pub fn spawn_frame_reader(video_path: &Path, dimensions: Dimensions) -> Result<FrameStream> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-loglevel", "warning", "-hwaccel", "auto", "-i"])
        .arg(video_path)
        .args([
            "-f",
            "image2pipe",
            "-pix_fmt",
            "bgr24",
            "-vcodec",
            "rawvideo",
            "-an",
            "-sn",
            "-",
        ]);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Video(format!("failed to spawn ffmpeg: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Video("ffmpeg process did not have a handle to stdout".into()))?;

    let source = video_path.display().to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if !status.success() => warn!("ffmpeg decoding {source} exited with {status}"),
            Ok(_) => debug!("ffmpeg decoding {source} finished"),
            Err(e) => warn!("ffmpeg process encountered an error: {e}"),
        }
    });

    info!("start ffmpeg decoding {}", video_path.display());

    let Dimensions { width, height } = dimensions;
    let frames = FramedRead::new(stdout, VideoFrame::new(width, height))
        .enumerate()
        .map(move |(index, item)| {
            let bytes_mut_buffer = item?;
            FrameBuffer::from_raw(width, height, bytes_mut_buffer.to_vec())
                .map(|buffer| Frame::new(index, buffer))
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "ffmpeg: parse frame error"))
        });

    Ok(frames.boxed())
}

fn frame_sort_key(path: &Path) -> (Option<u64>, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem.parse::<u64>().ok(), stem)
}

/// Image files of a frame directory in frame order. Numeric names sort by
/// value (`2.jpg` before `10.jpg`).
pub fn frame_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = vec![];
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_frame = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_frame {
            paths.push(path);
        }
    }
    paths.sort_by_key(|p| frame_sort_key(p));
    Ok(paths)
}

fn load_bgr(path: &Path, dimensions: Dimensions) -> io::Result<FrameBuffer> {
    let mut image = image::open(path)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display())))?
        .to_rgb8();
    if Dimensions::new(image.width(), image.height()) != dimensions {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: resolution changed mid-stream", path.display()),
        ));
    }
    for pixel in image.pixels_mut() {
        pixel.0.swap(0, 2);
    }
    Ok(image)
}

/// Streams the frames of a directory, decoding one image at a time.
pub fn read_frame_dir(dir: &Path) -> Result<(VideoInfo, FrameStream)> {
    let paths = frame_paths(dir)?;
    let first = paths
        .first()
        .ok_or_else(|| Error::Video(format!("{} contains no frames", dir.display())))?;
    let (width, height) = image::image_dimensions(first)?;
    let info = VideoInfo {
        dimensions: Dimensions::new(width, height),
        rate: FrameRate::DEFAULT,
        frame_count: Some(paths.len()),
    };

    let dimensions = info.dimensions;
    let frames = stream::iter(paths.into_iter().enumerate())
        .map(move |(index, path)| load_bgr(&path, dimensions).map(|image| Frame::new(index, image)));

    Ok((info, frames.boxed()))
}

pub fn probe_source(source: &VideoSource) -> Result<VideoInfo> {
    match source {
        VideoSource::File(path) => probe_video(path),
        VideoSource::Frames(dir) => read_frame_dir(dir).map(|(info, _)| info),
    }
}

pub fn open_source(source: &VideoSource) -> Result<(VideoInfo, FrameStream)> {
    match source {
        VideoSource::File(path) => {
            let info = probe_video(path)?;
            let frames = spawn_frame_reader(path, info.dimensions)?;
            Ok((info, frames))
        }
        VideoSource::Frames(dir) => read_frame_dir(dir),
    }
}

fn encoder_args(info: &VideoInfo) -> Vec<String> {
    let Dimensions { width, height } = info.dimensions;
    // yuv420p subsamples by two and cannot keep odd sizes
    let pix_fmt = if width % 2 == 0 && height % 2 == 0 {
        "yuv420p"
    } else {
        "yuv444p"
    };
    let size = format!("{width}x{height}");
    let rate = info.rate.to_string();
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "bgr24",
        "-s",
        size.as_str(),
        "-r",
        rate.as_str(),
        "-i",
        "-",
        "-an",
        "-c:v",
        "libx264",
        "-pix_fmt",
        pix_fmt,
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

/// Encodes bgr24 frames into a video file through an ffmpeg child.
pub struct FrameWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    dimensions: Dimensions,
    output: PathBuf,
}

impl FrameWriter {
    pub fn spawn(output: &Path, info: &VideoInfo) -> Result<Self> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(encoder_args(info)).arg(output);

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Io(io::Error::new(e.kind(), format!("failed to spawn ffmpeg encoder: {e}")))
        })?;
        let stdin = child.stdin.take();

        info!("start ffmpeg encoding {}", output.display());
        Ok(Self {
            child,
            stdin,
            dimensions: info.dimensions,
            output: output.to_path_buf(),
        })
    }

    pub async fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.dimensions() != self.dimensions {
            return Err(Error::Video(format!(
                "frame {} is {}x{}, encoder expects {}x{}",
                frame.index,
                frame.image.width(),
                frame.image.height(),
                self.dimensions.width,
                self.dimensions.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "encoder input closed")))?;
        stdin.write_all(frame.image.as_raw()).await?;
        Ok(())
    }

    /// Closes the encoder input and waits for the file to be finalized.
    pub async fn finish(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        let output = self.child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "ffmpeg failed to encode {}: {}",
                    self.output.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )));
        }
        info!("stop ffmpeg encoding {}", self.output.display());
        Ok(())
    }

    /// Stops the encoder without finalizing the output.
    pub async fn abort(mut self) {
        self.stdin.take();
        if let Err(e) = self.child.kill().await {
            warn!("could not stop ffmpeg encoding {}: {e}", self.output.display());
        }
    }
}
