//! FFmpeg-backed video decoding.
//!
//! `ffprobe` supplies the stream geometry and frame rate, then a single
//! `ffmpeg` child streams raw RGB frames over its stdout pipe.

use image::RgbImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use super::MediaError;
use super::frame_sampler::FrameSource;

/// Opens a video file as a stream of frames.
pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    /// Display size, after any rotation the container asks for.
    pub width: u32,
    pub height: u32,
    /// 0 when the container does not report a usable rate.
    pub fps: f64,
    pub duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    rotation: Option<f64>,
}

impl FfprobeStream {
    /// Clockwise rotation in degrees, normalised to 0..360.
    fn rotation(&self) -> i64 {
        let degrees = self
            .side_data_list
            .iter()
            .find_map(|d| d.rotation)
            .or_else(|| self.tags.get("rotate").and_then(|r| r.trim().parse().ok()))
            .unwrap_or(0.0);
        (degrees.round() as i64).rem_euclid(360)
    }
}

/// Parses ffprobe's `num/den` rate notation.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((num, den)) => (num.trim().parse::<f64>().ok()?, den.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 {
        return None;
    }
    let fps = num / den;
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn parse_probe_output(stdout: &[u8]) -> Result<VideoInfo, MediaError> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(MediaError::NoVideoStream)?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => match stream.rotation() {
            90 | 270 => (h, w),
            _ => (w, h),
        },
        _ => {
            return Err(MediaError::ProbeFailed(
                "video stream has no frame size".to_string(),
            ));
        }
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok());

    Ok(VideoInfo {
        width,
        height,
        fps,
        duration,
    })
}

pub fn probe_video(path: &Path) -> Result<VideoInfo, MediaError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => MediaError::ToolNotFound("ffprobe"),
            _ => MediaError::Io(e),
        })?;

    if !output.status.success() {
        return Err(MediaError::ProbeFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    parse_probe_output(&output.stdout)
}

#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    max_duration_secs: Option<u64>,
    max_frame_dimension: u32,
}

impl FfmpegDecoder {
    pub fn new(max_duration_secs: Option<u64>, max_frame_dimension: u32) -> Self {
        Self {
            max_duration_secs,
            max_frame_dimension,
        }
    }

    fn check_limits(&self, info: &VideoInfo) -> Result<(), MediaError> {
        if info.width > self.max_frame_dimension || info.height > self.max_frame_dimension {
            return Err(MediaError::FrameTooLarge {
                width: info.width,
                height: info.height,
                limit: self.max_frame_dimension,
            });
        }
        if let (Some(limit), Some(duration)) = (self.max_duration_secs, info.duration) {
            if duration > limit as f64 {
                return Err(MediaError::DurationExceeded {
                    duration_secs: duration,
                    limit_secs: limit,
                });
            }
        }
        Ok(())
    }

    pub fn ensure_available() -> Result<(), MediaError> {
        which::which("ffmpeg").map_err(|_| MediaError::ToolNotFound("ffmpeg"))?;
        which::which("ffprobe").map_err(|_| MediaError::ToolNotFound("ffprobe"))?;
        Ok(())
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
        let info = probe_video(path)?;
        self.check_limits(&info)?;
        log::debug!(
            "Decoding {} ({}x{} @ {:.2} fps, {:?}s)",
            path.display(),
            info.width,
            info.height,
            info.fps,
            info.duration
        );
        Ok(Box::new(FfmpegFrameSource::spawn(path, info)?))
    }
}

/// Raw RGB frames piped out of an `ffmpeg` child process.
pub struct FfmpegFrameSource {
    child: Child,
    stdout: BufReader<ChildStdout>,
    info: VideoInfo,
    buffer: Vec<u8>,
    done: bool,
}

impl FfmpegFrameSource {
    fn spawn(path: &Path, info: VideoInfo) -> Result<Self, MediaError> {
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => MediaError::ToolNotFound("ffmpeg"),
                _ => MediaError::Io(e),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Decode("ffmpeg stdout unavailable".to_string()))?;

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            buffer: vec![0u8; info.width as usize * info.height as usize * 3],
            info,
            done: false,
        })
    }
}

impl Iterator for FfmpegFrameSource {
    type Item = Result<RgbImage, MediaError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_frame()? {
            Ok(()) => RgbImage::from_raw(self.info.width, self.info.height, self.buffer.clone())
                .map(Ok)
                .or_else(|| {
                    self.done = true;
                    Some(Err(MediaError::Decode("frame buffer size mismatch".into())))
                }),
            Err(e) => Some(Err(e)),
        }
    }
}

impl FfmpegFrameSource {
    /// Reads the next frame into the shared buffer. A short read at the end
    /// of the pipe is treated as the end of the stream.
    fn read_frame(&mut self) -> Option<Result<(), MediaError>> {
        if self.done {
            return None;
        }
        match self.stdout.read_exact(&mut self.buffer) {
            Ok(()) => Some(Ok(())),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(MediaError::Io(e)))
            }
        }
    }
}

impl FrameSource for FfmpegFrameSource {
    fn fps(&self) -> f64 {
        self.info.fps
    }

    fn skip_frame(&mut self) -> Option<Result<(), MediaError>> {
        self.read_frame()
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
