pub mod ffmpeg;
pub mod frame_sampler;

use serde::{Deserialize, Serialize};
use shared::MediaKind;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("failed to decode media: {0}")]
    Decode(String),
    #[error("image decoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} was not found on PATH")]
    ToolNotFound(&'static str),
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),
    #[error("ffprobe output could not be parsed: {0}")]
    ProbeOutput(#[from] serde_json::Error),
    #[error("no video stream found")]
    NoVideoStream,
    #[error("Video is {duration_secs:.1}s long; the limit is {limit_secs}s.")]
    DurationExceeded { duration_secs: f64, limit_secs: u64 },
    #[error("Video frames are {width}x{height}; the limit is {limit} pixels per side.")]
    FrameTooLarge { width: u32, height: u32, limit: u32 },
}

impl MediaError {
    pub fn is_too_large(&self) -> bool {
        matches!(
            self,
            MediaError::DurationExceeded { .. } | MediaError::FrameTooLarge { .. }
        )
    }

    pub fn is_unreadable(&self) -> bool {
        matches!(
            self,
            MediaError::Decode(_)
                | MediaError::Image(_)
                | MediaError::ProbeFailed(_)
                | MediaError::ProbeOutput(_)
                | MediaError::NoVideoStream
        )
    }
}

/// Extension allowlists, lowercase and without the leading dot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedFormats {
    #[serde(default = "default_image_extensions")]
    pub image: Vec<String>,
    #[serde(default = "default_video_extensions")]
    pub video: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png"].iter().map(|s| s.to_string()).collect()
}

fn default_video_extensions() -> Vec<String> {
    ["mp4", "avi", "mov", "webm", "wmv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for AcceptedFormats {
    fn default() -> Self {
        Self {
            image: default_image_extensions(),
            video: default_video_extensions(),
        }
    }
}

impl AcceptedFormats {
    pub fn classify(&self, file_name: &str) -> Option<MediaKind> {
        let extension = file_extension(file_name)?;
        if self.image.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
            Some(MediaKind::Image)
        } else if self.video.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
            Some(MediaKind::Video)
        } else {
            None
        }
    }
}

pub fn file_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// An uploaded file as seen by the pipeline. The bytes live in a temporary
/// file owned by the request handler.
#[derive(Debug, Clone)]
pub struct MediaInput {
    pub file_name: String,
    pub kind: MediaKind,
    pub path: PathBuf,
    pub size_bytes: u64,
}
