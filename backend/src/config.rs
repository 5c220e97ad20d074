use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::DetectorParams;
use crate::media::AcceptedFormats;
use crate::media::frame_sampler::DEFAULT_FPS;
use crate::model::face_classifier::ClassifierParams;
use crate::storage::pinata_service::DEFAULT_PINATA_API_URL;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set when persistence is enabled")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoParams {
    /// Used when the container reports no usable frame rate.
    #[serde(default = "default_fallback_fps")]
    pub fallback_fps: f64,
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: Option<u64>,
    /// Largest accepted width or height of a decoded frame.
    #[serde(default = "default_max_frame_dimension")]
    pub max_frame_dimension: u32,
}

fn default_fallback_fps() -> f64 {
    DEFAULT_FPS
}

fn default_max_duration_secs() -> Option<u64> {
    Some(600)
}

fn default_max_frame_dimension() -> u32 {
    4096
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            fallback_fps: default_fallback_fps(),
            max_duration_secs: default_max_duration_secs(),
            max_frame_dimension: default_max_frame_dimension(),
        }
    }
}

/// Tunables read from `config/pipeline.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub detector: DetectorParams,
    #[serde(default)]
    pub classifier: ClassifierParams,
    #[serde(default)]
    pub video: VideoParams,
    #[serde(default)]
    pub formats: AcceptedFormats,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::warn!(
                "Pipeline config {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|source| ConfigError::Yaml {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub verdicts_table: String,
    pub pinata_api_key: String,
    pub pinata_secret_api_key: String,
    pub pinata_api_url: String,
    pub dynamodb_endpoint_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub static_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub pipeline_config: PathBuf,
    pub cascade_path: PathBuf,
    pub face_model_path: PathBuf,
    pub text_model_dir: PathBuf,
    pub text_tokenizer: String,
    pub max_upload_bytes: u64,
    pub processing_timeout: Duration,
    /// `None` runs the simple variant: no upload, no history.
    pub persistence: Option<PersistenceConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let path_or = |name: &str, default: &str| PathBuf::from(get(name).unwrap_or_else(|| default.to_string()));

        let persistence_enabled = match get("PERSISTENCE_ENABLED") {
            None => false,
            Some(value) => parse_flag(&value).ok_or(ConfigError::Invalid {
                name: "PERSISTENCE_ENABLED",
                value,
            })?,
        };

        let persistence = if persistence_enabled {
            Some(PersistenceConfig {
                verdicts_table: get("DYNAMODB_VERDICTS_TABLE")
                    .ok_or(ConfigError::Missing("DYNAMODB_VERDICTS_TABLE"))?,
                pinata_api_key: get("PINATA_API_KEY").ok_or(ConfigError::Missing("PINATA_API_KEY"))?,
                pinata_secret_api_key: get("PINATA_SECRET_API_KEY")
                    .ok_or(ConfigError::Missing("PINATA_SECRET_API_KEY"))?,
                pinata_api_url: get("PINATA_API_URL")
                    .unwrap_or_else(|| DEFAULT_PINATA_API_URL.to_string()),
                dynamodb_endpoint_url: get("DYNAMODB_ENDPOINT_URL"),
            })
        } else {
            None
        };

        let max_upload_mb: u64 = parse_or(get("MAX_UPLOAD_MB"), "MAX_UPLOAD_MB", 50)?;
        let max_upload_bytes = max_upload_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| ConfigError::Invalid {
                name: "MAX_UPLOAD_MB",
                value: max_upload_mb.to_string(),
            })?;
        let timeout_secs: u64 =
            parse_or(get("PROCESSING_TIMEOUT_SECS"), "PROCESSING_TIMEOUT_SECS", 120)?;

        Ok(Self {
            port: parse_or(get("PORT"), "PORT", 8081)?,
            static_dir: path_or("STATIC_DIR", "static"),
            upload_dir: get("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            pipeline_config: path_or("PIPELINE_CONFIG", "config/pipeline.yaml"),
            cascade_path: path_or("CASCADE_PATH", "models/haarcascade_frontalface_default.xml"),
            face_model_path: path_or("FACE_MODEL_PATH", "models/xception_deepfake.safetensors"),
            text_model_dir: path_or("TEXT_MODEL_DIR", "models/distilbert_text"),
            text_tokenizer: get("TEXT_TOKENIZER")
                .unwrap_or_else(|| "distilbert-base-uncased".to_string()),
            max_upload_bytes,
            processing_timeout: Duration::from_secs(timeout_secs),
            persistence,
        })
    }
}

fn parse_or<T: FromStr>(
    value: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
