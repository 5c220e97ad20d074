pub mod face_classifier;
pub mod text_classifier;
pub mod xception;

use candle_core::Device;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("preprocessing failed: {0}")]
    PreprocessingError(String),
    #[error("model error: {0}")]
    ModelError(#[from] candle_core::Error),
    #[error("failed to load model: {0}")]
    LoadError(String),
    #[error("tokenizer error: {0}")]
    TokenizerError(String),
}

pub fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            log::warn!("CUDA device unavailable, using CPU: {}", e);
            Device::Cpu
        }
    }
}
