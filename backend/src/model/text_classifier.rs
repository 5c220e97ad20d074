use candle_core::{D, DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::distilbert::{Config, DistilBertModel};
use hf_hub::{Repo, RepoType, api::sync::Api};
use serde::Deserialize;
use shared::TextLabel;
use std::path::{Path, PathBuf};
use tokenizers::{Tokenizer, TruncationParams};

use super::{InferenceError, select_device};

const MAX_SEQUENCE_LENGTH: usize = 512;
const NUM_LABELS: usize = 2;

/// Labels a passage of text as student-written or AI-generated.
pub trait TextClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<TextLabel, InferenceError>;
}

/// Where the tokenizer vocabulary comes from: a local `tokenizer.json`
/// or a Hugging Face repository id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerSource {
    File(PathBuf),
    Hub(String),
}

impl TokenizerSource {
    pub fn parse(value: &str) -> Self {
        let path = Path::new(value);
        if path.is_file() {
            TokenizerSource::File(path.to_path_buf())
        } else {
            TokenizerSource::Hub(value.to_string())
        }
    }

    fn resolve(&self) -> Result<PathBuf, InferenceError> {
        match self {
            TokenizerSource::File(path) => Ok(path.clone()),
            TokenizerSource::Hub(repo_id) => {
                log::info!("Fetching tokenizer from hub repo {}", repo_id);
                let api = Api::new().map_err(|e| InferenceError::LoadError(e.to_string()))?;
                api.repo(Repo::new(repo_id.clone(), RepoType::Model))
                    .get("tokenizer.json")
                    .map_err(|e| InferenceError::LoadError(e.to_string()))
            }
        }
    }
}

#[derive(Deserialize)]
struct HeadConfig {
    dim: usize,
}

pub struct DistilBertClassifier {
    model: DistilBertModel,
    pre_classifier: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
}

impl DistilBertClassifier {
    /// Loads `config.json` and `model.safetensors` from `model_dir`.
    pub fn load(model_dir: &Path, tokenizer: &TokenizerSource) -> Result<Self, InferenceError> {
        let device = select_device();
        log::info!(
            "Loading text classifier from {} on {:?}",
            model_dir.display(),
            device
        );

        let config_raw = std::fs::read_to_string(model_dir.join("config.json"))
            .map_err(|e| InferenceError::LoadError(format!("config.json: {}", e)))?;
        let config: Config = serde_json::from_str(&config_raw)
            .map_err(|e| InferenceError::LoadError(format!("config.json: {}", e)))?;
        let head: HeadConfig = serde_json::from_str(&config_raw)
            .map_err(|e| InferenceError::LoadError(format!("config.json: {}", e)))?;

        let weights = model_dir.join("model.safetensors");
        if !weights.is_file() {
            return Err(InferenceError::LoadError(format!(
                "weights not found at {}",
                weights.display()
            )));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        let model = DistilBertModel::load(vb.pp("distilbert"), &config)?;
        let pre_classifier = candle_nn::linear(head.dim, head.dim, vb.pp("pre_classifier"))?;
        let classifier = candle_nn::linear(head.dim, NUM_LABELS, vb.pp("classifier"))?;

        let mut tokenizer = Tokenizer::from_file(tokenizer.resolve()?)
            .map_err(|e| InferenceError::TokenizerError(e.to_string()))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQUENCE_LENGTH,
                ..Default::default()
            }))
            .map_err(|e| InferenceError::TokenizerError(e.to_string()))?;

        log::info!("Text classifier loaded");
        Ok(Self {
            model,
            pre_classifier,
            classifier,
            tokenizer,
            device,
        })
    }
}

impl TextClassifier for DistilBertClassifier {
    fn classify(&self, text: &str) -> Result<TextLabel, InferenceError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| InferenceError::TokenizerError(e.to_string()))?;
        let ids = encoding.get_ids();
        if ids.is_empty() {
            return Err(InferenceError::PreprocessingError(
                "text produced no tokens".to_string(),
            ));
        }

        let input_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        // All positions attend to each other.
        let mask = Tensor::zeros((ids.len(), ids.len()), DType::U8, &self.device)?;
        let hidden = self.model.forward(&input_ids, &mask)?;

        let cls = hidden.i((.., 0))?;
        let logits = cls
            .apply(&self.pre_classifier)?
            .relu()?
            .apply(&self.classifier)?;
        label_from_logits(&logits)
    }
}

/// Softmax over the class axis, then argmax.
pub fn label_from_logits(logits: &Tensor) -> Result<TextLabel, InferenceError> {
    let probs = candle_nn::ops::softmax(logits, D::Minus1)?;
    let index = probs
        .argmax(D::Minus1)?
        .flatten_all()?
        .to_vec1::<u32>()?
        .first()
        .copied()
        .ok_or_else(|| InferenceError::PreprocessingError("empty logits".to_string()))?;
    TextLabel::from_class_index(index as usize).ok_or_else(|| {
        InferenceError::PreprocessingError(format!("unexpected class index {}", index))
    })
}
