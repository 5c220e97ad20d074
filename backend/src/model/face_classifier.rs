use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use image::RgbImage;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::xception::Xception;
use super::{InferenceError, select_device};

/// Scores face crops with a probability of being manipulated.
pub trait FaceClassifier: Send + Sync {
    /// One score in `[0, 1]` per face, in input order.
    fn score_batch(&self, faces: &[&RgbImage]) -> Result<Vec<f32>, InferenceError>;

    fn batch_size(&self) -> usize {
        16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierParams {
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// The checkpoint was trained on OpenCV-decoded (BGR) crops.
    #[serde(default = "default_channel_order")]
    pub channel_order: ChannelOrder,
}

fn default_input_size() -> u32 {
    299
}

fn default_batch_size() -> usize {
    16
}

fn default_channel_order() -> ChannelOrder {
    ChannelOrder::Bgr
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            batch_size: default_batch_size(),
            channel_order: default_channel_order(),
        }
    }
}

pub struct XceptionClassifier {
    model: Xception,
    device: Device,
    params: ClassifierParams,
}

impl XceptionClassifier {
    pub fn load(weights: &Path, params: ClassifierParams) -> Result<Self, InferenceError> {
        let device = select_device();
        log::info!(
            "Loading face classifier from {} on {:?}",
            weights.display(),
            device
        );
        if !weights.is_file() {
            return Err(InferenceError::LoadError(format!(
                "weights not found at {}",
                weights.display()
            )));
        }
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        Self::from_var_builder(vb, device, params)
    }

    pub fn from_var_builder(
        vb: VarBuilder,
        device: Device,
        params: ClassifierParams,
    ) -> Result<Self, InferenceError> {
        if params.input_size < 71 {
            return Err(InferenceError::LoadError(format!(
                "input size {} is below the 71px minimum",
                params.input_size
            )));
        }
        let model = Xception::new(vb)?;
        Ok(Self {
            model,
            device,
            params,
        })
    }

    fn preprocess(&self, faces: &[&RgbImage]) -> Result<Tensor, InferenceError> {
        let size = self.params.input_size;
        let plane = (size * size) as usize;
        let mut data = vec![0f32; faces.len() * 3 * plane];

        for (index, face) in faces.iter().enumerate() {
            if face.width() == 0 || face.height() == 0 {
                return Err(InferenceError::PreprocessingError(
                    "empty face crop".to_string(),
                ));
            }
            let resized;
            let face = if face.dimensions() == (size, size) {
                *face
            } else {
                resized = imageops::resize(*face, size, size, FilterType::Triangle);
                &resized
            };

            let offset = index * 3 * plane;
            for (i, pixel) in face.pixels().enumerate() {
                let [r, g, b] = pixel.0;
                let ordered = match self.params.channel_order {
                    ChannelOrder::Rgb => [r, g, b],
                    ChannelOrder::Bgr => [b, g, r],
                };
                for (channel, value) in ordered.into_iter().enumerate() {
                    data[offset + channel * plane + i] = value as f32 / 127.5 - 1.0;
                }
            }
        }

        let tensor = Tensor::from_vec(
            data,
            (faces.len(), 3, size as usize, size as usize),
            &self.device,
        )?;
        Ok(tensor)
    }
}

impl FaceClassifier for XceptionClassifier {
    fn score_batch(&self, faces: &[&RgbImage]) -> Result<Vec<f32>, InferenceError> {
        if faces.is_empty() {
            return Ok(Vec::new());
        }
        let input = self.preprocess(faces)?;
        let output = self.model.forward(&input)?;
        let scores = output.flatten_all()?.to_vec1::<f32>()?;
        if scores.len() != faces.len() {
            return Err(InferenceError::PreprocessingError(format!(
                "expected {} scores, model produced {}",
                faces.len(),
                scores.len()
            )));
        }
        Ok(scores.into_iter().map(|s| s.clamp(0.0, 1.0)).collect())
    }

    fn batch_size(&self) -> usize {
        self.params.batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn zero_classifier(channel_order: ChannelOrder) -> XceptionClassifier {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        XceptionClassifier::from_var_builder(
            vb,
            device,
            ClassifierParams {
                input_size: 71,
                batch_size: 4,
                channel_order,
            },
        )
        .unwrap()
    }

    #[test]
    fn preprocessing_scales_to_unit_range_in_bgr() {
        let classifier = zero_classifier(ChannelOrder::Bgr);
        let face = RgbImage::from_pixel(71, 71, Rgb([255, 0, 0]));
        let tensor = classifier.preprocess(&[&face]).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 71, 71]);
        let means = tensor
            .mean((2, 3))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        // red lands in the last plane
        assert!((means[0] + 1.0).abs() < 1e-5);
        assert!((means[1] + 1.0).abs() < 1e-5);
        assert!((means[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn odd_sized_crops_are_resized() {
        let classifier = zero_classifier(ChannelOrder::Rgb);
        let face = RgbImage::from_pixel(40, 90, Rgb([128, 128, 128]));
        let tensor = classifier.preprocess(&[&face, &face]).unwrap();
        assert_eq!(tensor.dims(), &[2, 3, 71, 71]);
    }

    #[test]
    fn scores_follow_input_order_and_count() {
        let classifier = zero_classifier(ChannelOrder::Bgr);
        let a = RgbImage::new(71, 71);
        let b = RgbImage::new(100, 100);
        let scores = classifier.score_batch(&[&a, &b]).unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|s| (s - 0.5).abs() < 1e-6));
        assert!(classifier.score_batch(&[]).unwrap().is_empty());
        assert_eq!(classifier.batch_size(), 4);
    }

    #[test]
    fn tiny_inputs_are_refused() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let params = ClassifierParams {
            input_size: 32,
            ..ClassifierParams::default()
        };
        assert!(matches!(
            XceptionClassifier::from_var_builder(vb, device, params),
            Err(InferenceError::LoadError(_))
        ));
    }
}
