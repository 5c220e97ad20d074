use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Mean face confidence at or above which media is labelled fake.
pub const FAKE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum VerdictLabel {
    Real,
    Fake,
}

impl VerdictLabel {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence < FAKE_THRESHOLD {
            VerdictLabel::Real
        } else {
            VerdictLabel::Fake
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum TextLabel {
    #[serde(rename = "Student-Written")]
    #[strum(serialize = "Student-Written")]
    StudentWritten,
    #[serde(rename = "AI-Generated")]
    #[strum(serialize = "AI-Generated")]
    AiGenerated,
}

impl TextLabel {
    /// Maps the classifier's output index; 0 is human, 1 is machine.
    pub fn from_class_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(TextLabel::StudentWritten),
            1 => Some(TextLabel::AiGenerated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetail {
    pub frame_number: Option<u64>,
    pub timestamp: Option<f64>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: VerdictLabel,
    pub confidence: f64,
    pub total_faces_analyzed: usize,
    pub processing_time: f64,
    pub details: Vec<FaceDetail>,
    #[serde(rename = "fileHash", default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextRequest {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextResponse {
    pub classification: TextLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn label_threshold_is_inclusive_for_fake() {
        assert_eq!(VerdictLabel::from_confidence(0.4999), VerdictLabel::Real);
        assert_eq!(VerdictLabel::from_confidence(0.5), VerdictLabel::Fake);
        assert_eq!(VerdictLabel::from_confidence(0.0), VerdictLabel::Real);
    }

    #[test]
    fn text_labels_use_display_names() {
        assert_eq!(TextLabel::StudentWritten.to_string(), "Student-Written");
        assert_eq!(
            serde_json::to_value(TextLabel::AiGenerated).unwrap(),
            serde_json::json!("AI-Generated")
        );
        assert_eq!(TextLabel::from_class_index(2), None);
    }

    #[test]
    fn media_kind_is_lowercase() {
        assert_eq!(MediaKind::Video.to_string(), "video");
        assert_eq!(MediaKind::from_str("image").unwrap(), MediaKind::Image);
    }

    #[test]
    fn optional_response_fields_are_omitted() {
        let response = PredictionResponse {
            prediction: VerdictLabel::Real,
            confidence: 12.5,
            total_faces_analyzed: 1,
            processing_time: 0.3,
            details: vec![FaceDetail {
                frame_number: None,
                timestamp: None,
                confidence: 12.5,
            }],
            file_hash: None,
            db_id: None,
            db_error: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("fileHash").is_none());
        assert!(json.get("db_error").is_none());
        assert_eq!(json["details"][0]["frame_number"], serde_json::Value::Null);
        assert_eq!(json["prediction"], "Real");
    }
}
