use shared::{FaceDetail, PredictionResponse, VerdictLabel};
use std::time::Duration;

use crate::detect::Provenance;

/// Classifier output for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceScore {
    pub confidence: f64,
    pub provenance: Option<Provenance>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub label: VerdictLabel,
    /// Mean face confidence in `[0, 1]`, unrounded.
    pub confidence: f64,
    pub total_faces_analyzed: usize,
    pub processing_time: Duration,
    pub details: Vec<FaceScore>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn aggregate(scores: Vec<FaceScore>, elapsed: Duration) -> Verdict {
    let confidence = if scores.is_empty() {
        0.0
    } else {
        scores.iter().map(|s| s.confidence).sum::<f64>() / scores.len() as f64
    };

    Verdict {
        label: VerdictLabel::from_confidence(confidence),
        confidence,
        total_faces_analyzed: scores.len(),
        processing_time: elapsed,
        details: scores,
    }
}

impl Verdict {
    pub fn confidence_percent(&self) -> f64 {
        round2(self.confidence * 100.0)
    }

    pub fn to_response(&self) -> PredictionResponse {
        PredictionResponse {
            prediction: self.label,
            confidence: self.confidence_percent(),
            total_faces_analyzed: self.total_faces_analyzed,
            processing_time: round2(self.processing_time.as_secs_f64()),
            details: self
                .details
                .iter()
                .map(|score| FaceDetail {
                    frame_number: score.provenance.map(|p| p.frame_number),
                    timestamp: score.provenance.map(|p| round2(p.timestamp)),
                    confidence: round2(score.confidence * 100.0),
                })
                .collect(),
            file_hash: None,
            db_id: None,
            db_error: None,
        }
    }
}
