use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{FaceDetail, MediaKind, PredictionResponse, VerdictLabel};
use uuid::Uuid;

use crate::media::MediaInput;
use crate::pipeline::aggregator::round2;

/// One persisted verdict together with what was submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub id: Uuid,
    pub user_id: String,
    pub file_name: String,
    pub file_size_mb: f64,
    pub media_kind: MediaKind,
    pub ipfs_hash: Option<String>,
    pub sha256: String,
    pub prediction: VerdictLabel,
    pub confidence: f64,
    pub total_faces_analyzed: usize,
    pub processing_time: f64,
    pub details: Vec<FaceDetail>,
    pub created_at: DateTime<Utc>,
}

impl VerdictRecord {
    pub fn new(
        user_id: String,
        input: &MediaInput,
        sha256: String,
        ipfs_hash: Option<String>,
        response: &PredictionResponse,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            file_name: input.file_name.clone(),
            file_size_mb: round2(input.size_bytes as f64 / (1024.0 * 1024.0)),
            media_kind: input.kind,
            ipfs_hash,
            sha256,
            prediction: response.prediction,
            confidence: response.confidence,
            total_faces_analyzed: response.total_faces_analyzed,
            processing_time: response.processing_time,
            details: response.details.clone(),
            created_at: Utc::now(),
        }
    }
}
