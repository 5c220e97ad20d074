use actix_web::web;
use shared::PredictionResponse;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{Deadline, MediaPipeline, PipelineError, PipelineState, StateTracker};
use crate::db::dynamodb_repository::VerdictStore;
use crate::db::models::VerdictRecord;
use crate::error::AppError;
use crate::media::MediaInput;
use crate::storage::pinata_service::ContentUploader;

pub struct PredictionRequest {
    pub input: MediaInput,
    pub sha256: String,
    pub user_id: Option<String>,
}

#[derive(Clone)]
struct Persistence {
    uploader: Arc<dyn ContentUploader>,
    store: Arc<dyn VerdictStore>,
}

/// Runs the media pipeline off the async workers and, when persistence is
/// on, pins the upload and records the verdict.
#[derive(Clone)]
pub struct PredictionService {
    pipeline: Arc<MediaPipeline>,
    persistence: Option<Persistence>,
    timeout: Duration,
}

impl PredictionService {
    pub fn new(pipeline: Arc<MediaPipeline>, timeout: Duration) -> Self {
        Self {
            pipeline,
            persistence: None,
            timeout,
        }
    }

    pub fn with_persistence(
        mut self,
        uploader: Arc<dyn ContentUploader>,
        store: Arc<dyn VerdictStore>,
    ) -> Self {
        self.persistence = Some(Persistence { uploader, store });
        self
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence.is_some()
    }

    pub async fn predict(&self, request: PredictionRequest) -> Result<PredictionResponse, AppError> {
        let user_id = match (&self.persistence, request.user_id.as_deref()) {
            (Some(_), None | Some("")) => {
                return Err(AppError::MissingInput("No user ID provided".to_string()));
            }
            (_, user_id) => user_id.unwrap_or_default().to_string(),
        };

        let request_id = Uuid::new_v4();
        let deadline = Deadline::new(self.timeout);
        log::info!(
            "[{}] Analyzing {} '{}' ({} bytes)",
            request_id,
            request.input.kind,
            request.input.file_name,
            request.input.size_bytes
        );

        let pipeline = self.pipeline.clone();
        let input = request.input.clone();
        let verdict = web::block(move || pipeline.analyze(&input, &deadline, request_id))
            .await?
            .map_err(|e| {
                match &e {
                    PipelineError::NoFacesDetected => {
                        log::info!("[{}] No faces detected", request_id)
                    }
                    other => log::error!("[{}] Analysis failed: {}", request_id, other),
                }
                e
            })?;

        let mut state = StateTracker::resume(request_id, PipelineState::Aggregated);
        let mut response = verdict.to_response();

        if let Some(persistence) = &self.persistence {
            let content = tokio::fs::read(&request.input.path)
                .await
                .map_err(|e| AppError::Internal(format!("Failed to read upload: {}", e)))?;

            let ipfs_hash = match persistence
                .uploader
                .upload(&request.input.file_name, content)
                .await
            {
                Ok(hash) => hash,
                Err(e) => {
                    log::error!("[{}] Upload failed: {}", request_id, e);
                    state.advance(PipelineState::Failed);
                    return Err(e.into());
                }
            };
            state.advance(PipelineState::Uploaded);
            response.file_hash = Some(ipfs_hash.clone());

            let record = VerdictRecord::new(
                user_id,
                &request.input,
                request.sha256,
                Some(ipfs_hash),
                &response,
            );
            match persistence.store.insert(&record).await {
                Ok(id) => {
                    response.db_id = Some(id);
                    state.advance(PipelineState::Persisted);
                }
                Err(e) => {
                    log::warn!("[{}] Verdict not persisted: {}", request_id, e);
                    response.db_error = Some(e.to_string());
                }
            }
        }

        state.advance(PipelineState::Completed);
        log::info!(
            "[{}] {} faces, {} at {:.2}% in {:.2}s",
            request_id,
            response.total_faces_analyzed,
            response.prediction,
            response.confidence,
            response.processing_time
        );
        Ok(response)
    }

    /// Persisted verdicts, oldest first.
    pub async fn history(&self) -> Result<Vec<VerdictRecord>, AppError> {
        let persistence = self
            .persistence
            .as_ref()
            .ok_or_else(|| AppError::Internal("Persistence is disabled".to_string()))?;
        persistence.store.list().await.map_err(|e| {
            log::error!("Failed to load verdict history: {}", e);
            AppError::Internal(format!("Failed to load history: {}", e))
        })
    }
}
