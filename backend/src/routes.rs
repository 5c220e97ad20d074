use actix_files::Files;
use actix_multipart::{Field, Multipart};
use actix_web::error::JsonPayloadError;
use actix_web::{HttpRequest, HttpResponse, web};
use futures::TryStreamExt;
use sha2::{Digest, Sha256};
use shared::{MediaKind, TextRequest, TextResponse};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::AppError;
use crate::media::{AcceptedFormats, MediaInput, file_extension};
use crate::model::text_classifier::TextClassifier;
use crate::pipeline::service::{PredictionRequest, PredictionService};

const MAX_TEXT_FIELD_BYTES: usize = 1024;

/// Where and how uploads are spooled before analysis.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub upload_dir: PathBuf,
    pub max_bytes: u64,
    pub formats: AcceptedFormats,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, static_dir: &Path, persistence_enabled: bool) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/text").route(web::post().to(classify_text)));
    if persistence_enabled {
        cfg.service(web::resource("/videos").route(web::get().to(list_videos)));
    }
    cfg.service(Files::new("/", static_dir).index_file("index.html"));
}

fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    log::info!("Rejected JSON body: {}", err);
    AppError::MissingInput(format!("Invalid JSON body: {}", err)).into()
}

struct ReceivedFile {
    file: NamedTempFile,
    file_name: String,
    kind: MediaKind,
    size_bytes: u64,
    sha256: String,
}

fn malformed(err: actix_multipart::MultipartError) -> AppError {
    AppError::MissingInput(format!("Malformed multipart body: {}", err))
}

/// Streams the `file` field into a temporary file, enforcing the size limit
/// as bytes arrive.
async fn receive_file(field: &mut Field, uploads: &UploadSettings) -> Result<ReceivedFile, AppError> {
    let file_name = field
        .content_disposition()
        .and_then(|cd| cd.get_filename())
        .map(str::to_string)
        .unwrap_or_default();
    if file_name.is_empty() {
        return Err(AppError::MissingInput("Empty filename.".to_string()));
    }
    let kind = uploads
        .formats
        .classify(&file_name)
        .ok_or(AppError::UnsupportedFormat)?;

    let suffix = format!(".{}", file_extension(&file_name).unwrap_or_default());
    let mut file = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(&suffix)
        .tempfile_in(&uploads.upload_dir)
        .map_err(|e| AppError::Internal(format!("Failed to create upload file: {}", e)))?;

    let mut hasher = Sha256::new();
    let mut size_bytes = 0u64;
    while let Some(chunk) = field.try_next().await.map_err(malformed)? {
        size_bytes += chunk.len() as u64;
        if size_bytes > uploads.max_bytes {
            return Err(AppError::PayloadTooLarge(format!(
                "File exceeds the {} MB upload limit.",
                uploads.max_bytes / (1024 * 1024)
            )));
        }
        hasher.update(&chunk);
        file.write_all(&chunk)
            .map_err(|e| AppError::Internal(format!("Failed to write upload: {}", e)))?;
    }
    if size_bytes == 0 {
        return Err(AppError::MissingInput("Empty file.".to_string()));
    }
    file.flush()
        .map_err(|e| AppError::Internal(format!("Failed to write upload: {}", e)))?;

    Ok(ReceivedFile {
        file,
        file_name,
        kind,
        size_bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}

async fn read_text_field(field: &mut Field) -> Result<String, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.try_next().await.map_err(malformed)? {
        if bytes.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
            return Err(AppError::PayloadTooLarge(
                "Form field is too long.".to_string(),
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

async fn predict(
    service: web::Data<PredictionService>,
    uploads: web::Data<UploadSettings>,
    mut payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let mut upload: Option<ReceivedFile> = None;
    let mut user_id: Option<String> = None;

    while let Some(mut field) = payload.try_next().await.map_err(malformed)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") if upload.is_none() => {
                upload = Some(receive_file(&mut field, &uploads).await?);
            }
            Some("userId") => {
                user_id = Some(read_text_field(&mut field).await?).filter(|id| !id.is_empty());
            }
            _ => {
                while field.try_next().await.map_err(malformed)?.is_some() {}
            }
        }
    }

    let ReceivedFile {
        file,
        file_name,
        kind,
        size_bytes,
        sha256,
    } = upload.ok_or_else(|| AppError::MissingInput("No file provided.".to_string()))?;

    let input = MediaInput {
        file_name,
        kind,
        path: file.path().to_path_buf(),
        size_bytes,
    };
    let response = service
        .predict(PredictionRequest {
            input,
            sha256,
            user_id,
        })
        .await?;

    // The temporary file lives until the verdict is out.
    drop(file);
    Ok(HttpResponse::Ok().json(response))
}

async fn classify_text(
    classifier: web::Data<dyn TextClassifier>,
    body: web::Json<TextRequest>,
) -> Result<HttpResponse, AppError> {
    let text = body
        .into_inner()
        .text
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::MissingInput("No text provided".to_string()))?;

    let classifier = classifier.into_inner();
    let classification = web::block(move || classifier.classify(&text))
        .await?
        .map_err(|e| {
            log::error!("Text classification failed: {}", e);
            AppError::Internal(format!("Text classification failed: {}", e))
        })?;

    log::info!("Text classified as {}", classification);
    Ok(HttpResponse::Ok().json(TextResponse { classification }))
}

async fn list_videos(service: web::Data<PredictionService>) -> Result<HttpResponse, AppError> {
    let records = service.history().await?;
    Ok(HttpResponse::Ok().json(records))
}
