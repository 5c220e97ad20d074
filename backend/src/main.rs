mod config;
mod db;
mod detect;
mod error;
mod media;
mod model;
mod pipeline;
mod routes;
mod storage;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use config::{AppConfig, PipelineConfig};
use db::dynamodb_repository::DynamoDbRepository;
use detect::haar::HaarCascade;
use detect::{CascadeDetector, FaceDetector, FaceLocator};
use media::ffmpeg::FfmpegDecoder;
use model::face_classifier::{FaceClassifier, XceptionClassifier};
use model::text_classifier::{DistilBertClassifier, TextClassifier, TokenizerSource};
use pipeline::MediaPipeline;
use pipeline::service::PredictionService;
use routes::{UploadSettings, configure_routes};
use std::io::{Error, ErrorKind};
use std::sync::Arc;
use storage::pinata_service::PinataService;

fn startup_error(context: &str, err: impl std::fmt::Display) -> Error {
    log::error!("{}: {}", context, err);
    Error::new(ErrorKind::Other, format!("{}: {}", context, err))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::from_env().map_err(|e| startup_error("Invalid configuration", e))?;
    let pipeline_config = PipelineConfig::load(&config.pipeline_config)
        .map_err(|e| startup_error("Invalid pipeline config", e))?;

    log::info!(
        "Upload limit {} bytes, processing timeout {:?}, persistence {}",
        config.max_upload_bytes,
        config.processing_timeout,
        if config.persistence.is_some() { "enabled" } else { "disabled" }
    );

    std::fs::create_dir_all(&config.upload_dir)?;
    if let Err(e) = FfmpegDecoder::ensure_available() {
        log::warn!("{}; video uploads will fail", e);
    }

    let cascade = HaarCascade::from_file(&config.cascade_path)
        .map_err(|e| startup_error("Failed to load face cascade", e))?;
    let (window_w, window_h) = cascade.window_size();
    log::info!(
        "Loaded cascade {} ({}x{} window)",
        config.cascade_path.display(),
        window_w,
        window_h
    );
    let detector: Arc<dyn FaceDetector> =
        Arc::new(CascadeDetector::new(cascade, &pipeline_config.detector));

    let face_classifier: Arc<dyn FaceClassifier> = Arc::new(
        XceptionClassifier::load(&config.face_model_path, pipeline_config.classifier.clone())
            .map_err(|e| startup_error("Failed to load face classifier", e))?,
    );
    let text_classifier: Arc<dyn TextClassifier> = Arc::new(
        DistilBertClassifier::load(
            &config.text_model_dir,
            &TokenizerSource::parse(&config.text_tokenizer),
        )
        .map_err(|e| startup_error("Failed to load text classifier", e))?,
    );

    let pipeline = Arc::new(MediaPipeline::new(
        FaceLocator::new(detector, pipeline_config.detector.clone()),
        face_classifier,
        Arc::new(FfmpegDecoder::new(
            pipeline_config.video.max_duration_secs,
            pipeline_config.video.max_frame_dimension,
        )),
        pipeline_config.video.fallback_fps,
    ));
    let mut service = PredictionService::new(pipeline, config.processing_timeout);

    if let Some(persistence) = &config.persistence {
        let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut dynamodb_config = aws_sdk_dynamodb::config::Builder::from(&aws_config);
        if let Some(endpoint) = &persistence.dynamodb_endpoint_url {
            log::info!("Using DynamoDB endpoint {}", endpoint);
            dynamodb_config = dynamodb_config.endpoint_url(endpoint);
        }
        let repository = DynamoDbRepository::new(
            DynamoDbClient::from_conf(dynamodb_config.build()),
            persistence.verdicts_table.clone(),
        );
        let pinata = PinataService::new(
            persistence.pinata_api_url.clone(),
            persistence.pinata_api_key.clone(),
            persistence.pinata_secret_api_key.clone(),
        );
        service = service.with_persistence(Arc::new(pinata), Arc::new(repository));
        log::info!("Persisting verdicts to '{}'", persistence.verdicts_table);
    }

    let persistence_enabled = service.persistence_enabled();
    let service = web::Data::new(service);
    let uploads = web::Data::new(UploadSettings {
        upload_dir: config.upload_dir.clone(),
        max_bytes: config.max_upload_bytes,
        formats: pipeline_config.formats.clone(),
    });
    let text_classifier = web::Data::from(text_classifier);
    let static_dir = config.static_dir.clone();

    let bind_address = format!("0.0.0.0:{}", config.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .wrap(middleware::Logger::default())
            .app_data(service.clone())
            .app_data(uploads.clone())
            .app_data(text_classifier.clone())
            .configure(|cfg| configure_routes(cfg, &static_dir, persistence_enabled))
    })
    .bind(&bind_address)?
    .run()
    .await
}
