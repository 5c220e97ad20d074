pub mod aggregator;
pub mod service;

use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::detect::haar::CascadeError;
use crate::detect::{FaceLocator, FaceRegion};
use crate::media::MediaError;
use crate::media::MediaInput;
use crate::media::ffmpeg::VideoDecoder;
use crate::media::frame_sampler::FrameSampler;
use crate::model::InferenceError;
use crate::model::face_classifier::FaceClassifier;
use aggregator::{FaceScore, Verdict, aggregate};
use shared::MediaKind;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no faces detected")]
    NoFacesDetected,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("face detection failed: {0}")]
    Detection(#[from] CascadeError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("processing exceeded {limit_secs}s")]
    Timeout { limit_secs: u64 },
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    Extracting,
    FaceDetected,
    NoFace,
    Classifying,
    Aggregated,
    Uploaded,
    Persisted,
    Completed,
    Failed,
}

/// Current state of one request, logging every transition.
#[derive(Debug)]
pub struct StateTracker {
    request_id: Uuid,
    state: PipelineState,
}

impl StateTracker {
    pub fn new(request_id: Uuid) -> Self {
        Self::resume(request_id, PipelineState::Received)
    }

    pub fn resume(request_id: Uuid, state: PipelineState) -> Self {
        Self { request_id, state }
    }

    pub fn advance(&mut self, next: PipelineState) {
        log::debug!("[{}] {:?} -> {:?}", self.request_id, self.state, next);
        self.state = next;
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }
}

/// Wall-clock budget for one request.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn check(&self) -> Result<(), PipelineError> {
        if self.elapsed() > self.limit {
            Err(PipelineError::Timeout {
                limit_secs: self.limit.as_secs(),
            })
        } else {
            Ok(())
        }
    }
}

/// Media in, verdict out: frame sampling, face location, classification
/// and aggregation. Runs synchronously; callers move it onto a blocking
/// thread.
pub struct MediaPipeline {
    locator: FaceLocator,
    classifier: Arc<dyn FaceClassifier>,
    decoder: Arc<dyn VideoDecoder>,
    fallback_fps: f64,
}

impl MediaPipeline {
    pub fn new(
        locator: FaceLocator,
        classifier: Arc<dyn FaceClassifier>,
        decoder: Arc<dyn VideoDecoder>,
        fallback_fps: f64,
    ) -> Self {
        Self {
            locator,
            classifier,
            decoder,
            fallback_fps,
        }
    }

    pub fn analyze(
        &self,
        input: &MediaInput,
        deadline: &Deadline,
        request_id: Uuid,
    ) -> Result<Verdict, PipelineError> {
        let mut state = StateTracker::new(request_id);
        let result = self.run(input, deadline, &mut state);
        if let Err(e) = &result {
            if state.state() != PipelineState::NoFace {
                log::debug!("[{}] failed: {}", request_id, e);
                state.advance(PipelineState::Failed);
            }
        }
        result
    }

    fn run(
        &self,
        input: &MediaInput,
        deadline: &Deadline,
        state: &mut StateTracker,
    ) -> Result<Verdict, PipelineError> {
        state.advance(PipelineState::Extracting);
        let regions = match input.kind {
            MediaKind::Image => self.extract_from_image(&input.path)?,
            MediaKind::Video => self.extract_from_video(&input.path, deadline)?,
        };

        if regions.is_empty() {
            state.advance(PipelineState::NoFace);
            return Err(PipelineError::NoFacesDetected);
        }
        state.advance(PipelineState::FaceDetected);
        deadline.check()?;

        state.advance(PipelineState::Classifying);
        let scores = self.classify(&regions, deadline)?;

        state.advance(PipelineState::Aggregated);
        Ok(aggregate(scores, deadline.elapsed()))
    }

    fn extract_from_image(&self, path: &Path) -> Result<Vec<FaceRegion>, PipelineError> {
        let image = decode_upright(path)?.to_rgb8();
        Ok(self.locator.locate_in_image(&image)?)
    }

    fn extract_from_video(
        &self,
        path: &Path,
        deadline: &Deadline,
    ) -> Result<Vec<FaceRegion>, PipelineError> {
        let source = self.decoder.open(path)?;
        let sampler = FrameSampler::new(source, self.fallback_fps);
        log::debug!(
            "Sampling {} at {:.2} fps, every {} frames",
            path.display(),
            sampler.fps(),
            sampler.stride()
        );

        let mut regions = Vec::new();
        let mut sampled = 0usize;
        for frame in sampler {
            deadline.check()?;
            regions.extend(self.locator.locate_in_frame(&frame)?);
            sampled += 1;
        }
        log::debug!("{} faces across {} sampled frames", regions.len(), sampled);
        Ok(regions)
    }

    fn classify(
        &self,
        regions: &[FaceRegion],
        deadline: &Deadline,
    ) -> Result<Vec<FaceScore>, PipelineError> {
        let batch_size = self.classifier.batch_size().max(1);
        let mut scores = Vec::with_capacity(regions.len());

        for chunk in regions.chunks(batch_size) {
            deadline.check()?;
            let images: Vec<&RgbImage> = chunk.iter().map(|r| &r.image).collect();
            let confidences = self.classifier.score_batch(&images)?;
            if confidences.len() != chunk.len() {
                return Err(PipelineError::Internal(format!(
                    "classifier returned {} scores for {} faces",
                    confidences.len(),
                    chunk.len()
                )));
            }
            scores.extend(chunk.iter().zip(confidences).map(|(region, confidence)| FaceScore {
                confidence: confidence as f64,
                provenance: region.provenance,
            }));
        }
        Ok(scores)
    }
}

/// Decodes a still image and applies its EXIF orientation.
fn decode_upright(path: &Path) -> Result<DynamicImage, MediaError> {
    let mut decoder = ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detect::tests::{FixedDetector, face_box};
    use crate::detect::{DetectorParams, FaceDetector};
    use crate::media::frame_sampler::FrameSource;
    use crate::media::frame_sampler::tests::SyntheticSource;
    use image::Rgb;
    use shared::VerdictLabel;
    use std::sync::Mutex;

    /// Scores every face with the same confidence and records batch sizes.
    pub(crate) struct ConstantClassifier {
        pub score: f32,
        pub batch: usize,
        pub batches: Mutex<Vec<usize>>,
    }

    impl ConstantClassifier {
        pub(crate) fn new(score: f32) -> Self {
            Self {
                score,
                batch: 16,
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    impl FaceClassifier for ConstantClassifier {
        fn score_batch(&self, faces: &[&RgbImage]) -> Result<Vec<f32>, InferenceError> {
            self.batches.lock().unwrap().push(faces.len());
            Ok(vec![self.score; faces.len()])
        }

        fn batch_size(&self) -> usize {
            self.batch
        }
    }

    pub(crate) struct SyntheticDecoder {
        pub fps: f64,
        pub frames: u64,
        pub fail_at: Option<u64>,
    }

    impl VideoDecoder for SyntheticDecoder {
        fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
            let mut source = SyntheticSource::new(self.fps, self.frames);
            source.fail_at = self.fail_at;
            Ok(Box::new(source))
        }
    }

    struct UnreadableDecoder;

    impl VideoDecoder for UnreadableDecoder {
        fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
            Err(MediaError::NoVideoStream)
        }
    }

    pub(crate) fn pipeline_with(
        detector: Arc<dyn FaceDetector>,
        classifier: Arc<dyn FaceClassifier>,
        decoder: Arc<dyn VideoDecoder>,
    ) -> MediaPipeline {
        MediaPipeline::new(
            FaceLocator::new(detector, DetectorParams::default()),
            classifier,
            decoder,
            30.0,
        )
    }

    pub(crate) fn write_png(dir: &Path, name: &str) -> MediaInput {
        let path = dir.join(name);
        RgbImage::from_pixel(64, 64, Rgb([120, 90, 60]))
            .save(&path)
            .unwrap();
        MediaInput {
            file_name: name.to_string(),
            kind: MediaKind::Image,
            size_bytes: std::fs::metadata(&path).unwrap().len(),
            path,
        }
    }

    fn video_input(dir: &Path) -> MediaInput {
        let path = dir.join("clip.mp4");
        std::fs::write(&path, b"not inspected by the synthetic decoder").unwrap();
        MediaInput {
            file_name: "clip.mp4".to_string(),
            kind: MediaKind::Video,
            size_bytes: 38,
            path,
        }
    }

    fn generous() -> Deadline {
        Deadline::new(Duration::from_secs(60))
    }

    #[test]
    fn image_with_one_face_has_no_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_png(dir.path(), "face.png");
        let pipeline = pipeline_with(
            Arc::new(FixedDetector::new(vec![face_box(8, 8, 32, 32)])),
            Arc::new(ConstantClassifier::new(0.8)),
            Arc::new(UnreadableDecoder),
        );
        let verdict = pipeline.analyze(&input, &generous(), Uuid::new_v4()).unwrap();
        assert_eq!(verdict.total_faces_analyzed, 1);
        assert_eq!(verdict.details[0].provenance, None);
        assert_eq!(verdict.label, VerdictLabel::Fake);
    }

    /// A JPEG whose EXIF block says "rotate 90 degrees clockwise to display".
    fn write_rotated_jpeg(dir: &Path, width: u32, height: u32) -> MediaInput {
        let mut encoded = Vec::new();
        RgbImage::from_pixel(width, height, Rgb([200, 150, 120]))
            .write_to(&mut std::io::Cursor::new(&mut encoded), image::ImageFormat::Jpeg)
            .unwrap();

        let mut tiff = b"MM\x00\x2a\x00\x00\x00\x08".to_vec();
        tiff.extend_from_slice(&[0x00, 0x01]);
        // tag 0x0112 Orientation, SHORT, count 1, value 6
        tiff.extend_from_slice(&[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
        tiff.extend_from_slice(&[0x00, 0x06, 0x00, 0x00]);
        tiff.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        let mut app1 = b"Exif\x00\x00".to_vec();
        app1.extend_from_slice(&tiff);

        let mut jpeg = encoded[..2].to_vec();
        jpeg.extend_from_slice(&[0xff, 0xe1]);
        jpeg.extend_from_slice(&((app1.len() + 2) as u16).to_be_bytes());
        jpeg.extend_from_slice(&app1);
        jpeg.extend_from_slice(&encoded[2..]);

        let path = dir.join("portrait.jpg");
        std::fs::write(&path, &jpeg).unwrap();
        MediaInput {
            file_name: "portrait.jpg".to_string(),
            kind: MediaKind::Image,
            size_bytes: jpeg.len() as u64,
            path,
        }
    }

    #[test]
    fn exif_orientation_is_applied_before_detection() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_rotated_jpeg(dir.path(), 40, 20);
        let detector = Arc::new(FixedDetector::new(vec![face_box(2, 2, 10, 10)]));
        let pipeline = pipeline_with(
            detector.clone(),
            Arc::new(ConstantClassifier::new(0.4)),
            Arc::new(UnreadableDecoder),
        );
        pipeline.analyze(&input, &generous(), Uuid::new_v4()).unwrap();
        assert_eq!(*detector.dimensions.lock().unwrap(), vec![(20, 40)]);
    }

    #[test]
    fn same_image_twice_gives_the_same_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_png(dir.path(), "face.png");
        let pipeline = pipeline_with(
            Arc::new(FixedDetector::new(vec![
                face_box(4, 4, 20, 20),
                face_box(30, 30, 24, 24),
            ])),
            Arc::new(ConstantClassifier::new(0.37)),
            Arc::new(UnreadableDecoder),
        );
        let mut first = pipeline
            .analyze(&input, &generous(), Uuid::new_v4())
            .unwrap()
            .to_response();
        let mut second = pipeline
            .analyze(&input, &generous(), Uuid::new_v4())
            .unwrap()
            .to_response();
        first.processing_time = 0.0;
        second.processing_time = 0.0;
        assert_eq!(first, second);
        assert_eq!(first.total_faces_analyzed, 2);
    }

    #[test]
    fn image_without_faces_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_png(dir.path(), "empty.png");
        let pipeline = pipeline_with(
            Arc::new(FixedDetector::new(vec![])),
            Arc::new(ConstantClassifier::new(0.8)),
            Arc::new(UnreadableDecoder),
        );
        assert!(matches!(
            pipeline.analyze(&input, &generous(), Uuid::new_v4()),
            Err(PipelineError::NoFacesDetected)
        ));
    }

    #[test]
    fn corrupt_image_is_a_media_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"\xff\xd8 definitely not a jpeg").unwrap();
        let input = MediaInput {
            file_name: "broken.jpg".into(),
            kind: MediaKind::Image,
            size_bytes: 26,
            path,
        };
        let pipeline = pipeline_with(
            Arc::new(FixedDetector::new(vec![face_box(0, 0, 4, 4)])),
            Arc::new(ConstantClassifier::new(0.1)),
            Arc::new(UnreadableDecoder),
        );
        match pipeline.analyze(&input, &generous(), Uuid::new_v4()) {
            Err(PipelineError::Media(e)) => assert!(e.is_unreadable()),
            other => panic!("unexpected result: {:?}", other.map(|v| v.label)),
        }
    }

    #[test]
    fn video_faces_follow_frame_order() {
        let dir = tempfile::tempdir().unwrap();
        let detector = Arc::new(FixedDetector::new(vec![
            face_box(0, 0, 2, 2),
            face_box(2, 2, 2, 2),
        ]));
        let pipeline = pipeline_with(
            detector.clone(),
            Arc::new(ConstantClassifier::new(0.2)),
            Arc::new(SyntheticDecoder {
                fps: 25.0,
                frames: 75,
                fail_at: None,
            }),
        );
        let verdict = pipeline
            .analyze(&video_input(dir.path()), &generous(), Uuid::new_v4())
            .unwrap();
        let frames: Vec<u64> = verdict
            .details
            .iter()
            .map(|d| d.provenance.unwrap().frame_number)
            .collect();
        assert_eq!(frames, vec![0, 0, 25, 25, 50, 50]);
        assert_eq!(verdict.label, VerdictLabel::Real);
        assert_eq!(detector.min_sizes.lock().unwrap()[0], Some(60));
    }

    #[test]
    fn truncated_video_keeps_earlier_faces() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(
            Arc::new(FixedDetector::new(vec![face_box(0, 0, 2, 2)])),
            Arc::new(ConstantClassifier::new(0.6)),
            Arc::new(SyntheticDecoder {
                fps: 10.0,
                frames: 100,
                fail_at: Some(25),
            }),
        );
        let verdict = pipeline
            .analyze(&video_input(dir.path()), &generous(), Uuid::new_v4())
            .unwrap();
        assert_eq!(verdict.total_faces_analyzed, 3);
    }

    #[test]
    fn unreadable_video_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(
            Arc::new(FixedDetector::new(vec![face_box(0, 0, 2, 2)])),
            Arc::new(ConstantClassifier::new(0.6)),
            Arc::new(UnreadableDecoder),
        );
        assert!(matches!(
            pipeline.analyze(&video_input(dir.path()), &generous(), Uuid::new_v4()),
            Err(PipelineError::Media(MediaError::NoVideoStream))
        ));
    }

    #[test]
    fn classification_is_batched() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = Arc::new(ConstantClassifier {
            batch: 4,
            ..ConstantClassifier::new(0.5)
        });
        let pipeline = pipeline_with(
            Arc::new(FixedDetector::new(vec![face_box(0, 0, 2, 2); 3])),
            classifier.clone(),
            Arc::new(SyntheticDecoder {
                fps: 1.0,
                frames: 3,
                fail_at: None,
            }),
        );
        let verdict = pipeline
            .analyze(&video_input(dir.path()), &generous(), Uuid::new_v4())
            .unwrap();
        assert_eq!(verdict.total_faces_analyzed, 9);
        assert_eq!(*classifier.batches.lock().unwrap(), vec![4, 4, 1]);
    }

    #[test]
    fn expired_deadline_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(
            Arc::new(FixedDetector::new(vec![face_box(0, 0, 2, 2)])),
            Arc::new(ConstantClassifier::new(0.6)),
            Arc::new(SyntheticDecoder {
                fps: 30.0,
                frames: 90,
                fail_at: None,
            }),
        );
        let deadline = Deadline::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            pipeline.analyze(&video_input(dir.path()), &deadline, Uuid::new_v4()),
            Err(PipelineError::Timeout { limit_secs: 0 })
        ));
    }

    #[test]
    fn tracker_records_the_latest_state() {
        let mut tracker = StateTracker::new(Uuid::nil());
        assert_eq!(tracker.state(), PipelineState::Received);
        tracker.advance(PipelineState::Extracting);
        tracker.advance(PipelineState::Failed);
        assert_eq!(tracker.state(), PipelineState::Failed);
    }
}
