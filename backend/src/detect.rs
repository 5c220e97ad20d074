pub mod haar;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use opencv::core::Rect;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::media::frame_sampler::Frame;
use haar::{CascadeError, HaarCascade, ScanParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Where a face came from. Still images carry none.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Provenance {
    pub frame_number: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone)]
pub struct FaceRegion {
    pub image: RgbImage,
    pub bounds: FaceBox,
    pub provenance: Option<Provenance>,
}

/// Finds face rectangles in a grayscale image.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, gray: &GrayImage, min_size: Option<u32>) -> Result<Vec<FaceBox>, CascadeError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorParams {
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default = "default_min_neighbors")]
    pub min_neighbors: usize,
    #[serde(default)]
    pub image_min_face_size: Option<u32>,
    #[serde(default = "default_video_min_face_size")]
    pub video_min_face_size: Option<u32>,
    /// Side length video-frame crops are resized to before classification.
    #[serde(default = "default_video_face_size")]
    pub video_face_size: u32,
}

fn default_scale_factor() -> f64 {
    1.1
}

fn default_min_neighbors() -> usize {
    5
}

fn default_video_min_face_size() -> Option<u32> {
    Some(60)
}

fn default_video_face_size() -> u32 {
    299
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: default_scale_factor(),
            min_neighbors: default_min_neighbors(),
            image_min_face_size: None,
            video_min_face_size: default_video_min_face_size(),
            video_face_size: default_video_face_size(),
        }
    }
}

pub struct CascadeDetector {
    cascade: HaarCascade,
    scale_factor: f64,
    min_neighbors: usize,
}

impl CascadeDetector {
    pub fn new(cascade: HaarCascade, params: &DetectorParams) -> Self {
        Self {
            cascade,
            scale_factor: params.scale_factor,
            min_neighbors: params.min_neighbors,
        }
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &GrayImage, min_size: Option<u32>) -> Result<Vec<FaceBox>, CascadeError> {
        let params = ScanParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size,
        };
        let rects = self.cascade.detect_multi_scale(gray, &params)?;
        Ok(clip_to_image(&rects, gray.width(), gray.height()))
    }
}

fn clip_to_image(rects: &[Rect], width: u32, height: u32) -> Vec<FaceBox> {
    rects
        .iter()
        .filter_map(|r| {
            let x = r.x.max(0) as u32;
            let y = r.y.max(0) as u32;
            let right = (r.x + r.width).min(width as i32);
            let bottom = (r.y + r.height).min(height as i32);
            (right > x as i32 && bottom > y as i32).then(|| FaceBox {
                x,
                y,
                width: right as u32 - x,
                height: bottom as u32 - y,
            })
        })
        .collect()
}

/// ITU-R BT.601 luma, the weighting the cascades were trained on.
pub fn to_grayscale(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        Luma([luma.round().clamp(0.0, 255.0) as u8])
    })
}

/// Turns detector boxes into cropped face regions.
#[derive(Clone)]
pub struct FaceLocator {
    detector: Arc<dyn FaceDetector>,
    params: DetectorParams,
}

impl FaceLocator {
    pub fn new(detector: Arc<dyn FaceDetector>, params: DetectorParams) -> Self {
        Self { detector, params }
    }

    /// Still images: native-size crops, no provenance.
    pub fn locate_in_image(&self, image: &RgbImage) -> Result<Vec<FaceRegion>, CascadeError> {
        self.locate(image, self.params.image_min_face_size, None, None)
    }

    /// Video frames: crops resized to the canonical size, tagged with the
    /// frame's position.
    pub fn locate_in_frame(&self, frame: &Frame) -> Result<Vec<FaceRegion>, CascadeError> {
        let provenance = Provenance {
            frame_number: frame.frame_number,
            timestamp: frame.timestamp,
        };
        self.locate(
            &frame.image,
            self.params.video_min_face_size,
            Some(provenance),
            Some(self.params.video_face_size),
        )
    }

    fn locate(
        &self,
        image: &RgbImage,
        min_size: Option<u32>,
        provenance: Option<Provenance>,
        resize_to: Option<u32>,
    ) -> Result<Vec<FaceRegion>, CascadeError> {
        let gray = to_grayscale(image);
        let boxes = self.detector.detect(&gray, min_size)?;
        let regions = boxes
            .into_iter()
            .filter(|b| b.width > 0 && b.height > 0)
            .map(|bounds| {
                let crop =
                    imageops::crop_imm(image, bounds.x, bounds.y, bounds.width, bounds.height)
                        .to_image();
                let crop = match resize_to {
                    Some(size) => imageops::resize(&crop, size, size, FilterType::Triangle),
                    None => crop,
                };
                FaceRegion {
                    image: crop,
                    bounds,
                    provenance,
                }
            })
            .collect();
        Ok(regions)
    }
}
