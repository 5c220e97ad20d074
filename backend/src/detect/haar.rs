//! Haar cascade face detection backed by OpenCV's `CascadeClassifier`.

use image::GrayImage;
use opencv::core::{CV_8UC1, Mat, Rect, Scalar, Size, Vector};
use opencv::objdetect::CascadeClassifier;
use opencv::prelude::*;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    #[error("cascade file {0} does not exist")]
    NotFound(String),
    #[error("cascade file {0} could not be loaded")]
    Unloadable(String),
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("cascade classifier lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanParams {
    pub scale_factor: f64,
    pub min_neighbors: usize,
    /// `None` lets OpenCV start from the cascade's own window size.
    pub min_size: Option<u32>,
}

/// A cascade loaded once at startup. OpenCV's detector mutates internal
/// buffers, so calls are serialised through a mutex.
pub struct HaarCascade {
    classifier: Mutex<CascadeClassifier>,
    window: (u32, u32),
}

impl HaarCascade {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CascadeError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        if !path.is_file() {
            return Err(CascadeError::NotFound(name));
        }
        let utf8 = path
            .to_str()
            .ok_or_else(|| CascadeError::Unloadable(name.clone()))?;

        let mut classifier = CascadeClassifier::new(utf8)?;
        if classifier.empty()? {
            return Err(CascadeError::Unloadable(name));
        }
        let window = classifier.get_original_window_size()?;
        Ok(Self {
            classifier: Mutex::new(classifier),
            window: (window.width.max(0) as u32, window.height.max(0) as u32),
        })
    }

    pub fn window_size(&self) -> (u32, u32) {
        self.window
    }

    pub fn detect_multi_scale(
        &self,
        gray: &GrayImage,
        params: &ScanParams,
    ) -> Result<Vec<Rect>, CascadeError> {
        let (width, height) = gray.dimensions();
        if width < self.window.0 || height < self.window.1 {
            return Ok(Vec::new());
        }

        let mut mat =
            Mat::new_rows_cols_with_default(height as i32, width as i32, CV_8UC1, Scalar::all(0.0))?;
        mat.data_bytes_mut()?.copy_from_slice(gray.as_raw());

        let min_size = params
            .min_size
            .map(|s| Size::new(s as i32, s as i32))
            .unwrap_or_default();

        let mut faces = Vector::<Rect>::new();
        let mut classifier = self.classifier.lock().map_err(|_| CascadeError::Poisoned)?;
        classifier.detect_multi_scale(
            &mat,
            &mut faces,
            params.scale_factor,
            params.min_neighbors as i32,
            0,
            min_size,
            Size::default(),
        )?;
        Ok(faces.to_vec())
    }
}
