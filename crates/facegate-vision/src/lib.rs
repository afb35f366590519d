//! facegate-vision: ONNX Runtime implementations of the facegate collaborators.
//!
//! - [`UltraFaceDetector`]: face boxes (UltraFace RFB-320).
//! - [`FaceNetExtractor`]: 512-d descriptors (FaceNet, VGGFace2 weights).
//! - [`FaceMeshLandmarks`]: 468-point face mesh for the eye aspect ratio.
//!
//! All three run on CPU and are owned by a single thread; none is `Sync`.

pub mod detector;
pub mod embedder;
pub mod mesh;

pub use detector::UltraFaceDetector;
pub use embedder::FaceNetExtractor;
pub use mesh::FaceMeshLandmarks;

use facegate_core::{CropRect, Frame, FramePipeline};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "version-RFB-320.onnx";
pub const EMBEDDER_MODEL: &str = "facenet-vggface2.onnx";
pub const LANDMARK_MODEL: &str = "face_landmark.onnx";

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("model file not found: {0} (place it in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer does not match {width}x{height}")]
    BadFrame { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// The full ONNX-backed frame analyzer.
pub type VisionPipeline = FramePipeline<UltraFaceDetector, FaceNetExtractor, FaceMeshLandmarks>;

/// Locations of the three model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub embedder: PathBuf,
    pub landmarks: PathBuf,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL),
            embedder: dir.join(EMBEDDER_MODEL),
            landmarks: dir.join(LANDMARK_MODEL),
        }
    }
}

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    PathBuf::from(data_home).join("facegate/models")
}

/// Load all three models and compose them into a pipeline.
pub fn load_pipeline(paths: &ModelPaths) -> Result<VisionPipeline, VisionError> {
    let detector = UltraFaceDetector::load(&paths.detector)?;
    let extractor = FaceNetExtractor::load(&paths.embedder)?;
    let landmarks = FaceMeshLandmarks::load(&paths.landmarks)?;
    Ok(FramePipeline::new(detector, extractor, landmarks))
}

pub(crate) fn check_model(path: &Path) -> Result<(), VisionError> {
    if !path.exists() {
        return Err(VisionError::ModelNotFound(path.display().to_string()));
    }
    Ok(())
}

pub(crate) fn to_image(frame: &Frame) -> Result<RgbImage, VisionError> {
    RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec()).ok_or(
        VisionError::BadFrame {
            width: frame.width(),
            height: frame.height(),
        },
    )
}

/// Crop `rect` out of `frame` and resize it to `width`x`height`.
pub(crate) fn crop_resize(
    frame: &Frame,
    rect: &CropRect,
    width: u32,
    height: u32,
) -> Result<RgbImage, VisionError> {
    let img = to_image(frame)?;
    let crop = imageops::crop_imm(&img, rect.x, rect.y, rect.width, rect.height).to_image();
    Ok(imageops::resize(&crop, width, height, FilterType::Triangle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_paths_in_dir() {
        let paths = ModelPaths::in_dir(Path::new("/opt/models"));
        assert_eq!(paths.detector, PathBuf::from("/opt/models/version-RFB-320.onnx"));
        assert_eq!(paths.embedder, PathBuf::from("/opt/models/facenet-vggface2.onnx"));
        assert_eq!(paths.landmarks, PathBuf::from("/opt/models/face_landmark.onnx"));
    }

    #[test]
    fn test_crop_resize_dimensions() {
        let frame = Frame::new(vec![200; 64 * 48 * 3], 64, 48).unwrap();
        let rect = CropRect { x: 4, y: 4, width: 30, height: 20 };
        let out = crop_resize(&frame, &rect, 160, 160).unwrap();
        assert_eq!(out.dimensions(), (160, 160));
    }

    #[test]
    fn test_missing_model() {
        let result = load_pipeline(&ModelPaths::in_dir(Path::new("/nonexistent")));
        assert!(matches!(result, Err(VisionError::ModelNotFound(_))));
    }
}
