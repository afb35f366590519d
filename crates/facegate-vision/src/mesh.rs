//! 468-point face mesh via ONNX Runtime.
//!
//! Each detected box is expanded to a square region around the face, resized
//! to 192x192 and passed through the landmark model. The model returns
//! `(x, y, z)` per point in input-pixel coordinates; we map them back to
//! normalized [0, 1] coordinates of the full frame.

use facegate_core::{AnalyzerError, BoundingBox, CropRect, FaceMesh, Frame, LandmarkDetector, Point};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

use crate::{check_model, crop_resize, VisionError};

const MESH_INPUT_SIZE: u32 = 192;
const MESH_POINTS: usize = 468;
/// Box side multiplier; the detector box is tight, the mesh model expects margin.
const MESH_BOX_SCALE: f32 = 1.5;

pub struct FaceMeshLandmarks {
    session: Session,
}

impl FaceMeshLandmarks {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        check_model(model_path)?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face mesh model"
        );

        Ok(Self { session })
    }

    /// Mesh for one face, or `None` when the expanded region is empty.
    pub fn landmarks(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Option<FaceMesh>, VisionError> {
        let Some(region) = expand_region(face, frame.width(), frame.height()) else {
            return Ok(None);
        };

        let patch = crop_resize(frame, &region, MESH_INPUT_SIZE, MESH_INPUT_SIZE)?;
        let input = preprocess(&patch);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::InferenceFailed(format!("landmarks: {e}")))?;

        if raw.len() < MESH_POINTS * 3 {
            return Err(VisionError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                MESH_POINTS * 3,
                raw.len()
            )));
        }

        Ok(Some(to_frame_points(raw, &region, frame.width(), frame.height())))
    }
}

impl LandmarkDetector for FaceMeshLandmarks {
    fn facial_landmarks(&mut self, frame: &Frame, faces: &[BoundingBox]) -> Result<Vec<FaceMesh>, AnalyzerError> {
        let mut meshes = Vec::with_capacity(faces.len());
        for face in faces {
            match self.landmarks(frame, face) {
                Ok(Some(mesh)) => meshes.push(mesh),
                // Meshes associate by index; stop at the first face without one
                Ok(None) => break,
                Err(e) => return Err(AnalyzerError::Landmarks(e.to_string())),
            }
        }
        Ok(meshes)
    }
}

/// Square region `MESH_BOX_SCALE` times the longer box side, clamped to the frame.
fn expand_region(face: &BoundingBox, width: u32, height: u32) -> Option<CropRect> {
    let (cx, cy) = face.center();
    let half = face.width.max(face.height) * MESH_BOX_SCALE / 2.0;

    let x1 = (cx - half).max(0.0) as u32;
    let y1 = (cy - half).max(0.0) as u32;
    let x2 = ((cx + half).max(0.0) as u32).min(width);
    let y2 = ((cy + half).max(0.0) as u32).min(height);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(CropRect {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
    })
}

/// NCHW in [0, 1].
fn preprocess(patch: &RgbImage) -> Array4<f32> {
    let size = MESH_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in patch.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

fn to_frame_points(raw: &[f32], region: &CropRect, width: u32, height: u32) -> FaceMesh {
    let sx = region.width as f32 / MESH_INPUT_SIZE as f32;
    let sy = region.height as f32 / MESH_INPUT_SIZE as f32;

    let points = raw
        .chunks_exact(3)
        .take(MESH_POINTS)
        .map(|p| Point {
            x: (region.x as f32 + p[0] * sx) / width as f32,
            y: (region.y as f32 + p[1] * sy) / height as f32,
        })
        .collect();
    FaceMesh::new(points)
}
