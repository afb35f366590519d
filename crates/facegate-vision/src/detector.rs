//! UltraFace (RFB-320) face detector via ONNX Runtime.
//!
//! The model scores a fixed set of priors and regresses their boxes as
//! normalized corners; we threshold, rescale to frame pixels and apply NMS.

use facegate_core::{AnalyzerError, BoundingBox, FaceDetector, Frame};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

use crate::{check_model, to_image, VisionError};

const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;

pub struct UltraFaceDetector {
    session: Session,
    /// (scores, boxes) output indices, by name with positional fallback.
    output_indices: (usize, usize),
    confidence_threshold: f32,
}

impl UltraFaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        check_model(model_path)?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 2 {
            return Err(VisionError::InferenceFailed(format!(
                "UltraFace model requires 2 outputs (scores, boxes), got {}",
                output_names.len()
            )));
        }

        let output_indices = discover_output_indices(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?output_indices,
            "loaded UltraFace model"
        );

        Ok(Self {
            session,
            output_indices,
            confidence_threshold: ULTRAFACE_CONFIDENCE_THRESHOLD,
        })
    }

    /// Detect faces, most confident first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, VisionError> {
        let input = preprocess(frame)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (scores_idx, boxes_idx) = self.output_indices;
        let (_, scores) = outputs[scores_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[boxes_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode(
            scores,
            boxes,
            frame.width() as f32,
            frame.height() as f32,
            self.confidence_threshold,
        );
        let result = nms(candidates, ULTRAFACE_NMS_THRESHOLD);
        tracing::debug!(faces = result.len(), "UltraFace detection");
        Ok(result)
    }
}

impl FaceDetector for UltraFaceDetector {
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, AnalyzerError> {
        self.detect(frame)
            .map_err(|e| AnalyzerError::Detection(e.to_string()))
    }
}

fn discover_output_indices(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n == "scores");
    let boxes = names.iter().position(|n| n == "boxes");
    match (scores, boxes) {
        (Some(s), Some(b)) => (s, b),
        _ => (0, 1),
    }
}

/// Resize the whole frame to the model input and normalize into NCHW.
fn preprocess(frame: &Frame) -> Result<Array4<f32>, VisionError> {
    let img = to_image(frame)?;
    let resized = imageops::resize(
        &img,
        ULTRAFACE_INPUT_WIDTH,
        ULTRAFACE_INPUT_HEIGHT,
        FilterType::Triangle,
    );

    let (w, h) = (ULTRAFACE_INPUT_WIDTH as usize, ULTRAFACE_INPUT_HEIGHT as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        }
    }
    Ok(tensor)
}

/// Scores are `[N, 2]` (background, face); boxes are `[N, 4]` normalized corners.
fn decode(scores: &[f32], boxes: &[f32], width: f32, height: f32, threshold: f32) -> Vec<BoundingBox> {
    let priors = (scores.len() / 2).min(boxes.len() / 4);
    let mut detections = Vec::new();

    for i in 0..priors {
        let confidence = scores[i * 2 + 1];
        if confidence <= threshold {
            continue;
        }
        let b = &boxes[i * 4..i * 4 + 4];
        detections.push(BoundingBox::from_corners(
            b[0] * width,
            b[1] * height,
            b[2] * width,
            b[3] * height,
            confidence,
        ));
    }

    detections
}

fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
