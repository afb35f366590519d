//! Frame analysis: detection, descriptor extraction and landmark estimation.
//!
//! The three collaborators are black boxes behind traits. [`FramePipeline`]
//! composes them into a [`FrameAnalyzer`]: detect faces, crop each selected
//! box, extract its descriptor, and (optionally) compute the mean eye aspect
//! ratio from the face mesh.

use serde::Serialize;
use thiserror::Error;

use crate::liveness::FaceMesh;
use crate::types::{BoundingBox, Descriptor};

/// Crops narrower or shorter than this are rejected before extraction.
pub const MIN_FACE_SIZE: u32 = 20;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("no face or face too small ({width}x{height})")]
    NoFaceOrLowQuality { width: u32, height: u32 },
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("face detection failed: {0}")]
    Detection(String),
    #[error("descriptor extraction failed: {0}")]
    Extraction(String),
    #[error("landmark estimation failed: {0}")]
    Landmarks(String),
}

/// Decoded RGB8 image, row-major, 3 bytes per pixel.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, AnalyzerError> {
        let expected = width as usize * height as usize * 3;
        if width == 0 || height == 0 {
            return Err(AnalyzerError::InvalidFrame(format!(
                "empty frame {width}x{height}"
            )));
        }
        if data.len() != expected {
            return Err(AnalyzerError::InvalidFrame(format!(
                "expected {expected} bytes for {width}x{height} RGB, got {}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// RGB value at `(x, y)`. Caller guarantees the coordinates are in bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

/// Integer pixel region of a frame, clamped to its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Truncate box corners to whole pixels, clamp to the frame, and reject
    /// anything below [`MIN_FACE_SIZE`] on either side.
    pub fn from_box(bbox: &BoundingBox, frame_width: u32, frame_height: u32) -> Result<Self, AnalyzerError> {
        let clamp = |v: f32, max: u32| -> u32 {
            if v.is_nan() || v <= 0.0 {
                0
            } else {
                (v.trunc() as u32).min(max)
            }
        };

        let x1 = clamp(bbox.x, frame_width);
        let y1 = clamp(bbox.y, frame_height);
        let x2 = clamp(bbox.x + bbox.width, frame_width);
        let y2 = clamp(bbox.y + bbox.height, frame_height);

        let width = x2.saturating_sub(x1);
        let height = y2.saturating_sub(y1);
        if width < MIN_FACE_SIZE || height < MIN_FACE_SIZE {
            return Err(AnalyzerError::NoFaceOrLowQuality { width, height });
        }

        Ok(Self {
            x: x1,
            y: y1,
            width,
            height,
        })
    }
}

pub trait FaceDetector {
    /// Faces in the frame, in detector order (most confident first).
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, AnalyzerError>;
}

pub trait DescriptorExtractor {
    /// Unit-normalized descriptor of the face inside `crop`.
    fn extract_descriptor(&mut self, frame: &Frame, crop: &CropRect) -> Result<Descriptor, AnalyzerError>;
}

pub trait LandmarkDetector {
    /// One mesh per face, associated with `faces` by index. May return fewer
    /// meshes than faces when landmarks could not be estimated.
    fn facial_landmarks(&mut self, frame: &Frame, faces: &[BoundingBox]) -> Result<Vec<FaceMesh>, AnalyzerError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzeOptions {
    /// Estimate landmarks and compute the eye aspect ratio.
    pub landmarks: bool,
    /// Analyze every detected face instead of only the first.
    pub all_faces: bool,
}

impl AnalyzeOptions {
    /// First face only, descriptor only (enroll / recognize).
    pub fn primary() -> Self {
        Self::default()
    }

    /// First face, descriptor and EAR (liveness submissions).
    pub fn liveness() -> Self {
        Self {
            landmarks: true,
            all_faces: false,
        }
    }

    /// Every face, descriptor and EAR (stream tracking).
    pub fn tracking() -> Self {
        Self {
            landmarks: true,
            all_faces: true,
        }
    }
}

/// One detected face after analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedFace {
    pub bbox: BoundingBox,
    /// `None` when the crop was too small or extraction failed (tracking mode only).
    pub descriptor: Option<Descriptor>,
    /// Mean eye aspect ratio when landmarks were requested and found.
    pub ear: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameAnalysis {
    pub width: u32,
    pub height: u32,
    /// Analyzed faces in detector order. Empty when nothing was detected.
    pub faces: Vec<AnalyzedFace>,
}

impl FrameAnalysis {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            faces: Vec::new(),
        }
    }

    /// The first detected face.
    pub fn primary(&self) -> Option<&AnalyzedFace> {
        self.faces.first()
    }
}

/// Turns a frame into per-face descriptors and EARs.
pub trait FrameAnalyzer {
    /// In primary mode a too-small first face is an error
    /// ([`AnalyzerError::NoFaceOrLowQuality`]). In tracking mode such faces
    /// are reported without a descriptor.
    fn analyze(&mut self, frame: &Frame, options: AnalyzeOptions) -> Result<FrameAnalysis, AnalyzerError>;
}

/// [`FrameAnalyzer`] built from the three collaborators.
pub struct FramePipeline<D, E, L> {
    detector: D,
    extractor: E,
    landmarks: L,
}

impl<D, E, L> FramePipeline<D, E, L>
where
    D: FaceDetector,
    E: DescriptorExtractor,
    L: LandmarkDetector,
{
    pub fn new(detector: D, extractor: E, landmarks: L) -> Self {
        Self {
            detector,
            extractor,
            landmarks,
        }
    }
}

impl<D, E, L> FrameAnalyzer for FramePipeline<D, E, L>
where
    D: FaceDetector,
    E: DescriptorExtractor,
    L: LandmarkDetector,
{
    fn analyze(&mut self, frame: &Frame, options: AnalyzeOptions) -> Result<FrameAnalysis, AnalyzerError> {
        let mut boxes = self.detector.detect_faces(frame)?;
        if boxes.is_empty() {
            tracing::debug!("no face detected");
            return Ok(FrameAnalysis::empty(frame.width(), frame.height()));
        }
        if !options.all_faces {
            boxes.truncate(1);
        }

        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in &boxes {
            let descriptor = match CropRect::from_box(bbox, frame.width(), frame.height()) {
                Ok(crop) => match self.extractor.extract_descriptor(frame, &crop) {
                    Ok(d) => Some(d),
                    Err(e) if options.all_faces => {
                        tracing::debug!(error = %e, "skipping face: extraction failed");
                        None
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if options.all_faces => {
                    tracing::debug!(error = %e, "skipping face: crop rejected");
                    None
                }
                Err(e) => return Err(e),
            };
            faces.push(AnalyzedFace {
                bbox: *bbox,
                descriptor,
                ear: None,
            });
        }

        if options.landmarks {
            let meshes = self.landmarks.facial_landmarks(frame, &boxes)?;
            for (face, mesh) in faces.iter_mut().zip(meshes.iter()) {
                face.ear = mesh.mean_eye_aspect_ratio(frame.width(), frame.height());
            }
        }

        tracing::debug!(faces = faces.len(), "frame analyzed");
        Ok(FrameAnalysis {
            width: frame.width(),
            height: frame.height(),
            faces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::{Point, LEFT_EYE, RIGHT_EYE};

    struct FixedDetector(Vec<BoundingBox>);

    impl FaceDetector for FixedDetector {
        fn detect_faces(&mut self, _frame: &Frame) -> Result<Vec<BoundingBox>, AnalyzerError> {
            Ok(self.0.clone())
        }
    }

    /// Descriptor derived from the crop origin, so tests can tell faces apart.
    struct OriginExtractor {
        calls: usize,
    }

    impl DescriptorExtractor for OriginExtractor {
        fn extract_descriptor(&mut self, _frame: &Frame, crop: &CropRect) -> Result<Descriptor, AnalyzerError> {
            self.calls += 1;
            Descriptor::new(vec![crop.x as f32 + 1.0, crop.y as f32 + 1.0])
                .map_err(|e| AnalyzerError::Extraction(e.to_string()))
        }
    }

    /// Flat-eyed mesh for every face: EAR is computable and equals 0.
    struct FlatEyes;

    impl LandmarkDetector for FlatEyes {
        fn facial_landmarks(&mut self, _frame: &Frame, faces: &[BoundingBox]) -> Result<Vec<FaceMesh>, AnalyzerError> {
            let mut points = vec![Point { x: 0.0, y: 0.0 }; 468];
            for eye in [LEFT_EYE, RIGHT_EYE] {
                points[eye[0]] = Point { x: 0.1, y: 0.5 };
                points[eye[3]] = Point { x: 0.2, y: 0.5 };
                for &i in &[eye[1], eye[2], eye[4], eye[5]] {
                    points[i] = Point { x: 0.15, y: 0.5 };
                }
            }
            Ok(faces.iter().map(|_| FaceMesh::new(points.clone())).collect())
        }
    }

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![0; (width * height * 3) as usize], width, height).unwrap()
    }

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.99,
        }
    }

    fn pipeline(boxes: Vec<BoundingBox>) -> FramePipeline<FixedDetector, OriginExtractor, FlatEyes> {
        FramePipeline::new(FixedDetector(boxes), OriginExtractor { calls: 0 }, FlatEyes)
    }

    #[test]
    fn test_frame_rejects_wrong_length() {
        assert!(Frame::new(vec![0; 10], 2, 2).is_err());
        assert!(Frame::new(vec![], 0, 0).is_err());
        assert!(Frame::new(vec![0; 12], 2, 2).is_ok());
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let crop = CropRect::from_box(&bbox(-10.0, -5.7, 80.0, 90.0), 50, 60).unwrap();
        assert_eq!(crop, CropRect { x: 0, y: 0, width: 50, height: 60 });
    }

    #[test]
    fn test_crop_truncates_corners() {
        let crop = CropRect::from_box(&bbox(10.9, 20.2, 30.5, 30.0), 100, 100).unwrap();
        // corners (10, 20) - (41, 50)
        assert_eq!(crop, CropRect { x: 10, y: 20, width: 31, height: 30 });
    }

    #[test]
    fn test_crop_below_minimum() {
        let err = CropRect::from_box(&bbox(0.0, 0.0, 19.0, 40.0), 100, 100).unwrap_err();
        assert_eq!(err, AnalyzerError::NoFaceOrLowQuality { width: 19, height: 40 });
        assert!(CropRect::from_box(&bbox(0.0, 0.0, 20.0, 20.0), 100, 100).is_ok());
        // Inside the image only a sliver remains
        assert!(CropRect::from_box(&bbox(90.0, 0.0, 50.0, 50.0), 100, 100).is_err());
    }

    #[test]
    fn test_no_faces() {
        let analysis = pipeline(vec![]).analyze(&frame(64, 64), AnalyzeOptions::liveness()).unwrap();
        assert!(analysis.faces.is_empty());
        assert!(analysis.primary().is_none());
    }

    #[test]
    fn test_primary_mode_uses_first_face_only() {
        let mut p = pipeline(vec![bbox(0.0, 0.0, 30.0, 30.0), bbox(30.0, 30.0, 30.0, 30.0)]);
        let analysis = p.analyze(&frame(64, 64), AnalyzeOptions::primary()).unwrap();
        assert_eq!(analysis.faces.len(), 1);
        assert_eq!(p.extractor.calls, 1);
        assert!(analysis.faces[0].descriptor.is_some());
        assert!(analysis.faces[0].ear.is_none());
    }

    #[test]
    fn test_primary_mode_small_face_is_error() {
        let mut p = pipeline(vec![bbox(0.0, 0.0, 10.0, 10.0)]);
        let err = p.analyze(&frame(64, 64), AnalyzeOptions::primary()).unwrap_err();
        assert!(matches!(err, AnalyzerError::NoFaceOrLowQuality { .. }));
        assert_eq!(p.extractor.calls, 0);
    }

    #[test]
    fn test_tracking_mode_keeps_small_faces_without_descriptor() {
        let mut p = pipeline(vec![bbox(0.0, 0.0, 30.0, 30.0), bbox(40.0, 40.0, 10.0, 10.0)]);
        let analysis = p.analyze(&frame(64, 64), AnalyzeOptions::tracking()).unwrap();
        assert_eq!(analysis.faces.len(), 2);
        assert!(analysis.faces[0].descriptor.is_some());
        assert!(analysis.faces[1].descriptor.is_none());
        assert_eq!(analysis.faces[0].ear, Some(0.0));
    }
}
