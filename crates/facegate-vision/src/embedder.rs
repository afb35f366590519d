//! FaceNet (InceptionResnetV1, VGGFace2 weights) descriptor extractor via ONNX Runtime.

use facegate_core::{AnalyzerError, CropRect, Descriptor, DescriptorExtractor, Frame};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

use crate::{check_model, crop_resize, VisionError};

const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
const FACENET_EMBEDDING_DIM: usize = 512;
const FACENET_MODEL_VERSION: &str = "facenet-vggface2";

pub struct FaceNetExtractor {
    session: Session,
}

impl FaceNetExtractor {
    pub fn load(model_path: &Path) -> Result<Self, VisionError> {
        check_model(model_path)?;

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Crop, resize to 160x160 and embed. The result is L2-normalized.
    pub fn extract(&mut self, frame: &Frame, crop: &CropRect) -> Result<Descriptor, VisionError> {
        let face = crop_resize(frame, crop, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE)?;
        let input = preprocess(&face);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| VisionError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(VisionError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let descriptor = Descriptor::new(raw.to_vec())
            .map_err(|e| VisionError::InferenceFailed(format!("embedding: {e}")))?;
        Ok(descriptor.with_model_version(FACENET_MODEL_VERSION))
    }
}

impl DescriptorExtractor for FaceNetExtractor {
    fn extract_descriptor(&mut self, frame: &Frame, crop: &CropRect) -> Result<Descriptor, AnalyzerError> {
        self.extract(frame, crop)
            .map_err(|e| AnalyzerError::Extraction(e.to_string()))
    }
}

/// RGB face crop into NCHW, `(x - 127.5) / 128`.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = FACENET_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - FACENET_MEAN) / FACENET_STD;
        }
    }
    tensor
}
