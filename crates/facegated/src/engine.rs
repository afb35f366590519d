use facegate_core::{AnalyzeOptions, AnalyzerError, Frame, FrameAnalysis, FrameAnalyzer};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("analysis timed out after {0}s")]
    Timeout(u64),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Per-image outcome, in submission order.
pub type FrameResult = Result<FrameAnalysis, AnalyzerError>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Analyze {
        images: Vec<Vec<u8>>,
        options: AnalyzeOptions,
        reply: oneshot::Sender<Vec<FrameResult>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Decode and analyze `images` in order.
    ///
    /// Processing stops after the first failed image; the returned vector
    /// then ends with that error.
    pub async fn analyze(
        &self,
        images: Vec<Vec<u8>>,
        options: AnalyzeOptions,
    ) -> Result<Vec<FrameResult>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                images,
                options,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed),
            Err(_) => Err(EngineError::Timeout(self.timeout.as_secs())),
        }
    }

    /// Analyze a single image.
    pub async fn analyze_one(
        &self,
        image: Vec<u8>,
        options: AnalyzeOptions,
    ) -> Result<FrameResult, EngineError> {
        let mut results = self.analyze(vec![image], options).await?;
        Ok(results.pop().unwrap_or_else(|| {
            Err(AnalyzerError::InvalidFrame("no result for image".into()))
        }))
    }
}

/// Spawn the engine on a dedicated OS thread that owns the analyzer.
pub fn spawn_engine(
    mut analyzer: Box<dyn FrameAnalyzer + Send>,
    timeout: Duration,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze {
                        images,
                        options,
                        reply,
                    } => {
                        let results = run_analyze(analyzer.as_mut(), &images, options);
                        let _ = reply.send(results);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx, timeout }
}

fn run_analyze(
    analyzer: &mut dyn FrameAnalyzer,
    images: &[Vec<u8>],
    options: AnalyzeOptions,
) -> Vec<FrameResult> {
    let mut results = Vec::with_capacity(images.len());
    for (i, bytes) in images.iter().enumerate() {
        let result = decode_image(bytes).and_then(|frame| analyzer.analyze(&frame, options));
        let failed = result.is_err();
        if let Err(e) = &result {
            tracing::debug!(image = i, error = %e, "analysis failed");
        }
        results.push(result);
        if failed {
            break;
        }
    }
    results
}

/// Decode an encoded still image (JPEG, PNG, ...) into an RGB frame.
pub fn decode_image(bytes: &[u8]) -> Result<Frame, AnalyzerError> {
    let rgb = image::load_from_memory(bytes)
        .map_err(|e| AnalyzerError::InvalidFrame(e.to_string()))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    Frame::new(rgb.into_raw(), width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{AnalyzedFace, BoundingBox, Descriptor};
    use std::io::Cursor;

    /// One face per frame, descriptor from the frame's top-left pixel.
    struct PixelAnalyzer;

    impl FrameAnalyzer for PixelAnalyzer {
        fn analyze(&mut self, frame: &Frame, options: AnalyzeOptions) -> Result<FrameAnalysis, AnalyzerError> {
            let [r, g, _] = frame.pixel(0, 0);
            let descriptor = Descriptor::new(vec![r as f32 + 1.0, g as f32 + 1.0])
                .map_err(|e| AnalyzerError::Extraction(e.to_string()))?;
            Ok(FrameAnalysis {
                width: frame.width(),
                height: frame.height(),
                faces: vec![AnalyzedFace {
                    bbox: BoundingBox::from_corners(0.0, 0.0, 1.0, 1.0, 1.0),
                    descriptor: Some(descriptor),
                    ear: options.landmarks.then_some(0.3),
                }],
            })
        }
    }

    fn png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_image() {
        let frame = decode_image(&png(4, 3, [10, 20, 30])).unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert_eq!(frame.pixel(3, 2), [10, 20, 30]);
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_image(b"not an image").unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn test_analyze_in_order() {
        let engine = spawn_engine(Box::new(PixelAnalyzer), Duration::from_secs(5));
        let results = engine
            .analyze(
                vec![png(2, 2, [0, 9, 0]), png(2, 2, [9, 0, 0])],
                AnalyzeOptions::liveness(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.faces[0].ear, Some(0.3));
        let d = first.faces[0].descriptor.as_ref().unwrap();
        assert!(d.values()[1] > d.values()[0]);
    }

    #[tokio::test]
    async fn test_analyze_stops_at_first_failure() {
        let engine = spawn_engine(Box::new(PixelAnalyzer), Duration::from_secs(5));
        let results = engine
            .analyze(
                vec![png(2, 2, [1, 1, 1]), b"junk".to_vec(), png(2, 2, [1, 1, 1])],
                AnalyzeOptions::primary(),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn test_analyze_one() {
        let engine = spawn_engine(Box::new(PixelAnalyzer), Duration::from_secs(5));
        let analysis = engine
            .analyze_one(png(2, 2, [5, 5, 5]), AnalyzeOptions::primary())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(analysis.faces.len(), 1);
        assert!(analysis.faces[0].ear.is_none());
    }
}
