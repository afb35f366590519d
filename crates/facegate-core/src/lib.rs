//! facegate-core: face verification pipeline gated by blink liveness.
//!
//! Matches probe descriptors against an enrolled population, issues
//! time-bounded verification sessions, and runs a per-identity blink
//! state machine over sequences of frames. Face detection, descriptor
//! extraction and landmark estimation are consumed through the traits in
//! [`analysis`]; nothing here performs inference.

pub mod analysis;
pub mod liveness;
pub mod population;
pub mod service;
pub mod session;
pub mod tracker;
pub mod types;

pub use analysis::{
    AnalyzeOptions, AnalyzedFace, AnalyzerError, CropRect, DescriptorExtractor, FaceDetector,
    Frame, FrameAnalysis, FrameAnalyzer, FramePipeline, LandmarkDetector, MIN_FACE_SIZE,
};
pub use liveness::{BlinkConfig, BlinkState, FaceMesh, Point};
pub use population::{revert_enroll, EnrollOutcome, MemoryPopulation, Population};
pub use service::{LivenessReport, Recognition, VerifyError};
pub use session::{
    SessionConfig, SessionError, SessionInfo, SessionManager, SessionStatus, SessionToken,
    Verification,
};
pub use tracker::{Correlation, Detection, FaceStatus, FaceTracker, LiveStatus, TrackerConfig};
pub use types::{
    BoundingBox, CosineMatcher, Descriptor, DescriptorError, EnrolledIdentity, MatchPolicy,
    MatchResult, Matcher, NO_MATCH_SCORE, UNKNOWN_IDENTITY,
};
