//! Transport-agnostic verification operations.
//!
//! Every operation takes the state it touches explicitly (population,
//! session manager, tracker) and already-analyzed frames. Inference and
//! transport live in the daemon.

use serde::Serialize;
use thiserror::Error;

use crate::analysis::{AnalyzerError, FrameAnalysis};
use crate::population::{self, EnrollOutcome, Population};
use crate::session::{SessionError, SessionManager, SessionToken, Verification};
use crate::tracker::{Detection, FaceStatus, FaceTracker};
use crate::types::{Descriptor, EnrolledIdentity, MatchPolicy, MatchResult, Matcher};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifyError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("no match in database (best score {score:.3})")]
    NoMatch { score: f32 },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("session belongs to a different user")]
    UserMismatch,
    #[error("no blink detected over {frames} frame(s)")]
    NoBlinkDetected { frames: usize },
    #[error("too many failed liveness attempts, retry in {retry_after_secs}s")]
    AttemptsExhausted { retry_after_secs: u64 },
    #[error("embedding extraction failed: {0}")]
    EmbeddingExtractionFailure(String),
}

impl VerifyError {
    /// Stable machine-readable error kind for transport replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoFaceDetected => "no_face_detected",
            Self::NoMatch { .. } => "no_match",
            Self::Session(SessionError::NotFound) => "session_not_found",
            Self::Session(SessionError::Expired) => "session_expired",
            Self::Session(SessionError::VerificationInProgress) => "verification_in_progress",
            Self::Session(SessionError::IdentityMismatch { .. }) | Self::UserMismatch => {
                "face_mismatch"
            }
            Self::NoBlinkDetected { .. } => "no_blink_detected",
            Self::AttemptsExhausted { .. } => "attempts_exhausted",
            Self::EmbeddingExtractionFailure(_) => "embedding_extraction_failure",
        }
    }
}

impl From<AnalyzerError> for VerifyError {
    fn from(e: AnalyzerError) -> Self {
        match e {
            AnalyzerError::NoFaceOrLowQuality { .. } => Self::NoFaceDetected,
            other => Self::EmbeddingExtractionFailure(other.to_string()),
        }
    }
}

/// Successful recognition.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub identity_id: String,
    pub name: String,
    pub score: f32,
    pub token: SessionToken,
}

/// Successful liveness submission.
#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub identity_id: String,
    pub blinks: u32,
    /// Frames whose face was checked and fed to the blink state.
    pub frames_analyzed: usize,
    /// Frames without any detected face.
    pub frames_skipped: usize,
}

/// Descriptor of the first face in `analysis`.
pub fn probe_descriptor(analysis: &FrameAnalysis) -> Result<Descriptor, VerifyError> {
    analysis
        .primary()
        .and_then(|face| face.descriptor.clone())
        .ok_or(VerifyError::NoFaceDetected)
}

/// Enroll `name` from the first face of `analysis`.
pub fn enroll<P, M>(
    population: &mut P,
    name: &str,
    analysis: &FrameAnalysis,
    matcher: &M,
    policy: &MatchPolicy,
) -> Result<EnrollOutcome, VerifyError>
where
    P: Population + ?Sized,
    M: Matcher + ?Sized,
{
    let descriptor = probe_descriptor(analysis)?;
    let identity = EnrolledIdentity::new(name, descriptor);
    Ok(population::enroll(population, identity, matcher, policy))
}

/// Match the first face of `analysis` and issue a session on success.
pub fn recognize<P, M>(
    population: &P,
    sessions: &SessionManager,
    analysis: &FrameAnalysis,
    matcher: &M,
    policy: &MatchPolicy,
) -> Result<Recognition, VerifyError>
where
    P: Population + ?Sized,
    M: Matcher + ?Sized,
{
    let probe = probe_descriptor(analysis)?;
    let best = matcher.best_match(&probe, population.get_all());

    if !policy.accepts(&best) {
        tracing::info!(score = best.score, "recognition rejected");
        return Err(VerifyError::NoMatch { score: best.score });
    }

    let (Some(identity_id), Some(name)) = (best.identity_id, best.name) else {
        return Err(VerifyError::NoMatch { score: best.score });
    };

    let token = sessions.issue(&identity_id, probe);
    tracing::info!(identity_id, score = best.score, "recognized");

    Ok(Recognition {
        identity_id,
        name,
        score: best.score,
        token,
    })
}

/// Start a liveness submission: claim the session and check the caller's user id.
///
/// The returned guard keeps the session exclusive until it is passed to
/// [`run_liveness`] or dropped (which fails the session).
pub fn begin_liveness(
    sessions: &SessionManager,
    token: &str,
    user_id: &str,
) -> Result<Verification, VerifyError> {
    let verification = sessions.begin_verification(token)?;
    if verification.identity_id() != user_id {
        tracing::warn!(
            session = %verification.token().fingerprint(),
            "liveness submitted for a different user"
        );
        return Err(VerifyError::UserMismatch);
    }
    Ok(verification)
}

/// Feed analyzed frames to a claimed session and record the verdict.
///
/// Frames are processed in order. A frame without a face is skipped; a
/// face that is too small or does not match the session descriptor fails
/// the whole submission immediately. The verdict is the blink state after
/// the last frame that carried landmarks.
pub fn run_liveness<I>(mut verification: Verification, frames: I) -> Result<LivenessReport, VerifyError>
where
    I: IntoIterator<Item = Result<FrameAnalysis, AnalyzerError>>,
{
    let mut live = false;
    let mut analyzed = 0;
    let mut skipped = 0;

    for frame in frames {
        let analysis = frame?;
        let Some(face) = analysis.primary() else {
            skipped += 1;
            continue;
        };
        let descriptor = face.descriptor.as_ref().ok_or(VerifyError::NoFaceDetected)?;
        verification.check_identity(descriptor)?;
        analyzed += 1;

        if let Some(ear) = face.ear {
            live = verification.observe_ear(ear);
        }
    }

    let identity_id = verification.identity_id();
    let blinks = verification.blink_count();
    verification.finish(live);

    if !live {
        return Err(VerifyError::NoBlinkDetected {
            frames: analyzed + skipped,
        });
    }

    Ok(LivenessReport {
        identity_id,
        blinks,
        frames_analyzed: analyzed,
        frames_skipped: skipped,
    })
}

/// [`begin_liveness`] followed by [`run_liveness`].
pub fn submit_liveness<I>(
    sessions: &SessionManager,
    token: &str,
    user_id: &str,
    frames: I,
) -> Result<LivenessReport, VerifyError>
where
    I: IntoIterator<Item = Result<FrameAnalysis, AnalyzerError>>,
{
    let verification = begin_liveness(sessions, token, user_id)?;
    run_liveness(verification, frames)
}

/// Recognize every face in one stream frame and advance the tracker.
pub fn track_frame<P, M>(
    tracker: &mut FaceTracker,
    population: &P,
    analysis: &FrameAnalysis,
    matcher: &M,
    policy: &MatchPolicy,
) -> Vec<FaceStatus>
where
    P: Population + ?Sized,
    M: Matcher + ?Sized,
{
    let detections: Vec<Detection> = analysis
        .faces
        .iter()
        .map(|face| {
            let identity = match &face.descriptor {
                Some(d) => policy.recognize(matcher.best_match(d, population.get_all())),
                None => MatchResult::unknown(),
            };
            Detection {
                bbox: face.bbox,
                identity,
                ear: face.ear,
            }
        })
        .collect();

    tracker.update(&detections)
}
