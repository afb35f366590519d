use facegate_core::service::{self, VerifyError};
use facegate_core::{
    revert_enroll, AnalyzeOptions, CosineMatcher, FaceTracker, MemoryPopulation, Population,
    SessionError, SessionManager,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use zbus::interface;

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use crate::rate_limiter::AttemptLimiter;
use crate::store::{IdentityStore, StoreError};

/// Tracker for one client stream.
pub struct TrackerStream {
    tracker: FaceTracker,
    last_used: Instant,
}

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: IdentityStore,
    /// In-memory copy of the store. Matching reads, enrollment writes.
    pub gallery: RwLock<MemoryPopulation>,
    pub sessions: SessionManager,
    pub streams: Mutex<HashMap<String, Arc<Mutex<TrackerStream>>>>,
    pub limiter: Mutex<AttemptLimiter>,
}

fn success(mut body: Value) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert("status".into(), json!("success"));
    }
    body
}

fn failure(err: &VerifyError) -> Value {
    let mut body = json!({
        "status": "failed",
        "error": err.kind(),
        "msg": err.to_string(),
    });
    if let VerifyError::AttemptsExhausted { retry_after_secs } = err {
        body["retry_after_secs"] = json!(retry_after_secs);
    }
    body
}

fn invalid_request(msg: impl Into<String>) -> Value {
    json!({ "status": "failed", "error": "invalid_request", "msg": msg.into() })
}

fn engine_failure(e: EngineError) -> VerifyError {
    tracing::error!(error = %e, "engine request failed");
    VerifyError::EmbeddingExtractionFailure(e.to_string())
}

fn fdo_failed(e: StoreError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "store operation failed");
    zbus::fdo::Error::Failed(e.to_string())
}

impl AppState {
    /// Build the state and load the enrolled population from the store.
    pub async fn load(
        config: Config,
        engine: EngineHandle,
        store: IdentityStore,
    ) -> Result<Self, StoreError> {
        let identities = store.load_all().await?;
        tracing::info!(identities = identities.len(), "population loaded");

        Ok(Self {
            sessions: SessionManager::new(config.session_config()),
            limiter: Mutex::new(AttemptLimiter::new(config.limiter_config())),
            gallery: RwLock::new(MemoryPopulation::from_identities(identities)),
            streams: Mutex::new(HashMap::new()),
            config,
            engine,
            store,
        })
    }

    pub async fn enroll(&self, name: &str, image: Vec<u8>) -> Result<Value, StoreError> {
        if name.trim().is_empty() {
            return Ok(invalid_request("name must not be empty"));
        }

        let analysis = match self.engine.analyze_one(image, AnalyzeOptions::primary()).await {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => return Ok(failure(&e.into())),
            Err(e) => return Ok(failure(&engine_failure(e))),
        };

        let mut gallery = self.gallery.write().await;
        let outcome = match service::enroll(
            &mut *gallery,
            name,
            &analysis,
            &CosineMatcher,
            &self.config.policy,
        ) {
            Ok(outcome) => outcome,
            Err(e) => return Ok(failure(&e)),
        };

        let replaces = outcome.replaced.as_ref().map(|r| r.id.as_str());
        if let Err(e) = self.store.enroll(&outcome.identity, replaces).await {
            // Keep memory consistent with the store
            revert_enroll(&mut *gallery, &outcome);
            return Err(e);
        }
        if let Some(previous) = &outcome.replaced {
            self.sessions.revoke_identity(&previous.id);
        }

        Ok(success(json!({
            "msg": format!("User '{name}' added"),
            "user_id": outcome.identity.id,
            "replaced": outcome.replaced.as_ref().map(|r| r.id.clone()),
        })))
    }

    pub async fn recognize(&self, image: Vec<u8>) -> Value {
        let analysis = match self.engine.analyze_one(image, AnalyzeOptions::primary()).await {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => return failure(&e.into()),
            Err(e) => return failure(&engine_failure(e)),
        };

        let gallery = self.gallery.read().await;
        match service::recognize(
            &*gallery,
            &self.sessions,
            &analysis,
            &CosineMatcher,
            &self.config.policy,
        ) {
            Ok(r) => success(json!({
                "user_id": r.identity_id,
                "name": r.name,
                "score": r.score,
                "session_token": r.token.as_str(),
            })),
            Err(e) => failure(&e),
        }
    }

    pub async fn submit_liveness(&self, token: &str, user_id: &str, images: Vec<Vec<u8>>) -> Value {
        if images.is_empty() || images.len() > self.config.max_liveness_frames {
            return invalid_request(format!(
                "expected 1..={} images, got {}",
                self.config.max_liveness_frames,
                images.len()
            ));
        }

        let identity_id = match self.sessions.identity_of(token) {
            Ok(id) => id,
            Err(e) => return failure(&e.into()),
        };

        if let Err(remaining) = self.limiter.lock().await.check(&identity_id) {
            let err = VerifyError::AttemptsExhausted {
                retry_after_secs: remaining.as_secs(),
            };
            tracing::warn!(identity_id, "liveness rejected: attempts exhausted");
            return failure(&err);
        }

        // Claim the session before the engine call so a concurrent submission is rejected
        let verification = match service::begin_liveness(&self.sessions, token, user_id) {
            Ok(v) => v,
            Err(e) => {
                if matches!(e, VerifyError::UserMismatch) {
                    self.limiter.lock().await.record_failure(&identity_id);
                }
                return failure(&e);
            }
        };

        let frames = match self.engine.analyze(images, AnalyzeOptions::liveness()).await {
            Ok(frames) => frames,
            Err(e) => return failure(&engine_failure(e)),
        };

        match service::run_liveness(verification, frames) {
            Ok(report) => {
                self.limiter.lock().await.record_success(&identity_id);
                tracing::info!(identity_id, blinks = report.blinks, "liveness passed");
                success(json!({
                    "liveness": true,
                    "user_id": report.identity_id,
                    "blinks": report.blinks,
                    "frames_analyzed": report.frames_analyzed,
                    "frames_skipped": report.frames_skipped,
                }))
            }
            Err(e) => {
                if matches!(
                    e,
                    VerifyError::NoBlinkDetected { .. }
                        | VerifyError::Session(SessionError::IdentityMismatch { .. })
                ) {
                    self.limiter.lock().await.record_failure(&identity_id);
                }
                tracing::info!(identity_id, error = e.kind(), "liveness failed");
                failure(&e)
            }
        }
    }

    pub async fn track_frame(&self, stream_id: &str, image: Vec<u8>) -> Value {
        if stream_id.is_empty() {
            return invalid_request("stream id must not be empty");
        }

        let stream = {
            let mut streams = self.streams.lock().await;
            streams
                .entry(stream_id.to_string())
                .or_insert_with(|| {
                    tracing::debug!(stream_id, "tracker stream opened");
                    Arc::new(Mutex::new(TrackerStream {
                        tracker: FaceTracker::new(self.config.tracker_config()),
                        last_used: Instant::now(),
                    }))
                })
                .clone()
        };

        // Frames of one stream are applied in order
        let mut stream = stream.lock().await;
        stream.last_used = Instant::now();

        let analysis = match self.engine.analyze_one(image, AnalyzeOptions::tracking()).await {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => return failure(&e.into()),
            Err(e) => return failure(&engine_failure(e)),
        };

        let gallery = self.gallery.read().await;
        let faces = service::track_frame(
            &mut stream.tracker,
            &*gallery,
            &analysis,
            &CosineMatcher,
            &self.config.policy,
        );
        success(json!({ "faces": faces }))
    }

    pub async fn remove_identity(&self, id: &str) -> Result<bool, StoreError> {
        let mut gallery = self.gallery.write().await;
        let removed = self.store.remove(id).await?;
        gallery.delete(id);
        self.sessions.revoke_identity(id);
        if removed {
            tracing::info!(id, "identity removed");
        } else {
            tracing::warn!(id, "identity not found");
        }
        Ok(removed)
    }

    pub async fn status(&self) -> Value {
        let identities = self.gallery.read().await.len();
        let streams = self.streams.lock().await.len();
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": identities,
            "sessions": self.sessions.len(),
            "streams": streams,
            "enroll_dedup_threshold": self.config.policy.enroll_dedup,
            "recognize_threshold": self.config.policy.recognize_accept,
            "liveness_floor": self.config.policy.liveness_floor,
            "session_ttl_secs": self.config.session_ttl.map(|t| t.as_secs()),
        })
    }

    /// Expire sessions, drop idle streams and lapsed limiter records.
    pub async fn sweep(&self) {
        let sessions = self.sessions.sweep_expired();

        let idle = Duration::from_secs(self.config.stream_idle_secs);
        let now = Instant::now();
        let mut streams = self.streams.lock().await;
        let before = streams.len();
        // A stream locked by an in-flight frame is in use
        streams.retain(|_, s| match s.try_lock() {
            Ok(s) => now.duration_since(s.last_used) < idle,
            Err(_) => true,
        });
        let dropped = before - streams.len();
        drop(streams);

        self.limiter.lock().await.prune(now);

        if sessions > 0 || dropped > 0 {
            tracing::debug!(sessions, streams = dropped, "sweep complete");
        }
    }
}

/// D-Bus interface for the facegate verification daemon.
///
/// Bus name: org.freedesktop.Facegate1
/// Object path: /org/freedesktop/Facegate1
///
/// Verification outcomes are returned as JSON
/// (`{"status": "success", ...}` or `{"status": "failed", "error": kind, "msg": ...}`).
/// Only internal faults surface as D-Bus errors.
pub struct FacegateService {
    pub state: Arc<AppState>,
}

#[interface(name = "org.freedesktop.Facegate1")]
impl FacegateService {
    /// Enroll `name` from an encoded image.
    async fn enroll(&self, name: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(name, bytes = image.len(), "enroll requested");
        let reply = self.state.enroll(name, image).await.map_err(fdo_failed)?;
        Ok(reply.to_string())
    }

    /// Recognize the face in an encoded image and open a verification session.
    async fn recognize(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "recognize requested");
        Ok(self.state.recognize(image).await.to_string())
    }

    /// Run blink liveness over a sequence of encoded images.
    async fn submit_liveness(
        &self,
        session_token: &str,
        user_id: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(
            session = %facegate_core::session::fingerprint(session_token),
            frames = images.len(),
            "liveness requested"
        );
        Ok(self
            .state
            .submit_liveness(session_token, user_id, images)
            .await
            .to_string())
    }

    /// Recognize and track every face in one frame of a client stream.
    async fn track_frame(&self, stream_id: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        Ok(self.state.track_frame(stream_id, image).await.to_string())
    }

    /// List enrolled identities as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.state.store.list().await.map_err(fdo_failed)?;
        serde_json::to_string(&identities).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Remove an enrolled identity by ID.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_identity requested");
        self.state.remove_identity(id).await.map_err(fdo_failed)
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.state.status().await.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use facegate_core::{
        AnalyzeOptions, AnalyzedFace, AnalyzerError, BoundingBox, Descriptor, Frame,
        FrameAnalysis, FrameAnalyzer,
    };
    use std::io::Cursor;
    use std::path::Path;

    /// Reads the top-left pixel: red/green pick the descriptor, blue / 100 is the EAR.
    /// A black image has no face.
    struct PixelAnalyzer;

    impl FrameAnalyzer for PixelAnalyzer {
        fn analyze(&mut self, frame: &Frame, options: AnalyzeOptions) -> Result<FrameAnalysis, AnalyzerError> {
            let [r, g, b] = frame.pixel(0, 0);
            if [r, g, b] == [0, 0, 0] {
                return Ok(FrameAnalysis::empty(frame.width(), frame.height()));
            }
            // Red 7 yields a descriptor the store refuses
            let mut values = vec![0.0f32; if r == 7 { 4 } else { 512 }];
            values[0] = r as f32 + 1.0;
            values[1] = g as f32 + 1.0;
            let descriptor = Descriptor::new(values)
                .map_err(|e| AnalyzerError::Extraction(e.to_string()))?;
            Ok(FrameAnalysis {
                width: frame.width(),
                height: frame.height(),
                faces: vec![AnalyzedFace {
                    bbox: BoundingBox::from_corners(10.0, 10.0, 90.0, 90.0, 0.99),
                    descriptor: Some(descriptor),
                    ear: options.landmarks.then_some(b as f32 / 100.0),
                }],
            })
        }
    }

    fn png(rgb: [u8; 3]) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb(rgb));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    const ALICE: [u8; 3] = [255, 0, 0];
    const BOB: [u8; 3] = [0, 255, 0];

    /// Alice's face at roughly 0.95 similarity, eyes at the given EAR * 100.
    fn alice_frame(ear: u8) -> Vec<u8> {
        png([255, 80, ear])
    }

    async fn state() -> AppState {
        let store = IdentityStore::open(Path::new(":memory:")).await.unwrap();
        let engine = spawn_engine(Box::new(PixelAnalyzer), Duration::from_secs(5));
        AppState::load(Config::for_tests(), engine, store).await.unwrap()
    }

    async fn enrolled_state() -> (AppState, String) {
        let state = state().await;
        let reply = state.enroll("Alice", png(ALICE)).await.unwrap();
        assert_eq!(reply["status"], "success");
        let id = reply["user_id"].as_str().unwrap().to_string();
        (state, id)
    }

    async fn token_for_alice(state: &AppState) -> String {
        let reply = state.recognize(alice_frame(30)).await;
        assert_eq!(reply["status"], "success", "{reply}");
        reply["session_token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_alice_end_to_end() {
        let (state, alice_id) = enrolled_state().await;
        let token = token_for_alice(&state).await;

        let reply = state
            .submit_liveness(
                &token,
                &alice_id,
                vec![alice_frame(15), alice_frame(15), alice_frame(30)],
            )
            .await;
        assert_eq!(reply["status"], "success", "{reply}");
        assert_eq!(reply["liveness"], true);
        assert_eq!(reply["blinks"], 1);
    }

    #[tokio::test]
    async fn test_enroll_dedup_persists() {
        let (state, first_id) = enrolled_state().await;
        let reply = state.enroll("Alice", alice_frame(0)).await.unwrap();
        assert_eq!(reply["replaced"], first_id.as_str());

        assert_eq!(state.gallery.read().await.len(), 1);
        assert_eq!(state.store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enroll_no_face() {
        let state = state().await;
        let reply = state.enroll("Nobody", png([0, 0, 0])).await.unwrap();
        assert_eq!(reply["status"], "failed");
        assert_eq!(reply["error"], "no_face_detected");
    }

    #[tokio::test]
    async fn test_recognize_no_match() {
        let (state, _) = enrolled_state().await;
        let reply = state.recognize(png(BOB)).await;
        assert_eq!(reply["error"], "no_match");
    }

    #[tokio::test]
    async fn test_liveness_unknown_session() {
        let (state, alice_id) = enrolled_state().await;
        let reply = state
            .submit_liveness("missing", &alice_id, vec![alice_frame(30)])
            .await;
        assert_eq!(reply["error"], "session_not_found");
    }

    #[tokio::test]
    async fn test_liveness_face_mismatch() {
        let (state, alice_id) = enrolled_state().await;
        let token = token_for_alice(&state).await;
        let reply = state
            .submit_liveness(&token, &alice_id, vec![alice_frame(15), png(BOB)])
            .await;
        assert_eq!(reply["error"], "face_mismatch");
    }

    #[tokio::test]
    async fn test_liveness_without_blink_then_lockout() {
        let (state, alice_id) = enrolled_state().await;
        let token = token_for_alice(&state).await;

        for _ in 0..5 {
            let reply = state
                .submit_liveness(&token, &alice_id, vec![alice_frame(30)])
                .await;
            assert_eq!(reply["error"], "no_blink_detected");
        }
        let reply = state
            .submit_liveness(&token, &alice_id, vec![alice_frame(30)])
            .await;
        assert_eq!(reply["error"], "attempts_exhausted");
        assert!(reply["retry_after_secs"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_liveness_rejects_empty_submission() {
        let (state, alice_id) = enrolled_state().await;
        let token = token_for_alice(&state).await;
        let reply = state.submit_liveness(&token, &alice_id, vec![]).await;
        assert_eq!(reply["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_track_frame_stream() {
        let (state, _) = enrolled_state().await;

        let reply = state.track_frame("cam0", alice_frame(30)).await;
        assert_eq!(reply["faces"][0]["name"], "Alice");
        assert_eq!(reply["faces"][0]["status"], "not_yet_live");

        state.track_frame("cam0", alice_frame(15)).await;
        state.track_frame("cam0", alice_frame(15)).await;
        let reply = state.track_frame("cam0", alice_frame(30)).await;
        assert_eq!(reply["faces"][0]["status"], "live");
        assert_eq!(reply["faces"][0]["track_id"], 1);

        let reply = state.track_frame("cam1", png(BOB)).await;
        assert_eq!(reply["faces"][0]["status"], "unknown");
        assert_eq!(state.status().await["streams"], 2);
    }

    #[tokio::test]
    async fn test_remove_identity() {
        let (state, alice_id) = enrolled_state().await;
        assert!(state.remove_identity(&alice_id).await.unwrap());
        assert!(!state.remove_identity(&alice_id).await.unwrap());
        assert_eq!(state.recognize(alice_frame(30)).await["error"], "no_match");
    }

    #[tokio::test]
    async fn test_remove_identity_revokes_sessions() {
        let (state, alice_id) = enrolled_state().await;
        let token = token_for_alice(&state).await;
        assert!(state.remove_identity(&alice_id).await.unwrap());

        let frames = vec![alice_frame(15), alice_frame(15), alice_frame(30)];
        let reply = state.submit_liveness(&token, &alice_id, frames).await;
        assert_eq!(reply["error"], "session_not_found");
        assert_eq!(state.status().await["sessions"], 0);
    }

    #[tokio::test]
    async fn test_reenroll_revokes_replaced_sessions() {
        let (state, alice_id) = enrolled_state().await;
        let token = token_for_alice(&state).await;

        let reply = state.enroll("Alice", png(ALICE)).await.unwrap();
        assert_eq!(reply["replaced"], alice_id.as_str());
        let new_id = reply["user_id"].as_str().unwrap().to_string();

        let frames = vec![alice_frame(15), alice_frame(15), alice_frame(30)];
        let reply = state.submit_liveness(&token, &alice_id, frames).await;
        assert_eq!(reply["error"], "session_not_found");
        assert_eq!(state.recognize(alice_frame(30)).await["user_id"], new_id.as_str());
    }

    #[tokio::test]
    async fn test_enroll_store_failure_restores_gallery() {
        let (state, alice_id) = enrolled_state().await;
        assert!(state.enroll("mallory", png([7, 0, 0])).await.is_err());

        let gallery = state.gallery.read().await;
        let ids: Vec<_> = gallery.get_all().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![alice_id]);
    }

    #[tokio::test]
    async fn test_status() {
        let (state, _) = enrolled_state().await;
        token_for_alice(&state).await;
        let status = state.status().await;
        assert_eq!(status["identities"], 1);
        assert_eq!(status["sessions"], 1);
        assert_eq!(status["session_ttl_secs"], 300);
    }
}
