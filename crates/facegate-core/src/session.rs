//! Verification sessions.
//!
//! A successful recognition issues an opaque token bound to the probe
//! descriptor and the recognized identity. Liveness submissions present the
//! token; each submission runs under a [`Verification`] guard, which makes
//! the session exclusive (`Verifying`) until a verdict is recorded.
//!
//! Sessions expire `ttl` after issue. Expired sessions are rejected on
//! access and removed by [`SessionManager::sweep_expired`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::liveness::{BlinkConfig, BlinkState};
use crate::types::Descriptor;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("a liveness verification is already running for this session")]
    VerificationInProgress,
    #[error("observed face does not match the session identity (similarity {similarity:.3} < {floor:.3})")]
    IdentityMismatch { similarity: f32, floor: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Issued,
    Verifying,
    Passed,
    Failed,
}

/// Opaque session token (UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 fingerprint for logs. Tokens are bearer credentials.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Log-safe fingerprint of a raw token string.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Lifetime of an issued session. `None` keeps sessions until shutdown.
    pub ttl: Option<Duration>,
    /// Minimum similarity between a liveness frame and the bound descriptor.
    pub liveness_floor: f32,
    pub blink: BlinkConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(300)),
            liveness_floor: 0.70,
            blink: BlinkConfig::default(),
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    identity_id: String,
    bound: Descriptor,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    status: SessionStatus,
    blink: BlinkState,
    attempts: u32,
}

impl SessionEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Snapshot of a session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub identity_id: String,
    pub status: SessionStatus,
    pub attempts: u32,
    pub blinks: u32,
    pub created_at: String,
    pub expires_at: Option<String>,
}

/// Owns every live session. One instance per service; pass it explicitly.
pub struct SessionManager {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>,
}

fn lock(entry: &Mutex<SessionEntry>) -> MutexGuard<'_, SessionEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Issue a fresh token bound to `descriptor` and the recognized identity.
    pub fn issue(&self, identity_id: &str, descriptor: Descriptor) -> SessionToken {
        self.issue_at(identity_id, descriptor, Utc::now())
    }

    pub fn issue_at(
        &self,
        identity_id: &str,
        descriptor: Descriptor,
        now: DateTime<Utc>,
    ) -> SessionToken {
        let expires_at = self
            .config
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        let entry = SessionEntry {
            identity_id: identity_id.to_string(),
            bound: descriptor,
            created_at: now,
            expires_at,
            status: SessionStatus::Issued,
            blink: BlinkState::new(self.config.blink),
            attempts: 0,
        };

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let token = loop {
            let token = SessionToken::generate();
            if !sessions.contains_key(token.as_str()) {
                break token;
            }
        };
        sessions.insert(token.0.clone(), Arc::new(Mutex::new(entry)));

        tracing::info!(
            session = %token.fingerprint(),
            identity_id,
            expires_at = ?expires_at,
            "session issued"
        );
        token
    }

    fn entry(&self, token: &str) -> Result<Arc<Mutex<SessionEntry>>, SessionError> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    /// Return the descriptor bound to `token`.
    pub fn validate(&self, token: &str) -> Result<Descriptor, SessionError> {
        self.validate_at(token, Utc::now())
    }

    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<Descriptor, SessionError> {
        let entry = self.entry(token)?;
        let entry = lock(&entry);
        if entry.is_expired(now) {
            return Err(SessionError::Expired);
        }
        Ok(entry.bound.clone())
    }

    /// Identity the session was issued for.
    pub fn identity_of(&self, token: &str) -> Result<String, SessionError> {
        let entry = self.entry(token)?;
        let entry = lock(&entry);
        if entry.is_expired(Utc::now()) {
            return Err(SessionError::Expired);
        }
        Ok(entry.identity_id.clone())
    }

    pub fn info(&self, token: &str) -> Result<SessionInfo, SessionError> {
        let entry = self.entry(token)?;
        let entry = lock(&entry);
        Ok(SessionInfo {
            identity_id: entry.identity_id.clone(),
            status: entry.status,
            attempts: entry.attempts,
            blinks: entry.blink.blink_count(),
            created_at: entry.created_at.to_rfc3339(),
            expires_at: entry.expires_at.map(|at| at.to_rfc3339()),
        })
    }

    /// Start a liveness verification. Fails while another one is running.
    pub fn begin_verification(&self, token: &str) -> Result<Verification, SessionError> {
        self.begin_verification_at(token, Utc::now())
    }

    pub fn begin_verification_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Verification, SessionError> {
        let entry = self.entry(token)?;
        {
            let mut guard = lock(&entry);
            if guard.is_expired(now) {
                return Err(SessionError::Expired);
            }
            if guard.status == SessionStatus::Verifying {
                return Err(SessionError::VerificationInProgress);
            }
            guard.status = SessionStatus::Verifying;
        }

        Ok(Verification {
            token: SessionToken(token.to_string()),
            entry,
            liveness_floor: self.config.liveness_floor,
            finished: false,
        })
    }

    /// Check `observed` against the bound descriptor and record `verdict`.
    ///
    /// A descriptor below the liveness floor fails the session with
    /// [`SessionError::IdentityMismatch`] regardless of the verdict.
    pub fn complete_liveness(
        &self,
        token: &str,
        observed: &Descriptor,
        verdict: bool,
    ) -> Result<SessionStatus, SessionError> {
        let verification = self.begin_verification(token)?;
        verification.check_identity(observed)?;
        Ok(verification.finish(verdict))
    }

    /// Drop every session bound to `identity_id`. Returns the count removed.
    pub fn revoke_identity(&self, identity_id: &str) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, entry| lock(entry).identity_id != identity_id);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!(identity_id, removed, "sessions revoked");
        }
        removed
    }

    /// Remove every expired session that is not mid-verification. Returns the count removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, entry| {
            let entry = lock(entry);
            !(entry.is_expired(now) && entry.status != SessionStatus::Verifying)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "expired sessions swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive liveness verification on one session.
///
/// Dropping the guard without [`finish`](Self::finish) marks the session `Failed`.
pub struct Verification {
    token: SessionToken,
    entry: Arc<Mutex<SessionEntry>>,
    liveness_floor: f32,
    finished: bool,
}

impl Verification {
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn identity_id(&self) -> String {
        lock(&self.entry).identity_id.clone()
    }

    /// Similarity of `observed` to the bound descriptor, or `IdentityMismatch`
    /// when it falls below the liveness floor.
    pub fn check_identity(&self, observed: &Descriptor) -> Result<f32, SessionError> {
        let similarity = lock(&self.entry).bound.similarity(observed);
        if similarity < self.liveness_floor {
            tracing::warn!(
                session = %self.token.fingerprint(),
                similarity,
                floor = self.liveness_floor,
                "liveness frame does not match session identity"
            );
            return Err(SessionError::IdentityMismatch {
                similarity,
                floor: self.liveness_floor,
            });
        }
        Ok(similarity)
    }

    /// Feed one frame's EAR to the session's blink state.
    pub fn observe_ear(&mut self, ear: f32) -> bool {
        lock(&self.entry).blink.update(ear)
    }

    pub fn is_live(&self) -> bool {
        lock(&self.entry).blink.is_live()
    }

    pub fn blink_count(&self) -> u32 {
        lock(&self.entry).blink.blink_count()
    }

    /// Record the verdict and release the session for the next attempt.
    pub fn finish(mut self, verdict: bool) -> SessionStatus {
        self.finished = true;
        let status = if verdict {
            SessionStatus::Passed
        } else {
            SessionStatus::Failed
        };
        let mut entry = lock(&self.entry);
        entry.status = status;
        entry.attempts += 1;
        tracing::info!(
            session = %self.token.fingerprint(),
            status = ?status,
            attempts = entry.attempts,
            "liveness verification finished"
        );
        status
    }
}

impl Drop for Verification {
    fn drop(&mut self) {
        if !self.finished {
            let mut entry = lock(&self.entry);
            entry.status = SessionStatus::Failed;
            entry.attempts += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn desc(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec()).unwrap()
    }

    fn manager() -> SessionManager {
        SessionManager::new(SessionConfig::default())
    }

    #[test]
    fn test_issue_and_validate() {
        let sessions = manager();
        let d = desc(&[1.0, 0.0, 0.0]);
        let token = sessions.issue("alice-id", d.clone());
        assert_eq!(sessions.validate(token.as_str()).unwrap(), d);
        assert_eq!(sessions.identity_of(token.as_str()).unwrap(), "alice-id");
        assert_eq!(
            sessions.info(token.as_str()).unwrap().status,
            SessionStatus::Issued
        );
    }

    #[test]
    fn test_unknown_token() {
        let sessions = manager();
        assert_eq!(
            sessions.validate("no-such-token").unwrap_err(),
            SessionError::NotFound
        );
        assert!(sessions.begin_verification("no-such-token").is_err());
    }

    #[test]
    fn test_tokens_are_unique() {
        let sessions = manager();
        let d = desc(&[1.0, 0.0]);
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let token = sessions.issue("id", d.clone());
            assert!(seen.insert(token.as_str().to_string()));
        }
        assert_eq!(sessions.len(), 10_000);
    }

    #[test]
    fn test_expiry() {
        let sessions = manager();
        let issued = Utc::now();
        let token = sessions.issue_at("id", desc(&[1.0, 0.0]), issued);

        let before = issued + chrono::Duration::seconds(299);
        assert!(sessions.validate_at(token.as_str(), before).is_ok());

        let after = issued + chrono::Duration::seconds(300);
        assert_eq!(
            sessions.validate_at(token.as_str(), after).unwrap_err(),
            SessionError::Expired
        );
        assert_eq!(
            sessions
                .begin_verification_at(token.as_str(), after)
                .err(),
            Some(SessionError::Expired)
        );
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let sessions = SessionManager::new(SessionConfig {
            ttl: None,
            ..SessionConfig::default()
        });
        let token = sessions.issue("id", desc(&[1.0, 0.0]));
        let far = Utc::now() + chrono::Duration::days(3650);
        assert!(sessions.validate_at(token.as_str(), far).is_ok());
        assert_eq!(sessions.sweep_expired_at(far), 0);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let sessions = manager();
        let now = Utc::now();
        let old = sessions.issue_at("old", desc(&[1.0, 0.0]), now - chrono::Duration::hours(1));
        let fresh = sessions.issue_at("fresh", desc(&[1.0, 0.0]), now);

        assert_eq!(sessions.sweep_expired_at(now), 1);
        assert_eq!(
            sessions.validate(old.as_str()).unwrap_err(),
            SessionError::NotFound
        );
        assert!(sessions.validate(fresh.as_str()).is_ok());
    }

    #[test]
    fn test_one_active_verification() {
        let sessions = manager();
        let token = sessions.issue("id", desc(&[1.0, 0.0]));

        let first = sessions.begin_verification(token.as_str()).unwrap();
        assert_eq!(
            sessions.begin_verification(token.as_str()).err(),
            Some(SessionError::VerificationInProgress)
        );
        assert_eq!(first.finish(false), SessionStatus::Failed);

        // Token stays valid for another attempt
        let second = sessions.begin_verification(token.as_str()).unwrap();
        assert_eq!(second.finish(true), SessionStatus::Passed);
        assert_eq!(sessions.info(token.as_str()).unwrap().attempts, 2);
    }

    #[test]
    fn test_dropped_verification_fails_session() {
        let sessions = manager();
        let token = sessions.issue("id", desc(&[1.0, 0.0]));
        {
            let _verification = sessions.begin_verification(token.as_str()).unwrap();
        }
        assert_eq!(
            sessions.info(token.as_str()).unwrap().status,
            SessionStatus::Failed
        );
        assert!(sessions.begin_verification(token.as_str()).is_ok());
    }

    #[test]
    fn test_complete_liveness_identity_mismatch() {
        let sessions = manager();
        let token = sessions.issue("id", desc(&[1.0, 0.0]));

        let err = sessions
            .complete_liveness(token.as_str(), &desc(&[0.0, 1.0]), true)
            .unwrap_err();
        assert!(matches!(err, SessionError::IdentityMismatch { .. }));
        assert_eq!(
            sessions.info(token.as_str()).unwrap().status,
            SessionStatus::Failed
        );
    }

    #[test]
    fn test_complete_liveness_passes() {
        let sessions = manager();
        let token = sessions.issue("id", desc(&[1.0, 0.0]));
        let status = sessions
            .complete_liveness(token.as_str(), &desc(&[0.95, 0.05]), true)
            .unwrap();
        assert_eq!(status, SessionStatus::Passed);

        let status = sessions
            .complete_liveness(token.as_str(), &desc(&[0.95, 0.05]), false)
            .unwrap();
        assert_eq!(status, SessionStatus::Failed);
    }

    #[test]
    fn test_blink_state_persists_across_attempts() {
        let sessions = manager();
        let token = sessions.issue("id", desc(&[1.0, 0.0]));

        let mut first = sessions.begin_verification(token.as_str()).unwrap();
        first.observe_ear(0.30);
        first.observe_ear(0.15);
        first.observe_ear(0.15);
        assert!(!first.is_live());
        first.finish(false);

        let mut second = sessions.begin_verification(token.as_str()).unwrap();
        assert!(second.observe_ear(0.30));
        assert_eq!(second.blink_count(), 1);
        second.finish(true);
    }

    #[test]
    fn test_fingerprint_hides_token() {
        let sessions = manager();
        let token = sessions.issue("id", desc(&[1.0, 0.0]));
        let fp = token.fingerprint();
        assert_eq!(fp.len(), 12);
        assert!(!token.as_str().contains(&fp));
        assert_eq!(fp, fingerprint(token.as_str()));
    }

    #[test]
    fn test_revoke_identity() {
        let sessions = manager();
        let first = sessions.issue("alice-id", desc(&[1.0, 0.0]));
        let second = sessions.issue("alice-id", desc(&[0.9, 0.1]));
        let other = sessions.issue("bob-id", desc(&[0.0, 1.0]));

        assert_eq!(sessions.revoke_identity("alice-id"), 2);
        assert_eq!(sessions.validate(first.as_str()), Err(SessionError::NotFound));
        assert_eq!(sessions.validate(second.as_str()), Err(SessionError::NotFound));
        assert!(sessions.validate(other.as_str()).is_ok());
        assert_eq!(sessions.revoke_identity("alice-id"), 0);
        assert_eq!(sessions.len(), 1);
    }
}
