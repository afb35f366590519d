use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    /// Failed liveness attempts tolerated inside `window` before lockout.
    pub max_failures: u32,
    pub window: Duration,
    pub lockout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(300),
        }
    }
}

struct AttemptRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl AttemptRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Failed-liveness limiter, keyed by enrolled identity id.
///
/// Only verdicts count as failures (no blink, face mismatch). Session and
/// engine errors do not. A lockout applies to every session of the identity,
/// so a replay cannot simply recognize again for a fresh token.
pub struct AttemptLimiter {
    config: LimiterConfig,
    records: HashMap<String, AttemptRecord>,
}

impl AttemptLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    /// `Err(remaining)` while the identity is locked out.
    pub fn check(&mut self, identity_id: &str) -> Result<(), Duration> {
        self.check_at(identity_id, Instant::now())
    }

    pub fn check_at(&mut self, identity_id: &str, now: Instant) -> Result<(), Duration> {
        let Some(record) = self.records.get_mut(identity_id) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(locked_until.duration_since(now));
            }
            *record = AttemptRecord::fresh(now);
        } else if now.duration_since(record.window_start) >= self.config.window {
            *record = AttemptRecord::fresh(now);
        }

        Ok(())
    }

    pub fn record_failure(&mut self, identity_id: &str) {
        self.record_failure_at(identity_id, Instant::now());
    }

    pub fn record_failure_at(&mut self, identity_id: &str, now: Instant) {
        let record = self
            .records
            .entry(identity_id.to_string())
            .or_insert_with(|| AttemptRecord::fresh(now));

        if now.duration_since(record.window_start) >= self.config.window {
            *record = AttemptRecord::fresh(now);
        }

        record.failures += 1;
        if record.failures >= self.config.max_failures {
            record.locked_until = Some(now + self.config.lockout);
            tracing::warn!(
                identity_id,
                failures = record.failures,
                lockout_secs = self.config.lockout.as_secs(),
                "liveness attempts exhausted; identity locked"
            );
        } else {
            tracing::debug!(
                identity_id,
                failures = record.failures,
                max = self.config.max_failures,
                "liveness failed"
            );
        }
    }

    pub fn record_success(&mut self, identity_id: &str) {
        self.records.remove(identity_id);
    }

    /// Drop records whose window and lockout have both lapsed.
    pub fn prune(&mut self, now: Instant) {
        let window = self.config.window;
        self.records.retain(|_, r| match r.locked_until {
            Some(until) => now < until,
            None => now.duration_since(r.window_start) < window,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
