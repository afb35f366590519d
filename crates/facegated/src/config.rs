use facegate_core::{BlinkConfig, Correlation, MatchPolicy, SessionConfig, TrackerConfig};
use facegate_vision::ModelPaths;
use std::path::PathBuf;
use std::time::Duration;

use crate::rate_limiter::LimiterConfig;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub policy: MatchPolicy,
    pub blink: BlinkConfig,
    /// Session lifetime. `None` when `FACEGATE_SESSION_TTL_SECS=0`.
    pub session_ttl: Option<Duration>,
    /// Tracks unmatched for more than this many frames are retired.
    pub track_max_lost_frames: u32,
    /// Spatial correlation bound in pixels. `0` selects positional correlation.
    pub track_max_distance: f32,
    /// Timeout in seconds for one analysis request to the engine.
    pub analyze_timeout_secs: u64,
    /// Interval of the session / stream / limiter sweep.
    pub sweep_interval_secs: u64,
    /// Tracker streams idle this long are dropped.
    pub stream_idle_secs: u64,
    pub max_failed_attempts: u32,
    pub lockout_secs: u64,
    /// Maximum images per liveness submission.
    pub max_liveness_frames: usize,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEGATE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facegate_vision::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");

        let db_path = std::env::var("FACEGATE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("identities.db"));

        let defaults = MatchPolicy::default();
        let blink = BlinkConfig::default();

        let ttl_secs = env_u64("FACEGATE_SESSION_TTL_SECS", 300);

        Self {
            model_dir,
            db_path,
            policy: MatchPolicy {
                enroll_dedup: env_f32("FACEGATE_ENROLL_DEDUP_THRESHOLD", defaults.enroll_dedup),
                recognize_accept: env_f32(
                    "FACEGATE_RECOGNIZE_THRESHOLD",
                    defaults.recognize_accept,
                ),
                liveness_floor: env_f32("FACEGATE_LIVENESS_FLOOR", defaults.liveness_floor),
            },
            blink: BlinkConfig {
                ear_threshold: env_f32("FACEGATE_EAR_THRESHOLD", blink.ear_threshold),
                consec_frames: env_u32("FACEGATE_BLINK_CONSEC_FRAMES", blink.consec_frames).max(1),
                window_size: env_usize("FACEGATE_BLINK_WINDOW", blink.window_size),
                min_blinks: env_u32("FACEGATE_MIN_BLINKS", blink.min_blinks).max(1),
            },
            session_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            track_max_lost_frames: env_u32("FACEGATE_TRACK_MAX_LOST_FRAMES", 25),
            track_max_distance: env_f32("FACEGATE_TRACK_MAX_DISTANCE", 120.0),
            analyze_timeout_secs: env_u64("FACEGATE_ANALYZE_TIMEOUT_SECS", 10),
            sweep_interval_secs: env_u64("FACEGATE_SWEEP_INTERVAL_SECS", 30).max(1),
            stream_idle_secs: env_u64("FACEGATE_STREAM_IDLE_SECS", 120),
            max_failed_attempts: env_u32("FACEGATE_MAX_FAILED_ATTEMPTS", 5).max(1),
            lockout_secs: env_u64("FACEGATE_LOCKOUT_SECS", 300),
            max_liveness_frames: env_usize("FACEGATE_MAX_LIVENESS_FRAMES", 60),
            session_bus: std::env::var("FACEGATE_SESSION_BUS").is_ok(),
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ttl: self.session_ttl,
            liveness_floor: self.policy.liveness_floor,
            blink: self.blink,
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        let correlation = if self.track_max_distance > 0.0 {
            Correlation::Spatial {
                max_center_distance: self.track_max_distance,
            }
        } else {
            Correlation::Positional
        };
        TrackerConfig {
            max_lost_frames: self.track_max_lost_frames,
            correlation,
            blink: self.blink,
        }
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            max_failures: self.max_failed_attempts,
            lockout: Duration::from_secs(self.lockout_secs),
            ..LimiterConfig::default()
        }
    }

    /// Defaults with an in-memory database, independent of the environment.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            model_dir: PathBuf::from("/models"),
            db_path: PathBuf::from(":memory:"),
            policy: MatchPolicy::default(),
            blink: BlinkConfig::default(),
            session_ttl: Some(Duration::from_secs(300)),
            track_max_lost_frames: 25,
            track_max_distance: 120.0,
            analyze_timeout_secs: 10,
            sweep_interval_secs: 30,
            stream_idle_secs: 120,
            max_failed_attempts: 5,
            lockout_secs: 300,
            max_liveness_frames: 60,
            session_bus: true,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
