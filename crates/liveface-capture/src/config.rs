use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use liveface_core::{ChallengeThresholds, LivenessTask, ValidatorConfig};

use crate::error::ConfigError;

/// Capture session configuration.
///
/// Loaded from `LIVEFACE_*` environment variables ([`CaptureConfig::from_env`])
/// or a TOML file ([`CaptureConfig::from_toml_file`]); every field has a
/// default and can be overridden for tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Root directory for job lifecycle directories.
    pub data_dir: PathBuf,
    /// Partner-side user id. A random one is generated per session when unset.
    pub user_id: Option<String>,
    /// Number of liveness frames submitted with each job.
    pub liveness_frames: usize,
    /// Per-task liveness timeout.
    pub task_timeout_secs: u64,
    /// Timer tick granularity for the liveness timeout.
    pub tick_interval_ms: u64,
    /// Pause between challenge completion and submission.
    pub settle_delay_ms: u64,
    /// Queue jobs locally when the network is unavailable.
    pub offline_mode: bool,
    /// Accept fewer than `liveness_frames` frames after a liveness timeout.
    pub allow_partial_on_timeout: bool,
    pub allow_new_enroll: bool,
    pub callback_url: Option<String>,
    pub jpeg_quality: u8,
    /// Longest edge of the stored selfie, in pixels.
    pub selfie_max_dim: u32,
    /// Longest edge of each stored liveness frame, in pixels.
    pub liveness_max_dim: u32,
    pub validator: ValidatorConfig,
    pub challenge: ChallengeThresholds,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            user_id: None,
            liveness_frames: 7,
            task_timeout_secs: 120,
            tick_interval_ms: 1000,
            settle_delay_ms: 1000,
            offline_mode: false,
            allow_partial_on_timeout: true,
            allow_new_enroll: false,
            callback_url: None,
            jpeg_quality: 85,
            selfie_max_dim: 640,
            liveness_max_dim: 320,
            validator: ValidatorConfig::default(),
            challenge: ChallengeThresholds::default(),
        }
    }
}

impl CaptureConfig {
    /// Load configuration from `LIVEFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let validator = ValidatorConfig {
            center_tolerance: env_f32(
                "LIVEFACE_CENTER_TOLERANCE",
                defaults.validator.center_tolerance,
            ),
            min_brightness: env_u8("LIVEFACE_MIN_BRIGHTNESS", defaults.validator.min_brightness),
            max_brightness: env_u8("LIVEFACE_MAX_BRIGHTNESS", defaults.validator.max_brightness),
            min_quality: env_f32("LIVEFACE_MIN_QUALITY", defaults.validator.min_quality),
            ..defaults.validator.clone()
        };
        let challenge = ChallengeThresholds {
            min_angle: env_f32("LIVEFACE_MIN_ANGLE", defaults.challenge.min_angle),
            max_angle: env_f32("LIVEFACE_MAX_ANGLE", defaults.challenge.max_angle),
        };

        Self {
            data_dir: std::env::var("LIVEFACE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            user_id: std::env::var("LIVEFACE_USER_ID").ok(),
            liveness_frames: env_usize("LIVEFACE_LIVENESS_FRAMES", defaults.liveness_frames),
            task_timeout_secs: env_u64("LIVEFACE_TASK_TIMEOUT_SECS", defaults.task_timeout_secs),
            tick_interval_ms: env_u64("LIVEFACE_TICK_INTERVAL_MS", defaults.tick_interval_ms),
            settle_delay_ms: env_u64("LIVEFACE_SETTLE_DELAY_MS", defaults.settle_delay_ms),
            offline_mode: env_bool("LIVEFACE_OFFLINE_MODE", defaults.offline_mode),
            allow_partial_on_timeout: env_bool(
                "LIVEFACE_ALLOW_PARTIAL_ON_TIMEOUT",
                defaults.allow_partial_on_timeout,
            ),
            allow_new_enroll: env_bool("LIVEFACE_ALLOW_NEW_ENROLL", defaults.allow_new_enroll),
            callback_url: std::env::var("LIVEFACE_CALLBACK_URL").ok(),
            jpeg_quality: env_u8("LIVEFACE_JPEG_QUALITY", defaults.jpeg_quality),
            selfie_max_dim: env_u32("LIVEFACE_SELFIE_MAX_DIM", defaults.selfie_max_dim),
            liveness_max_dim: env_u32("LIVEFACE_LIVENESS_MAX_DIM", defaults.liveness_max_dim),
            validator,
            challenge,
        }
    }

    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.liveness_frames < LivenessTask::ALL.len() {
            return Err(ConfigError::Invalid(format!(
                "liveness_frames must be at least {} (one per task), got {}",
                LivenessTask::ALL.len(),
                self.liveness_frames
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.validator.min_brightness > self.validator.max_brightness {
            return Err(ConfigError::Invalid(
                "min_brightness exceeds max_brightness".to_string(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality must be 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        self.challenge.validate()?;
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Per-task timeout expressed in timer ticks, at least one.
    pub fn task_timeout_ticks(&self) -> u32 {
        let ticks = self.task_timeout_secs.saturating_mul(1000) / self.tick_interval_ms.max(1);
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("liveface")
}

fn env_f32(key: &str, default: f32) -> f32 {
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

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u8(key: &str, default: u8) -> u8 {
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

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
