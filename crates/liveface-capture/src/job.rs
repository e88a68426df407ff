use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Directory a job lives in. A job is in exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Pending,
    Submitted,
    FailedOffline,
}

impl Lifecycle {
    pub const ALL: [Lifecycle; 3] = [
        Lifecycle::Pending,
        Lifecycle::Submitted,
        Lifecycle::FailedOffline,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            Lifecycle::Pending => "pending",
            Lifecycle::Submitted => "submitted",
            Lifecycle::FailedOffline => "failed_offline",
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.dir_name())
    }
}

impl std::str::FromStr for Lifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Lifecycle::Pending),
            "submitted" => Ok(Lifecycle::Submitted),
            "failed_offline" | "offline" => Ok(Lifecycle::FailedOffline),
            other => Err(format!("unknown lifecycle '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Selfie,
    Liveness,
}

impl ArtifactKind {
    pub(crate) fn file_prefix(self) -> &'static str {
        match self {
            ArtifactKind::Selfie => "selfie",
            ArtifactKind::Liveness => "liveness_",
        }
    }

    pub(crate) fn matches(self, file_name: &str) -> bool {
        match self {
            ArtifactKind::Selfie => file_name == "selfie.jpg",
            ArtifactKind::Liveness => {
                file_name.starts_with(self.file_prefix()) && file_name.ends_with(".jpg")
            }
        }
    }
}

/// Reference to one persisted image, stable within its lifecycle directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub job_id: String,
    pub kind: ArtifactKind,
    pub file_name: String,
    pub lifecycle: Lifecycle,
}

impl ArtifactRef {
    /// Path relative to the store root, e.g. `pending/<job>/selfie.jpg`.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.lifecycle.dir_name())
            .join(&self.job_id)
            .join(&self.file_name)
    }

    /// The same file after its job directory moved to `lifecycle`.
    pub fn in_lifecycle(&self, lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            ..self.clone()
        }
    }
}

/// Why a capture completed in a degraded way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ActiveLivenessTimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_name: String,
    pub kind: ArtifactKind,
    /// Hex SHA-256 of the file contents.
    pub sha256: String,
}

/// `manifest.json`: the durable job record stored next to the images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub failure_reason: Option<FailureReason>,
    pub allow_new_enroll: bool,
    pub callback_url: Option<String>,
    #[serde(default)]
    pub partner_params: BTreeMap<String, String>,
    pub artifacts: Vec<ManifestEntry>,
}

impl JobManifest {
    pub fn count(&self, kind: ArtifactKind) -> usize {
        self.artifacts.iter().filter(|a| a.kind == kind).count()
    }
}
