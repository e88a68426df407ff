use std::path::PathBuf;

use thiserror::Error;

use liveface_core::{ChallengeError, DetectionError};

use crate::api::ApiError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected")]
    MultipleFaces,
    #[error("active liveness timed out")]
    Timeout,
}

impl From<&DetectionError> for CaptureError {
    fn from(e: &DetectionError) -> Self {
        match e {
            DetectionError::MultipleFaces => CaptureError::MultipleFaces,
            DetectionError::NoFace | DetectionError::Failed(_) => CaptureError::NoFaceDetected,
        }
    }
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artifact I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("missing artifact: {0}")]
    MissingArtifact(String),
    #[error("liveness artifact count mismatch: expected {expected}, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("invalid job id: {0:?}")]
    InvalidJobId(String),
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("malformed frame buffer ({width}x{height}, {len} bytes)")]
    MalformedFrame { width: u32, height: u32, len: usize },
    #[error("digest mismatch for {file}")]
    DigestMismatch { file: String },
}

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("a submission for job {0} is already in progress")]
    InProgress(String),
    #[error("job {job_id} is incomplete: {source}")]
    Incomplete {
        job_id: String,
        #[source]
        source: ArtifactError,
    },
    #[error("network error (retryable): {0}")]
    Network(String),
    #[error("rejected by service [{code}]: {message}")]
    Permanent { code: String, message: String },
    #[error("artifact store error: {0}")]
    Artifact(#[from] ArtifactError),
}

impl SubmissionError {
    /// Whether resubmitting the same artifacts can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmissionError::Network(_))
    }
}

impl From<ApiError> for SubmissionError {
    fn from(e: ApiError) -> Self {
        match e {
            e if e.is_transient() => SubmissionError::Network(e.to_string()),
            ApiError::Rejected { code, message } => SubmissionError::Permanent { code, message },
            other => SubmissionError::Permanent {
                code: "invalid_response".to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
}

/// Everything a capture session can fail with.
#[derive(Error, Debug)]
pub enum SelfieError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session cancelled")]
    Cancelled,
    #[error("capture session has shut down")]
    Closed,
    #[error("unknown error: {0}")]
    Unknown(String),
}
