//! Backend capability used by the submission pipeline.
//!
//! The HTTP client and request signing live with the integrator; this module
//! only fixes the three calls and the data that flows between them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{ArtifactKind, JobManifest};

/// Prepare-upload error code asking the client to resend with `retry = true`.
pub const RETRY_WITH_FLAG_CODE: &str = "2215";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Connection failure; the request may not have reached the service.
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    /// Structured rejection from the service.
    #[error("service rejected request [{code}]: {message}")]
    Rejected { code: String, message: String },
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Timeout(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub job_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    pub signature: String,
    pub timestamp: String,
    #[serde(default)]
    pub partner_params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepUploadRequest {
    pub job_id: String,
    pub signature: String,
    pub timestamp: String,
    pub partner_params: BTreeMap<String, String>,
    pub callback_url: Option<String>,
    pub allow_new_enroll: bool,
    pub retry: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepUploadResponse {
    pub code: String,
    pub ref_id: String,
    pub upload_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub file_name: String,
    pub kind: ArtifactKind,
    pub bytes: Vec<u8>,
}

/// Everything uploaded for one job. Wire encoding is up to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPackage {
    pub manifest: JobManifest,
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAck {
    pub status: u16,
}

/// Response surfaced to the caller after a successful upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub ref_id: String,
    pub code: String,
    pub upload_status: u16,
}

#[async_trait]
pub trait SelfieApi: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResponse, ApiError>;

    async fn prepare_upload(
        &self,
        request: &PrepUploadRequest,
    ) -> Result<PrepUploadResponse, ApiError>;

    async fn upload(&self, url: &str, package: &UploadPackage) -> Result<UploadAck, ApiError>;
}
