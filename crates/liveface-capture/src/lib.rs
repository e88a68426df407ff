//! liveface-capture — Selfie and active-liveness capture sessions.
//!
//! Drives a session from the first valid face through the liveness
//! challenges to a durable, offline-capable submission. Frames come from the
//! integrator's camera; detection, quality scoring and the backend are
//! injected capabilities.

pub mod api;
pub mod config;
pub mod driver;
pub mod encode;
pub mod error;
pub mod job;
pub mod session;
pub mod store;
pub mod submission;
mod timer;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{
    ApiError, ApiResponse, AuthRequest, AuthResponse, PrepUploadRequest, PrepUploadResponse,
    SelfieApi, UploadAck, UploadFile, UploadPackage, RETRY_WITH_FLAG_CODE,
};
pub use config::CaptureConfig;
pub use driver::{spawn_session, SessionHandle};
pub use error::{ArtifactError, CaptureError, ConfigError, SelfieError, SubmissionError};
pub use job::{ArtifactKind, ArtifactRef, FailureReason, JobManifest, Lifecycle, ManifestEntry};
pub use session::{
    CaptureOrchestrator, CaptureResult, CaptureSession, Effect, SessionEvent, SessionState,
    TimerCommand,
};
pub use store::ArtifactStore;
pub use submission::{SubmissionManager, SubmissionOutcome, SubmissionRequest, SubmittedArtifacts};
