//! liveface-core — Face validation and active liveness challenges.
//!
//! Consumes geometry from an external face detector; performs no detection
//! and no rendering itself.

pub mod liveness;
pub mod provider;
pub mod types;
pub mod validator;

pub use liveness::{
    ChallengeEngine, ChallengeError, ChallengeEvent, ChallengeSequence, ChallengeState,
    ChallengeThresholds,
};
pub use provider::{
    DetectionError, FaceGeometryProvider, FrameAnalysis, QualityClassifier, QualityError,
};
pub use types::{
    BoundsState, FaceGeometry, FrameSample, ImageFrame, Instruction, LayoutFrame, LivenessTask,
    Orientation, Rect, ValidationResult,
};
pub use validator::{FaceValidator, ValidatorConfig};
