//! Capability interfaces for the face detector and image-quality classifier.
//!
//! Both are supplied by the integrator. The capture pipeline calls them from a
//! dedicated analysis thread, one frame at a time.

use thiserror::Error;

use crate::types::{FaceGeometry, ImageFrame};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("no face in frame")]
    NoFace,
    #[error("more than one face in frame")]
    MultipleFaces,
    #[error("face detector failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("quality classifier failed: {0}")]
pub struct QualityError(pub String);

/// Detects the single face in a frame and reports its geometry.
pub trait FaceGeometryProvider: Send + Sync {
    fn analyze(&self, image: &ImageFrame) -> Result<FaceGeometry, DetectionError>;
}

/// Scores how usable a frame is as a selfie, 0..1.
pub trait QualityClassifier: Send + Sync {
    fn score(&self, image: &ImageFrame) -> Result<f32, QualityError>;
}

/// Everything the analysis thread learned about one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameAnalysis {
    pub detection: Result<FaceGeometry, DetectionError>,
    pub quality: Result<f32, QualityError>,
}

impl FrameAnalysis {
    /// Run both capabilities against a frame. The classifier is skipped when
    /// no usable face was found.
    pub fn run(
        image: &ImageFrame,
        provider: &dyn FaceGeometryProvider,
        classifier: &dyn QualityClassifier,
    ) -> Self {
        let detection = provider.analyze(image);
        let quality = match detection {
            Ok(_) => classifier.score(image),
            Err(_) => Ok(0.0),
        };
        Self { detection, quality }
    }
}
