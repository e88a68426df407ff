//! Per-frame face validation.
//!
//! Turns detector geometry, brightness and a quality score into a single
//! verdict plus the one instruction the user should follow next. The only
//! state is the layout frame of the on-screen face guide; everything else is
//! a pure function of the inputs.

use serde::{Deserialize, Serialize};

use crate::provider::DetectionError;
use crate::types::{
    BoundsState, FaceGeometry, Instruction, LayoutFrame, LivenessTask, ValidationResult,
};

/// Thresholds used by [`FaceValidator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Maximum per-axis distance (view pixels) between the face centre and
    /// the guide centre when no challenge is running.
    pub center_tolerance: f32,
    /// The face may be at most `guide.width - max_width_margin` wide.
    pub max_width_margin: f32,
    /// The face must be at least `guide.width / min_width_divisor` wide.
    pub min_width_divisor: f32,
    pub min_brightness: u8,
    pub max_brightness: u8,
    pub min_quality: f32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            center_tolerance: 50.0,
            max_width_margin: 20.0,
            min_width_divisor: 1.5,
            min_brightness: 80,
            max_brightness: 200,
            min_quality: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FaceValidator {
    config: ValidatorConfig,
    layout: LayoutFrame,
}

impl FaceValidator {
    pub fn new(config: ValidatorConfig, layout: LayoutFrame) -> Self {
        Self { config, layout }
    }

    pub fn set_layout_frame(&mut self, layout: LayoutFrame) {
        self.layout = layout;
    }

    pub fn layout_frame(&self) -> &LayoutFrame {
        &self.layout
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate one detected face.
    ///
    /// `current_task` is the liveness task in progress, if any. Mid-challenge
    /// the subject is expected to turn their head, so the centring check is
    /// skipped and the task's look direction becomes the default prompt.
    pub fn validate(
        &self,
        geometry: &FaceGeometry,
        quality_score: f32,
        brightness: u8,
        current_task: Option<LivenessTask>,
    ) -> ValidationResult {
        let bounds_state = self.check_bounds(geometry, current_task.is_none());
        let bounds_ok = bounds_state == BoundsState::Ok;
        let brightness_ok =
            (self.config.min_brightness..=self.config.max_brightness).contains(&brightness);
        let quality_ok = quality_score >= self.config.min_quality;

        let is_valid = bounds_ok && brightness_ok && quality_ok;

        let instruction = if is_valid {
            current_task.map(LivenessTask::instruction)
        } else if let Some(fix) = bounds_state.instruction() {
            Some(fix)
        } else if let Some(task) = current_task {
            Some(task.instruction())
        } else {
            Some(Instruction::ImproveLighting)
        };

        ValidationResult {
            is_valid,
            bounds_state,
            instruction,
        }
    }

    /// Map a detector failure onto a result. Never valid.
    pub fn validate_failure(&self, error: &DetectionError) -> ValidationResult {
        let instruction = match error {
            DetectionError::MultipleFaces => Instruction::MultipleFaces,
            DetectionError::NoFace | DetectionError::Failed(_) => Instruction::NoFace,
        };
        ValidationResult {
            is_valid: false,
            bounds_state: BoundsState::Unknown,
            instruction: Some(instruction),
        }
    }

    fn check_bounds(&self, geometry: &FaceGeometry, require_centered: bool) -> BoundsState {
        let guide = &self.layout.guide;
        let face = self.layout.to_view(&geometry.bounding_box);

        let min_width = guide.width / self.config.min_width_divisor;
        let max_width = guide.width - self.config.max_width_margin;

        if face.width < min_width {
            return BoundsState::TooSmall;
        }
        if face.width > max_width {
            return BoundsState::TooLarge;
        }

        if require_centered {
            let (fx, fy) = face.center();
            let (gx, gy) = guide.center();
            let tolerance = self.config.center_tolerance;
            if (fx - gx).abs() > tolerance || (fy - gy).abs() > tolerance {
                return BoundsState::OffCenter;
            }
        }

        BoundsState::Ok
    }
}

impl Default for FaceValidator {
    fn default() -> Self {
        Self::new(ValidatorConfig::default(), LayoutFrame::default())
    }
}
