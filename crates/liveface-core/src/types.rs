use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle. Units depend on context: normalized (0..1) for
/// detector output, view pixels for the layout frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// The on-screen face guide and the view it lives in, both in view pixels.
///
/// Detector boxes are normalized to the frame; they are scaled by `view_width`
/// and `view_height` before being compared against `guide`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayoutFrame {
    pub guide: Rect,
    pub view_width: f32,
    pub view_height: f32,
}

impl LayoutFrame {
    pub fn new(guide: Rect, view_width: f32, view_height: f32) -> Self {
        Self {
            guide,
            view_width,
            view_height,
        }
    }

    /// Map a normalized detector box into view pixels.
    pub fn to_view(&self, normalized: &Rect) -> Rect {
        Rect {
            x: normalized.x * self.view_width,
            y: normalized.y * self.view_height,
            width: normalized.width * self.view_width,
            height: normalized.height * self.view_height,
        }
    }
}

impl Default for LayoutFrame {
    /// A 390×844 portrait view with a 280 px wide guide centred horizontally.
    fn default() -> Self {
        Self {
            guide: Rect::new(55.0, 182.0, 280.0, 380.0),
            view_width: 390.0,
            view_height: 844.0,
        }
    }
}

/// Face geometry for one analyzed frame, as produced by a
/// [`FaceGeometryProvider`](crate::provider::FaceGeometryProvider).
///
/// Angles are in radians. Negative yaw is the subject turning to their left,
/// negative pitch is the subject looking up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceGeometry {
    pub bounding_box: Rect,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    /// Capture-quality score reported by the detector, 0..1.
    pub quality_score: f32,
    /// Mean luminance of the face region, 0..255.
    pub brightness: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

impl Orientation {
    pub fn is_portrait(self) -> bool {
        matches!(self, Orientation::Portrait)
    }
}

/// Raw RGB8 image buffer delivered by the camera pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB8, `width * height * 3` bytes.
    pub data: Vec<u8>,
}

impl ImageFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// Whether `data` holds exactly one RGB8 pixel per position.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.width as usize * self.height as usize * 3
    }
}

/// One frame from the camera: a shared buffer handle, the device orientation
/// at capture time, and a monotonic timestamp since stream start.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub image: Arc<ImageFrame>,
    pub orientation: Orientation,
    pub timestamp: Duration,
}

impl FrameSample {
    pub fn new(image: ImageFrame, orientation: Orientation, timestamp: Duration) -> Self {
        Self {
            image: Arc::new(image),
            orientation,
            timestamp,
        }
    }
}

/// Active liveness pose challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessTask {
    LookLeft,
    LookRight,
    LookUp,
}

impl LivenessTask {
    pub const ALL: [LivenessTask; 3] = [
        LivenessTask::LookLeft,
        LivenessTask::LookRight,
        LivenessTask::LookUp,
    ];

    /// The prompt shown while this task is active.
    pub fn instruction(self) -> Instruction {
        match self {
            LivenessTask::LookLeft => Instruction::LookLeft,
            LivenessTask::LookRight => Instruction::LookRight,
            LivenessTask::LookUp => Instruction::LookUp,
        }
    }

    /// The head-pose angle component measured in this task's direction.
    /// Positive values move towards completion.
    pub fn directed_angle(self, yaw: f32, pitch: f32) -> f32 {
        match self {
            LivenessTask::LookLeft => -yaw,
            LivenessTask::LookRight => yaw,
            LivenessTask::LookUp => -pitch,
        }
    }
}

impl std::fmt::Display for LivenessTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LivenessTask::LookLeft => "look_left",
            LivenessTask::LookRight => "look_right",
            LivenessTask::LookUp => "look_up",
        };
        f.write_str(s)
    }
}

/// User-facing next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    ReorientDevice,
    NoFace,
    MultipleFaces,
    MoveCloser,
    MoveBack,
    CenterFace,
    ImproveLighting,
    LookLeft,
    LookRight,
    LookUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundsState {
    TooSmall,
    TooLarge,
    OffCenter,
    Ok,
    Unknown,
}

impl BoundsState {
    /// Instruction that fixes this bounds problem, if any.
    pub fn instruction(self) -> Option<Instruction> {
        match self {
            BoundsState::TooSmall => Some(Instruction::MoveCloser),
            BoundsState::TooLarge => Some(Instruction::MoveBack),
            BoundsState::OffCenter => Some(Instruction::CenterFace),
            BoundsState::Ok | BoundsState::Unknown => None,
        }
    }
}

/// Verdict for one frame. `is_valid` implies `bounds_state == Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub bounds_state: BoundsState,
    pub instruction: Option<Instruction>,
}
