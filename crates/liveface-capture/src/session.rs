//! Capture session state machine.
//!
//! [`CaptureOrchestrator`] is synchronous and owns no timers, threads or
//! sockets. Every input (an analyzed frame, a timer tick, a submission result,
//! a user action) returns the [`Effect`]s the caller must carry out. The
//! runtime in [`crate::driver`] executes them; tests drive the machine
//! directly.

use std::path::PathBuf;
use std::time::Duration;

use liveface_core::{
    BoundsState, ChallengeEngine, ChallengeEvent, ChallengeSequence, FaceValidator, FrameAnalysis,
    FrameSample, Instruction, LayoutFrame, LivenessTask, ValidationResult,
};

use crate::api::ApiResponse;
use crate::config::CaptureConfig;
use crate::encode::encode_jpeg;
use crate::error::{ArtifactError, CaptureError, ConfigError, SelfieError, SubmissionError};
use crate::job::{ArtifactKind, ArtifactRef, FailureReason};
use crate::store::ArtifactStore;
use crate::submission::{SubmissionOutcome, SubmissionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingValidFace,
    SelfieCaptured,
    RunningChallenges,
    CollectingLivenessFrames,
    Submitting,
    Success,
    Error,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Success | SessionState::Cancelled)
    }
}

/// Per-session capture record. Mutated only by [`CaptureOrchestrator`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSession {
    pub session_id: String,
    pub job_id: String,
    pub user_id: String,
    pub selfie: Option<ArtifactRef>,
    pub liveness: Vec<ArtifactRef>,
    /// Liveness captures attempted with no usable frame.
    pub missing_liveness: usize,
    pub state: SessionState,
    pub failure_reason: Option<FailureReason>,
}

impl CaptureSession {
    fn new(user_id: Option<&str>) -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let job_id = format!("job-{}", uuid::Uuid::new_v4().simple());
        let user_id = user_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("user-{}", uuid::Uuid::new_v4().simple()));
        Self {
            session_id,
            job_id,
            user_id,
            selfie: None,
            liveness: Vec::new(),
            missing_liveness: 0,
            state: SessionState::Idle,
            failure_reason: None,
        }
    }
}

/// Delivered once on successful handoff.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub job_id: String,
    pub selfie_path: PathBuf,
    pub liveness_paths: Vec<PathBuf>,
    /// `None` when the job was queued offline.
    pub api_response: Option<ApiResponse>,
    pub queued_offline: bool,
    pub failure_reason: Option<FailureReason>,
}

#[derive(Debug)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// The prompt changed. `None` clears it.
    Instruction(Option<Instruction>),
    /// The detector found no usable face. Capture carries on with the next
    /// frame; emitted alongside the matching instruction change.
    DetectionFailed(CaptureError),
    TaskStarted(LivenessTask),
    TaskProgress {
        task: LivenessTask,
        progress: f32,
    },
    TaskCompleted(LivenessTask),
    SelfieCaptured(ArtifactRef),
    LivenessCaptured {
        index: usize,
        artifact: ArtifactRef,
    },
    LivenessMissing {
        index: usize,
    },
    /// Submission failed; artifacts are kept and a retry is possible.
    SubmissionFailed {
        message: String,
        retryable: bool,
    },
    /// Terminal outcome. Emitted exactly once per session.
    Finished(Result<CaptureResult, SelfieError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Start the periodic liveness tick.
    StartTicker(Duration),
    StopTicker,
    /// Fire `on_settle_elapsed` once after the delay.
    ScheduleSettle(Duration),
    /// Invalidate every timer of the session.
    CancelAll,
}

#[derive(Debug)]
pub enum Effect {
    Emit(SessionEvent),
    Timer(TimerCommand),
    Submit(SubmissionRequest),
    /// Abort the in-flight submission, if any, and wait for it to stop.
    AbortSubmission,
    /// Remove the job from disk. Follows any `AbortSubmission` it pairs with.
    DeleteJob(String),
}

pub struct CaptureOrchestrator {
    config: CaptureConfig,
    store: ArtifactStore,
    validator: FaceValidator,
    fixed_sequence: Option<ChallengeSequence>,
    engine: ChallengeEngine,
    session: CaptureSession,
    latest_frame: Option<FrameSample>,
    /// Liveness frames owed by each task, indexed like the sequence.
    quotas: Vec<usize>,
    captured_per_task: Vec<usize>,
    last_instruction: Option<Option<Instruction>>,
    last_error: Option<SelfieError>,
    submission_ready: bool,
    finished: bool,
}

impl CaptureOrchestrator {
    /// New session with a freshly shuffled challenge order.
    pub fn new(config: CaptureConfig, store: ArtifactStore) -> Result<Self, SelfieError> {
        Self::build(config, store, None)
    }

    /// New session with a caller-chosen challenge order, kept across resets.
    pub fn with_sequence(
        config: CaptureConfig,
        store: ArtifactStore,
        sequence: ChallengeSequence,
    ) -> Result<Self, SelfieError> {
        Self::build(config, store, Some(sequence))
    }

    fn build(
        config: CaptureConfig,
        store: ArtifactStore,
        fixed_sequence: Option<ChallengeSequence>,
    ) -> Result<Self, SelfieError> {
        config.validate()?;
        let sequence = fixed_sequence.clone().unwrap_or_else(ChallengeSequence::random);
        if config.liveness_frames < sequence.len() {
            return Err(ConfigError::Invalid(format!(
                "{} liveness frames cannot cover {} tasks",
                config.liveness_frames,
                sequence.len()
            ))
            .into());
        }
        let engine = ChallengeEngine::new(
            sequence,
            config.challenge,
            config.task_timeout_ticks(),
        )
        .map_err(ConfigError::from)?;
        let quotas = split_quota(config.liveness_frames, engine.sequence().len());
        let session = CaptureSession::new(config.user_id.as_deref());
        let validator = FaceValidator::new(config.validator.clone(), LayoutFrame::default());

        Ok(Self {
            captured_per_task: vec![0; quotas.len()],
            quotas,
            config,
            store,
            validator,
            fixed_sequence,
            engine,
            session,
            latest_frame: None,
            last_instruction: None,
            last_error: None,
            submission_ready: false,
            finished: false,
        })
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn engine(&self) -> &ChallengeEngine {
        &self.engine
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn set_layout_frame(&mut self, layout: LayoutFrame) {
        self.validator.set_layout_frame(layout);
    }

    /// `Idle → AwaitingValidFace`.
    pub fn start(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.session.state == SessionState::Idle {
            tracing::info!(
                job_id = %self.session.job_id,
                sequence = ?self.engine.sequence().tasks(),
                "capture session started"
            );
            self.transition(SessionState::AwaitingValidFace, &mut fx);
        }
        fx
    }

    /// A frame arrived while the device is not upright. Analysis is skipped.
    pub fn on_misoriented(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.is_capturing() {
            self.set_instruction(Some(Instruction::ReorientDevice), &mut fx);
        }
        fx
    }

    /// Feed one analyzed frame.
    pub fn on_analyzed(&mut self, frame: FrameSample, analysis: &FrameAnalysis) -> Vec<Effect> {
        if !frame.orientation.is_portrait() {
            return self.on_misoriented();
        }
        let mut fx = Vec::new();
        match self.session.state {
            SessionState::AwaitingValidFace => {
                self.latest_frame = Some(frame.clone());
                let result = self.validate(analysis, None);
                self.emit_instruction(result.instruction, analysis, &mut fx);
                if result.is_valid {
                    self.capture_selfie(&frame, &mut fx);
                }
            }
            SessionState::RunningChallenges => {
                self.latest_frame = Some(frame);
                let result = self.validate(analysis, self.engine.current_task());
                self.emit_instruction(result.instruction, analysis, &mut fx);
                if let (Ok(geometry), BoundsState::Ok) = (&analysis.detection, result.bounds_state) {
                    let events = self.engine.process_pose(geometry.yaw, geometry.pitch);
                    self.handle_challenge_events(events, &mut fx);
                }
            }
            _ => {}
        }
        fx
    }

    /// One liveness timer tick.
    pub fn on_tick(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.session.state == SessionState::RunningChallenges {
            let events = self.engine.tick();
            self.handle_challenge_events(events, &mut fx);
        }
        fx
    }

    /// The post-challenge settle delay elapsed.
    pub fn on_settle_elapsed(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.session.state == SessionState::CollectingLivenessFrames {
            self.begin_submission(&mut fx);
        }
        fx
    }

    pub fn on_submission_result(
        &mut self,
        result: Result<SubmissionOutcome, SubmissionError>,
    ) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.session.state != SessionState::Submitting {
            tracing::debug!(state = ?self.session.state, "ignoring stale submission result");
            return fx;
        }

        match result {
            Ok(outcome) => {
                let artifacts = outcome.artifacts().clone();
                self.session.selfie = Some(artifacts.selfie.clone());
                self.session.liveness = artifacts.liveness.clone();
                self.latest_frame = None;

                let (api_response, queued_offline) = match outcome {
                    SubmissionOutcome::Submitted { response, .. } => (Some(response), false),
                    SubmissionOutcome::QueuedOffline { .. } => (None, true),
                };
                let result = CaptureResult {
                    job_id: self.session.job_id.clone(),
                    selfie_path: self.store.resolve(&artifacts.selfie),
                    liveness_paths: artifacts
                        .liveness
                        .iter()
                        .map(|a| self.store.resolve(a))
                        .collect(),
                    api_response,
                    queued_offline,
                    failure_reason: self.session.failure_reason,
                };
                self.transition(SessionState::Success, &mut fx);
                self.finish(Ok(result), &mut fx);
            }
            Err(error) => {
                let retryable = error.is_retryable();
                let message = error.to_string();
                tracing::warn!(job_id = %self.session.job_id, %message, retryable, "submission failed; artifacts kept");
                self.last_error = Some(error.into());
                self.transition(SessionState::Error, &mut fx);
                fx.push(Effect::Emit(SessionEvent::SubmissionFailed { message, retryable }));
            }
        }
        fx
    }

    /// `Error → Submitting` without recapturing.
    pub fn retry_submission(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.session.state == SessionState::Error && self.submission_ready && !self.finished {
            tracing::info!(job_id = %self.session.job_id, "retrying submission");
            self.last_error = None;
            self.begin_submission(&mut fx);
        }
        fx
    }

    /// Give up after a submission failure and deliver the error.
    pub fn dismiss(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.session.state == SessionState::Error && !self.finished {
            let error = self
                .last_error
                .take()
                .unwrap_or_else(|| SelfieError::Unknown("submission failed".to_string()));
            self.finish(Err(error), &mut fx);
        }
        fx
    }

    /// Abandon the session and delete its artifacts.
    pub fn cancel(&mut self) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.session.state.is_terminal() || self.finished {
            return fx;
        }
        fx.push(Effect::Timer(TimerCommand::CancelAll));
        if self.session.state == SessionState::Submitting {
            fx.push(Effect::AbortSubmission);
        }
        fx.push(Effect::DeleteJob(self.session.job_id.clone()));
        self.latest_frame = None;
        self.session.selfie = None;
        self.session.liveness.clear();
        self.engine.reset();
        tracing::info!(job_id = %self.session.job_id, "capture session cancelled");
        self.transition(SessionState::Cancelled, &mut fx);
        self.finish(Err(SelfieError::Cancelled), &mut fx);
        fx
    }

    /// Start over with a new job id and challenge order. An unfinished
    /// session is cancelled first.
    pub fn reset(&mut self) -> Vec<Effect> {
        let mut fx = self.cancel();
        fx.push(Effect::Timer(TimerCommand::CancelAll));

        let sequence = self
            .fixed_sequence
            .clone()
            .unwrap_or_else(ChallengeSequence::random);
        match ChallengeEngine::new(
            sequence,
            self.config.challenge,
            self.config.task_timeout_ticks(),
        ) {
            Ok(engine) => self.engine = engine,
            // Thresholds were validated at construction; keep the old order.
            Err(_) => self.engine.reset(),
        }
        self.quotas = split_quota(self.config.liveness_frames, self.engine.sequence().len());
        self.captured_per_task = vec![0; self.quotas.len()];

        let from = self.session.state;
        self.session = CaptureSession::new(self.config.user_id.as_deref());
        self.latest_frame = None;
        self.last_instruction = None;
        self.last_error = None;
        self.submission_ready = false;
        self.finished = false;
        tracing::info!(job_id = %self.session.job_id, "capture session reset");
        fx.push(Effect::Emit(SessionEvent::StateChanged {
            from,
            to: SessionState::Idle,
        }));
        fx
    }

    fn is_capturing(&self) -> bool {
        matches!(
            self.session.state,
            SessionState::AwaitingValidFace | SessionState::RunningChallenges
        )
    }

    fn validate(&self, analysis: &FrameAnalysis, task: Option<LivenessTask>) -> ValidationResult {
        match &analysis.detection {
            Ok(geometry) => {
                let quality = match &analysis.quality {
                    Ok(score) => *score,
                    Err(e) => {
                        tracing::debug!(error = %e, "quality classifier failed; treating frame as low quality");
                        0.0
                    }
                };
                self.validator
                    .validate(geometry, quality, geometry.brightness, task)
            }
            Err(e) => {
                tracing::debug!(error = %e, "no usable face in frame");
                self.validator.validate_failure(e)
            }
        }
    }

    fn capture_selfie(&mut self, frame: &FrameSample, fx: &mut Vec<Effect>) {
        let saved = encode_jpeg(&frame.image, self.config.selfie_max_dim, self.config.jpeg_quality)
            .and_then(|bytes| {
                self.store
                    .save(&self.session.job_id, ArtifactKind::Selfie, &bytes)
            });
        let artifact = match saved {
            Ok(artifact) => artifact,
            Err(e) => return self.fail_capture(e, fx),
        };

        tracing::info!(job_id = %self.session.job_id, file = %artifact.file_name, "selfie captured");
        self.session.selfie = Some(artifact.clone());
        fx.push(Effect::Emit(SessionEvent::SelfieCaptured(artifact)));
        self.transition(SessionState::SelfieCaptured, fx);

        match self.engine.initiate() {
            Ok(events) => {
                self.transition(SessionState::RunningChallenges, fx);
                fx.push(Effect::Timer(TimerCommand::StartTicker(
                    self.config.tick_interval(),
                )));
                self.handle_challenge_events(events, fx);
            }
            Err(e) => {
                tracing::error!(error = %e, "liveness challenge could not start");
                self.last_error = Some(SelfieError::Unknown(e.to_string()));
                self.transition(SessionState::Error, fx);
                self.finish(Err(SelfieError::Unknown(e.to_string())), fx);
            }
        }
    }

    fn fail_capture(&mut self, error: ArtifactError, fx: &mut Vec<Effect>) {
        tracing::error!(job_id = %self.session.job_id, error = %error, "selfie capture failed");
        fx.push(Effect::Timer(TimerCommand::CancelAll));
        self.transition(SessionState::Error, fx);
        self.finish(Err(error.into()), fx);
    }

    fn handle_challenge_events(&mut self, events: Vec<ChallengeEvent>, fx: &mut Vec<Effect>) {
        for event in events {
            match event {
                ChallengeEvent::TaskStarted { task, .. } => {
                    fx.push(Effect::Emit(SessionEvent::TaskStarted(task)));
                    self.set_instruction(Some(task.instruction()), fx);
                }
                ChallengeEvent::Progress { task, progress } => {
                    fx.push(Effect::Emit(SessionEvent::TaskProgress { task, progress }));
                    if let Some(index) = self.task_index(task) {
                        let quota = self.quotas[index];
                        // The last frame of each quota is taken on completion.
                        while self.captured_per_task[index] + 1 < quota
                            && progress
                                >= (self.captured_per_task[index] + 1) as f32 / quota as f32
                        {
                            self.captured_per_task[index] += 1;
                            self.capture_liveness(fx);
                        }
                    }
                }
                ChallengeEvent::TaskCompleted { index, task } => {
                    fx.push(Effect::Emit(SessionEvent::TaskCompleted(task)));
                    self.captured_per_task[index] += 1;
                    self.capture_liveness(fx);
                }
                ChallengeEvent::ChallengeCompleted => {
                    fx.push(Effect::Timer(TimerCommand::StopTicker));
                    self.transition(SessionState::CollectingLivenessFrames, fx);
                    fx.push(Effect::Timer(TimerCommand::ScheduleSettle(
                        self.config.settle_delay(),
                    )));
                }
                ChallengeEvent::TimedOut { task } => {
                    fx.push(Effect::Timer(TimerCommand::CancelAll));
                    if !self.config.allow_partial_on_timeout {
                        tracing::warn!(job_id = %self.session.job_id, %task, "liveness timed out; partial submission disabled");
                        if let Err(e) = self.store.delete(&self.session.job_id) {
                            tracing::warn!(job_id = %self.session.job_id, error = %e, "failed to delete timed out job");
                        }
                        self.latest_frame = None;
                        self.transition(SessionState::Error, fx);
                        self.finish(Err(CaptureError::Timeout.into()), fx);
                        return;
                    }
                    self.session.failure_reason = Some(FailureReason::ActiveLivenessTimedOut);
                    self.transition(SessionState::CollectingLivenessFrames, fx);

                    let owed = self
                        .config
                        .liveness_frames
                        .saturating_sub(self.session.liveness.len());
                    tracing::warn!(
                        job_id = %self.session.job_id,
                        %task,
                        backfill = owed,
                        "liveness timed out; backfilling from last frame"
                    );
                    for _ in 0..owed {
                        self.capture_liveness(fx);
                    }
                    self.begin_submission(fx);
                }
            }
        }
    }

    fn task_index(&self, task: LivenessTask) -> Option<usize> {
        self.engine.sequence().tasks().iter().position(|t| *t == task)
    }

    /// Persist the latest frame as the next liveness artifact.
    fn capture_liveness(&mut self, fx: &mut Vec<Effect>) {
        let index = self.session.liveness.len() + self.session.missing_liveness;
        if self.session.liveness.len() >= self.config.liveness_frames {
            return;
        }
        let Some(frame) = self.latest_frame.clone() else {
            tracing::warn!(job_id = %self.session.job_id, index, "no frame available for liveness capture");
            self.session.missing_liveness += 1;
            fx.push(Effect::Emit(SessionEvent::LivenessMissing { index }));
            return;
        };

        let saved = encode_jpeg(&frame.image, self.config.liveness_max_dim, self.config.jpeg_quality)
            .and_then(|bytes| {
                self.store
                    .save(&self.session.job_id, ArtifactKind::Liveness, &bytes)
            });
        match saved {
            Ok(artifact) => {
                tracing::debug!(job_id = %self.session.job_id, index, file = %artifact.file_name, "liveness frame captured");
                self.session.liveness.push(artifact.clone());
                fx.push(Effect::Emit(SessionEvent::LivenessCaptured { index, artifact }));
            }
            Err(e) => {
                tracing::warn!(job_id = %self.session.job_id, index, error = %e, "liveness capture failed");
                self.session.missing_liveness += 1;
                fx.push(Effect::Emit(SessionEvent::LivenessMissing { index }));
            }
        }
    }

    fn begin_submission(&mut self, fx: &mut Vec<Effect>) {
        self.submission_ready = true;
        self.transition(SessionState::Submitting, fx);
        fx.push(Effect::Submit(SubmissionRequest {
            job_id: self.session.job_id.clone(),
            user_id: self.session.user_id.clone(),
            failure_reason: self.session.failure_reason,
            expected_liveness: self.config.liveness_frames,
            missing_liveness: self.session.missing_liveness,
        }));
    }

    /// Returns whether the prompt changed.
    fn set_instruction(&mut self, instruction: Option<Instruction>, fx: &mut Vec<Effect>) -> bool {
        if self.last_instruction == Some(instruction) {
            return false;
        }
        self.last_instruction = Some(instruction);
        fx.push(Effect::Emit(SessionEvent::Instruction(instruction)));
        true
    }

    fn emit_instruction(
        &mut self,
        instruction: Option<Instruction>,
        analysis: &FrameAnalysis,
        fx: &mut Vec<Effect>,
    ) {
        if self.set_instruction(instruction, fx) {
            if let Err(e) = &analysis.detection {
                fx.push(Effect::Emit(SessionEvent::DetectionFailed(CaptureError::from(e))));
            }
        }
    }

    fn transition(&mut self, to: SessionState, fx: &mut Vec<Effect>) {
        let from = self.session.state;
        if from == to {
            return;
        }
        self.session.state = to;
        tracing::info!(job_id = %self.session.job_id, ?from, ?to, "session state changed");
        fx.push(Effect::Emit(SessionEvent::StateChanged { from, to }));
    }

    /// Deliver the terminal outcome. Callers transition first.
    fn finish(&mut self, result: Result<CaptureResult, SelfieError>, fx: &mut Vec<Effect>) {
        if self.finished {
            return;
        }
        self.finished = true;
        fx.push(Effect::Emit(SessionEvent::Finished(result)));
    }
}

/// Split `frames` across `tasks` as evenly as possible, earlier tasks first.
fn split_quota(frames: usize, tasks: usize) -> Vec<usize> {
    if tasks == 0 {
        return Vec::new();
    }
    let base = frames / tasks;
    let rem = frames % tasks;
    (0..tasks).map(|i| base + usize::from(i < rem)).collect()
}
