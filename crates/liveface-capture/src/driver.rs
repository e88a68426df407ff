//! Runtime for a capture session.
//!
//! Three execution contexts cooperate:
//!
//! - the **analysis thread**, a dedicated OS thread that runs the face
//!   geometry provider and quality classifier on the newest frame only;
//! - the **owner task**, a tokio task that owns the [`CaptureOrchestrator`]
//!   and is the only place session state is touched;
//! - **submission tasks**, spawned per attempt and aborted on cancel.
//!
//! Frames are pushed into a one-slot mailbox. A frame that arrives while the
//! previous one is still waiting replaces it, so analysis never falls behind
//! the camera.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};

use liveface_core::{
    ChallengeSequence, FaceGeometryProvider, FrameAnalysis, FrameSample, LayoutFrame,
    QualityClassifier,
};

use crate::api::SelfieApi;
use crate::config::CaptureConfig;
use crate::error::{SelfieError, SubmissionError};
use crate::session::{CaptureOrchestrator, CaptureSession, Effect, SessionEvent};
use crate::store::ArtifactStore;
use crate::submission::{SubmissionManager, SubmissionOutcome};
use crate::timer::{ScheduledTask, SessionTimers, TimerFired};

/// Commands sent from [`SessionHandle`] to the owner task.
enum Command {
    Start,
    Cancel,
    Retry,
    Dismiss,
    Reset,
    SetLayout(LayoutFrame),
    Snapshot(oneshot::Sender<CaptureSession>),
}

/// Results posted back to the owner task by workers.
enum Internal {
    Analyzed(FrameSample, FrameAnalysis),
    Misoriented,
    Submitted(u64, Result<SubmissionOutcome, SubmissionError>),
}

#[derive(Default)]
struct SlotState {
    frame: Option<FrameSample>,
    closed: bool,
    replaced: u64,
}

/// Latest-only frame mailbox between the camera and the analysis thread.
#[derive(Default)]
struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` once the slot is closed.
    fn put(&self, frame: FrameSample) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        if state.frame.replace(frame).is_some() {
            state.replaced += 1;
        }
        self.ready.notify_one();
        true
    }

    /// Block until a frame is available. `None` once closed.
    fn take(&self) -> Option<FrameSample> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(frame) = state.frame.take() {
                return Some(frame);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.frame = None;
        tracing::debug!(replaced = state.replaced, "frame slot closed");
        self.ready.notify_all();
    }
}

/// Clone-safe handle to a running capture session.
///
/// The session shuts down when every handle has been dropped.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
    slot: Arc<FrameSlot>,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<(), SelfieError> {
        self.tx.send(command).map_err(|_| SelfieError::Closed)
    }

    pub fn start(&self) -> Result<(), SelfieError> {
        self.send(Command::Start)
    }

    /// Hand a camera frame to the session. Never blocks; an unanalyzed
    /// older frame is discarded.
    pub fn push_frame(&self, frame: FrameSample) -> Result<(), SelfieError> {
        if self.slot.put(frame) {
            Ok(())
        } else {
            Err(SelfieError::Closed)
        }
    }

    pub fn cancel(&self) -> Result<(), SelfieError> {
        self.send(Command::Cancel)
    }

    pub fn retry_submission(&self) -> Result<(), SelfieError> {
        self.send(Command::Retry)
    }

    pub fn dismiss(&self) -> Result<(), SelfieError> {
        self.send(Command::Dismiss)
    }

    pub fn reset(&self) -> Result<(), SelfieError> {
        self.send(Command::Reset)
    }

    pub fn set_layout_frame(&self, layout: LayoutFrame) -> Result<(), SelfieError> {
        self.send(Command::SetLayout(layout))
    }

    /// Copy of the current session record.
    pub async fn snapshot(&self) -> Result<CaptureSession, SelfieError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Snapshot(reply_tx))?;
        reply_rx.await.map_err(|_| SelfieError::Closed)
    }
}

/// Spawn a capture session.
///
/// Opens the artifact store under `config.data_dir`, starts the analysis
/// thread and the owner task, and returns a handle plus the event stream.
/// Must be called from within a tokio runtime. `sequence` pins the challenge
/// order; `None` shuffles it per session.
pub fn spawn_session(
    config: CaptureConfig,
    provider: Arc<dyn FaceGeometryProvider>,
    classifier: Arc<dyn QualityClassifier>,
    api: Arc<dyn SelfieApi>,
    sequence: Option<ChallengeSequence>,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), SelfieError> {
    let store = ArtifactStore::open(&config.data_dir)?;
    let submitter = SubmissionManager::new(api, store.clone(), &config);
    let orchestrator = match sequence {
        Some(sequence) => CaptureOrchestrator::with_sequence(config, store, sequence)?,
        None => CaptureOrchestrator::new(config, store)?,
    };

    let slot = Arc::new(FrameSlot::default());
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let worker_slot = slot.clone();
    let worker_tx = internal_tx.clone();
    std::thread::Builder::new()
        .name("liveface-analysis".into())
        .spawn(move || run_analysis(&worker_slot, provider.as_ref(), classifier.as_ref(), &worker_tx))
        .map_err(|e| SelfieError::Unknown(format!("failed to spawn analysis thread: {e}")))?;

    let owner = Owner {
        orchestrator,
        submitter,
        slot: slot.clone(),
        internal_tx,
        events: event_tx,
        submission: None,
        submission_gen: 0,
    };
    tokio::spawn(owner.run(command_rx, internal_rx));

    Ok((SessionHandle { tx: command_tx, slot }, event_rx))
}

fn run_analysis(
    slot: &FrameSlot,
    provider: &dyn FaceGeometryProvider,
    classifier: &dyn QualityClassifier,
    tx: &mpsc::UnboundedSender<Internal>,
) {
    tracing::info!("analysis thread started");
    while let Some(frame) = slot.take() {
        let message = if frame.orientation.is_portrait() {
            let analysis = FrameAnalysis::run(&frame.image, provider, classifier);
            Internal::Analyzed(frame, analysis)
        } else {
            Internal::Misoriented
        };
        if tx.send(message).is_err() {
            break;
        }
    }
    tracing::info!("analysis thread exiting");
}

struct Owner {
    orchestrator: CaptureOrchestrator,
    submitter: SubmissionManager,
    slot: Arc<FrameSlot>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: mpsc::UnboundedSender<SessionEvent>,
    submission: Option<ScheduledTask>,
    /// Bumped on every attempt and abort; results from older attempts are dropped.
    submission_gen: u64,
}

impl Owner {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut timers = SessionTimers::new(timer_tx);
        tracing::debug!(job_id = %self.orchestrator.session().job_id, "session owner started");

        loop {
            let effects = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = internal.recv() => self.handle_internal(message),
                Some(fired) = timer_rx.recv() => {
                    if !timers.is_current(fired) {
                        continue;
                    }
                    match fired {
                        TimerFired::Tick(_) => self.orchestrator.on_tick(),
                        TimerFired::Settle(_) => {
                            timers.settle_consumed();
                            self.orchestrator.on_settle_elapsed()
                        }
                    }
                }
            };
            self.apply(effects, &mut timers).await;
        }

        timers.cancel_all();
        self.submission = None;
        self.slot.close();
        tracing::debug!(job_id = %self.orchestrator.session().job_id, "session owner exiting");
    }

    fn handle_command(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::Start => self.orchestrator.start(),
            Command::Cancel => self.orchestrator.cancel(),
            Command::Retry => self.orchestrator.retry_submission(),
            Command::Dismiss => self.orchestrator.dismiss(),
            Command::Reset => self.orchestrator.reset(),
            Command::SetLayout(layout) => {
                self.orchestrator.set_layout_frame(layout);
                Vec::new()
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.orchestrator.session().clone());
                Vec::new()
            }
        }
    }

    fn handle_internal(&mut self, message: Internal) -> Vec<Effect> {
        match message {
            Internal::Analyzed(frame, analysis) => self.orchestrator.on_analyzed(frame, &analysis),
            Internal::Misoriented => self.orchestrator.on_misoriented(),
            Internal::Submitted(gen, result) => {
                if gen != self.submission_gen {
                    tracing::debug!(gen, "dropping result of aborted submission");
                    return Vec::new();
                }
                self.submission = None;
                self.orchestrator.on_submission_result(result)
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>, timers: &mut SessionTimers) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => {
                    // A dropped receiver only means nobody is listening.
                    let _ = self.events.send(event);
                }
                Effect::Timer(command) => timers.apply(command),
                Effect::Submit(request) => {
                    self.submission_gen += 1;
                    let gen = self.submission_gen;
                    let submitter = self.submitter.clone();
                    let tx = self.internal_tx.clone();
                    self.submission = Some(ScheduledTask::spawn(async move {
                        let result = submitter.submit(&request).await;
                        let _ = tx.send(Internal::Submitted(gen, result));
                    }));
                }
                Effect::AbortSubmission => {
                    self.submission_gen += 1;
                    if let Some(task) = self.submission.take() {
                        task.abort_and_wait().await;
                        tracing::debug!("submission aborted");
                    }
                }
                Effect::DeleteJob(job_id) => {
                    if let Err(e) = self.submitter.store().delete(&job_id) {
                        tracing::warn!(job_id, error = %e, "failed to delete cancelled job");
                    }
                }
            }
        }
    }
}
