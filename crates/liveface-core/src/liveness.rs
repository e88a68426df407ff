//! Active liveness via head-pose challenges.
//!
//! The subject is asked to turn their head in a randomized order of
//! directions. Each task's progress is derived from the continuous pose angle
//! reported by the detector; a task completes once the head has turned far
//! enough in the requested direction, and the challenge completes once every
//! task in the sequence has.
//!
//! The engine is a plain state machine. It owns no timer: the caller drives
//! the per-task timeout with [`ChallengeEngine::tick`], and every transition
//! is reported as a [`ChallengeEvent`] in the return value.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and static screens (no pose change),
//!   replayed clips that do not follow the randomized order.
//! - **Does not block:** Live puppeteering of a 3D mask, or a real-time deepfake
//!   that reacts to the prompts.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LivenessTask;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChallengeError {
    #[error("challenge sequence is empty")]
    EmptySequence,
    #[error("task {0} appears more than once in the challenge sequence")]
    DuplicateTask(LivenessTask),
    #[error("invalid angle thresholds: min {min} must be below max {max}")]
    InvalidThresholds { min: f32, max: f32 },
    #[error("challenge already initiated")]
    AlreadyStarted,
}

/// Angle window (radians) mapped onto task progress 0..1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeThresholds {
    /// Below this the head is considered not turned at all.
    pub min_angle: f32,
    /// At or beyond this the task is complete.
    pub max_angle: f32,
}

impl Default for ChallengeThresholds {
    fn default() -> Self {
        Self {
            min_angle: 0.15,
            max_angle: 0.3,
        }
    }
}

impl ChallengeThresholds {
    pub fn validate(&self) -> Result<(), ChallengeError> {
        if !(self.min_angle < self.max_angle) || !self.min_angle.is_finite() {
            return Err(ChallengeError::InvalidThresholds {
                min: self.min_angle,
                max: self.max_angle,
            });
        }
        Ok(())
    }

    /// Progress for a directed angle, clamped to 0..1.
    pub fn progress_for(&self, directed_angle: f32) -> f32 {
        let span = self.max_angle - self.min_angle;
        ((directed_angle - self.min_angle) / span).clamp(0.0, 1.0)
    }
}

/// Order in which tasks are presented. Generated once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSequence(Vec<LivenessTask>);

impl ChallengeSequence {
    /// A random permutation of every task.
    pub fn shuffled<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut tasks = LivenessTask::ALL.to_vec();
        tasks.shuffle(rng);
        Self(tasks)
    }

    pub fn random() -> Self {
        Self::shuffled(&mut rand::thread_rng())
    }

    /// A caller-chosen order. Tasks must be distinct.
    pub fn fixed(tasks: Vec<LivenessTask>) -> Result<Self, ChallengeError> {
        if tasks.is_empty() {
            return Err(ChallengeError::EmptySequence);
        }
        for (i, task) in tasks.iter().enumerate() {
            if tasks[..i].contains(task) {
                return Err(ChallengeError::DuplicateTask(*task));
            }
        }
        Ok(Self(tasks))
    }

    pub fn tasks(&self) -> &[LivenessTask] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChallengeState {
    NotStarted,
    Active { index: usize, task: LivenessTask },
    Completed,
    TimedOut { task: LivenessTask },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChallengeEvent {
    TaskStarted { index: usize, task: LivenessTask },
    Progress { task: LivenessTask, progress: f32 },
    TaskCompleted { index: usize, task: LivenessTask },
    ChallengeCompleted,
    TimedOut { task: LivenessTask },
}

/// Sequences pose tasks and tracks their progress.
#[derive(Debug, Clone)]
pub struct ChallengeEngine {
    sequence: ChallengeSequence,
    thresholds: ChallengeThresholds,
    timeout_ticks: u32,
    ticks_remaining: u32,
    progress: Vec<f32>,
    state: ChallengeState,
}

impl ChallengeEngine {
    /// `timeout_ticks` is the per-task budget in timer ticks.
    pub fn new(
        sequence: ChallengeSequence,
        thresholds: ChallengeThresholds,
        timeout_ticks: u32,
    ) -> Result<Self, ChallengeError> {
        thresholds.validate()?;
        let progress = vec![0.0; sequence.len()];
        Ok(Self {
            sequence,
            thresholds,
            timeout_ticks: timeout_ticks.max(1),
            ticks_remaining: timeout_ticks.max(1),
            progress,
            state: ChallengeState::NotStarted,
        })
    }

    pub fn state(&self) -> ChallengeState {
        self.state
    }

    pub fn sequence(&self) -> &ChallengeSequence {
        &self.sequence
    }

    pub fn current_task(&self) -> Option<LivenessTask> {
        match self.state {
            ChallengeState::Active { task, .. } => Some(task),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ChallengeState::Active { .. })
    }

    /// Recorded progress of a task, or `None` if it is not in the sequence.
    pub fn progress_of(&self, task: LivenessTask) -> Option<f32> {
        let index = self.sequence.tasks().iter().position(|t| *t == task)?;
        Some(self.progress[index])
    }

    pub fn ticks_remaining(&self) -> u32 {
        self.ticks_remaining
    }

    /// Start the first task and its timeout budget.
    pub fn initiate(&mut self) -> Result<Vec<ChallengeEvent>, ChallengeError> {
        if self.state != ChallengeState::NotStarted {
            return Err(ChallengeError::AlreadyStarted);
        }
        let task = self.sequence.tasks()[0];
        self.state = ChallengeState::Active { index: 0, task };
        self.ticks_remaining = self.timeout_ticks;
        tracing::debug!(%task, sequence = ?self.sequence.tasks(), "challenge initiated");
        Ok(vec![ChallengeEvent::TaskStarted { index: 0, task }])
    }

    /// Feed one head pose. Ignored unless a task is active.
    pub fn process_pose(&mut self, yaw: f32, pitch: f32) -> Vec<ChallengeEvent> {
        let ChallengeState::Active { index, task } = self.state else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let candidate = self
            .thresholds
            .progress_for(task.directed_angle(yaw, pitch));
        if candidate <= self.progress[index] {
            return events;
        }
        self.progress[index] = candidate;
        events.push(ChallengeEvent::Progress {
            task,
            progress: candidate,
        });

        if candidate >= 1.0 {
            events.push(ChallengeEvent::TaskCompleted { index, task });
            tracing::info!(%task, index, "liveness task completed");

            let next = index + 1;
            if let Some(&next_task) = self.sequence.tasks().get(next) {
                self.state = ChallengeState::Active {
                    index: next,
                    task: next_task,
                };
                self.ticks_remaining = self.timeout_ticks;
                events.push(ChallengeEvent::TaskStarted {
                    index: next,
                    task: next_task,
                });
            } else {
                self.state = ChallengeState::Completed;
                events.push(ChallengeEvent::ChallengeCompleted);
                tracing::info!("liveness challenge completed");
            }
        }

        events
    }

    /// Advance the active task's timeout clock by one tick.
    pub fn tick(&mut self) -> Vec<ChallengeEvent> {
        let ChallengeState::Active { task, .. } = self.state else {
            return Vec::new();
        };
        self.ticks_remaining = self.ticks_remaining.saturating_sub(1);
        if self.ticks_remaining > 0 {
            return Vec::new();
        }
        self.state = ChallengeState::TimedOut { task };
        tracing::warn!(%task, "liveness task timed out");
        vec![ChallengeEvent::TimedOut { task }]
    }

    /// Clear all progress and return to `NotStarted`. The sequence is kept.
    pub fn reset(&mut self) {
        self.progress.iter_mut().for_each(|p| *p = 0.0);
        self.ticks_remaining = self.timeout_ticks;
        self.state = ChallengeState::NotStarted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn engine(tasks: Vec<LivenessTask>, timeout_ticks: u32) -> ChallengeEngine {
        let seq = ChallengeSequence::fixed(tasks).unwrap();
        ChallengeEngine::new(seq, ChallengeThresholds::default(), timeout_ticks).unwrap()
    }

    fn default_order() -> Vec<LivenessTask> {
        vec![
            LivenessTask::LookLeft,
            LivenessTask::LookRight,
            LivenessTask::LookUp,
        ]
    }

    fn completions(events: &[ChallengeEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ChallengeEvent::TaskCompleted { .. }))
            .count()
    }

    #[test]
    fn test_full_sequence_emits_three_completions_then_one_challenge_completion() {
        let mut e = engine(default_order(), 120);
        let mut events = e.initiate().unwrap();
        events.extend(e.process_pose(-0.35, 0.0));
        events.extend(e.process_pose(0.35, 0.0));
        events.extend(e.process_pose(0.0, -0.35));
        // Further poses after completion are ignored.
        events.extend(e.process_pose(-0.35, -0.35));

        let completed: Vec<LivenessTask> = events
            .iter()
            .filter_map(|e| match e {
                ChallengeEvent::TaskCompleted { task, .. } => Some(*task),
                _ => None,
            })
            .collect();
        assert_eq!(completed, default_order());
        let finals = events
            .iter()
            .filter(|e| matches!(e, ChallengeEvent::ChallengeCompleted))
            .count();
        assert_eq!(finals, 1);
        assert_eq!(events.last(), Some(&ChallengeEvent::ChallengeCompleted));
        assert_eq!(e.state(), ChallengeState::Completed);
    }

    #[test]
    fn test_completed_task_is_not_re_emitted() {
        let mut e = engine(default_order(), 120);
        e.initiate().unwrap();
        let first = e.process_pose(-0.35, 0.0);
        assert_eq!(completions(&first), 1);
        // LookRight is now active; looking left again does nothing.
        let again = e.process_pose(-0.5, 0.0);
        assert!(again.is_empty());
        assert_eq!(e.current_task(), Some(LivenessTask::LookRight));
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut e = engine(default_order(), 120);
        e.initiate().unwrap();
        e.process_pose(-0.25, 0.0);
        let high = e.progress_of(LivenessTask::LookLeft).unwrap();
        assert!((high - (0.10 / 0.15)).abs() < 1e-5);

        let events = e.process_pose(-0.18, 0.0);
        assert!(events.is_empty());
        assert_eq!(e.progress_of(LivenessTask::LookLeft), Some(high));

        e.process_pose(0.2, 0.0);
        assert_eq!(e.progress_of(LivenessTask::LookLeft), Some(high));
    }

    #[test]
    fn test_wrong_direction_makes_no_progress() {
        let mut e = engine(default_order(), 120);
        e.initiate().unwrap();
        assert!(e.process_pose(0.35, 0.0).is_empty());
        assert!(e.process_pose(0.0, 0.35).is_empty());
        assert_eq!(e.progress_of(LivenessTask::LookLeft), Some(0.0));
    }

    #[test]
    fn test_below_min_angle_makes_no_progress() {
        let mut e = engine(default_order(), 120);
        e.initiate().unwrap();
        assert!(e.process_pose(-0.14, 0.0).is_empty());
    }

    #[test]
    fn test_pose_ignored_before_initiate() {
        let mut e = engine(default_order(), 120);
        assert!(e.process_pose(-0.35, 0.0).is_empty());
        assert!(e.tick().is_empty());
        assert_eq!(e.state(), ChallengeState::NotStarted);
    }

    #[test]
    fn test_initiate_twice_fails() {
        let mut e = engine(default_order(), 120);
        e.initiate().unwrap();
        assert_eq!(e.initiate(), Err(ChallengeError::AlreadyStarted));
    }

    #[test]
    fn test_timeout_after_budget() {
        let mut e = engine(default_order(), 3);
        e.initiate().unwrap();
        assert!(e.tick().is_empty());
        assert!(e.tick().is_empty());
        assert_eq!(
            e.tick(),
            vec![ChallengeEvent::TimedOut {
                task: LivenessTask::LookLeft
            }]
        );
        assert_eq!(
            e.state(),
            ChallengeState::TimedOut {
                task: LivenessTask::LookLeft
            }
        );
        // Terminal: nothing more happens.
        assert!(e.tick().is_empty());
        assert!(e.process_pose(-0.35, 0.0).is_empty());
    }

    #[test]
    fn test_task_completion_resets_timer() {
        let mut e = engine(default_order(), 3);
        e.initiate().unwrap();
        e.tick();
        e.tick();
        e.process_pose(-0.35, 0.0);
        assert_eq!(e.ticks_remaining(), 3);
        assert!(e.tick().is_empty());
        assert!(e.tick().is_empty());
        assert_eq!(e.tick().len(), 1);
    }

    #[test]
    fn test_reset_clears_progress_and_keeps_order() {
        let mut e = engine(
            vec![LivenessTask::LookUp, LivenessTask::LookLeft],
            120,
        );
        e.initiate().unwrap();
        e.process_pose(0.0, -0.35);
        e.reset();
        assert_eq!(e.state(), ChallengeState::NotStarted);
        assert_eq!(e.progress_of(LivenessTask::LookUp), Some(0.0));
        assert_eq!(
            e.sequence().tasks(),
            &[LivenessTask::LookUp, LivenessTask::LookLeft]
        );
        assert!(e.initiate().is_ok());
    }

    #[test]
    fn test_shuffled_sequence_is_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let seq = ChallengeSequence::shuffled(&mut rng);
            let mut tasks = seq.tasks().to_vec();
            assert_eq!(tasks.len(), 3);
            tasks.sort_by_key(|t| *t as u8);
            assert_eq!(tasks, LivenessTask::ALL.to_vec());
        }
    }

    #[test]
    fn test_fixed_sequence_rejects_duplicates_and_empty() {
        assert_eq!(
            ChallengeSequence::fixed(vec![]),
            Err(ChallengeError::EmptySequence)
        );
        assert_eq!(
            ChallengeSequence::fixed(vec![LivenessTask::LookUp, LivenessTask::LookUp]),
            Err(ChallengeError::DuplicateTask(LivenessTask::LookUp))
        );
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let seq = ChallengeSequence::fixed(default_order()).unwrap();
        let bad = ChallengeThresholds {
            min_angle: 0.3,
            max_angle: 0.3,
        };
        assert!(matches!(
            ChallengeEngine::new(seq, bad, 10),
            Err(ChallengeError::InvalidThresholds { .. })
        ));
    }
}
