//! Session timers.
//!
//! Each timer is a spawned task that posts a [`TimerFired`] message tagged
//! with a generation number. Restarting or cancelling a timer bumps the
//! generation, so a message already in the channel from an old timer is
//! recognised as stale and dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::session::TimerCommand;

/// A spawned task that is aborted when dropped.
pub(crate) struct ScheduledTask(JoinHandle<()>);

impl ScheduledTask {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    /// Abort the task and wait until it has stopped running.
    pub(crate) async fn abort_and_wait(mut self) {
        self.0.abort();
        let _ = (&mut self.0).await;
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerFired {
    Tick(u64),
    Settle(u64),
}

pub(crate) struct SessionTimers {
    tx: mpsc::UnboundedSender<TimerFired>,
    generation: u64,
    ticker: Option<(u64, ScheduledTask)>,
    settle: Option<(u64, ScheduledTask)>,
}

impl SessionTimers {
    pub(crate) fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            generation: 0,
            ticker: None,
            settle: None,
        }
    }

    pub(crate) fn apply(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::StartTicker(period) => self.start_ticker(period),
            TimerCommand::StopTicker => self.ticker = None,
            TimerCommand::ScheduleSettle(delay) => self.schedule_settle(delay),
            TimerCommand::CancelAll => self.cancel_all(),
        }
    }

    /// Whether a fired message belongs to a timer that is still armed.
    pub(crate) fn is_current(&self, fired: TimerFired) -> bool {
        match fired {
            TimerFired::Tick(gen) => matches!(&self.ticker, Some((g, _)) if *g == gen),
            TimerFired::Settle(gen) => matches!(&self.settle, Some((g, _)) if *g == gen),
        }
    }

    /// Settle timers are one-shot; forget one once its message is consumed.
    pub(crate) fn settle_consumed(&mut self) {
        self.settle = None;
    }

    pub(crate) fn cancel_all(&mut self) {
        self.generation += 1;
        self.ticker = None;
        self.settle = None;
    }

    fn start_ticker(&mut self, period: Duration) {
        self.generation += 1;
        let gen = self.generation;
        let tx = self.tx.clone();
        let task = ScheduledTask::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(TimerFired::Tick(gen)).is_err() {
                    break;
                }
            }
        });
        tracing::trace!(gen, ?period, "ticker started");
        self.ticker = Some((gen, task));
    }

    fn schedule_settle(&mut self, delay: Duration) {
        self.generation += 1;
        let gen = self.generation;
        let tx = self.tx.clone();
        let task = ScheduledTask::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired::Settle(gen));
        });
        self.settle = Some((gen, task));
    }
}
