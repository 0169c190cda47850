//! Cooperative polling loop that drives reconciliation passes.

use std::future::Future;
use std::time::Duration;

use log::{error, info};
use tokio::time::{sleep, Instant};

use crate::audit::AuditLog;
use crate::reconcile::Reconciler;
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// One pass, then stop.
    Once,
    Every(Duration),
}

impl Cadence {
    /// Negative intervals mean "run once".
    pub fn from_minutes(minutes: f64) -> anyhow::Result<Self> {
        if !minutes.is_finite() {
            anyhow::bail!("reconciliation interval must be a finite number of minutes");
        }
        if minutes < 0.0 {
            Ok(Cadence::Once)
        } else {
            Ok(Cadence::Every(Duration::from_secs_f64(minutes * 60.0)))
        }
    }
}

pub struct Scheduler<R> {
    reconciler: Reconciler<R>,
    audit: AuditLog,
    cadence: Cadence,
    poll: Duration,
    state: SchedulerState,
    last_run: Option<Instant>,
    passes: usize,
}

impl<R: ContainerRuntime> Scheduler<R> {
    pub fn new(reconciler: Reconciler<R>, audit: AuditLog, cadence: Cadence, poll: Duration) -> Self {
        Self {
            reconciler,
            audit,
            cadence,
            poll,
            state: SchedulerState::Idle,
            last_run: None,
            passes: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Number of passes that ran to completion.
    pub fn passes(&self) -> usize {
        self.passes
    }

    fn due(&self, now: Instant) -> bool {
        match (self.cadence, self.last_run) {
            (Cadence::Once, _) | (_, None) => true,
            (Cadence::Every(interval), Some(last)) => now.duration_since(last) > interval,
        }
    }

    /// Runs until `shutdown` resolves, or after the single pass of a
    /// [`Cadence::Once`] schedule.  A pass in flight when `shutdown` fires
    /// is abandoned.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("Scheduler started ({:?}, polling every {:?})", self.cadence, self.poll);

        loop {
            let now = Instant::now();
            if self.due(now) {
                self.state = SchedulerState::Running;
                self.last_run = Some(now);
                let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

                let outcome = tokio::select! {
                    _ = &mut shutdown => {
                        info!("Interrupted during reconciliation pass");
                        break;
                    }
                    outcome = self.reconciler.run_pass() => outcome,
                };
                if outcome.is_success() {
                    info!("Reconciliation pass finished");
                } else {
                    error!("Reconciliation pass finished with errors");
                }
                if let Err(e) = self.audit.append(&outcome.audit_lines(&timestamp)).await {
                    error!("Failed to write {}: {}", self.audit.path().display(), e);
                }
                self.passes += 1;
                self.state = SchedulerState::Idle;
            }

            if self.cadence == Cadence::Once {
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Interrupted, stopping scheduler");
                    break;
                }
                _ = sleep(self.poll) => {}
            }
        }

        self.state = SchedulerState::Stopped;
    }
}
