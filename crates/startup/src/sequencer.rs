//! Runs startup steps in order with per-step deadlines.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::session::{
    AggregateHealth, SessionState, StartupReport, StartupSession, StepInfo, StepOutcome,
    StepResult,
};
use crate::step::StartupStep;

/// Default interval between health check polls.
pub const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Options for [`StartupSequencer`].
#[derive(Clone, Debug)]
pub struct SequencerOptions {
    /// Fixed delay between health check attempts.
    pub health_poll_interval: Duration,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            health_poll_interval: DEFAULT_HEALTH_POLL_INTERVAL,
        }
    }
}

enum Bounded<T> {
    Done(T),
    Elapsed,
    Cancelled,
}

/// Executes one startup session.
///
/// A sequencer owns exactly one session; once `run` has been called it
/// cannot be run again.
pub struct StartupSequencer {
    options: SequencerOptions,
    session: Arc<RwLock<StartupSession>>,
    cancel: CancellationToken,
}

impl Default for StartupSequencer {
    fn default() -> Self {
        Self::new(SequencerOptions::default())
    }
}

impl StartupSequencer {
    /// Creates a sequencer with a fresh session.
    #[must_use]
    pub fn new(options: SequencerOptions) -> Self {
        Self {
            options,
            session: Arc::new(RwLock::new(StartupSession::default())),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Aborts the run: no further steps are issued and the in-flight step is
    /// recorded as timed out.
    pub fn cancel(&self) {
        info!("startup cancellation requested");
        self.cancel.cancel();
    }

    /// Snapshot of the session.
    #[must_use]
    pub fn status(&self) -> StartupSession {
        self.session.read().clone()
    }

    /// Runs `steps` in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRun`] if the session is not `NotStarted`.
    pub async fn run(&self, steps: Vec<StartupStep>) -> Result<StartupReport> {
        {
            let mut session = self.session.write();
            if session.state != SessionState::NotStarted {
                return Err(Error::AlreadyRun(session.state));
            }
            session.state = SessionState::Running;
            session.started_at = Some(Utc::now());
            session.steps = steps
                .iter()
                .map(|step| StepInfo {
                    id: step.id.clone(),
                    name: step.name.clone(),
                    critical: step.critical,
                })
                .collect();
        }

        info!("starting startup sequence with {} steps", steps.len());

        let mut halted = false;
        let mut cancelled = false;

        for (index, step) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("startup cancelled before step {}", step.id);
                cancelled = true;
                break;
            }

            self.session.write().current_index = index;
            info!("running startup step {} ({})", step.id, step.name);

            let result = self.run_step(step).await;
            let outcome = result.outcome;
            let error_detail = result.error.clone();
            self.session.write().step_results.push(result);

            if outcome == StepOutcome::Success {
                info!("startup step {} succeeded", step.id);
                continue;
            }

            if self.cancel.is_cancelled() {
                warn!("startup step {} interrupted by cancellation", step.id);
                cancelled = true;
                break;
            }

            if step.critical {
                error!(
                    "critical startup step {} {:?}: {}",
                    step.id,
                    outcome,
                    error_detail.as_deref().unwrap_or("no detail")
                );
                halted = true;
                break;
            }

            warn!(
                "non-critical startup step {} {:?}, continuing: {}",
                step.id,
                outcome,
                error_detail.as_deref().unwrap_or("no detail")
            );
        }

        let session = {
            let mut session = self.session.write();
            session.state = if halted || cancelled {
                SessionState::Failed
            } else {
                SessionState::Completed
            };
            session.finished_at = Some(Utc::now());
            session.clone()
        };

        let health = AggregateHealth::from_session(&session);
        info!(
            "startup sequence finished: {:?} ({:?})",
            session.state, health
        );

        Ok(StartupReport {
            session,
            health,
            cancelled,
        })
    }

    async fn run_step(&self, step: &StartupStep) -> StepResult {
        let started = Instant::now();
        let deadline = started + step.timeout;

        let (outcome, error) = match self.bounded(deadline, step.action.invoke()).await {
            Bounded::Done(Ok(())) => {
                debug!("step {} action returned, polling health check", step.id);
                match self.bounded(deadline, self.poll_health(step)).await {
                    Bounded::Done(()) => (StepOutcome::Success, None),
                    Bounded::Elapsed => (
                        StepOutcome::TimedOut,
                        Some(format!(
                            "health check did not pass within {:?}",
                            step.timeout
                        )),
                    ),
                    Bounded::Cancelled => (StepOutcome::TimedOut, Some("cancelled".to_string())),
                }
            }
            Bounded::Done(Err(e)) => (StepOutcome::Failed, Some(e.to_string())),
            Bounded::Elapsed => (
                StepOutcome::TimedOut,
                Some(format!("action did not complete within {:?}", step.timeout)),
            ),
            Bounded::Cancelled => (StepOutcome::TimedOut, Some("cancelled".to_string())),
        };

        StepResult {
            step_id: step.id.clone(),
            critical: step.critical,
            outcome,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error,
        }
    }

    async fn poll_health(&self, step: &StartupStep) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if step.health_check.check().await {
                debug!(
                    "step {} healthy after {} attempt(s)",
                    step.id, attempts
                );
                return;
            }
            sleep(self.options.health_poll_interval).await;
        }
    }

    async fn bounded<F: Future>(&self, deadline: Instant, future: F) -> Bounded<F::Output> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Bounded::Cancelled,
            result = timeout_at(deadline, future) => match result {
                Ok(output) => Bounded::Done(output),
                Err(_) => Bounded::Elapsed,
            },
        }
    }
}
