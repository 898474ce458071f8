//! Startup session state and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single step ended.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Action succeeded and the health check passed in time.
    Success,
    /// The action returned an error.
    Failed,
    /// The deadline passed (or the run was cancelled) before the step finished.
    TimedOut,
}

/// Recorded result of one executed step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id.
    pub step_id: String,

    /// Whether the step was critical when it ran. Step ids need not be unique.
    pub critical: bool,

    /// Outcome.
    pub outcome: StepOutcome,

    /// Wall time spent on the step.
    pub duration_ms: u64,

    /// Failure detail, if any.
    pub error: Option<String>,
}

/// Lifecycle of a startup session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// `run` has not been called.
    NotStarted,
    /// Steps are executing.
    Running,
    /// Every critical step succeeded.
    Completed,
    /// A critical step failed or the run was cancelled.
    Failed,
}

/// Static description of a step, as seen by status readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Step id.
    pub id: String,
    /// Step name.
    pub name: String,
    /// Whether the step is critical.
    pub critical: bool,
}

/// Snapshot of a startup session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupSession {
    /// Steps in declaration order.
    pub steps: Vec<StepInfo>,

    /// Index of the step currently (or last) executing.
    pub current_index: usize,

    /// Results of executed steps, in order.
    pub step_results: Vec<StepResult>,

    /// Session state.
    pub state: SessionState,

    /// When `run` was called.
    pub started_at: Option<DateTime<Utc>>,

    /// When the session reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for StartupSession {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            current_index: 0,
            step_results: Vec::new(),
            state: SessionState::NotStarted,
            started_at: None,
            finished_at: None,
        }
    }
}

impl StartupSession {
    /// Whether the session reached `Completed` or `Failed`.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Completed | SessionState::Failed)
    }
}

/// Overall health after the sequence.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum AggregateHealth {
    /// Every step succeeded.
    Healthy,
    /// Only non-critical steps failed.
    Degraded,
    /// A critical step failed or the run was cancelled.
    Unhealthy,
}

impl AggregateHealth {
    /// Derives the aggregate health of a finished session.
    #[must_use]
    pub fn from_session(session: &StartupSession) -> Self {
        let critical_failure = session
            .step_results
            .iter()
            .any(|result| result.outcome != StepOutcome::Success && result.critical);

        if critical_failure || session.state != SessionState::Completed {
            Self::Unhealthy
        } else if session
            .step_results
            .iter()
            .any(|result| result.outcome != StepOutcome::Success)
        {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

/// Final result of a startup run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    /// Final session snapshot.
    pub session: StartupSession,

    /// Aggregate health.
    pub health: AggregateHealth,

    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl StartupReport {
    /// Whether the system may proceed to monitoring (`Healthy` or `Degraded`).
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.session.state == SessionState::Completed
            && matches!(
                self.health,
                AggregateHealth::Healthy | AggregateHealth::Degraded
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(results: &[(&str, bool, StepOutcome)], state: SessionState) -> StartupSession {
        StartupSession {
            steps: results
                .iter()
                .map(|(id, critical, _)| StepInfo {
                    id: (*id).to_string(),
                    name: (*id).to_string(),
                    critical: *critical,
                })
                .collect(),
            current_index: results.len().saturating_sub(1),
            step_results: results
                .iter()
                .map(|(id, critical, outcome)| StepResult {
                    step_id: (*id).to_string(),
                    critical: *critical,
                    outcome: *outcome,
                    duration_ms: 1,
                    error: None,
                })
                .collect(),
            state,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn all_success_is_healthy() {
        let s = session(
            &[("a", true, StepOutcome::Success), ("b", false, StepOutcome::Success)],
            SessionState::Completed,
        );
        assert_eq!(AggregateHealth::from_session(&s), AggregateHealth::Healthy);
    }

    #[test]
    fn non_critical_timeout_is_degraded() {
        let s = session(
            &[("a", true, StepOutcome::Success), ("b", false, StepOutcome::TimedOut)],
            SessionState::Completed,
        );
        assert_eq!(AggregateHealth::from_session(&s), AggregateHealth::Degraded);
    }

    #[test]
    fn critical_failure_is_unhealthy() {
        let s = session(&[("a", true, StepOutcome::Failed)], SessionState::Failed);
        assert_eq!(AggregateHealth::from_session(&s), AggregateHealth::Unhealthy);
    }

    #[test]
    fn criticality_follows_the_result_not_the_id() {
        let s = session(
            &[("migrate", true, StepOutcome::Success), ("migrate", false, StepOutcome::Failed)],
            SessionState::Completed,
        );
        assert_eq!(AggregateHealth::from_session(&s), AggregateHealth::Degraded);

        let s = session(
            &[("migrate", false, StepOutcome::Success), ("migrate", true, StepOutcome::Failed)],
            SessionState::Completed,
        );
        assert_eq!(AggregateHealth::from_session(&s), AggregateHealth::Unhealthy);
    }
}
