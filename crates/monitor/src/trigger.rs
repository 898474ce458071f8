//! Rollback trigger definitions and the default trigger set.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::window::Window;

/// Comparison applied to an observed metric value.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        };
        f.write_str(symbol)
    }
}

/// Threshold comparison.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Operator.
    pub operator: Operator,
    /// Threshold the observed value is compared against.
    pub threshold: f64,
}

impl Condition {
    /// Creates a condition.
    #[must_use]
    pub const fn new(operator: Operator, threshold: f64) -> Self {
        Self {
            operator,
            threshold,
        }
    }

    /// Whether `observed` crosses the threshold.
    #[must_use]
    pub fn is_crossed_by(&self, observed: f64) -> bool {
        let equal = (observed - self.threshold).abs() < f64::EPSILON;
        match self.operator {
            Operator::Gt => observed > self.threshold,
            Operator::Ge => observed > self.threshold || equal,
            Operator::Lt => observed < self.threshold,
            Operator::Le => observed < self.threshold || equal,
            Operator::Eq => equal,
            Operator::Ne => !equal,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operator, self.threshold)
    }
}

/// One metric path and the condition it is tested against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricCheck {
    /// Dotted path into the metrics snapshot. One `*` segment evaluates the
    /// check separately for every key at that position.
    pub metric_path: String,
    /// Condition.
    pub condition: Condition,
}

impl MetricCheck {
    /// Creates a check.
    pub fn new(metric_path: impl Into<String>, operator: Operator, threshold: f64) -> Self {
        Self {
            metric_path: metric_path.into(),
            condition: Condition::new(operator, threshold),
        }
    }
}

/// Urgency of a trigger. Ordered from least to most urgent.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Low.
    Low,
    /// Medium.
    Medium,
    /// High.
    High,
    /// Critical.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A rule that, once its window is satisfied, asks for a rollback.
///
/// A poll fires when any of `checks` crosses its condition.
#[derive(Clone, Debug, PartialEq)]
pub struct RollbackTrigger {
    /// Trigger id.
    pub id: String,
    /// Alternative checks; the first is the primary metric.
    pub checks: Vec<MetricCheck>,
    /// How many fired polls are needed, over what span.
    pub window: Window,
    /// Severity used to pick between simultaneously satisfied triggers.
    pub severity: Severity,
}

impl RollbackTrigger {
    /// Creates a trigger over a single metric.
    pub fn new(id: impl Into<String>, check: MetricCheck, window: Window, severity: Severity) -> Self {
        Self {
            id: id.into(),
            checks: vec![check],
            window,
            severity,
        }
    }

    /// Adds an alternative check.
    #[must_use]
    pub fn or_check(mut self, check: MetricCheck) -> Self {
        self.checks.push(check);
        self
    }
}

/// Outcome of evaluating one trigger against one snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    /// Trigger id.
    pub trigger_id: String,
    /// Snapshot time.
    pub timestamp: DateTime<Utc>,
    /// Observed value; `None` when the metric was unavailable.
    pub observed_value: Option<f64>,
    /// Whether the condition was crossed.
    pub fired: bool,
}

/// Id of the error-rate trigger.
pub const HIGH_ERROR_RATE: &str = "high-error-rate";
/// Id of the repeated-service-failure trigger.
pub const REPEATED_SERVICE_FAILURE: &str = "repeated-service-failure";
/// Id of the response-time trigger.
pub const RESPONSE_TIME_DEGRADATION: &str = "response-time-degradation";
/// Id of the resource-exhaustion trigger.
pub const RESOURCE_EXHAUSTION: &str = "resource-exhaustion";
/// Id of the repeated-health-check-failure trigger.
pub const REPEATED_HEALTH_CHECK_FAILURE: &str = "repeated-health-check-failure";

/// Thresholds and windows for the five standard triggers.
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerThresholds {
    /// Error ratio above which a poll fires.
    pub error_rate: f64,
    /// How long the error ratio must stay high.
    pub error_rate_window: Duration,
    /// Failed transitions of any one service needed within the window.
    pub service_failures: f64,
    /// Window for failed transitions.
    pub service_failure_window: Duration,
    /// Average response time, in seconds, above which a poll fires.
    pub response_time_seconds: f64,
    /// How long response time must stay high.
    pub response_time_window: Duration,
    /// Memory high-water mark, percent.
    pub memory_percent: f64,
    /// CPU high-water mark, percent.
    pub cpu_percent: f64,
    /// Disk high-water mark, percent.
    pub disk_percent: f64,
    /// Failed health checks needed within the window.
    pub health_check_failures: u32,
    /// Window for failed health checks.
    pub health_check_window: Duration,
}

impl Default for TriggerThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.10,
            error_rate_window: Duration::from_secs(5 * 60),
            service_failures: 3.0,
            service_failure_window: Duration::from_secs(3 * 60),
            response_time_seconds: 2.0,
            response_time_window: Duration::from_secs(5 * 60),
            memory_percent: 95.0,
            cpu_percent: 95.0,
            disk_percent: 90.0,
            health_check_failures: 5,
            health_check_window: Duration::from_secs(5 * 60),
        }
    }
}

impl TriggerThresholds {
    /// Builds the five standard triggers.
    #[must_use]
    pub fn triggers(&self) -> Vec<RollbackTrigger> {
        vec![
            RollbackTrigger::new(
                HIGH_ERROR_RATE,
                MetricCheck::new("errors.rate", Operator::Gt, self.error_rate),
                Window::Sustained {
                    duration: self.error_rate_window,
                },
                Severity::High,
            ),
            RollbackTrigger::new(
                REPEATED_SERVICE_FAILURE,
                MetricCheck::new("services.*.failed_transitions", Operator::Gt, 0.0),
                Window::Accumulated {
                    at_least: self.service_failures,
                    within: self.service_failure_window,
                },
                Severity::High,
            ),
            RollbackTrigger::new(
                RESPONSE_TIME_DEGRADATION,
                MetricCheck::new(
                    "response_time.avg_seconds",
                    Operator::Gt,
                    self.response_time_seconds,
                ),
                Window::Sustained {
                    duration: self.response_time_window,
                },
                Severity::Medium,
            ),
            RollbackTrigger::new(
                RESOURCE_EXHAUSTION,
                MetricCheck::new("resources.memory_percent", Operator::Ge, self.memory_percent),
                Window::Instant,
                Severity::Critical,
            )
            .or_check(MetricCheck::new(
                "resources.cpu_percent",
                Operator::Ge,
                self.cpu_percent,
            ))
            .or_check(MetricCheck::new(
                "resources.disk_percent",
                Operator::Ge,
                self.disk_percent,
            )),
            RollbackTrigger::new(
                REPEATED_HEALTH_CHECK_FAILURE,
                MetricCheck::new("health.check_passed", Operator::Eq, 0.0),
                Window::Occurrences {
                    at_least: self.health_check_failures,
                    within: self.health_check_window,
                },
                Severity::High,
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_compare_with_tolerance() {
        assert!(Condition::new(Operator::Gt, 0.10).is_crossed_by(0.12));
        assert!(!Condition::new(Operator::Gt, 0.10).is_crossed_by(0.10));
        assert!(Condition::new(Operator::Ge, 95.0).is_crossed_by(95.0));
        assert!(Condition::new(Operator::Eq, 0.0).is_crossed_by(0.0));
        assert!(Condition::new(Operator::Ne, 0.0).is_crossed_by(1.0));
        assert!(Condition::new(Operator::Le, 1.0).is_crossed_by(1.0));
        assert!(!Condition::new(Operator::Lt, 1.0).is_crossed_by(1.0));
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn default_triggers_cover_the_standard_set() {
        let triggers = TriggerThresholds::default().triggers();
        let ids: Vec<_> = triggers.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                HIGH_ERROR_RATE,
                REPEATED_SERVICE_FAILURE,
                RESPONSE_TIME_DEGRADATION,
                RESOURCE_EXHAUSTION,
                REPEATED_HEALTH_CHECK_FAILURE,
            ]
        );

        let exhaustion = &triggers[3];
        assert_eq!(exhaustion.checks.len(), 3);
        assert_eq!(exhaustion.severity, Severity::Critical);
        assert_eq!(exhaustion.window, Window::Instant);
    }
}
