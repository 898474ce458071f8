//! Trigger windows: how much fired history is needed before a trigger trips.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::trigger::RollbackEvent;

/// Span over which a trigger's condition must hold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Window {
    /// The latest poll fired.
    Instant,

    /// Every poll has fired for at least `duration`.
    ///
    /// Each event is taken to cover the observed spacing between snapshots
    /// (the median gap between recorded events), so with one-minute snapshots
    /// a five-minute window trips on the fifth consecutive fired event. A gap
    /// of more than twice that spacing breaks the run. The configured poll
    /// interval only stands in while fewer than two events are recorded.
    Sustained {
        /// Required span.
        duration: Duration,
    },

    /// At least `at_least` polls fired within the trailing `within`.
    Occurrences {
        /// Required fired polls.
        at_least: u32,
        /// Trailing span.
        within: Duration,
    },

    /// Observed values of fired polls within the trailing `within` sum to at
    /// least `at_least`.
    Accumulated {
        /// Required total.
        at_least: f64,
        /// Trailing span.
        within: Duration,
    },

    /// At least `at_least` of the last `of_last` recorded polls fired.
    Polls {
        /// Required fired polls.
        at_least: usize,
        /// Number of most recent polls considered.
        of_last: usize,
    },
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Median gap between consecutive events, or `fallback` with fewer than two.
fn observed_spacing(history: &VecDeque<RollbackEvent>, fallback: Duration) -> Duration {
    let mut gaps: Vec<Duration> = history
        .iter()
        .zip(history.iter().skip(1))
        .filter_map(|(earlier, later)| (later.timestamp - earlier.timestamp).to_std().ok())
        .filter(|gap| !gap.is_zero())
        .collect();
    if gaps.is_empty() {
        return fallback;
    }
    gaps.sort_unstable();
    gaps[gaps.len() / 2]
}

fn cutoff(newest: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    newest
        .checked_sub_signed(delta(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Window {
    /// Whether `history` (oldest first) satisfies the window. `poll_interval`
    /// is only consulted by sustained windows with too little history to
    /// measure snapshot spacing.
    #[must_use]
    pub fn is_satisfied(&self, history: &VecDeque<RollbackEvent>, poll_interval: Duration) -> bool {
        let Some(newest) = history.back() else {
            return false;
        };

        match *self {
            Self::Instant => newest.fired,
            Self::Sustained { duration } => {
                if !newest.fired {
                    return false;
                }
                let spacing = observed_spacing(history, poll_interval);
                let max_gap = delta(spacing.saturating_mul(2));
                let mut earliest = newest.timestamp;
                for event in history.iter().rev().skip(1) {
                    if !event.fired || earliest - event.timestamp > max_gap {
                        break;
                    }
                    earliest = event.timestamp;
                }
                let span = (newest.timestamp - earliest).to_std().unwrap_or_default();
                span + spacing >= duration
            }
            Self::Occurrences { at_least, within } => {
                let cutoff = cutoff(newest.timestamp, within);
                let count = history
                    .iter()
                    .filter(|e| e.fired && e.timestamp > cutoff)
                    .count();
                count >= at_least as usize
            }
            Self::Accumulated { at_least, within } => {
                let cutoff = cutoff(newest.timestamp, within);
                let total: f64 = history
                    .iter()
                    .filter(|e| e.fired && e.timestamp > cutoff)
                    .filter_map(|e| e.observed_value)
                    .sum();
                total >= at_least
            }
            Self::Polls { at_least, of_last } => {
                let count = history.iter().rev().take(of_last).filter(|e| e.fired).count();
                count >= at_least
            }
        }
    }

    /// Drops events the window can no longer look at.
    pub fn prune(&self, history: &mut VecDeque<RollbackEvent>, poll_interval: Duration) {
        match *self {
            Self::Instant => keep_last(history, 1),
            Self::Polls { of_last, .. } => keep_last(history, of_last.max(1)),
            Self::Sustained { duration } => {
                let spacing = observed_spacing(history, poll_interval);
                keep_within(history, duration + spacing.saturating_mul(2));
            }
            Self::Occurrences { within, .. } | Self::Accumulated { within, .. } => {
                keep_within(history, within);
            }
        }
    }
}

fn keep_last(history: &mut VecDeque<RollbackEvent>, count: usize) {
    while history.len() > count {
        history.pop_front();
    }
}

fn keep_within(history: &mut VecDeque<RollbackEvent>, span: Duration) {
    let Some(newest) = history.back().map(|e| e.timestamp) else {
        return;
    };
    let cutoff = cutoff(newest, span);
    while history.front().is_some_and(|e| e.timestamp <= cutoff) {
        history.pop_front();
    }
}
