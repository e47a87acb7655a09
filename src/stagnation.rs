//! Stagnation circuit breaker.
//!
//! Pure functions over an execution's [`StagnationCounters`]. Recording a loop
//! result updates the counters; the verdict decides whether the execution must
//! be force-failed.

use serde::Serialize;

use crate::ledger::StagnationCounters;

/// Consecutive updates without file changes before tripping.
pub const NO_PROGRESS_THRESHOLD: u32 = 3;
/// Consecutive repeats of one error before tripping.
pub const SAME_ERROR_THRESHOLD: u32 = 5;
/// Loop budget per still-failing story.
pub const MAX_LOOPS_PER_STORY: u32 = 10;

/// Early-warning levels reported by `get`, one below each trip threshold.
const NO_PROGRESS_WARNING: u32 = 2;
const SAME_ERROR_WARNING: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagnationKind {
    NoProgress,
    RepeatedError,
    MaxLoops,
}

impl StagnationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoProgress => "no_progress",
            Self::RepeatedError => "repeated_error",
            Self::MaxLoops => "max_loops",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagnationVerdict {
    pub is_stagnant: bool,
    #[serde(rename = "type")]
    pub kind: Option<StagnationKind>,
    pub message: Option<String>,
}

impl StagnationVerdict {
    fn healthy() -> Self {
        Self {
            is_stagnant: false,
            kind: None,
            message: None,
        }
    }

    fn tripped(kind: StagnationKind, message: String) -> Self {
        Self {
            is_stagnant: true,
            kind: Some(kind),
            message: Some(message),
        }
    }
}

/// Fold one loop result into the counters.
pub fn record_loop_result(
    counters: &StagnationCounters,
    files_changed: u32,
    error: Option<&str>,
) -> StagnationCounters {
    let mut next = counters.clone();
    next.loop_count += 1;
    next.last_files_changed = files_changed;
    next.consecutive_no_progress = if files_changed == 0 {
        counters.consecutive_no_progress + 1
    } else {
        0
    };
    match error {
        Some(err) if counters.last_error.as_deref() == Some(err) => {
            next.consecutive_errors = counters.consecutive_errors + 1;
        }
        Some(err) => {
            next.consecutive_errors = 1;
            next.last_error = Some(err.to_string());
        }
        None => {
            next.consecutive_errors = 0;
            next.last_error = None;
        }
    }
    next
}

/// Decide whether the counters describe a stuck execution.
///
/// Checked in fixed order: no progress, repeated error, loop budget. Only the
/// first tripped reason is reported.
pub fn check_stagnation(counters: &StagnationCounters, failing_stories: usize) -> StagnationVerdict {
    if counters.consecutive_no_progress >= NO_PROGRESS_THRESHOLD {
        return StagnationVerdict::tripped(
            StagnationKind::NoProgress,
            format!(
                "No file changes for {} consecutive updates (threshold: {})",
                counters.consecutive_no_progress, NO_PROGRESS_THRESHOLD
            ),
        );
    }
    if counters.consecutive_errors >= SAME_ERROR_THRESHOLD {
        return StagnationVerdict::tripped(
            StagnationKind::RepeatedError,
            format!(
                "Same error repeated {} times (threshold: {}): {}",
                counters.consecutive_errors,
                SAME_ERROR_THRESHOLD,
                counters.last_error.as_deref().unwrap_or("")
            ),
        );
    }
    let failing = u32::try_from(failing_stories).unwrap_or(u32::MAX);
    let budget = failing.saturating_mul(MAX_LOOPS_PER_STORY);
    if failing > 0 && counters.loop_count >= budget {
        return StagnationVerdict::tripped(
            StagnationKind::MaxLoops,
            format!(
                "Loop count {} reached the budget of {} for {} failing stories",
                counters.loop_count, budget, failing
            ),
        );
    }
    StagnationVerdict::healthy()
}

/// Early warning shown before the breaker trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub is_at_risk: bool,
    pub risk_reason: Option<String>,
}

pub fn assess_risk(counters: &StagnationCounters) -> RiskAssessment {
    let reason = if counters.consecutive_no_progress >= NO_PROGRESS_WARNING {
        Some(format!(
            "No file changes for {} consecutive updates (threshold: {})",
            counters.consecutive_no_progress, NO_PROGRESS_THRESHOLD
        ))
    } else if counters.consecutive_errors >= SAME_ERROR_WARNING {
        Some(format!(
            "Same error repeated {} times (threshold: {})",
            counters.consecutive_errors, SAME_ERROR_THRESHOLD
        ))
    } else {
        None
    };
    RiskAssessment {
        is_at_risk: reason.is_some(),
        risk_reason: reason,
    }
}
