//! Job lifecycle states and their scheduler-state tolerance mapping.
//!
//! The job store and the platform scheduler each track their own lifecycle
//! for a piece of work. The two lag behind each other in normal operation,
//! so a single logical job state corresponds to a *set* of scheduler states
//! that are considered consistent with it. Drift detection compares against
//! that set, never against a single expected state.
//!
//! # Invariants
//!
//! - The mapping is total over non-terminal states.
//! - Terminal job states (CANCELED, FAILED, COMPLETED) are never reconciled.
//! - `reconciliation_states()` orders states earliest lifecycle stage first,
//!   so a bounded pass makes forward progress deterministically.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error parsing a state from its stored string form.
#[derive(Debug, Error)]
#[error("unknown state: {0}")]
pub struct UnknownState(pub String);

/// Logical job lifecycle state, as recorded in the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Job exists but has not been queued yet.
    Pending,
    /// Job is queued for execution.
    Queued,
    /// Job is scheduled for a future run.
    Scheduled,
    /// Job has been selected by a worker but not started.
    Selected,
    /// Job body is executing.
    Running,
    /// Cancellation requested, not yet confirmed.
    Canceling,
    /// Job was cancelled (terminal).
    Canceled,
    /// Job failed (terminal).
    Failed,
    /// Job finished successfully (terminal).
    Completed,
}

/// Execution state of a scheduler work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkState {
    /// Request accepted, waiting to run.
    Enqueued,
    /// Request blocked on platform constraints.
    Blocked,
    /// Request is executing.
    Running,
    /// Request finished successfully.
    Succeeded,
    /// Request failed.
    Failed,
    /// Request was cancelled by the platform or a caller.
    Cancelled,
}

impl JobState {
    /// Canonical string form used by the job store's `state` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Scheduled => "SCHEDULED",
            Self::Selected => "SELECTED",
            Self::Running => "RUNNING",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Result<Self, UnknownState> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "SCHEDULED" => Ok(Self::Scheduled),
            "SELECTED" => Ok(Self::Selected),
            "RUNNING" => Ok(Self::Running),
            "CANCELING" => Ok(Self::Canceling),
            "CANCELED" => Ok(Self::Canceled),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(UnknownState(other.to_string())),
        }
    }

    /// True for states a job can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Failed | Self::Completed)
    }

    /// Scheduler states considered consistent with this job state.
    ///
    /// One-to-many on purpose: a RUNNING job may legitimately map to a
    /// request the scheduler reports as RUNNING, or SUCCEEDED if it finished
    /// just before the check ran. Keep this a table, not scattered
    /// conditionals, so tests can enumerate every pairing.
    pub fn accepted_work_states(&self) -> &'static [WorkState] {
        match self {
            Self::Pending | Self::Queued | Self::Scheduled | Self::Selected => {
                &[WorkState::Enqueued, WorkState::Blocked, WorkState::Running]
            }
            Self::Running => &[WorkState::Running, WorkState::Succeeded],
            Self::Canceling | Self::Canceled => &[WorkState::Cancelled],
            Self::Failed => &[WorkState::Failed],
            Self::Completed => &[WorkState::Succeeded],
        }
    }

    /// States checked by a reconciliation pass, earliest lifecycle first.
    pub fn reconciliation_states() -> &'static [JobState] {
        &[
            Self::Pending,
            Self::Queued,
            Self::Scheduled,
            Self::Selected,
            Self::Running,
        ]
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for WorkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Enqueued => "ENQUEUED",
            Self::Blocked => "BLOCKED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Job priority tiers.
///
/// Numeric values come from the job store: lower value means higher
/// priority (HIGH = 5, REGULAR = 10, LOW = 15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Regular,
    Low,
}

impl Priority {
    /// Stored numeric value.
    pub fn value(&self) -> i64 {
        match self {
            Self::High => 5,
            Self::Regular => 10,
            Self::Low => 15,
        }
    }

    /// Map a stored numeric value to the nearest tier.
    ///
    /// Values at or below HIGH count as HIGH; anything above REGULAR is LOW.
    pub fn from_value(value: i64) -> Self {
        if value <= Self::High.value() {
            Self::High
        } else if value <= Self::Regular.value() {
            Self::Regular
        } else {
            Self::Low
        }
    }

    /// Whether this priority requests expedited scheduling.
    pub fn expedites(&self) -> bool {
        matches!(self, Self::High)
    }
}
