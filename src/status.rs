//! Status vocabulary and the legality rules for status writes.
//!
//! Every status value has an ordinal level. A transition is legal only if it
//! is non-decreasing in level, except that interrupt statuses (Canceled,
//! Timeout, Failed) may land from any non-terminal source, and terminal
//! statuses accept nothing further. Status updates arrive asynchronously
//! over the network and may be stale; rejecting regressions keeps a late
//! "running" from clobbering a recorded "success".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Common interface over job and task status enums.
pub trait SchedulingStatus: Copy + Eq {
    /// Ordinal level used by the monotonicity rule.
    fn level(self) -> u8;

    /// Terminal statuses that may override any in-progress status.
    fn is_interrupt(self) -> bool;

    /// End statuses: no further non-forced writes are accepted.
    fn is_terminal(self) -> bool;
}

/// Whether a status write from `src` to `dest` is legal.
///
/// Same-status writes are allowed and harmless; the store-level guard turns
/// them into no-ops.
pub fn transition_allowed<S: SchedulingStatus>(src: S, dest: S) -> bool {
    if src == dest {
        return true;
    }
    if src.is_terminal() {
        return false;
    }
    if dest.is_interrupt() {
        return true;
    }
    dest.level() >= src.level()
}

macro_rules! status_text {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownStatus;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(UnknownStatus(other.to_string())),
                }
            }
        }
    };
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status {0:?}")]
pub struct UnknownStatus(pub String);

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Running,
    Canceled,
    Timeout,
    Failed,
    Success,
}

status_text!(JobStatus {
    Waiting => "waiting",
    Running => "running",
    Canceled => "canceled",
    Timeout => "timeout",
    Failed => "failed",
    Success => "success",
});

impl SchedulingStatus for JobStatus {
    fn level(self) -> u8 {
        match self {
            JobStatus::Waiting => 1,
            JobStatus::Running => 2,
            JobStatus::Canceled => 3,
            JobStatus::Timeout => 4,
            JobStatus::Failed => 5,
            JobStatus::Success => 6,
        }
    }

    fn is_interrupt(self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Timeout | JobStatus::Failed
        )
    }

    fn is_terminal(self) -> bool {
        self.is_interrupt() || self == JobStatus::Success
    }
}

/// Task lifecycle status. `Pass` marks a skipped task and aggregates as
/// `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    Canceled,
    Timeout,
    Failed,
    Pass,
    Success,
}

status_text!(TaskStatus {
    Waiting => "waiting",
    Running => "running",
    Canceled => "canceled",
    Timeout => "timeout",
    Failed => "failed",
    Pass => "pass",
    Success => "success",
});

impl SchedulingStatus for TaskStatus {
    fn level(self) -> u8 {
        match self {
            TaskStatus::Waiting => 1,
            TaskStatus::Running => 2,
            TaskStatus::Canceled => 3,
            TaskStatus::Timeout => 4,
            TaskStatus::Failed => 5,
            TaskStatus::Pass => 6,
            TaskStatus::Success => 7,
        }
    }

    fn is_interrupt(self) -> bool {
        matches!(
            self,
            TaskStatus::Canceled | TaskStatus::Timeout | TaskStatus::Failed
        )
    }

    fn is_terminal(self) -> bool {
        self.is_interrupt() || matches!(self, TaskStatus::Pass | TaskStatus::Success)
    }
}

impl TaskStatus {
    /// Pass counts as Success everywhere aggregation is concerned.
    pub fn normalized(self) -> TaskStatus {
        match self {
            TaskStatus::Pass => TaskStatus::Success,
            other => other,
        }
    }

    /// Equivalent job-level status for an identical-across-tasks fold.
    pub fn as_job_status(self) -> JobStatus {
        match self.normalized() {
            TaskStatus::Waiting => JobStatus::Waiting,
            TaskStatus::Running => JobStatus::Running,
            TaskStatus::Canceled => JobStatus::Canceled,
            TaskStatus::Timeout => JobStatus::Timeout,
            TaskStatus::Failed => JobStatus::Failed,
            TaskStatus::Success | TaskStatus::Pass => JobStatus::Success,
        }
    }
}

/// Per-destination reply code for one federated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyCode {
    Success,
    /// The command had nothing to do (e.g. stop on an already-ended job).
    NotEffective,
    /// The command was delivered and cleanly refused (e.g. no resource).
    Failed,
    /// Transport failure or a remote exception.
    Error,
}

status_text!(ReplyCode {
    Success => "success",
    NotEffective => "not_effective",
    Failed => "failed",
    Error => "error",
});

/// Aggregate outcome of a federated broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FederatedCode {
    Success,
    /// At least one destination succeeded and at least one failed.
    Partial,
    Failed,
    NotEffective,
    Error,
}

status_text!(FederatedCode {
    Success => "success",
    Partial => "partial",
    Failed => "failed",
    NotEffective => "not_effective",
    Error => "error",
});

impl FederatedCode {
    pub fn is_success(self) -> bool {
        self == FederatedCode::Success
    }
}

/// Reduce per-destination reply codes into one aggregate outcome.
///
/// The reduction only inspects which codes are present, so it is invariant
/// under reply ordering.
pub fn reduce_reply_codes<I>(codes: I) -> FederatedCode
where
    I: IntoIterator<Item = ReplyCode>,
{
    let mut any = false;
    let mut success = 0usize;
    let mut not_effective = 0usize;
    let mut failed = 0usize;
    let mut error = 0usize;
    for code in codes {
        any = true;
        match code {
            ReplyCode::Success => success += 1,
            ReplyCode::NotEffective => not_effective += 1,
            ReplyCode::Failed => failed += 1,
            ReplyCode::Error => error += 1,
        }
    }
    if !any || (not_effective == 0 && failed == 0 && error == 0) {
        return FederatedCode::Success;
    }
    if error > 0 {
        return FederatedCode::Error;
    }
    if not_effective > 0 {
        return FederatedCode::NotEffective;
    }
    if success > 0 && failed > 0 {
        return FederatedCode::Partial;
    }
    FederatedCode::Failed
}

/// Fold the per-party statuses of one task into a single federated status.
///
/// All parties agreeing is the common case. While they disagree, Running
/// wins over non-terminal values, then the highest-level interrupt present,
/// then Running as the safe holding value.
pub fn fold_party_statuses(statuses: &[TaskStatus]) -> Option<TaskStatus> {
    let (first, rest) = statuses.split_first()?;
    if rest.iter().all(|s| s == first) {
        return Some(*first);
    }
    if statuses.contains(&TaskStatus::Running) {
        return Some(TaskStatus::Running);
    }
    statuses
        .iter()
        .copied()
        .filter(|s| s.is_interrupt())
        .max_by_key(|s| s.level())
        .or(Some(TaskStatus::Running))
}

/// Aggregate a job status from its per-task federated statuses.
///
/// `have_next` reports whether the scheduling pass dispatched (or could
/// still dispatch) a task. The `{Waiting, Success}`-without-progress case
/// resolves to Canceled: nothing is running, nothing can start, so the job
/// can never finish on its own.
pub fn aggregate_job_status(task_statuses: &[TaskStatus], have_next: bool) -> Option<JobStatus> {
    let normalized: Vec<TaskStatus> = task_statuses.iter().map(|s| s.normalized()).collect();
    let (first, rest) = normalized.split_first()?;
    if rest.iter().all(|s| s == first) {
        if *first == TaskStatus::Waiting && have_next {
            return Some(JobStatus::Running);
        }
        return Some(first.as_job_status());
    }
    if normalized.contains(&TaskStatus::Running) {
        return Some(JobStatus::Running);
    }
    let any_waiting = normalized.contains(&TaskStatus::Waiting);
    if any_waiting && have_next {
        return Some(JobStatus::Running);
    }
    if normalized
        .iter()
        .all(|s| matches!(s, TaskStatus::Waiting | TaskStatus::Success))
    {
        // Deadlocked: only waiting and finished tasks, and nothing more can
        // be scheduled.
        return Some(JobStatus::Canceled);
    }
    normalized
        .iter()
        .copied()
        .filter(|s| s.is_interrupt())
        .max_by_key(|s| s.level())
        .map(|s| s.as_job_status())
        .or(Some(JobStatus::Running))
}
