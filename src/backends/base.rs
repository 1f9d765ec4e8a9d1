//! Entity models and the backend interface for scheduler state.
//!
//! Every mutation the scheduler performs is a row-level conditional update:
//! the methods return `bool` for "did the guarded write land", and callers
//! treat `false` as a harmless no-op (a concurrent writer got there first,
//! or the guard rejected a stale value). Nothing here takes a lock across
//! calls; linearizability of the resource operations is the backend's
//! responsibility (one mutex for the in-memory store, single conditional
//! statements or transactions for Postgres).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{DagSpec, PartyAddr, SyncKind};
use crate::status::{JobStatus, TaskStatus, UnknownStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Status(#[from] UnknownStatus),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Primary key of a per-party job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub job_id: String,
    pub role: String,
    pub party_id: String,
}

impl JobKey {
    pub fn new(job_id: impl Into<String>, addr: &PartyAddr) -> Self {
        Self {
            job_id: job_id.into(),
            role: addr.role.clone(),
            party_id: addr.party_id.clone(),
        }
    }

    pub fn addr(&self) -> PartyAddr {
        PartyAddr::new(self.role.clone(), self.party_id.clone())
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.job_id, self.role, self.party_id)
    }
}

/// Primary key of a per-party task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub job_id: String,
    /// The task's DAG name; unique within a job.
    pub task_id: String,
    /// Incremented on every rerun; historical attempts stay queryable.
    pub task_version: i64,
    pub role: String,
    pub party_id: String,
}

impl TaskKey {
    pub fn job_key(&self) -> JobKey {
        JobKey {
            job_id: self.job_id.clone(),
            role: self.role.clone(),
            party_id: self.party_id.clone(),
        }
    }

    pub fn addr(&self) -> PartyAddr {
        PartyAddr::new(self.role.clone(), self.party_id.clone())
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}v{}@{}:{}",
            self.job_id, self.task_id, self.task_version, self.role, self.party_id
        )
    }
}

/// Per-party durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    pub dag: DagSpec,
    pub status: JobStatus,
    /// Finished-task percentage, 0..=100.
    pub progress: i32,
    pub initiator: PartyAddr,
    pub scheduler_party: PartyAddr,
    pub engine_type: String,
    pub engine_name: String,
    /// Capacity quota granted to the job on this party.
    pub cores: i64,
    pub memory: i64,
    /// Quota not yet handed to running tasks.
    pub remaining_cores: i64,
    pub remaining_memory: i64,
    pub resource_in_use: bool,
    pub resource_applied_at: Option<DateTime<Utc>>,
    pub resource_returned_at: Option<DateTime<Utc>>,
    pub cancel_signal: bool,
    pub cancel_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Per-party durable task attempt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub key: TaskKey,
    pub component_ref: String,
    /// The value synchronized from the scheduler's federated aggregate.
    pub status: TaskStatus,
    /// Local execution state, reported by the component runner.
    pub party_status: TaskStatus,
    pub task_cores: i64,
    pub task_memory: i64,
    pub resource_in_use: bool,
    pub sync_type: SyncKind,
    /// Placement info: which provider/worker executes the attempt.
    pub provider: Option<String>,
    pub worker_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Scheduler-side job aggregate; exists only on the scheduling party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJob {
    pub job_id: String,
    pub dag: DagSpec,
    pub status: JobStatus,
    pub priority: i32,
    pub progress: i32,
    pub initiator: PartyAddr,
    pub cancel_signal: bool,
    pub cancel_at: Option<DateTime<Utc>>,
    pub rerun_signal: bool,
    pub rerun_at: Option<DateTime<Utc>>,
    /// Set while a tick is mid-processing the waiting→running transition.
    pub ready_signal: bool,
    pub ready_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Scheduler-side per-task-name aggregate of the statuses reported by every
/// participating party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTaskStatus {
    pub job_id: String,
    pub task_id: String,
    /// Version currently being scheduled; reruns bump it.
    pub task_version: i64,
    pub status: TaskStatus,
    /// Remaining automatic rerun budget.
    pub auto_retries: i32,
    pub sync_type: SyncKind,
    pub updated_at: DateTime<Utc>,
}

/// Scheduler-side copy of one party's pushed task status (callback mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub job_id: String,
    pub task_id: String,
    pub task_version: i64,
    pub role: String,
    pub party_id: String,
    pub party_status: TaskStatus,
    pub reported_at: DateTime<Utc>,
}

/// Shared capacity pool for one computation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRegistry {
    pub engine_type: String,
    pub engine_name: String,
    pub total_cores: i64,
    pub total_memory: i64,
    pub remaining_cores: i64,
    pub remaining_memory: i64,
    pub updated_at: DateTime<Utc>,
}

/// Signals the cron loop queries for, besides plain status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSignal {
    Cancel,
    Rerun,
    Ready,
}

/// Durable state operations shared by the scheduler and the party
/// controller. Conditional-write methods return whether the guarded update
/// landed.
#[async_trait]
pub trait StateBackend: Send + Sync {
    // Scheduler-side aggregates.

    /// Insert the job aggregate and its per-task-name rows atomically.
    async fn create_schedule_job(
        &self,
        job: &ScheduleJob,
        tasks: &[ScheduleTaskStatus],
    ) -> StoreResult<()>;

    async fn schedule_job(&self, job_id: &str) -> StoreResult<Option<ScheduleJob>>;

    /// Jobs in `status`; Waiting is ordered by priority (desc) then
    /// creation time (oldest first), others by creation time.
    async fn schedule_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> StoreResult<Vec<ScheduleJob>>;

    async fn schedule_jobs_with_signal(
        &self,
        signal: JobSignal,
        limit: i64,
    ) -> StoreResult<Vec<ScheduleJob>>;

    async fn update_schedule_job_status(
        &self,
        job_id: &str,
        src: JobStatus,
        dest: JobStatus,
    ) -> StoreResult<bool>;

    /// Administrative status write bypassing the transition rule; only the
    /// rerun activation path uses this.
    async fn force_schedule_job_status(&self, job_id: &str, dest: JobStatus) -> StoreResult<bool>;

    /// Guarded flip of one signal flag; `false` when already in the
    /// requested state.
    async fn set_schedule_signal(
        &self,
        job_id: &str,
        signal: JobSignal,
        on: bool,
    ) -> StoreResult<bool>;

    async fn set_schedule_progress(&self, job_id: &str, progress: i32) -> StoreResult<()>;

    async fn schedule_task_statuses(&self, job_id: &str) -> StoreResult<Vec<ScheduleTaskStatus>>;

    async fn update_schedule_task_status(
        &self,
        job_id: &str,
        task_id: &str,
        task_version: i64,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool>;

    /// Rerun: point the aggregate row at a fresh version in Waiting,
    /// optionally spending one auto-retry.
    async fn reset_schedule_task(
        &self,
        job_id: &str,
        task_id: &str,
        new_version: i64,
        spend_retry: bool,
    ) -> StoreResult<bool>;

    async fn upsert_task_report(&self, report: &TaskReport) -> StoreResult<()>;

    async fn task_reports(
        &self,
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> StoreResult<Vec<TaskReport>>;

    // Party-side records.

    /// Insert the party job record and its version-0 tasks atomically.
    async fn create_job(&self, job: &Job, tasks: &[Task]) -> StoreResult<()>;

    async fn job(&self, key: &JobKey) -> StoreResult<Option<Job>>;

    /// Transition-guarded status write; stamps started/ended times as a
    /// side effect of entering Running / a terminal status.
    async fn update_job_status(
        &self,
        key: &JobKey,
        src: JobStatus,
        dest: JobStatus,
    ) -> StoreResult<bool>;

    /// Administrative status write bypassing the transition rule; used only
    /// when a rerun revives an ended job on this party.
    async fn force_job_status(&self, key: &JobKey, dest: JobStatus) -> StoreResult<bool>;

    async fn set_job_cancel_signal(&self, key: &JobKey, on: bool) -> StoreResult<bool>;

    async fn set_job_progress(&self, key: &JobKey, progress: i32) -> StoreResult<()>;

    async fn insert_tasks(&self, tasks: &[Task]) -> StoreResult<()>;

    async fn task(&self, key: &TaskKey) -> StoreResult<Option<Task>>;

    /// Latest attempt of every task on one party.
    async fn latest_tasks(
        &self,
        job_id: &str,
        role: &str,
        party_id: &str,
    ) -> StoreResult<Vec<Task>>;

    /// Latest attempt of one task on one party.
    async fn latest_task(
        &self,
        job_id: &str,
        task_id: &str,
        role: &str,
        party_id: &str,
    ) -> StoreResult<Option<Task>>;

    async fn update_task_status(
        &self,
        key: &TaskKey,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool>;

    /// Local execution state write, stamped like [`update_task_status`].
    async fn update_task_party_status(
        &self,
        key: &TaskKey,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool>;

    // Resource accounting. All four are linearizable per pool row and
    // mutate nothing when the guard fails.

    /// Upsert engine totals; remaining capacity shifts by the totals delta.
    async fn register_engine(
        &self,
        engine_type: &str,
        engine_name: &str,
        total_cores: i64,
        total_memory: i64,
    ) -> StoreResult<()>;

    async fn engine(
        &self,
        engine_type: &str,
        engine_name: &str,
    ) -> StoreResult<Option<EngineRegistry>>;

    /// Move the job's quota out of the engine pool and flip
    /// `resource_in_use` on, guarded against double-apply and insufficient
    /// capacity.
    async fn apply_job_resource(&self, key: &JobKey) -> StoreResult<bool>;

    /// Credit the quota back, guarded against over-crediting the pool and
    /// double-return.
    async fn return_job_resource(&self, key: &JobKey) -> StoreResult<bool>;

    /// Hand task cores/memory out of the job's remaining quota.
    async fn apply_task_resource(&self, key: &TaskKey) -> StoreResult<bool>;

    async fn return_task_resource(&self, key: &TaskKey) -> StoreResult<bool>;
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::dag::DagSpec;

    pub fn engine_defaults() -> (i64, i64) {
        (16, 1 << 30)
    }

    pub fn job_fixture(job_id: &str, role: &str, party_id: &str, cores: i64, memory: i64) -> Job {
        let addr = PartyAddr::new(role, party_id);
        Job {
            key: JobKey::new(job_id, &addr),
            dag: DagSpec::default(),
            status: JobStatus::Waiting,
            progress: 0,
            initiator: addr.clone(),
            scheduler_party: addr,
            engine_type: "compute".into(),
            engine_name: "local".into(),
            cores,
            memory,
            remaining_cores: cores,
            remaining_memory: memory,
            resource_in_use: false,
            resource_applied_at: None,
            resource_returned_at: None,
            cancel_signal: false,
            cancel_at: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn task_fixture(
        job_id: &str,
        task_id: &str,
        task_version: i64,
        role: &str,
        party_id: &str,
        cores: i64,
        memory: i64,
    ) -> Task {
        Task {
            key: TaskKey {
                job_id: job_id.into(),
                task_id: task_id.into(),
                task_version,
                role: role.into(),
                party_id: party_id.into(),
            },
            component_ref: "noop".into(),
            status: TaskStatus::Waiting,
            party_status: TaskStatus::Waiting,
            task_cores: cores,
            task_memory: memory,
            resource_in_use: false,
            sync_type: SyncKind::Poll,
            provider: None,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}
