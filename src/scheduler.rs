//! The periodic job scheduling driver.
//!
//! Every tick runs four disjoint passes — waiting, ready-signal, rerun-
//! signal, running — over the scheduler party's job aggregates. Each
//! per-job step is guarded by a non-blocking try-lock: a job already being
//! processed (previous tick still in flight, or a concurrent scheduler
//! instance) is skipped entirely and retried next tick. One job's failure
//! never aborts the tick.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backends::{
    JobSignal, ScheduleJob, ScheduleTaskStatus, StateBackend, StoreError,
};
use crate::components::ComponentRegistry;
use crate::dag::{DagSpec, PartyAddr};
use crate::federation::{Command, FederatedCoordinator};
use crate::parser::{DagParser, ParseError};
use crate::status::{
    aggregate_job_status, FederatedCode, JobStatus, SchedulingStatus, TaskStatus,
};
use crate::task_scheduler::{SchedulingError, TaskScheduler};

/// Non-blocking per-job locks. Held keys are skipped, not waited on.
#[derive(Default)]
pub struct JobLockSet {
    held: Mutex<HashSet<String>>,
}

impl JobLockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, job_id: &str) -> Option<JobLockGuard<'_>> {
        let mut held = self.held.lock().expect("job lock set poisoned");
        if !held.insert(job_id.to_string()) {
            return None;
        }
        Some(JobLockGuard {
            set: self,
            job_id: job_id.to_string(),
        })
    }
}

pub struct JobLockGuard<'a> {
    set: &'a JobLockSet,
    job_id: String,
}

impl Drop for JobLockGuard<'_> {
    fn drop(&mut self) {
        self.set
            .held
            .lock()
            .expect("job lock set poisoned")
            .remove(&self.job_id);
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Jobs pulled per status per tick.
    pub batch_size: i64,
    /// Ready signals older than this are considered abandoned by a crashed
    /// tick and cleared.
    pub ready_stale_after: Duration,
    /// Auto-rerun budget when the job conf does not set one.
    pub default_auto_retries: i32,
    /// End statuses eligible for automatic rerun.
    pub auto_rerun_statuses: Vec<TaskStatus>,
    /// Running jobs older than this are stopped as Timeout unless the job
    /// conf overrides it.
    pub default_job_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1500),
            batch_size: 50,
            ready_stale_after: Duration::from_secs(300),
            default_auto_retries: 0,
            auto_rerun_statuses: vec![TaskStatus::Failed, TaskStatus::Timeout],
            default_job_timeout: Duration::from_secs(72 * 3600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("this party ({0}) is not declared by the job's dag")]
    SchedulerNotParticipating(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job {job_id} creation was rejected by participating parties ({code})")]
    Create {
        job_id: String,
        code: FederatedCode,
        breakdown: Value,
    },
}

#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub job_id: String,
    pub status: JobStatus,
}

/// The scheduling authority for jobs submitted to this party.
pub struct JobScheduler {
    party_id: String,
    backend: Arc<dyn StateBackend>,
    coordinator: Arc<FederatedCoordinator>,
    registry: Arc<ComponentRegistry>,
    tasks: TaskScheduler,
    locks: JobLockSet,
    config: SchedulerConfig,
    instance_id: Uuid,
}

impl JobScheduler {
    pub fn new(
        party_id: impl Into<String>,
        backend: Arc<dyn StateBackend>,
        coordinator: Arc<FederatedCoordinator>,
        registry: Arc<ComponentRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let tasks = TaskScheduler::new(
            backend.clone(),
            coordinator.clone(),
            config.auto_rerun_statuses.clone(),
        );
        Self {
            party_id: party_id.into(),
            backend,
            coordinator,
            registry,
            tasks,
            locks: JobLockSet::new(),
            config,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Accept a job definition, create the aggregates, and fan out
    /// `job.create` to every declared party. Structural errors reject the
    /// submission before any state exists.
    pub async fn submit(
        &self,
        dag: DagSpec,
        job_id: Option<String>,
    ) -> Result<SubmitResult, SubmitError> {
        let job_id = job_id.unwrap_or_else(generate_job_id);
        let graph = DagParser::new(&self.registry).parse(&job_id, &dag)?;
        let initiator = self.own_party(&dag)?;

        let now = Utc::now();
        let auto_retries = dag
            .conf
            .auto_retries
            .unwrap_or(self.config.default_auto_retries);
        let task_rows: Vec<ScheduleTaskStatus> = graph
            .task_names()
            .map(|task_id| ScheduleTaskStatus {
                job_id: job_id.clone(),
                task_id: task_id.to_string(),
                task_version: 0,
                status: TaskStatus::Waiting,
                auto_retries,
                sync_type: dag.conf.sync_type,
                updated_at: now,
            })
            .collect();
        let schedule_job = ScheduleJob {
            job_id: job_id.clone(),
            dag: dag.clone(),
            status: JobStatus::Waiting,
            priority: dag.conf.priority,
            progress: 0,
            initiator: initiator.clone(),
            cancel_signal: false,
            cancel_at: None,
            rerun_signal: false,
            rerun_at: None,
            ready_signal: false,
            ready_at: None,
            created_at: now,
            started_at: None,
            ended_at: None,
        };
        self.backend
            .create_schedule_job(&schedule_job, &task_rows)
            .await?;

        let parties = dag.all_parties();
        let create = Command::JobCreate {
            job_id: job_id.clone(),
            dag,
            initiator: initiator.clone(),
            scheduler_party: initiator,
        };
        let outcome = self.coordinator.broadcast(&parties, &create).await;
        if !outcome.is_success() {
            // Tear down whatever landed before surfacing the failure: stop
            // the created rows and return any resource a party may hold.
            let created: Vec<PartyAddr> = outcome.succeeded().cloned().collect();
            if !created.is_empty() {
                self.coordinator
                    .broadcast(
                        &created,
                        &Command::JobStop {
                            job_id: job_id.clone(),
                            stop_status: JobStatus::Failed,
                        },
                    )
                    .await;
                self.coordinator
                    .broadcast(
                        &created,
                        &Command::JobResourceReturn {
                            job_id: job_id.clone(),
                        },
                    )
                    .await;
            }
            self.backend
                .update_schedule_job_status(&job_id, JobStatus::Waiting, JobStatus::Failed)
                .await?;
            return Err(SubmitError::Create {
                job_id,
                code: outcome.code,
                breakdown: outcome.breakdown(),
            });
        }

        info!(job_id, parties = parties.len(), "job submitted");
        Ok(SubmitResult {
            job_id,
            status: JobStatus::Waiting,
        })
    }

    /// Request cancellation; the flag is observed at the next pass.
    pub async fn stop_job(&self, job_id: &str) -> Result<bool, StoreError> {
        self.backend
            .set_schedule_signal(job_id, JobSignal::Cancel, true)
            .await
    }

    /// Request a rerun of every non-successful task of an ended job.
    pub async fn rerun_job(&self, job_id: &str) -> Result<bool, StoreError> {
        self.backend
            .set_schedule_signal(job_id, JobSignal::Rerun, true)
            .await
    }

    /// One tick: the four passes, each per-job step behind the try-lock.
    pub async fn run_tick(&self) {
        self.waiting_pass().await;
        self.ready_pass().await;
        self.rerun_pass().await;
        self.running_pass().await;
    }

    async fn waiting_pass(&self) {
        let jobs = match self
            .backend
            .schedule_jobs_by_status(JobStatus::Waiting, self.config.batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "failed to list waiting jobs");
                return;
            }
        };
        for job in &jobs {
            let Some(_guard) = self.locks.try_lock(&job.job_id) else {
                debug!(job_id = %job.job_id, "job is locked, skipping");
                continue;
            };
            if let Err(err) = self.schedule_waiting_job(job).await {
                error!(job_id = %job.job_id, error = %err, "waiting pass step failed");
            }
        }
    }

    async fn running_pass(&self) {
        let jobs = match self
            .backend
            .schedule_jobs_by_status(JobStatus::Running, self.config.batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "failed to list running jobs");
                return;
            }
        };
        for job in &jobs {
            let Some(_guard) = self.locks.try_lock(&job.job_id) else {
                debug!(job_id = %job.job_id, "job is locked, skipping");
                continue;
            };
            if let Err(err) = self.schedule_running_job(job).await {
                error!(job_id = %job.job_id, error = %err, "running pass step failed");
            }
        }
    }

    async fn ready_pass(&self) {
        let jobs = match self
            .backend
            .schedule_jobs_with_signal(JobSignal::Ready, self.config.batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "failed to list ready-signal jobs");
                return;
            }
        };
        let stale_after = chrono::Duration::from_std(self.config.ready_stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        for job in jobs {
            let stale = job
                .ready_at
                .map(|at| at + stale_after < Utc::now())
                .unwrap_or(true);
            if !stale {
                continue;
            }
            warn!(job_id = %job.job_id, "clearing stale ready signal");
            if let Err(err) = self
                .backend
                .set_schedule_signal(&job.job_id, JobSignal::Ready, false)
                .await
            {
                error!(job_id = %job.job_id, error = %err, "failed to clear ready signal");
            }
        }
    }

    async fn rerun_pass(&self) {
        let jobs = match self
            .backend
            .schedule_jobs_with_signal(JobSignal::Rerun, self.config.batch_size)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "failed to list rerun-signal jobs");
                return;
            }
        };
        for job in jobs {
            let Some(_guard) = self.locks.try_lock(&job.job_id) else {
                continue;
            };
            if let Err(err) = self.activate_rerun(&job).await {
                error!(job_id = %job.job_id, error = %err, "rerun activation failed");
            }
        }
    }

    async fn schedule_waiting_job(&self, job: &ScheduleJob) -> Result<(), SchedulingError> {
        if job.cancel_signal {
            return self.cancel_job(job).await;
        }
        // Claim the start with the transient ready signal; a concurrent
        // tick that already claimed it wins.
        if !self
            .backend
            .set_schedule_signal(&job.job_id, JobSignal::Ready, true)
            .await?
        {
            debug!(job_id = %job.job_id, "start already claimed");
            return Ok(());
        }
        let result = self.start_waiting_job(job).await;
        self.backend
            .set_schedule_signal(&job.job_id, JobSignal::Ready, false)
            .await?;
        result
    }

    async fn start_waiting_job(&self, job: &ScheduleJob) -> Result<(), SchedulingError> {
        let parties = job.dag.all_parties();
        let saga = self
            .coordinator
            .apply_job_resource(&parties, &job.job_id)
            .await;
        if !saga.outcome.is_success() {
            if saga.outcome.has_error_reply() {
                // A party is broken, not merely busy; fail the job now that
                // the compensating returns ran.
                warn!(
                    job_id = %job.job_id,
                    code = %saga.outcome.code,
                    "job resource apply hit a federated error"
                );
                self.finish_job(job, JobStatus::Failed).await?;
            } else {
                debug!(job_id = %job.job_id, "no resource for job, staying in queue");
            }
            return Ok(());
        }

        let start = self
            .coordinator
            .broadcast(
                &parties,
                &Command::JobStart {
                    job_id: job.job_id.clone(),
                },
            )
            .await;
        if !start.is_success() {
            warn!(job_id = %job.job_id, code = %start.code, "job start broadcast failed");
            self.coordinator
                .broadcast(
                    &parties,
                    &Command::JobResourceReturn {
                        job_id: job.job_id.clone(),
                    },
                )
                .await;
            self.finish_job(job, JobStatus::Failed).await?;
            return Ok(());
        }

        self.backend
            .update_schedule_job_status(&job.job_id, JobStatus::Waiting, JobStatus::Running)
            .await?;
        info!(job_id = %job.job_id, "job is running");
        Ok(())
    }

    async fn schedule_running_job(&self, job: &ScheduleJob) -> Result<(), SchedulingError> {
        if job.cancel_signal {
            return self.cancel_job(job).await;
        }
        if self.timed_out(job) {
            warn!(job_id = %job.job_id, "job exceeded its timeout");
            self.finish_job(job, JobStatus::Timeout).await?;
            return Ok(());
        }

        let graph = DagParser::new(&self.registry).parse(&job.job_id, &job.dag)?;
        let outcome = self.tasks.schedule(job, &graph, false).await?;

        let finished = outcome
            .statuses
            .iter()
            .filter(|status| status.is_terminal())
            .count();
        if !outcome.statuses.is_empty() {
            let progress = (finished * 100 / outcome.statuses.len()) as i32;
            self.backend
                .set_schedule_progress(&job.job_id, progress)
                .await?;
        }

        let Some(next) = aggregate_job_status(&outcome.statuses, outcome.have_next) else {
            return Ok(());
        };
        if next == job.status {
            return Ok(());
        }
        let landed = self
            .backend
            .update_schedule_job_status(&job.job_id, job.status, next)
            .await?;
        if !landed {
            return Ok(());
        }
        info!(job_id = %job.job_id, from = %job.status, to = %next, "job status changed");
        if next.is_terminal() {
            self.finish_remote(job, next).await;
        } else {
            self.coordinator
                .broadcast(
                    &job.dag.all_parties(),
                    &Command::JobStatusSync {
                        job_id: job.job_id.clone(),
                        status: next,
                        force: false,
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn activate_rerun(&self, job: &ScheduleJob) -> Result<(), SchedulingError> {
        if !job.status.is_terminal() {
            debug!(job_id = %job.job_id, status = %job.status, "rerun ignored, job not ended");
            self.backend
                .set_schedule_signal(&job.job_id, JobSignal::Rerun, false)
                .await?;
            return Ok(());
        }
        let graph = DagParser::new(&self.registry).parse(&job.job_id, &job.dag)?;
        let mut revived = 0usize;
        for row in self.backend.schedule_task_statuses(&job.job_id).await? {
            if row.status.normalized() == TaskStatus::Success {
                continue;
            }
            if self.tasks.rerun_task(&job.job_id, &row, &graph, false).await? {
                revived += 1;
            }
        }
        if revived > 0 {
            self.backend
                .force_schedule_job_status(&job.job_id, JobStatus::Waiting)
                .await?;
            self.coordinator
                .broadcast(
                    &job.dag.all_parties(),
                    &Command::JobStatusSync {
                        job_id: job.job_id.clone(),
                        status: JobStatus::Waiting,
                        force: true,
                    },
                )
                .await;
            info!(job_id = %job.job_id, tasks = revived, "job queued for rerun");
        }
        self.backend
            .set_schedule_signal(&job.job_id, JobSignal::Rerun, false)
            .await?;
        Ok(())
    }

    async fn cancel_job(&self, job: &ScheduleJob) -> Result<(), SchedulingError> {
        info!(job_id = %job.job_id, "cancel signal observed");
        self.finish_job(job, JobStatus::Canceled).await?;
        self.backend
            .set_schedule_signal(&job.job_id, JobSignal::Cancel, false)
            .await?;
        Ok(())
    }

    /// Drive the aggregate to `end_status` and finish on every party.
    async fn finish_job(
        &self,
        job: &ScheduleJob,
        end_status: JobStatus,
    ) -> Result<(), SchedulingError> {
        let landed = self
            .backend
            .update_schedule_job_status(&job.job_id, job.status, end_status)
            .await?;
        if landed {
            self.finish_remote(job, end_status).await;
        }
        Ok(())
    }

    async fn finish_remote(&self, job: &ScheduleJob, end_status: JobStatus) {
        let parties = job.dag.all_parties();
        if end_status == JobStatus::Success {
            // Parties return their grant when the terminal sync lands.
            self.coordinator
                .broadcast(
                    &parties,
                    &Command::JobStatusSync {
                        job_id: job.job_id.clone(),
                        status: end_status,
                        force: false,
                    },
                )
                .await;
        } else {
            // Stop halts straggling tasks and returns resources.
            self.coordinator
                .broadcast(
                    &parties,
                    &Command::JobStop {
                        job_id: job.job_id.clone(),
                        stop_status: end_status,
                    },
                )
                .await;
        }
        info!(job_id = %job.job_id, status = %end_status, "job finished");
    }

    fn timed_out(&self, job: &ScheduleJob) -> bool {
        let timeout = job
            .dag
            .conf
            .timeout_ms
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
            .unwrap_or(self.config.default_job_timeout);
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        let started = job.started_at.unwrap_or(job.created_at);
        started + timeout < Utc::now()
    }

    fn own_party(&self, dag: &DagSpec) -> Result<PartyAddr, SubmitError> {
        dag.parties
            .iter()
            .find(|decl| decl.party_ids.iter().any(|id| id == &self.party_id))
            .map(|decl| PartyAddr::new(decl.role.clone(), self.party_id.clone()))
            .ok_or_else(|| SubmitError::SchedulerNotParticipating(self.party_id.clone()))
    }
}

fn generate_job_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{stamp}{suffix:06}")
}

/// Running scheduler loop, shut down through the watch channel.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.trigger_shutdown();
        if let Err(err) = self.handle.await {
            error!(error = %err, "scheduler task panicked");
        }
    }
}

/// Start the fixed-interval scheduling loop.
pub fn spawn_scheduler(scheduler: Arc<JobScheduler>) -> SchedulerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        info!(
            instance_id = %scheduler.instance_id(),
            tick_ms = scheduler.config.tick_interval.as_millis() as u64,
            "scheduler loop started"
        );
        let mut ticker = interval(scheduler.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    scheduler.run_tick().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler loop stopped");
    });
    SchedulerHandle {
        shutdown_tx,
        handle,
    }
}
