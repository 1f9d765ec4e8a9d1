//! One scheduling pass over a job's tasks.
//!
//! The pass collects per-party task statuses, folds them into federated
//! aggregates, persists and re-broadcasts changes, queues automatic reruns,
//! and dispatches every waiting task whose producers have all succeeded —
//! stopping at the first resource rejection so a contended pool simply
//! defers to the next tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::backends::{ScheduleJob, ScheduleTaskStatus, StateBackend, StoreError};
use crate::dag::SyncKind;
use crate::federation::{Command, FederatedCoordinator};
use crate::graph::{GraphError, TaskGraph};
use crate::parser::ParseError;
use crate::status::{fold_party_statuses, SchedulingStatus, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// What one pass observed and did.
#[derive(Debug, Default)]
pub struct TaskSchedulingOutcome {
    /// A task advanced this pass, or a ready task was deferred only by
    /// resource backpressure. Distinguishes "nothing runnable yet" from
    /// "nothing will ever run".
    pub have_next: bool,
    /// A task settled into an interrupt status with no rerun budget left.
    pub interrupted: bool,
    /// Aggregate status per task after the pass.
    pub statuses: Vec<TaskStatus>,
}

pub struct TaskScheduler {
    backend: Arc<dyn StateBackend>,
    coordinator: Arc<FederatedCoordinator>,
    /// End statuses eligible for automatic rerun.
    auto_rerun_statuses: Vec<TaskStatus>,
}

impl TaskScheduler {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        coordinator: Arc<FederatedCoordinator>,
        auto_rerun_statuses: Vec<TaskStatus>,
    ) -> Self {
        Self {
            backend,
            coordinator,
            auto_rerun_statuses,
        }
    }

    pub async fn schedule(
        &self,
        job: &ScheduleJob,
        graph: &TaskGraph,
        canceled: bool,
    ) -> Result<TaskSchedulingOutcome, SchedulingError> {
        let job_id = job.job_id.as_str();
        let mut rows: BTreeMap<String, ScheduleTaskStatus> = self
            .backend
            .schedule_task_statuses(job_id)
            .await?
            .into_iter()
            .map(|row| (row.task_id.clone(), row))
            .collect();

        let mut outcome = TaskSchedulingOutcome::default();

        // Refresh every unsettled aggregate from the parties.
        let task_ids: Vec<String> = rows.keys().cloned().collect();
        for task_id in &task_ids {
            let row = rows.get(task_id).expect("row present").clone();
            if row.status.is_terminal() {
                continue;
            }
            let Some(federated) = self.federated_status(job_id, &row, graph).await? else {
                continue;
            };
            if federated != row.status {
                let landed = self
                    .backend
                    .update_schedule_task_status(
                        job_id,
                        task_id,
                        row.task_version,
                        row.status,
                        federated,
                    )
                    .await?;
                if landed {
                    info!(
                        job_id,
                        task_id,
                        from = %row.status,
                        to = %federated,
                        "federated task status changed"
                    );
                    let parties = graph.parties_of(task_id)?;
                    self.coordinator
                        .broadcast(
                            parties,
                            &Command::TaskStatusSync {
                                job_id: job_id.to_string(),
                                task_id: task_id.clone(),
                                task_version: row.task_version,
                                status: federated,
                            },
                        )
                        .await;
                    rows.get_mut(task_id).expect("row present").status = federated;
                }
            }

            let current = rows.get(task_id).expect("row present").clone();
            if current.status.is_terminal() && self.auto_rerun_statuses.contains(&current.status) {
                if self.rerun_task(job_id, &current, graph, true).await? {
                    rows.get_mut(task_id).expect("row present").status = TaskStatus::Waiting;
                    rows.get_mut(task_id).expect("row present").task_version =
                        current.task_version + 1;
                    outcome.have_next = true;
                    continue;
                }
            }
            if rows[task_id].status.is_interrupt() {
                outcome.interrupted = true;
            }
        }

        // Dispatch waiting tasks in topological order unless the job is
        // interrupted or being canceled.
        if !outcome.interrupted && !canceled {
            let retry_delay = job
                .dag
                .conf
                .auto_retry_delay_ms
                .map(Duration::milliseconds)
                .unwrap_or_else(Duration::zero);
            for task_id in graph.global_topological_order()? {
                let Some(row) = rows.get(&task_id) else {
                    continue;
                };
                if row.status != TaskStatus::Waiting {
                    continue;
                }
                let deps = graph.dependent_tasks(&task_id)?;
                let ready = deps.iter().all(|dep| {
                    rows.get(dep)
                        .map(|dep_row| dep_row.status.normalized() == TaskStatus::Success)
                        .unwrap_or(false)
                });
                if !ready {
                    continue;
                }
                // Rerun attempts honor the configured delay.
                if row.task_version > 0 && row.updated_at + retry_delay > Utc::now() {
                    outcome.have_next = true;
                    continue;
                }
                match self.start_task(job_id, row, graph).await? {
                    StartResult::Started => {
                        rows.get_mut(&task_id).expect("row present").status =
                            TaskStatus::Running;
                        outcome.have_next = true;
                    }
                    StartResult::NoResource => {
                        // Backpressure: the pool is full, not broken. Leave
                        // the rest of the queue for the next tick.
                        debug!(job_id, task_id = %task_id, "no resource, deferring to next tick");
                        outcome.have_next = true;
                        break;
                    }
                    StartResult::Failed => {
                        rows.get_mut(&task_id).expect("row present").status =
                            TaskStatus::Failed;
                        break;
                    }
                }
            }
        }

        outcome.statuses = rows.values().map(|row| row.status).collect();
        Ok(outcome)
    }

    /// Current federated status of one task, from callback reports or an
    /// active collect, folded across parties. `None` when nothing has been
    /// observed yet.
    async fn federated_status(
        &self,
        job_id: &str,
        row: &ScheduleTaskStatus,
        graph: &TaskGraph,
    ) -> Result<Option<TaskStatus>, SchedulingError> {
        let parties = graph.parties_of(&row.task_id)?;
        let statuses: Vec<TaskStatus> = match row.sync_type {
            SyncKind::Callback => {
                let reports = self
                    .backend
                    .task_reports(job_id, &row.task_id, row.task_version)
                    .await?;
                if reports.is_empty() {
                    return Ok(None);
                }
                // A party that has not reported yet holds the fold at
                // Running; a partial set must never look settled.
                parties
                    .iter()
                    .map(|addr| {
                        reports
                            .iter()
                            .find(|report| {
                                report.role == addr.role && report.party_id == addr.party_id
                            })
                            .map(|report| report.party_status)
                            .unwrap_or(TaskStatus::Running)
                    })
                    .collect()
            }
            SyncKind::Poll => {
                let outcome = self
                    .coordinator
                    .broadcast(
                        parties,
                        &Command::TaskCollect {
                            job_id: job_id.to_string(),
                            task_id: row.task_id.clone(),
                            task_version: row.task_version,
                        },
                    )
                    .await;
                outcome
                    .replies
                    .iter()
                    .map(|(_, reply)| {
                        reply.data["party_status"]
                            .as_str()
                            .and_then(|s| s.parse().ok())
                            // An unreachable party holds the fold at
                            // Running rather than inventing an end status.
                            .unwrap_or(TaskStatus::Running)
                    })
                    .collect()
            }
        };
        if statuses.is_empty() {
            return Ok(None);
        }
        Ok(fold_party_statuses(&statuses))
    }

    /// Queue a fresh attempt of an ended task. Returns whether the new
    /// version was created and the aggregate reset.
    pub async fn rerun_task(
        &self,
        job_id: &str,
        row: &ScheduleTaskStatus,
        graph: &TaskGraph,
        spend_retry: bool,
    ) -> Result<bool, SchedulingError> {
        if spend_retry && row.auto_retries <= 0 {
            return Ok(false);
        }
        let parties = graph.parties_of(&row.task_id)?;
        let new_version = row.task_version + 1;

        // Tell the old attempt to stop; it may still be running on parties
        // that reported late.
        self.coordinator
            .broadcast(
                parties,
                &Command::TaskStop {
                    job_id: job_id.to_string(),
                    task_id: row.task_id.clone(),
                    task_version: row.task_version,
                    stop_status: TaskStatus::Canceled,
                },
            )
            .await;

        let created = self
            .coordinator
            .broadcast(
                parties,
                &Command::TaskCreate {
                    job_id: job_id.to_string(),
                    task_id: row.task_id.clone(),
                    task_version: new_version,
                },
            )
            .await;
        if !created.is_success() {
            warn!(
                job_id,
                task_id = %row.task_id,
                new_version,
                code = %created.code,
                "task rerun creation failed"
            );
            return Ok(false);
        }
        let reset = self
            .backend
            .reset_schedule_task(job_id, &row.task_id, new_version, spend_retry)
            .await?;
        if reset {
            info!(
                job_id,
                task_id = %row.task_id,
                new_version,
                spend_retry,
                "task queued for rerun"
            );
        }
        Ok(reset)
    }

    async fn start_task(
        &self,
        job_id: &str,
        row: &ScheduleTaskStatus,
        graph: &TaskGraph,
    ) -> Result<StartResult, SchedulingError> {
        let parties = graph.parties_of(&row.task_id)?;

        let saga = self
            .coordinator
            .apply_task_resource(parties, job_id, &row.task_id, row.task_version)
            .await;
        if !saga.outcome.is_success() {
            return Ok(StartResult::NoResource);
        }

        let start = self
            .coordinator
            .broadcast(
                parties,
                &Command::TaskStart {
                    job_id: job_id.to_string(),
                    task_id: row.task_id.clone(),
                    task_version: row.task_version,
                },
            )
            .await;
        if !start.is_success() {
            warn!(
                job_id,
                task_id = %row.task_id,
                code = %start.code,
                "task start broadcast failed"
            );
            // Free what the apply reserved, then record the failure.
            self.coordinator
                .broadcast(
                    parties,
                    &Command::TaskResourceReturn {
                        job_id: job_id.to_string(),
                        task_id: row.task_id.clone(),
                        task_version: row.task_version,
                    },
                )
                .await;
            let landed = self
                .backend
                .update_schedule_task_status(
                    job_id,
                    &row.task_id,
                    row.task_version,
                    row.status,
                    TaskStatus::Failed,
                )
                .await?;
            if landed {
                self.coordinator
                    .broadcast(
                        parties,
                        &Command::TaskStatusSync {
                            job_id: job_id.to_string(),
                            task_id: row.task_id.clone(),
                            task_version: row.task_version,
                            status: TaskStatus::Failed,
                        },
                    )
                    .await;
            }
            return Ok(StartResult::Failed);
        }

        let landed = self
            .backend
            .update_schedule_task_status(
                job_id,
                &row.task_id,
                row.task_version,
                row.status,
                TaskStatus::Running,
            )
            .await?;
        if landed {
            info!(job_id, task_id = %row.task_id, version = row.task_version, "task dispatched");
        }
        Ok(StartResult::Started)
    }
}

enum StartResult {
    Started,
    NoResource,
    Failed,
}
