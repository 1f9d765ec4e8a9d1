//! Party-side execution of federated commands.
//!
//! One `PartyController` serves a party instance across every role it
//! fills. Each handler works against the local durable store and replies
//! with a `{code, message, data}` envelope; application problems become
//! reply codes, never transport failures.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backends::{Job, JobKey, StateBackend, StoreResult, Task, TaskKey, TaskReport};
use crate::components::{ComponentRegistry, StatusSink, TaskRunContext};
use crate::dag::{DagSpec, PartyAddr, SyncKind};
use crate::federation::{Command, PartyReply};
use crate::graph::TaskNode;
use crate::parser::DagParser;
use crate::resources::ResourceManager;
use crate::status::{JobStatus, SchedulingStatus, TaskStatus};
use crate::transport::{CommandHandler, PartyTransport};

pub struct PartyController {
    party_id: String,
    backend: Arc<dyn StateBackend>,
    registry: Arc<ComponentRegistry>,
    resources: Arc<ResourceManager>,
    transport: Arc<dyn PartyTransport>,
}

impl PartyController {
    pub fn new(
        party_id: impl Into<String>,
        backend: Arc<dyn StateBackend>,
        registry: Arc<ComponentRegistry>,
        resources: Arc<ResourceManager>,
        transport: Arc<dyn PartyTransport>,
    ) -> Self {
        Self {
            party_id: party_id.into(),
            backend,
            registry,
            resources,
            transport,
        }
    }

    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    async fn create_job(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        dag: &DagSpec,
        initiator: &PartyAddr,
        scheduler_party: &PartyAddr,
    ) -> StoreResult<PartyReply> {
        let key = JobKey::new(job_id, dest);
        if self.backend.job(&key).await?.is_some() {
            return Ok(PartyReply::not_effective("job already created"));
        }
        let graph = match DagParser::new(&self.registry).parse(job_id, dag) {
            Ok(graph) => graph,
            Err(err) => return Ok(PartyReply::failed(format!("invalid dag: {err}"))),
        };

        let quota = self.resources.job_quota(&dag.conf, &dest.role);
        let task_quota = self.resources.task_quota(&dag.conf, &dest.role);
        let settings = self.resources.settings();
        let now = Utc::now();
        let job = Job {
            key: key.clone(),
            dag: dag.clone(),
            status: JobStatus::Waiting,
            progress: 0,
            initiator: initiator.clone(),
            scheduler_party: scheduler_party.clone(),
            engine_type: settings.engine_type.clone(),
            engine_name: settings.engine_name.clone(),
            cores: quota.cores,
            memory: quota.memory,
            remaining_cores: quota.cores,
            remaining_memory: quota.memory,
            resource_in_use: false,
            resource_applied_at: None,
            resource_returned_at: None,
            cancel_signal: false,
            cancel_at: None,
            created_at: now,
            started_at: None,
            ended_at: None,
        };

        let tasks: Vec<Task> = graph
            .view(dest)
            .map(|view| {
                view.nodes
                    .values()
                    .map(|node| Task {
                        key: TaskKey {
                            job_id: job_id.to_string(),
                            task_id: node.name.clone(),
                            task_version: 0,
                            role: dest.role.clone(),
                            party_id: dest.party_id.clone(),
                        },
                        component_ref: node.component_ref.clone(),
                        status: TaskStatus::Waiting,
                        party_status: TaskStatus::Waiting,
                        task_cores: task_quota.cores,
                        task_memory: task_quota.memory,
                        resource_in_use: false,
                        sync_type: dag.conf.sync_type,
                        provider: None,
                        worker_id: None,
                        created_at: now,
                        started_at: None,
                        ended_at: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let task_count = tasks.len();
        self.backend.create_job(&job, &tasks).await?;
        info!(job = %key, tasks = task_count, "job created");
        Ok(PartyReply::success(json!({ "task_count": task_count })))
    }

    async fn start_job(&self, dest: &PartyAddr, job_id: &str) -> StoreResult<PartyReply> {
        let key = JobKey::new(job_id, dest);
        let Some(job) = self.backend.job(&key).await? else {
            return Ok(PartyReply::failed("unknown job"));
        };
        if self
            .backend
            .update_job_status(&key, job.status, JobStatus::Running)
            .await?
        {
            info!(job = %key, "job started");
            Ok(PartyReply::success(json!({ "status": JobStatus::Running })))
        } else {
            Ok(PartyReply::not_effective(format!(
                "job is {}, start had no effect",
                job.status
            )))
        }
    }

    async fn stop_job(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        stop_status: JobStatus,
    ) -> StoreResult<PartyReply> {
        let key = JobKey::new(job_id, dest);
        let Some(job) = self.backend.job(&key).await? else {
            return Ok(PartyReply::failed("unknown job"));
        };
        self.backend.set_job_cancel_signal(&key, true).await?;

        let task_stop = task_stop_status(stop_status);
        let mut stopped = 0usize;
        for task in self
            .backend
            .latest_tasks(job_id, &dest.role, &dest.party_id)
            .await?
        {
            if task.party_status.is_terminal() {
                continue;
            }
            if let Ok(runner) = self.registry.runner(&task.component_ref) {
                if let Err(err) = runner.halt(&task.key).await {
                    warn!(task = %task.key, error = %err, "runner halt failed");
                }
            }
            if self
                .backend
                .update_task_party_status(&task.key, task.party_status, task_stop)
                .await?
            {
                stopped += 1;
            }
            self.backend
                .update_task_status(&task.key, task.status, task_stop)
                .await?;
            if task.resource_in_use {
                self.resources.return_task(&task.key).await?;
            }
        }

        if job.resource_in_use {
            self.resources.return_job(&key).await?;
        }
        let job_transitioned = self
            .backend
            .update_job_status(&key, job.status, stop_status)
            .await?;

        if job_transitioned || stopped > 0 {
            info!(job = %key, status = %stop_status, stopped, "job stopped");
            Ok(PartyReply::success(json!({ "stopped_tasks": stopped })))
        } else {
            Ok(PartyReply::not_effective("job already ended"))
        }
    }

    async fn sync_job_status(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        status: JobStatus,
        force: bool,
    ) -> StoreResult<PartyReply> {
        let key = JobKey::new(job_id, dest);
        let Some(job) = self.backend.job(&key).await? else {
            return Ok(PartyReply::failed("unknown job"));
        };
        let landed = if force {
            self.backend.force_job_status(&key, status).await?
        } else {
            self.backend
                .update_job_status(&key, job.status, status)
                .await?
        };
        if landed && status.is_terminal() && job.resource_in_use {
            // Reaching an end status returns the job grant exactly once;
            // the in-use guard makes a racing stop harmless.
            self.resources.return_job(&key).await?;
        }
        if landed {
            debug!(job = %key, status = %status, "job status synced");
            Ok(PartyReply::success(json!({ "status": status })))
        } else {
            Ok(PartyReply::not_effective("stale job status"))
        }
    }

    async fn apply_job_resource(&self, dest: &PartyAddr, job_id: &str) -> StoreResult<PartyReply> {
        let key = JobKey::new(job_id, dest);
        if self.backend.job(&key).await?.is_none() {
            return Ok(PartyReply::failed("unknown job"));
        }
        if self.resources.apply_job(&key).await? {
            Ok(PartyReply::success(json!({})))
        } else {
            Ok(PartyReply::failed("no available resource"))
        }
    }

    async fn return_job_resource(&self, dest: &PartyAddr, job_id: &str) -> StoreResult<PartyReply> {
        let key = JobKey::new(job_id, dest);
        if self.backend.job(&key).await?.is_none() {
            return Ok(PartyReply::failed("unknown job"));
        }
        if self.resources.return_job(&key).await? {
            Ok(PartyReply::success(json!({})))
        } else {
            Ok(PartyReply::not_effective("no resource in use"))
        }
    }

    async fn create_task(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> StoreResult<PartyReply> {
        let key = JobKey::new(job_id, dest);
        let Some(job) = self.backend.job(&key).await? else {
            return Ok(PartyReply::failed("unknown job"));
        };
        let task_key = TaskKey {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version,
            role: dest.role.clone(),
            party_id: dest.party_id.clone(),
        };
        if self.backend.task(&task_key).await?.is_some() {
            return Ok(PartyReply::not_effective("task version already exists"));
        }
        let Some(spec) = job.dag.tasks.get(task_id) else {
            return Ok(PartyReply::failed("task is not part of the job dag"));
        };
        let task_quota = self.resources.task_quota(&job.dag.conf, &dest.role);
        let task = Task {
            key: task_key.clone(),
            component_ref: spec.component_ref.clone(),
            status: TaskStatus::Waiting,
            party_status: TaskStatus::Waiting,
            task_cores: task_quota.cores,
            task_memory: task_quota.memory,
            resource_in_use: false,
            sync_type: job.dag.conf.sync_type,
            provider: None,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        self.backend.insert_tasks(&[task]).await?;
        info!(task = %task_key, "task version created");
        Ok(PartyReply::success(json!({})))
    }

    async fn start_task(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> StoreResult<PartyReply> {
        let task_key = TaskKey {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version,
            role: dest.role.clone(),
            party_id: dest.party_id.clone(),
        };
        let Some(task) = self.backend.task(&task_key).await? else {
            return Ok(PartyReply::failed("unknown task"));
        };
        let Some(job) = self.backend.job(&task_key.job_key()).await? else {
            return Ok(PartyReply::failed("unknown job"));
        };
        if task.party_status != TaskStatus::Waiting {
            return Ok(PartyReply::not_effective(format!(
                "task is {}, start had no effect",
                task.party_status
            )));
        }

        let node = match self.task_node(&job.dag, job_id, dest, task_id) {
            Ok(node) => node,
            Err(message) => return Ok(PartyReply::failed(message)),
        };
        let runner = match self.registry.runner(&node.component_ref) {
            Ok(runner) => runner,
            Err(err) => {
                self.backend
                    .update_task_party_status(&task_key, task.party_status, TaskStatus::Failed)
                    .await?;
                return Ok(PartyReply::failed(err.to_string()));
            }
        };

        self.backend
            .update_task_party_status(&task_key, TaskStatus::Waiting, TaskStatus::Running)
            .await?;
        self.backend
            .update_task_status(&task_key, task.status, TaskStatus::Running)
            .await?;

        let ctx = TaskRunContext {
            key: task_key.clone(),
            component_ref: node.component_ref.clone(),
            stage: node.stage.clone(),
            parameters: node.parameters.clone(),
            conf: node.conf.clone(),
            inputs: node.inputs.clone(),
            output_uris: output_uris(dest, &task_key, &node),
            sink: Arc::new(self.reporter(&job, task.sync_type)),
        };
        if let Err(err) = runner.launch(ctx).await {
            warn!(task = %task_key, error = %err, "runner launch failed");
            self.backend
                .update_task_party_status(&task_key, TaskStatus::Running, TaskStatus::Failed)
                .await?;
            return Ok(PartyReply::failed(format!("launch failed: {err}")));
        }
        info!(task = %task_key, component = %node.component_ref, "task started");
        Ok(PartyReply::success(json!({})))
    }

    async fn stop_task(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        task_id: &str,
        task_version: i64,
        stop_status: TaskStatus,
    ) -> StoreResult<PartyReply> {
        let task_key = TaskKey {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version,
            role: dest.role.clone(),
            party_id: dest.party_id.clone(),
        };
        let Some(task) = self.backend.task(&task_key).await? else {
            return Ok(PartyReply::failed("unknown task"));
        };
        if task.party_status.is_terminal() {
            return Ok(PartyReply::not_effective("task already ended"));
        }
        if let Ok(runner) = self.registry.runner(&task.component_ref) {
            if let Err(err) = runner.halt(&task_key).await {
                warn!(task = %task_key, error = %err, "runner halt failed");
            }
        }
        self.backend
            .update_task_party_status(&task_key, task.party_status, stop_status)
            .await?;
        self.backend
            .update_task_status(&task_key, task.status, stop_status)
            .await?;
        if task.resource_in_use {
            self.resources.return_task(&task_key).await?;
        }
        info!(task = %task_key, status = %stop_status, "task stopped");
        Ok(PartyReply::success(json!({})))
    }

    async fn sync_task_status(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        task_id: &str,
        task_version: i64,
        status: TaskStatus,
    ) -> StoreResult<PartyReply> {
        let task_key = TaskKey {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version,
            role: dest.role.clone(),
            party_id: dest.party_id.clone(),
        };
        let Some(task) = self.backend.task(&task_key).await? else {
            return Ok(PartyReply::failed("unknown task"));
        };
        if self
            .backend
            .update_task_status(&task_key, task.status, status)
            .await?
        {
            Ok(PartyReply::success(json!({ "status": status })))
        } else {
            Ok(PartyReply::not_effective("stale task status"))
        }
    }

    async fn apply_task_resource(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> StoreResult<PartyReply> {
        let task_key = TaskKey {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version,
            role: dest.role.clone(),
            party_id: dest.party_id.clone(),
        };
        if self.backend.task(&task_key).await?.is_none() {
            return Ok(PartyReply::failed("unknown task"));
        }
        if self.resources.apply_task(&task_key).await? {
            Ok(PartyReply::success(json!({})))
        } else {
            Ok(PartyReply::failed("no available resource"))
        }
    }

    async fn return_task_resource(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> StoreResult<PartyReply> {
        let task_key = TaskKey {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version,
            role: dest.role.clone(),
            party_id: dest.party_id.clone(),
        };
        if self.backend.task(&task_key).await?.is_none() {
            return Ok(PartyReply::failed("unknown task"));
        }
        if self.resources.return_task(&task_key).await? {
            Ok(PartyReply::success(json!({})))
        } else {
            Ok(PartyReply::not_effective("no resource in use"))
        }
    }

    async fn collect_task(
        &self,
        dest: &PartyAddr,
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> StoreResult<PartyReply> {
        let task_key = TaskKey {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version,
            role: dest.role.clone(),
            party_id: dest.party_id.clone(),
        };
        let Some(task) = self.backend.task(&task_key).await? else {
            return Ok(PartyReply::failed("unknown task"));
        };
        Ok(PartyReply::success(json!({
            "party_status": task.party_status,
        })))
    }

    /// Scheduler-side sink for callback-mode pushes.
    async fn record_task_report(
        &self,
        job_id: &str,
        task_id: &str,
        task_version: i64,
        party: &PartyAddr,
        party_status: TaskStatus,
    ) -> StoreResult<PartyReply> {
        self.backend
            .upsert_task_report(&TaskReport {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
                task_version,
                role: party.role.clone(),
                party_id: party.party_id.clone(),
                party_status,
                reported_at: Utc::now(),
            })
            .await?;
        Ok(PartyReply::success(json!({})))
    }

    /// Apply a local execution-state change, as the component runner's sink
    /// does. Public so out-of-process executors (and tests) can feed
    /// results in.
    pub async fn report_task(&self, key: &TaskKey, status: TaskStatus) -> StoreResult<()> {
        let Some(task) = self.backend.task(key).await? else {
            return Ok(());
        };
        let Some(job) = self.backend.job(&key.job_key()).await? else {
            return Ok(());
        };
        self.reporter(&job, task.sync_type).apply(key, status).await
    }

    fn reporter(&self, job: &Job, sync_type: SyncKind) -> PartyReporter {
        PartyReporter {
            backend: self.backend.clone(),
            resources: self.resources.clone(),
            transport: self.transport.clone(),
            scheduler_party: job.scheduler_party.clone(),
            sync_type,
        }
    }

    fn task_node(
        &self,
        dag: &DagSpec,
        job_id: &str,
        dest: &PartyAddr,
        task_id: &str,
    ) -> Result<TaskNode, String> {
        let graph = DagParser::new(&self.registry)
            .parse(job_id, dag)
            .map_err(|err| format!("invalid dag: {err}"))?;
        graph
            .view(dest)
            .and_then(|view| view.node(task_id))
            .cloned()
            .ok_or_else(|| format!("task {task_id:?} is not applicable to {dest}"))
    }
}

#[async_trait]
impl CommandHandler for PartyController {
    async fn handle(&self, dest: &PartyAddr, command: &Command) -> PartyReply {
        let result = match command {
            Command::JobCreate {
                job_id,
                dag,
                initiator,
                scheduler_party,
            } => {
                self.create_job(dest, job_id, dag, initiator, scheduler_party)
                    .await
            }
            Command::JobStart { job_id } => self.start_job(dest, job_id).await,
            Command::JobStop {
                job_id,
                stop_status,
            } => self.stop_job(dest, job_id, *stop_status).await,
            Command::JobStatusSync {
                job_id,
                status,
                force,
            } => self.sync_job_status(dest, job_id, *status, *force).await,
            Command::JobResourceApply { job_id } => self.apply_job_resource(dest, job_id).await,
            Command::JobResourceReturn { job_id } => self.return_job_resource(dest, job_id).await,
            Command::TaskCreate {
                job_id,
                task_id,
                task_version,
            } => self.create_task(dest, job_id, task_id, *task_version).await,
            Command::TaskStart {
                job_id,
                task_id,
                task_version,
            } => self.start_task(dest, job_id, task_id, *task_version).await,
            Command::TaskStop {
                job_id,
                task_id,
                task_version,
                stop_status,
            } => {
                self.stop_task(dest, job_id, task_id, *task_version, *stop_status)
                    .await
            }
            Command::TaskStatusSync {
                job_id,
                task_id,
                task_version,
                status,
            } => {
                self.sync_task_status(dest, job_id, task_id, *task_version, *status)
                    .await
            }
            Command::TaskResourceApply {
                job_id,
                task_id,
                task_version,
            } => {
                self.apply_task_resource(dest, job_id, task_id, *task_version)
                    .await
            }
            Command::TaskResourceReturn {
                job_id,
                task_id,
                task_version,
            } => {
                self.return_task_resource(dest, job_id, task_id, *task_version)
                    .await
            }
            Command::TaskCollect {
                job_id,
                task_id,
                task_version,
            } => self.collect_task(dest, job_id, task_id, *task_version).await,
            Command::TaskReport {
                job_id,
                task_id,
                task_version,
                party,
                party_status,
            } => {
                self.record_task_report(job_id, task_id, *task_version, party, *party_status)
                    .await
            }
        };
        match result {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    op = command.op(),
                    job_id = command.job_id(),
                    party = %dest,
                    error = %err,
                    "command handler failed"
                );
                PartyReply::error(err.to_string())
            }
        }
    }
}

/// Applies runner status reports: local state, task resource return on end,
/// progress, and the callback push to the scheduler.
pub struct PartyReporter {
    backend: Arc<dyn StateBackend>,
    resources: Arc<ResourceManager>,
    transport: Arc<dyn PartyTransport>,
    scheduler_party: PartyAddr,
    sync_type: SyncKind,
}

impl PartyReporter {
    async fn apply(&self, key: &TaskKey, status: TaskStatus) -> StoreResult<()> {
        let Some(task) = self.backend.task(key).await? else {
            return Ok(());
        };
        let landed = self
            .backend
            .update_task_party_status(key, task.party_status, status)
            .await?;
        if !landed {
            debug!(task = %key, status = %status, "stale runner report ignored");
            return Ok(());
        }
        if status.is_terminal() {
            if task.resource_in_use {
                self.resources.return_task(key).await?;
            }
            self.update_progress(key).await?;
        }
        if self.sync_type == SyncKind::Callback {
            let report = Command::TaskReport {
                job_id: key.job_id.clone(),
                task_id: key.task_id.clone(),
                task_version: key.task_version,
                party: key.addr(),
                party_status: status,
            };
            if let Err(err) = self.transport.send(&self.scheduler_party, &report).await {
                // The scheduler will fall back to collect on its next pass.
                warn!(task = %key, error = %err, "status callback failed");
            }
        }
        Ok(())
    }

    async fn update_progress(&self, key: &TaskKey) -> StoreResult<()> {
        let tasks = self
            .backend
            .latest_tasks(&key.job_id, &key.role, &key.party_id)
            .await?;
        if tasks.is_empty() {
            return Ok(());
        }
        let finished = tasks
            .iter()
            .filter(|task| task.party_status.is_terminal())
            .count();
        let progress = (finished * 100 / tasks.len()) as i32;
        self.backend.set_job_progress(&key.job_key(), progress).await
    }
}

#[async_trait]
impl StatusSink for PartyReporter {
    async fn report(&self, key: &TaskKey, status: TaskStatus) {
        if let Err(err) = self.apply(key, status).await {
            warn!(task = %key, error = %err, "failed to record runner report");
        }
    }
}

fn task_stop_status(stop: JobStatus) -> TaskStatus {
    match stop {
        JobStatus::Canceled => TaskStatus::Canceled,
        JobStatus::Timeout => TaskStatus::Timeout,
        _ => TaskStatus::Failed,
    }
}

fn output_uris(
    dest: &PartyAddr,
    key: &TaskKey,
    node: &TaskNode,
) -> BTreeMap<String, String> {
    node.outputs
        .keys()
        .map(|output| {
            (
                output.clone(),
                format!(
                    "fedflow://{}/{}/{}/{}/v{}/{}",
                    dest.role, dest.party_id, key.job_id, key.task_id, key.task_version, output
                ),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::components::{ComponentMeta, NoopRunner};
    use crate::resources::{ResourceManager, ResourceSettings};
    use crate::transport::LocalTransport;
    use serde_json::json;

    fn registry() -> Arc<ComponentRegistry> {
        let mut registry = ComponentRegistry::new();
        registry.register(
            ComponentMeta {
                name: "reader".into(),
                supported_roles: vec!["guest".into()],
                input_artifacts: vec![],
                output_artifacts: vec!["output_data".into()],
            },
            Arc::new(NoopRunner),
        );
        Arc::new(registry)
    }

    fn spec() -> DagSpec {
        serde_json::from_value(json!({
            "parties": [{"role": "guest", "party_ids": ["9999"]}],
            "tasks": {"reader_0": {"component_ref": "reader"}}
        }))
        .unwrap()
    }

    fn controller() -> Arc<PartyController> {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let resources = Arc::new(ResourceManager::new(
            backend.clone(),
            ResourceSettings::default(),
        ));
        Arc::new(PartyController::new(
            "9999",
            backend,
            registry(),
            resources,
            Arc::new(LocalTransport::new()),
        ))
    }

    fn guest() -> PartyAddr {
        PartyAddr::new("guest", "9999")
    }

    #[tokio::test]
    async fn create_job_is_idempotent() {
        let controller = controller();
        let create = Command::JobCreate {
            job_id: "j-1".into(),
            dag: spec(),
            initiator: guest(),
            scheduler_party: guest(),
        };
        let first = controller.handle(&guest(), &create).await;
        assert_eq!(first.code, crate::status::ReplyCode::Success);
        assert_eq!(first.data["task_count"], json!(1));

        let second = controller.handle(&guest(), &create).await;
        assert_eq!(second.code, crate::status::ReplyCode::NotEffective);
    }

    #[tokio::test]
    async fn noop_runner_drives_task_to_success() {
        let controller = controller();
        let create = Command::JobCreate {
            job_id: "j-1".into(),
            dag: spec(),
            initiator: guest(),
            scheduler_party: guest(),
        };
        controller.handle(&guest(), &create).await;

        let start = Command::TaskStart {
            job_id: "j-1".into(),
            task_id: "reader_0".into(),
            task_version: 0,
        };
        let reply = controller.handle(&guest(), &start).await;
        assert_eq!(reply.code, crate::status::ReplyCode::Success);

        let collect = Command::TaskCollect {
            job_id: "j-1".into(),
            task_id: "reader_0".into(),
            task_version: 0,
        };
        let reply = controller.handle(&guest(), &collect).await;
        assert_eq!(reply.data["party_status"], json!("success"));
    }

    #[tokio::test]
    async fn stop_job_halts_live_tasks_and_replies_not_effective_when_done() {
        let controller = controller();
        let create = Command::JobCreate {
            job_id: "j-1".into(),
            dag: spec(),
            initiator: guest(),
            scheduler_party: guest(),
        };
        controller.handle(&guest(), &create).await;

        let stop = Command::JobStop {
            job_id: "j-1".into(),
            stop_status: JobStatus::Canceled,
        };
        let first = controller.handle(&guest(), &stop).await;
        assert_eq!(first.code, crate::status::ReplyCode::Success);

        let second = controller.handle(&guest(), &stop).await;
        assert_eq!(second.code, crate::status::ReplyCode::NotEffective);
    }
}
