//! End-to-end scheduling scenarios on an in-process multi-party cluster.
//!
//! Every party runs its own memory backend, resource manager, and
//! controller, wired together through the local transport; the scheduler
//! party additionally runs the job scheduler. Ticks are driven manually so
//! each scenario asserts pass-by-pass behavior.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use fedflow::backends::{JobKey, StateBackend, TaskKey};
use fedflow::components::{
    ComponentMeta, ComponentRegistry, ComponentRunner, RunnerError, TaskRunContext,
};
use fedflow::controller::PartyController;
use fedflow::dag::DagSpec;
use fedflow::federation::FederatedCoordinator;
use fedflow::resources::{ResourceManager, ResourceSettings};
use fedflow::scheduler::{JobScheduler, SchedulerConfig, SubmitError};
use fedflow::status::{JobStatus, TaskStatus};
use fedflow::transport::{LocalTransport, PartyTransport};
use fedflow::PartyAddr;

/// Keeps the task running until the test reports a result.
struct HoldRunner;

#[async_trait]
impl ComponentRunner for HoldRunner {
    async fn launch(&self, _ctx: TaskRunContext) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn halt(&self, _key: &TaskKey) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Reports immediate failure.
struct FailRunner;

#[async_trait]
impl ComponentRunner for FailRunner {
    async fn launch(&self, ctx: TaskRunContext) -> Result<(), RunnerError> {
        ctx.sink.report(&ctx.key, TaskStatus::Failed).await;
        Ok(())
    }

    async fn halt(&self, _key: &TaskKey) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Reports immediate success.
struct InstantRunner;

#[async_trait]
impl ComponentRunner for InstantRunner {
    async fn launch(&self, ctx: TaskRunContext) -> Result<(), RunnerError> {
        ctx.sink.report(&ctx.key, TaskStatus::Success).await;
        Ok(())
    }

    async fn halt(&self, _key: &TaskKey) -> Result<(), RunnerError> {
        Ok(())
    }
}

fn registry_with(runner: Arc<dyn ComponentRunner>) -> Arc<ComponentRegistry> {
    let mut registry = ComponentRegistry::new();
    registry.register(
        ComponentMeta {
            name: "step".into(),
            supported_roles: vec!["guest".into(), "host".into()],
            input_artifacts: vec!["input_data".into()],
            output_artifacts: vec!["output_data".into()],
        },
        runner,
    );
    Arc::new(registry)
}

struct Cluster {
    transport: Arc<LocalTransport>,
    scheduler: Arc<JobScheduler>,
    controllers: HashMap<String, Arc<PartyController>>,
    backends: HashMap<String, Arc<dyn StateBackend>>,
}

impl Cluster {
    /// Build a cluster; each entry is `(party_id, engine_cores)`. The first
    /// party is the scheduling authority.
    async fn new(
        parties: &[(&str, i64)],
        registry: Arc<ComponentRegistry>,
        config: SchedulerConfig,
    ) -> Cluster {
        let transport = Arc::new(LocalTransport::new());
        let coordinator = Arc::new(FederatedCoordinator::new(transport.clone(), false));

        let mut controllers = HashMap::new();
        let mut backends: HashMap<String, Arc<dyn StateBackend>> = HashMap::new();
        for (party_id, cores) in parties {
            let backend: Arc<dyn StateBackend> = Arc::new(fedflow::MemoryBackend::new());
            backend
                .register_engine("compute", "standalone", *cores, 1 << 30)
                .await
                .unwrap();
            let resources = Arc::new(ResourceManager::new(
                backend.clone(),
                ResourceSettings {
                    task_cores: 2,
                    task_memory: 0,
                    ..ResourceSettings::default()
                },
            ));
            let controller = Arc::new(PartyController::new(
                *party_id,
                backend.clone(),
                registry.clone(),
                resources,
                transport.clone(),
            ));
            transport.register(*party_id, controller.clone());
            controllers.insert(party_id.to_string(), controller);
            backends.insert(party_id.to_string(), backend);
        }

        let scheduler_party = parties[0].0;
        let scheduler = Arc::new(JobScheduler::new(
            scheduler_party,
            backends[scheduler_party].clone(),
            coordinator,
            registry,
            config,
        ));
        Cluster {
            transport,
            scheduler,
            controllers,
            backends,
        }
    }

    fn backend(&self, party_id: &str) -> &Arc<dyn StateBackend> {
        &self.backends[party_id]
    }

    async fn tick(&self) {
        self.scheduler.run_tick().await;
    }

    async fn ticks(&self, n: usize) {
        for _ in 0..n {
            self.tick().await;
        }
    }

    async fn job_status(&self, party_id: &str, job_id: &str) -> JobStatus {
        self.backend(party_id)
            .schedule_job(job_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn task_statuses(&self, party_id: &str, job_id: &str) -> HashMap<String, TaskStatus> {
        self.backend(party_id)
            .schedule_task_statuses(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|row| (row.task_id, row.status))
            .collect()
    }

    async fn report(&self, party_id: &str, job_id: &str, task_id: &str, status: TaskStatus) {
        let controller = &self.controllers[party_id];
        let role = "guest";
        let key = TaskKey {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version: latest_version(self.backend(party_id), job_id, task_id, role, party_id)
                .await,
            role: role.to_string(),
            party_id: party_id.to_string(),
        };
        controller.report_task(&key, status).await.unwrap();
    }

    async fn engine_remaining(&self, party_id: &str) -> (i64, i64) {
        let engine = self
            .backend(party_id)
            .engine("compute", "standalone")
            .await
            .unwrap()
            .unwrap();
        (engine.remaining_cores, engine.total_cores)
    }
}

async fn latest_version(
    backend: &Arc<dyn StateBackend>,
    job_id: &str,
    task_id: &str,
    role: &str,
    party_id: &str,
) -> i64 {
    backend
        .latest_task(job_id, task_id, role, party_id)
        .await
        .unwrap()
        .map(|task| task.key.task_version)
        .unwrap_or(0)
}

fn chain_dag(party_ids: &[&str]) -> DagSpec {
    serde_json::from_value(json!({
        "parties": [{"role": "guest", "party_ids": party_ids}],
        "tasks": {
            "a": {"component_ref": "step"},
            "b": {"component_ref": "step", "inputs": {
                "input_data": {"task_output": {"producer_task": "a", "output_key": "output_data"}}
            }},
            "c": {"component_ref": "step", "inputs": {
                "input_data": {"task_output": {"producer_task": "b", "output_key": "output_data"}}
            }},
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn chain_dispatches_in_dependency_order() {
    let cluster = Cluster::new(
        &[("9999", 16)],
        registry_with(Arc::new(HoldRunner)),
        SchedulerConfig::default(),
    )
    .await;
    let result = cluster
        .scheduler
        .submit(chain_dag(&["9999"]), Some("j-chain".into()))
        .await
        .unwrap();
    assert_eq!(result.status, JobStatus::Waiting);

    // Pass 1: the job starts and only `a` is dispatched.
    cluster.tick().await;
    assert_eq!(cluster.job_status("9999", "j-chain").await, JobStatus::Running);
    let statuses = cluster.task_statuses("9999", "j-chain").await;
    assert_eq!(statuses["a"], TaskStatus::Running);
    assert_eq!(statuses["b"], TaskStatus::Waiting);
    assert_eq!(statuses["c"], TaskStatus::Waiting);

    // `a` succeeds; pass 2 dispatches only `b`.
    cluster.report("9999", "j-chain", "a", TaskStatus::Success).await;
    cluster.tick().await;
    let statuses = cluster.task_statuses("9999", "j-chain").await;
    assert_eq!(statuses["a"], TaskStatus::Success);
    assert_eq!(statuses["b"], TaskStatus::Running);
    assert_eq!(statuses["c"], TaskStatus::Waiting);
    assert_eq!(cluster.job_status("9999", "j-chain").await, JobStatus::Running);

    cluster.report("9999", "j-chain", "b", TaskStatus::Success).await;
    cluster.tick().await;
    let statuses = cluster.task_statuses("9999", "j-chain").await;
    assert_eq!(statuses["c"], TaskStatus::Running);
    assert_eq!(cluster.job_status("9999", "j-chain").await, JobStatus::Running);

    cluster.report("9999", "j-chain", "c", TaskStatus::Success).await;
    cluster.tick().await;
    assert_eq!(cluster.job_status("9999", "j-chain").await, JobStatus::Success);

    // The party record agrees and every grant went back to the pool.
    let party_job = cluster
        .backend("9999")
        .job(&JobKey::new("j-chain", &PartyAddr::new("guest", "9999")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(party_job.status, JobStatus::Success);
    assert!(!party_job.resource_in_use);
    assert_eq!(party_job.progress, 100);
    let (remaining, total) = cluster.engine_remaining("9999").await;
    assert_eq!(remaining, total);
}

#[tokio::test]
async fn oversized_job_stays_waiting_without_touching_the_pool() {
    let cluster = Cluster::new(
        &[("9999", 4)],
        registry_with(Arc::new(HoldRunner)),
        SchedulerConfig::default(),
    )
    .await;
    let mut dag = chain_dag(&["9999"]);
    // Quota of 8 cores against a pool of 4.
    dag.conf.task_cores = Some(8);
    cluster
        .scheduler
        .submit(dag, Some("j-big".into()))
        .await
        .unwrap();

    cluster.ticks(3).await;
    assert_eq!(cluster.job_status("9999", "j-big").await, JobStatus::Waiting);
    let (remaining, _) = cluster.engine_remaining("9999").await;
    assert_eq!(remaining, 4);
    let schedule_job = cluster
        .backend("9999")
        .schedule_job("j-big")
        .await
        .unwrap()
        .unwrap();
    assert!(!schedule_job.ready_signal);
}

#[tokio::test]
async fn unreachable_party_fails_creation_with_rollback() {
    let cluster = Cluster::new(
        &[("9999", 16)],
        registry_with(Arc::new(HoldRunner)),
        SchedulerConfig::default(),
    )
    .await;
    // The host is declared but no instance is routable.
    let dag = serde_json::from_value(json!({
        "parties": [
            {"role": "guest", "party_ids": ["9999"]},
            {"role": "host", "party_ids": ["10000"]}
        ],
        "tasks": {"a": {"component_ref": "step"}}
    }))
    .unwrap();

    let err = cluster
        .scheduler
        .submit(dag, Some("j-half".into()))
        .await
        .unwrap_err();
    match err {
        SubmitError::Create { job_id, breakdown, .. } => {
            assert_eq!(job_id, "j-half");
            assert_eq!(breakdown.as_array().unwrap().len(), 2);
        }
        other => panic!("expected create failure, got {other}"),
    }

    // The guest rows were created, then stopped and rolled back.
    assert_eq!(cluster.job_status("9999", "j-half").await, JobStatus::Failed);
    let guest_job = cluster
        .backend("9999")
        .job(&JobKey::new("j-half", &PartyAddr::new("guest", "9999")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guest_job.status, JobStatus::Failed);
    assert!(!guest_job.resource_in_use);
    let (remaining, total) = cluster.engine_remaining("9999").await;
    assert_eq!(remaining, total);
}

#[tokio::test]
async fn two_party_job_runs_to_success() {
    let cluster = Cluster::new(
        &[("9999", 16), ("10000", 16)],
        registry_with(Arc::new(InstantRunner)),
        SchedulerConfig::default(),
    )
    .await;
    let dag = serde_json::from_value(json!({
        "parties": [{"role": "guest", "party_ids": ["9999", "10000"]}],
        "tasks": {
            "a": {"component_ref": "step"},
            "b": {"component_ref": "step", "inputs": {
                "input_data": {"task_output": {"producer_task": "a", "output_key": "output_data"}}
            }},
        }
    }))
    .unwrap();
    cluster
        .scheduler
        .submit(dag, Some("j-two".into()))
        .await
        .unwrap();

    cluster.ticks(4).await;
    assert_eq!(cluster.job_status("9999", "j-two").await, JobStatus::Success);
    for party in ["9999", "10000"] {
        let job = cluster
            .backend(party)
            .job(&JobKey::new("j-two", &PartyAddr::new("guest", party)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Success, "party {party}");
        assert!(!job.resource_in_use);
        let (remaining, total) = cluster.engine_remaining(party).await;
        assert_eq!(remaining, total, "party {party}");
    }
}

#[tokio::test]
async fn manual_rerun_creates_a_new_version() {
    let cluster = Cluster::new(
        &[("9999", 16)],
        registry_with(Arc::new(FailRunner)),
        SchedulerConfig::default(),
    )
    .await;
    let dag = serde_json::from_value(json!({
        "parties": [{"role": "guest", "party_ids": ["9999"]}],
        "tasks": {"a": {"component_ref": "step"}}
    }))
    .unwrap();
    cluster
        .scheduler
        .submit(dag, Some("j-rerun".into()))
        .await
        .unwrap();

    cluster.ticks(3).await;
    assert_eq!(cluster.job_status("9999", "j-rerun").await, JobStatus::Failed);

    assert!(cluster.scheduler.rerun_job("j-rerun").await.unwrap());
    cluster.tick().await;
    // Rerun activation revived the job with a fresh attempt.
    let row_version = cluster
        .backend("9999")
        .schedule_task_statuses("j-rerun")
        .await
        .unwrap()
        .pop()
        .unwrap()
        .task_version;
    assert_eq!(row_version, 1);

    cluster.ticks(3).await;
    // The component still fails, so the job fails again, but both attempts
    // remain queryable and "latest" is the maximum version.
    assert_eq!(cluster.job_status("9999", "j-rerun").await, JobStatus::Failed);
    let backend = cluster.backend("9999");
    assert_eq!(latest_version(backend, "j-rerun", "a", "guest", "9999").await, 1);
    for version in [0, 1] {
        let key = TaskKey {
            job_id: "j-rerun".into(),
            task_id: "a".into(),
            task_version: version,
            role: "guest".into(),
            party_id: "9999".into(),
        };
        assert!(backend.task(&key).await.unwrap().is_some(), "v{version}");
    }
}

#[tokio::test]
async fn auto_rerun_spends_budget_then_fails() {
    let config = SchedulerConfig {
        default_auto_retries: 2,
        ..SchedulerConfig::default()
    };
    let cluster = Cluster::new(&[("9999", 16)], registry_with(Arc::new(FailRunner)), config).await;
    let dag = serde_json::from_value(json!({
        "parties": [{"role": "guest", "party_ids": ["9999"]}],
        "tasks": {"a": {"component_ref": "step"}}
    }))
    .unwrap();
    cluster
        .scheduler
        .submit(dag, Some("j-auto".into()))
        .await
        .unwrap();

    cluster.ticks(8).await;
    assert_eq!(cluster.job_status("9999", "j-auto").await, JobStatus::Failed);
    let rows = cluster
        .backend("9999")
        .schedule_task_statuses("j-auto")
        .await
        .unwrap();
    assert_eq!(rows[0].task_version, 2, "two automatic reruns after v0");
    assert_eq!(rows[0].auto_retries, 0);
    let (remaining, total) = cluster.engine_remaining("9999").await;
    assert_eq!(remaining, total);
}

#[tokio::test]
async fn cancel_interrupts_a_running_job() {
    let cluster = Cluster::new(
        &[("9999", 16)],
        registry_with(Arc::new(HoldRunner)),
        SchedulerConfig::default(),
    )
    .await;
    cluster
        .scheduler
        .submit(chain_dag(&["9999"]), Some("j-stop".into()))
        .await
        .unwrap();

    cluster.tick().await;
    assert_eq!(cluster.job_status("9999", "j-stop").await, JobStatus::Running);

    assert!(cluster.scheduler.stop_job("j-stop").await.unwrap());
    cluster.tick().await;

    assert_eq!(cluster.job_status("9999", "j-stop").await, JobStatus::Canceled);
    let backend = cluster.backend("9999");
    let task = backend
        .latest_task("j-stop", "a", "guest", "9999")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.party_status, TaskStatus::Canceled);
    assert!(!task.resource_in_use);
    let job = backend
        .job(&JobKey::new("j-stop", &PartyAddr::new("guest", "9999")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    assert!(!job.resource_in_use);
    let (remaining, total) = cluster.engine_remaining("9999").await;
    assert_eq!(remaining, total);
}

#[tokio::test]
async fn waiting_plus_success_with_nothing_schedulable_cancels() {
    use chrono::Utc;
    use fedflow::backends::{ScheduleJob, ScheduleTaskStatus};
    use fedflow::dag::SyncKind;

    let cluster = Cluster::new(
        &[("9999", 16)],
        registry_with(Arc::new(HoldRunner)),
        SchedulerConfig::default(),
    )
    .await;

    // Fabricate a running job whose aggregate rows lost task `a` (the
    // producer of `b`): `b` can never become ready, `d` already succeeded.
    let dag: DagSpec = serde_json::from_value(json!({
        "parties": [{"role": "guest", "party_ids": ["9999"]}],
        "tasks": {
            "a": {"component_ref": "step"},
            "b": {"component_ref": "step", "inputs": {
                "input_data": {"task_output": {"producer_task": "a", "output_key": "output_data"}}
            }},
            "d": {"component_ref": "step"},
        }
    }))
    .unwrap();
    let backend = cluster.backend("9999");
    let now = Utc::now();
    let job = ScheduleJob {
        job_id: "j-dead".into(),
        dag: dag.clone(),
        status: JobStatus::Running,
        priority: 0,
        progress: 0,
        initiator: PartyAddr::new("guest", "9999"),
        cancel_signal: false,
        cancel_at: None,
        rerun_signal: false,
        rerun_at: None,
        ready_signal: false,
        ready_at: None,
        created_at: now,
        started_at: Some(now),
        ended_at: None,
    };
    let rows = vec![
        ScheduleTaskStatus {
            job_id: "j-dead".into(),
            task_id: "b".into(),
            task_version: 0,
            status: TaskStatus::Waiting,
            auto_retries: 0,
            sync_type: SyncKind::Poll,
            updated_at: now,
        },
        ScheduleTaskStatus {
            job_id: "j-dead".into(),
            task_id: "d".into(),
            task_version: 0,
            status: TaskStatus::Success,
            auto_retries: 0,
            sync_type: SyncKind::Poll,
            updated_at: now,
        },
    ];
    backend.create_schedule_job(&job, &rows).await.unwrap();
    // Party rows exist so collect answers Waiting for `b`.
    cluster
        .transport
        .send(
            &PartyAddr::new("guest", "9999"),
            &fedflow::Command::JobCreate {
                job_id: "j-dead".into(),
                dag,
                initiator: PartyAddr::new("guest", "9999"),
                scheduler_party: PartyAddr::new("guest", "9999"),
            },
        )
        .await
        .unwrap();

    cluster.tick().await;
    // Only {Waiting, Success} remain and nothing can be scheduled: the
    // terminal-deadlock detector resolves the job to Canceled.
    assert_eq!(cluster.job_status("9999", "j-dead").await, JobStatus::Canceled);
}
