//! HTTP surface: job submission/control plus the federated command
//! endpoint every party instance exposes.
//!
//! All responses use the `{code, message, data}` envelope. Partial
//! multi-party failures carry the per-party breakdown in `data` rather than
//! collapsing into one boolean.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::backends::StateBackend;
use crate::controller::PartyController;
use crate::dag::DagSpec;
use crate::federation::{CommandEnvelope, PartyReply};
use crate::scheduler::{JobScheduler, SubmitError};
use crate::transport::CommandHandler;

pub const CODE_OK: i32 = 0;
pub const CODE_BAD_REQUEST: i32 = 100;
pub const CODE_NOT_FOUND: i32 = 101;
pub const CODE_FEDERATED: i32 = 102;
pub const CODE_INTERNAL: i32 = 103;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<PartyController>,
    pub scheduler: Arc<JobScheduler>,
    pub backend: Arc<dyn StateBackend>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/job/submit", post(submit_job))
        .route("/v1/job/stop", post(stop_job))
        .route("/v1/job/rerun", post(rerun_job))
        .route("/v1/job/{job_id}", get(query_job))
        .route("/v1/federated/command", post(federated_command))
        .with_state(state)
}

fn envelope(code: i32, message: impl Into<String>, data: Value) -> Json<Value> {
    Json(json!({
        "code": code,
        "message": message.into(),
        "data": data,
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    dag: DagSpec,
    #[serde(default)]
    job_id: Option<String>,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Json<Value> {
    match state.scheduler.submit(request.dag, request.job_id).await {
        Ok(result) => {
            info!(job_id = %result.job_id, "submission accepted");
            envelope(
                CODE_OK,
                "success",
                json!({ "job_id": result.job_id, "status": result.status }),
            )
        }
        Err(SubmitError::Parse(err)) => envelope(CODE_BAD_REQUEST, err.to_string(), Value::Null),
        Err(SubmitError::SchedulerNotParticipating(party)) => envelope(
            CODE_BAD_REQUEST,
            format!("party {party} does not appear in the dag"),
            Value::Null,
        ),
        Err(SubmitError::Create {
            job_id,
            code,
            breakdown,
        }) => envelope(
            CODE_FEDERATED,
            format!("job creation failed with {code}"),
            json!({ "job_id": job_id, "parties": breakdown }),
        ),
        Err(SubmitError::Store(err)) => envelope(CODE_INTERNAL, err.to_string(), Value::Null),
    }
}

#[derive(Debug, Deserialize)]
struct JobRef {
    job_id: String,
}

async fn stop_job(State(state): State<AppState>, Json(request): Json<JobRef>) -> Json<Value> {
    match state.scheduler.stop_job(&request.job_id).await {
        Ok(true) => envelope(CODE_OK, "cancel signal set", Value::Null),
        Ok(false) => envelope(
            CODE_NOT_FOUND,
            "unknown job or cancel already requested",
            Value::Null,
        ),
        Err(err) => envelope(CODE_INTERNAL, err.to_string(), Value::Null),
    }
}

async fn rerun_job(State(state): State<AppState>, Json(request): Json<JobRef>) -> Json<Value> {
    match state.scheduler.rerun_job(&request.job_id).await {
        Ok(true) => envelope(CODE_OK, "rerun signal set", Value::Null),
        Ok(false) => envelope(
            CODE_NOT_FOUND,
            "unknown job or rerun already requested",
            Value::Null,
        ),
        Err(err) => envelope(CODE_INTERNAL, err.to_string(), Value::Null),
    }
}

async fn query_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Json<Value> {
    let job = match state.backend.schedule_job(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return envelope(CODE_NOT_FOUND, "unknown job", Value::Null),
        Err(err) => return envelope(CODE_INTERNAL, err.to_string(), Value::Null),
    };
    let tasks = match state.backend.schedule_task_statuses(&job_id).await {
        Ok(tasks) => tasks,
        Err(err) => return envelope(CODE_INTERNAL, err.to_string(), Value::Null),
    };
    envelope(
        CODE_OK,
        "success",
        json!({
            "job_id": job.job_id,
            "status": job.status,
            "progress": job.progress,
            "created_at": job.created_at,
            "started_at": job.started_at,
            "ended_at": job.ended_at,
            "tasks": tasks
                .iter()
                .map(|task| json!({
                    "task_id": task.task_id,
                    "task_version": task.task_version,
                    "status": task.status,
                    "auto_retries": task.auto_retries,
                }))
                .collect::<Vec<_>>(),
        }),
    )
}

async fn federated_command(
    State(state): State<AppState>,
    Json(envelope): Json<CommandEnvelope>,
) -> Json<PartyReply> {
    Json(
        state
            .controller
            .handle(&envelope.dest, &envelope.command)
            .await,
    )
}
