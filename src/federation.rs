//! Federated command fan-out and reply aggregation.
//!
//! One logical command is broadcast to a set of `(role, party_id)`
//! destinations and the per-destination replies reduce into a single
//! [`FederatedCode`]. A transport failure for one destination becomes an
//! `error` reply for that destination only; delivery to the remaining
//! destinations always proceeds.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::dag::{DagSpec, PartyAddr};
use crate::status::{reduce_reply_codes, FederatedCode, JobStatus, ReplyCode, TaskStatus};
use crate::transport::PartyTransport;

/// One federated command, addressed by job/task key fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    JobCreate {
        job_id: String,
        dag: DagSpec,
        initiator: PartyAddr,
        scheduler_party: PartyAddr,
    },
    JobStart {
        job_id: String,
    },
    JobStop {
        job_id: String,
        stop_status: JobStatus,
    },
    JobStatusSync {
        job_id: String,
        status: JobStatus,
        /// Bypass the transition rule; set only by rerun activation.
        #[serde(default)]
        force: bool,
    },
    JobResourceApply {
        job_id: String,
    },
    JobResourceReturn {
        job_id: String,
    },
    TaskCreate {
        job_id: String,
        task_id: String,
        task_version: i64,
    },
    TaskStart {
        job_id: String,
        task_id: String,
        task_version: i64,
    },
    TaskStop {
        job_id: String,
        task_id: String,
        task_version: i64,
        stop_status: TaskStatus,
    },
    TaskStatusSync {
        job_id: String,
        task_id: String,
        task_version: i64,
        status: TaskStatus,
    },
    TaskResourceApply {
        job_id: String,
        task_id: String,
        task_version: i64,
    },
    TaskResourceReturn {
        job_id: String,
        task_id: String,
        task_version: i64,
    },
    TaskCollect {
        job_id: String,
        task_id: String,
        task_version: i64,
    },
    /// Callback-mode push from an executing party to the scheduler.
    TaskReport {
        job_id: String,
        task_id: String,
        task_version: i64,
        party: PartyAddr,
        party_status: TaskStatus,
    },
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Command::JobCreate { .. } => "job.create",
            Command::JobStart { .. } => "job.start",
            Command::JobStop { .. } => "job.stop",
            Command::JobStatusSync { .. } => "job.status.sync",
            Command::JobResourceApply { .. } => "job.resource.apply",
            Command::JobResourceReturn { .. } => "job.resource.return",
            Command::TaskCreate { .. } => "task.create",
            Command::TaskStart { .. } => "task.start",
            Command::TaskStop { .. } => "task.stop",
            Command::TaskStatusSync { .. } => "task.status.sync",
            Command::TaskResourceApply { .. } => "task.resource.apply",
            Command::TaskResourceReturn { .. } => "task.resource.return",
            Command::TaskCollect { .. } => "task.collect",
            Command::TaskReport { .. } => "task.report",
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Command::JobCreate { job_id, .. }
            | Command::JobStart { job_id }
            | Command::JobStop { job_id, .. }
            | Command::JobStatusSync { job_id, .. }
            | Command::JobResourceApply { job_id }
            | Command::JobResourceReturn { job_id }
            | Command::TaskCreate { job_id, .. }
            | Command::TaskStart { job_id, .. }
            | Command::TaskStop { job_id, .. }
            | Command::TaskStatusSync { job_id, .. }
            | Command::TaskResourceApply { job_id, .. }
            | Command::TaskResourceReturn { job_id, .. }
            | Command::TaskCollect { job_id, .. }
            | Command::TaskReport { job_id, .. } => job_id,
        }
    }
}

/// Wire envelope: the command plus the party it is addressed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub dest: PartyAddr,
    pub command: Command,
}

/// Per-destination reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyReply {
    pub code: ReplyCode,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl PartyReply {
    pub fn success(data: Value) -> Self {
        Self {
            code: ReplyCode::Success,
            message: "success".into(),
            data,
        }
    }

    pub fn not_effective(message: impl Into<String>) -> Self {
        Self {
            code: ReplyCode::NotEffective,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: ReplyCode::Failed,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: ReplyCode::Error,
            message: message.into(),
            data: Value::Null,
        }
    }
}

/// Reduced result of one broadcast, with the per-destination breakdown.
#[derive(Debug, Clone)]
pub struct BroadcastOutcome {
    pub code: FederatedCode,
    pub replies: Vec<(PartyAddr, PartyReply)>,
}

impl BroadcastOutcome {
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Destinations whose own reply succeeded, regardless of the aggregate.
    pub fn succeeded(&self) -> impl Iterator<Item = &PartyAddr> {
        self.replies
            .iter()
            .filter(|(_, reply)| reply.code == ReplyCode::Success)
            .map(|(addr, _)| addr)
    }

    pub fn has_error_reply(&self) -> bool {
        self.replies
            .iter()
            .any(|(_, reply)| reply.code == ReplyCode::Error)
    }

    /// Per-party breakdown for user-visible failure reports.
    pub fn breakdown(&self) -> Value {
        Value::Array(
            self.replies
                .iter()
                .map(|(addr, reply)| {
                    json!({
                        "role": addr.role,
                        "party_id": addr.party_id,
                        "code": reply.code,
                        "message": reply.message,
                    })
                })
                .collect(),
        )
    }

    pub fn reply_for(&self, addr: &PartyAddr) -> Option<&PartyReply> {
        self.replies
            .iter()
            .find(|(dest, _)| dest == addr)
            .map(|(_, reply)| reply)
    }
}

/// Result of a cross-party resource apply saga.
#[derive(Debug, Clone)]
pub struct SagaOutcome {
    pub outcome: BroadcastOutcome,
    /// Destinations whose successful apply was compensated with a return.
    pub rolled_back: Vec<PartyAddr>,
}

/// Broadcasts commands and reduces replies.
pub struct FederatedCoordinator {
    transport: Arc<dyn PartyTransport>,
    /// Deliver to destinations concurrently; sequential otherwise.
    concurrent: bool,
}

impl FederatedCoordinator {
    pub fn new(transport: Arc<dyn PartyTransport>, concurrent: bool) -> Self {
        Self {
            transport,
            concurrent,
        }
    }

    pub async fn broadcast(&self, dests: &[PartyAddr], command: &Command) -> BroadcastOutcome {
        let replies = if self.concurrent {
            join_all(
                dests
                    .iter()
                    .map(|dest| async move { (dest.clone(), self.deliver(dest, command).await) }),
            )
            .await
        } else {
            let mut replies = Vec::with_capacity(dests.len());
            for dest in dests {
                replies.push((dest.clone(), self.deliver(dest, command).await));
            }
            replies
        };
        let code = reduce_reply_codes(replies.iter().map(|(_, reply)| reply.code));
        debug!(
            op = command.op(),
            job_id = command.job_id(),
            destinations = dests.len(),
            code = %code,
            "federated broadcast reduced"
        );
        BroadcastOutcome { code, replies }
    }

    /// One delivery; a transport failure is this destination's error reply,
    /// never an abort of the whole broadcast.
    async fn deliver(&self, dest: &PartyAddr, command: &Command) -> PartyReply {
        match self.transport.send(dest, command).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    op = command.op(),
                    job_id = command.job_id(),
                    dest = %dest,
                    error = %err,
                    "federated delivery failed"
                );
                PartyReply::error(err.to_string())
            }
        }
    }

    /// Apply the job quota on every destination; on any failure, issue a
    /// compensating return to each destination whose apply succeeded before
    /// reporting the outcome.
    pub async fn apply_job_resource(&self, dests: &[PartyAddr], job_id: &str) -> SagaOutcome {
        let apply = Command::JobResourceApply {
            job_id: job_id.to_string(),
        };
        let outcome = self.broadcast(dests, &apply).await;
        if outcome.is_success() {
            return SagaOutcome {
                outcome,
                rolled_back: Vec::new(),
            };
        }
        let compensate: Vec<PartyAddr> = outcome.succeeded().cloned().collect();
        if !compensate.is_empty() {
            warn!(
                job_id,
                parties = compensate.len(),
                "rolling back partially applied job resources"
            );
            let ret = Command::JobResourceReturn {
                job_id: job_id.to_string(),
            };
            self.broadcast(&compensate, &ret).await;
        }
        SagaOutcome {
            outcome,
            rolled_back: compensate,
        }
    }

    /// Task-level twin of [`apply_job_resource`].
    pub async fn apply_task_resource(
        &self,
        dests: &[PartyAddr],
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> SagaOutcome {
        let apply = Command::TaskResourceApply {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            task_version,
        };
        let outcome = self.broadcast(dests, &apply).await;
        if outcome.is_success() {
            return SagaOutcome {
                outcome,
                rolled_back: Vec::new(),
            };
        }
        let compensate: Vec<PartyAddr> = outcome.succeeded().cloned().collect();
        if !compensate.is_empty() {
            warn!(
                job_id,
                task_id,
                task_version,
                parties = compensate.len(),
                "rolling back partially applied task resources"
            );
            let ret = Command::TaskResourceReturn {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
                task_version,
            };
            self.broadcast(&compensate, &ret).await;
        }
        SagaOutcome {
            outcome,
            rolled_back: compensate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted transport: per-party canned replies, everything else errors.
    struct ScriptedTransport {
        replies: HashMap<String, PartyReply>,
        log: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<(&str, PartyReply)>) -> Self {
            Self {
                replies: replies
                    .into_iter()
                    .map(|(party, reply)| (party.to_string(), reply))
                    .collect(),
                log: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PartyTransport for ScriptedTransport {
        async fn send(
            &self,
            dest: &PartyAddr,
            command: &Command,
        ) -> Result<PartyReply, TransportError> {
            self.log
                .lock()
                .unwrap()
                .push((dest.party_id.clone(), command.op().to_string()));
            match self.replies.get(&dest.party_id) {
                Some(reply) => Ok(reply.clone()),
                None => Err(TransportError::Unroutable(dest.clone())),
            }
        }
    }

    fn dests() -> Vec<PartyAddr> {
        vec![PartyAddr::new("guest", "9999"), PartyAddr::new("host", "10000")]
    }

    #[tokio::test]
    async fn broadcast_reduces_all_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ("9999", PartyReply::success(Value::Null)),
            ("10000", PartyReply::success(Value::Null)),
        ]));
        let coordinator = FederatedCoordinator::new(transport, true);
        let outcome = coordinator
            .broadcast(&dests(), &Command::JobStart { job_id: "j-1".into() })
            .await;
        assert_eq!(outcome.code, FederatedCode::Success);
    }

    #[tokio::test]
    async fn transport_failure_becomes_one_error_reply() {
        // Only the guest is routable; the host delivery must still happen
        // and fail in isolation.
        let transport = Arc::new(ScriptedTransport::new(vec![(
            "9999",
            PartyReply::success(Value::Null),
        )]));
        let coordinator = FederatedCoordinator::new(transport.clone(), false);
        let outcome = coordinator
            .broadcast(&dests(), &Command::JobStart { job_id: "j-1".into() })
            .await;
        assert_eq!(outcome.code, FederatedCode::Error);
        assert_eq!(outcome.replies.len(), 2);
        assert_eq!(transport.sent().len(), 2);
        let host_reply = outcome
            .reply_for(&PartyAddr::new("host", "10000"))
            .unwrap();
        assert_eq!(host_reply.code, ReplyCode::Error);
    }

    #[tokio::test]
    async fn failed_apply_rolls_back_successful_parties_only() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ("9999", PartyReply::success(Value::Null)),
            ("10000", PartyReply::failed("no resource")),
        ]));
        let coordinator = FederatedCoordinator::new(transport.clone(), false);
        let saga = coordinator.apply_job_resource(&dests(), "j-1").await;

        assert_eq!(saga.outcome.code, FederatedCode::Partial);
        assert_eq!(saga.rolled_back, vec![PartyAddr::new("guest", "9999")]);
        let sent = transport.sent();
        // Two applies, then exactly one compensating return to the guest.
        assert_eq!(
            sent,
            vec![
                ("9999".to_string(), "job.resource.apply".to_string()),
                ("10000".to_string(), "job.resource.apply".to_string()),
                ("9999".to_string(), "job.resource.return".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn clean_apply_needs_no_compensation() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ("9999", PartyReply::success(Value::Null)),
            ("10000", PartyReply::success(Value::Null)),
        ]));
        let coordinator = FederatedCoordinator::new(transport.clone(), false);
        let saga = coordinator
            .apply_task_resource(&dests(), "j-1", "train_0", 0)
            .await;
        assert!(saga.outcome.is_success());
        assert!(saga.rolled_back.is_empty());
        assert_eq!(transport.sent().len(), 2);
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = CommandEnvelope {
            dest: PartyAddr::new("guest", "9999"),
            command: Command::TaskStatusSync {
                job_id: "j-1".into(),
                task_id: "train_0".into(),
                task_version: 2,
                status: TaskStatus::Success,
            },
        };
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: CommandEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.dest, envelope.dest);
        assert_eq!(decoded.command.op(), "task.status.sync");
    }
}
