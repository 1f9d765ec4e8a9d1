//! Resource accounting: sizing rules plus the conditional apply/return
//! operations against the shared capacity pool.
//!
//! Job-level grants move capacity between the engine pool and the job's
//! quota; task-level grants move capacity between the job's quota and the
//! task. The backend performs each move as one linearizable conditional
//! update, so a failed apply mutates nothing and a duplicate return cannot
//! over-credit the pool.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backends::{JobKey, StateBackend, StoreResult, TaskKey};
use crate::dag::JobConf;

/// Cores/memory pair requested by a job or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cores: i64,
    pub memory: i64,
}

impl ResourceSpec {
    pub const ZERO: ResourceSpec = ResourceSpec { cores: 0, memory: 0 };
}

/// Deployment-level sizing defaults and exemptions.
#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub engine_type: String,
    pub engine_name: String,
    /// Cores granted per task slot when the job conf does not say.
    pub task_cores: i64,
    pub task_memory: i64,
    /// Compute nodes backing the engine; per-slot cores scale with it.
    pub nodes: i64,
    /// Task slots a job's quota is sized for when the conf does not say.
    pub task_parallelism: i64,
    /// Roles that always request zero capacity (e.g. coordination-only
    /// roles with no local computation).
    pub exempt_roles: Vec<String>,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            engine_type: "compute".into(),
            engine_name: "standalone".into(),
            task_cores: 4,
            task_memory: 0,
            nodes: 1,
            task_parallelism: 1,
            exempt_roles: Vec::new(),
        }
    }
}

pub struct ResourceManager {
    backend: Arc<dyn StateBackend>,
    settings: ResourceSettings,
}

impl ResourceManager {
    pub fn new(backend: Arc<dyn StateBackend>, settings: ResourceSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &ResourceSettings {
        &self.settings
    }

    /// Capacity one task attempt requests on `role`.
    pub fn task_quota(&self, conf: &JobConf, role: &str) -> ResourceSpec {
        if self.is_exempt(role) {
            return ResourceSpec::ZERO;
        }
        let per_node = conf.task_cores.unwrap_or(self.settings.task_cores);
        ResourceSpec {
            cores: per_node * self.settings.nodes,
            memory: conf.task_memory.unwrap_or(self.settings.task_memory),
        }
    }

    /// Capacity a whole job reserves on `role`: the task quota times the
    /// configured parallelism.
    pub fn job_quota(&self, conf: &JobConf, role: &str) -> ResourceSpec {
        if self.is_exempt(role) {
            return ResourceSpec::ZERO;
        }
        let task = self.task_quota(conf, role);
        let parallelism = conf
            .task_parallelism
            .unwrap_or(self.settings.task_parallelism)
            .max(1);
        ResourceSpec {
            cores: task.cores * parallelism,
            memory: task.memory * parallelism,
        }
    }

    fn is_exempt(&self, role: &str) -> bool {
        self.settings.exempt_roles.iter().any(|r| r == role)
    }

    pub async fn apply_job(&self, key: &JobKey) -> StoreResult<bool> {
        let applied = self.backend.apply_job_resource(key).await?;
        if applied {
            info!(job = %key, "job resource applied");
        } else {
            debug!(job = %key, "job resource apply rejected");
        }
        Ok(applied)
    }

    pub async fn return_job(&self, key: &JobKey) -> StoreResult<bool> {
        let returned = self.backend.return_job_resource(key).await?;
        if returned {
            info!(job = %key, "job resource returned");
        } else {
            debug!(job = %key, "job resource return was a no-op");
        }
        Ok(returned)
    }

    pub async fn apply_task(&self, key: &TaskKey) -> StoreResult<bool> {
        let applied = self.backend.apply_task_resource(key).await?;
        if !applied {
            debug!(task = %key, "task resource apply rejected");
        }
        Ok(applied)
    }

    pub async fn return_task(&self, key: &TaskKey) -> StoreResult<bool> {
        let returned = self.backend.return_task_resource(key).await?;
        if !returned {
            warn!(task = %key, "task resource return was a no-op");
        }
        Ok(returned)
    }
}
