//! Component capability descriptors and the runner registry.
//!
//! Components are the units of business logic a task executes. The
//! scheduler never runs them itself: it resolves a task's component against
//! the registry at parse time (capability check) and hands the merged
//! runtime context to the registered [`ComponentRunner`] at dispatch time.
//! Runners are registered once at process start; there is no runtime
//! discovery.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backends::TaskKey;
use crate::graph::ResolvedChannel;
use crate::status::TaskStatus;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no runner registered for component {0:?}")]
    Unregistered(String),
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("halt failed: {0}")]
    Halt(String),
}

/// Declared capabilities of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentMeta {
    pub name: String,
    pub supported_roles: Vec<String>,
    pub input_artifacts: Vec<String>,
    pub output_artifacts: Vec<String>,
}

impl ComponentMeta {
    pub fn supports_role(&self, role: &str) -> bool {
        self.supported_roles.iter().any(|r| r == role)
    }
}

/// Everything a runner needs to execute one task attempt locally.
#[derive(Clone)]
pub struct TaskRunContext {
    pub key: TaskKey,
    pub component_ref: String,
    pub stage: String,
    /// Merged runtime parameters for this party.
    pub parameters: Map<String, Value>,
    pub conf: Map<String, Value>,
    pub inputs: BTreeMap<String, ResolvedChannel>,
    /// Resolved output artifact locations, keyed by declared output name.
    pub output_uris: BTreeMap<String, String>,
    /// Where the runner reports execution-state changes.
    pub sink: Arc<dyn StatusSink>,
}

impl std::fmt::Debug for TaskRunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunContext")
            .field("key", &self.key)
            .field("component_ref", &self.component_ref)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

/// Callback surface handed to runners for asynchronous status reports.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, key: &TaskKey, status: TaskStatus);
}

/// Executes a component's business logic for one task attempt.
///
/// `launch` must return promptly; long-running work belongs on a spawned
/// task that reports through the sink.
#[async_trait]
pub trait ComponentRunner: Send + Sync {
    async fn launch(&self, ctx: TaskRunContext) -> Result<(), RunnerError>;

    async fn halt(&self, key: &TaskKey) -> Result<(), RunnerError>;
}

/// Immutable table from component name to capability descriptor and runner,
/// built at process start.
#[derive(Default)]
pub struct ComponentRegistry {
    metas: HashMap<String, ComponentMeta>,
    runners: HashMap<String, Arc<dyn ComponentRunner>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, meta: ComponentMeta, runner: Arc<dyn ComponentRunner>) {
        self.runners.insert(meta.name.clone(), runner);
        self.metas.insert(meta.name.clone(), meta);
    }

    /// Register a descriptor without a runner, for parties that only
    /// validate and never execute the component.
    pub fn register_meta(&mut self, meta: ComponentMeta) {
        self.metas.insert(meta.name.clone(), meta);
    }

    pub fn meta(&self, name: &str) -> Option<&ComponentMeta> {
        self.metas.get(name)
    }

    pub fn runner(&self, name: &str) -> Result<Arc<dyn ComponentRunner>, RunnerError> {
        self.runners
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::Unregistered(name.to_string()))
    }
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.metas.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Runner that reports immediate success. Used for wiring checks and as the
/// placeholder for components whose execution engine lives out of process.
#[derive(Debug, Default)]
pub struct NoopRunner;

#[async_trait]
impl ComponentRunner for NoopRunner {
    async fn launch(&self, ctx: TaskRunContext) -> Result<(), RunnerError> {
        ctx.sink.report(&ctx.key, TaskStatus::Success).await;
        Ok(())
    }

    async fn halt(&self, _key: &TaskKey) -> Result<(), RunnerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_role_check() {
        let meta = ComponentMeta {
            name: "psi".into(),
            supported_roles: vec!["guest".into(), "host".into()],
            input_artifacts: vec!["input_data".into()],
            output_artifacts: vec!["output_data".into()],
        };
        assert!(meta.supports_role("guest"));
        assert!(!meta.supports_role("arbiter"));
    }

    #[test]
    fn registry_resolves_registered_runner() {
        let mut registry = ComponentRegistry::new();
        registry.register(
            ComponentMeta {
                name: "noop".into(),
                supported_roles: vec!["guest".into()],
                input_artifacts: vec![],
                output_artifacts: vec![],
            },
            Arc::new(NoopRunner),
        );
        assert!(registry.meta("noop").is_some());
        assert!(registry.runner("noop").is_ok());
        assert!(matches!(
            registry.runner("missing"),
            Err(RunnerError::Unregistered(_))
        ));
    }
}
