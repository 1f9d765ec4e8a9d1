//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `FEDFLOW_PARTY_ID`: this party's identifier (required)
//! - `FEDFLOW_DATABASE_URL`: PostgreSQL connection string (required unless `FEDFLOW_BACKEND=memory`)
//! - `FEDFLOW_BACKEND`: "postgres" (default) or "memory"
//! - `FEDFLOW_BIND_ADDR`: HTTP bind address (default: 0.0.0.0:9380)
//! - `FEDFLOW_ROUTE_TABLE`: path to a JSON file mapping party_id to base URL, own party included (optional)
//! - `FEDFLOW_TICK_INTERVAL_MS`: scheduler tick interval (default: 1500)
//! - `FEDFLOW_BATCH_SIZE`: jobs pulled per status per tick (default: 50)
//! - `FEDFLOW_READY_STALE_MS`: age after which an abandoned ready signal is cleared (default: 300000)
//! - `FEDFLOW_AUTO_RETRIES`: default task rerun budget (default: 0)
//! - `FEDFLOW_JOB_TIMEOUT_MS`: default running-job timeout (default: 259200000, 72h)
//! - `FEDFLOW_FEDERATED_CONCURRENT`: deliver broadcasts concurrently (default: true)
//! - `FEDFLOW_FEDERATED_TIMEOUT_MS`: per-destination command timeout (default: 10000)
//! - `FEDFLOW_ENGINE_TYPE` / `FEDFLOW_ENGINE_NAME`: capacity pool key (default: compute/standalone)
//! - `FEDFLOW_TOTAL_CORES` / `FEDFLOW_TOTAL_MEMORY`: pool totals registered at startup (default: 16 / 0)
//! - `FEDFLOW_TASK_CORES` / `FEDFLOW_TASK_MEMORY`: per-slot defaults (default: 4 / 0)
//! - `FEDFLOW_NODES`: compute nodes backing the engine (default: 1)
//! - `FEDFLOW_TASK_PARALLELISM`: default job parallelism (default: 1)
//! - `FEDFLOW_EXEMPT_ROLES`: comma-separated roles that request no capacity (optional)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::resources::ResourceSettings;
use crate::scheduler::SchedulerConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9380";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Memory,
}

/// Process-wide configuration, constructed once at startup and passed by
/// reference; components never read the environment themselves.
#[derive(Debug, Clone)]
pub struct Config {
    pub party_id: String,
    pub backend: BackendKind,
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
    /// party_id -> base URL for the HTTP transport, own party included.
    pub routes: HashMap<String, String>,
    pub tick_interval: Duration,
    pub batch_size: i64,
    pub ready_stale_after: Duration,
    pub default_auto_retries: i32,
    pub default_job_timeout: Duration,
    pub federated_concurrent: bool,
    pub federated_timeout: Duration,
    pub engine_type: String,
    pub engine_name: String,
    pub total_cores: i64,
    pub total_memory: i64,
    pub task_cores: i64,
    pub task_memory: i64,
    pub nodes: i64,
    pub task_parallelism: i64,
    pub exempt_roles: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let party_id =
            std::env::var("FEDFLOW_PARTY_ID").context("FEDFLOW_PARTY_ID must be set")?;
        let backend = match std::env::var("FEDFLOW_BACKEND").as_deref() {
            Ok("memory") => BackendKind::Memory,
            _ => BackendKind::Postgres,
        };
        let database_url = std::env::var("FEDFLOW_DATABASE_URL").ok();
        if backend == BackendKind::Postgres && database_url.is_none() {
            anyhow::bail!("FEDFLOW_DATABASE_URL must be set for the postgres backend");
        }
        let bind_addr = env_parse("FEDFLOW_BIND_ADDR", DEFAULT_BIND_ADDR.parse::<SocketAddr>()?)?;
        let routes = match std::env::var("FEDFLOW_ROUTE_TABLE") {
            Ok(path) => load_route_table(Path::new(&path))
                .with_context(|| format!("failed to load route table from {path}"))?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            party_id,
            backend,
            database_url,
            bind_addr,
            routes,
            tick_interval: Duration::from_millis(env_parse("FEDFLOW_TICK_INTERVAL_MS", 1500u64)?),
            batch_size: env_parse("FEDFLOW_BATCH_SIZE", 50i64)?,
            ready_stale_after: Duration::from_millis(env_parse(
                "FEDFLOW_READY_STALE_MS",
                300_000u64,
            )?),
            default_auto_retries: env_parse("FEDFLOW_AUTO_RETRIES", 0i32)?,
            default_job_timeout: Duration::from_millis(env_parse(
                "FEDFLOW_JOB_TIMEOUT_MS",
                259_200_000u64,
            )?),
            federated_concurrent: env_parse("FEDFLOW_FEDERATED_CONCURRENT", true)?,
            federated_timeout: Duration::from_millis(env_parse(
                "FEDFLOW_FEDERATED_TIMEOUT_MS",
                10_000u64,
            )?),
            engine_type: env_string("FEDFLOW_ENGINE_TYPE", "compute"),
            engine_name: env_string("FEDFLOW_ENGINE_NAME", "standalone"),
            total_cores: env_parse("FEDFLOW_TOTAL_CORES", 16i64)?,
            total_memory: env_parse("FEDFLOW_TOTAL_MEMORY", 0i64)?,
            task_cores: env_parse("FEDFLOW_TASK_CORES", 4i64)?,
            task_memory: env_parse("FEDFLOW_TASK_MEMORY", 0i64)?,
            nodes: env_parse("FEDFLOW_NODES", 1i64)?,
            task_parallelism: env_parse("FEDFLOW_TASK_PARALLELISM", 1i64)?,
            exempt_roles: env_list("FEDFLOW_EXEMPT_ROLES"),
        })
    }

    pub fn resource_settings(&self) -> ResourceSettings {
        ResourceSettings {
            engine_type: self.engine_type.clone(),
            engine_name: self.engine_name.clone(),
            task_cores: self.task_cores,
            task_memory: self.task_memory,
            nodes: self.nodes,
            task_parallelism: self.task_parallelism,
            exempt_roles: self.exempt_roles.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: self.tick_interval,
            batch_size: self.batch_size,
            ready_stale_after: self.ready_stale_after,
            default_auto_retries: self.default_auto_retries,
            default_job_timeout: self.default_job_timeout,
            ..SchedulerConfig::default()
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {value:?}")),
        Err(_) => Ok(default),
    }
}

fn load_route_table(path: &Path) -> Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("FEDFLOW_TEST_ROLES", "arbiter, local ,");
        assert_eq!(env_list("FEDFLOW_TEST_ROLES"), vec!["arbiter", "local"]);
        std::env::remove_var("FEDFLOW_TEST_ROLES");
        assert!(env_list("FEDFLOW_TEST_ROLES").is_empty());
    }

    #[test]
    fn env_parse_falls_back_to_default() {
        assert_eq!(env_parse("FEDFLOW_TEST_MISSING", 42i64).unwrap(), 42);
    }
}
