//! fedflow - a federated multi-party DAG job scheduler.
//!
//! One party acts as the scheduling authority for a job: it decomposes the
//! submitted DAG per participating `(role, party_id)`, fans commands out to
//! every party, folds asynchronously-reported statuses into federated
//! aggregates, accounts compute capacity against per-party pools, and
//! drives the job to a terminal state with rerun support.

pub mod backends;
pub mod components;
pub mod config;
pub mod controller;
pub mod dag;
pub mod federation;
pub mod graph;
pub mod parser;
pub mod resources;
pub mod scheduler;
pub mod server;
pub mod status;
pub mod task_scheduler;
pub mod transport;

pub use backends::{MemoryBackend, PostgresBackend, StateBackend};
pub use components::{ComponentMeta, ComponentRegistry, ComponentRunner, NoopRunner};
pub use config::Config;
pub use controller::PartyController;
pub use dag::{DagSpec, PartyAddr};
pub use federation::{Command, FederatedCoordinator, PartyReply};
pub use parser::DagParser;
pub use resources::{ResourceManager, ResourceSettings};
pub use scheduler::{spawn_scheduler, JobLockSet, JobScheduler, SchedulerConfig};
pub use status::{FederatedCode, JobStatus, ReplyCode, TaskStatus};
pub use task_scheduler::TaskScheduler;
pub use transport::{HttpTransport, LocalTransport, PartyTransport};
