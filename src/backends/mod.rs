//! Backend implementations for scheduler persistence.

mod base;
mod memory;
mod postgres;

pub use base::{
    EngineRegistry, Job, JobKey, JobSignal, ScheduleJob, ScheduleTaskStatus, StateBackend,
    StoreError, StoreResult, Task, TaskKey, TaskReport,
};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
