//! In-memory backend.
//!
//! One mutex over the whole state keeps every conditional update trivially
//! linearizable, which is exactly the store contract the scheduler relies
//! on. Used by tests and single-process deployments.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::backends::base::{
    EngineRegistry, Job, JobKey, JobSignal, ScheduleJob, ScheduleTaskStatus, StateBackend,
    StoreError, StoreResult, Task, TaskKey, TaskReport,
};
use crate::status::{transition_allowed, JobStatus, SchedulingStatus, TaskStatus};

type ReportKey = (String, String, i64, String, String);

#[derive(Default)]
struct Inner {
    schedule_jobs: BTreeMap<String, ScheduleJob>,
    /// (job_id, task_id) -> aggregate row.
    schedule_tasks: BTreeMap<(String, String), ScheduleTaskStatus>,
    task_reports: BTreeMap<ReportKey, TaskReport>,
    jobs: BTreeMap<JobKey, Job>,
    tasks: BTreeMap<TaskKey, Task>,
    engines: BTreeMap<(String, String), EngineRegistry>,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory backend poisoned")
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn create_schedule_job(
        &self,
        job: &ScheduleJob,
        tasks: &[ScheduleTaskStatus],
    ) -> StoreResult<()> {
        let mut state = self.lock();
        if state.schedule_jobs.contains_key(&job.job_id) {
            return Err(StoreError::Message(format!(
                "schedule job {} already exists",
                job.job_id
            )));
        }
        state.schedule_jobs.insert(job.job_id.clone(), job.clone());
        for task in tasks {
            state
                .schedule_tasks
                .insert((task.job_id.clone(), task.task_id.clone()), task.clone());
        }
        Ok(())
    }

    async fn schedule_job(&self, job_id: &str) -> StoreResult<Option<ScheduleJob>> {
        Ok(self.lock().schedule_jobs.get(job_id).cloned())
    }

    async fn schedule_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> StoreResult<Vec<ScheduleJob>> {
        let state = self.lock();
        let mut jobs: Vec<ScheduleJob> = state
            .schedule_jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        if status == JobStatus::Waiting {
            jobs.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });
        } else {
            jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn schedule_jobs_with_signal(
        &self,
        signal: JobSignal,
        limit: i64,
    ) -> StoreResult<Vec<ScheduleJob>> {
        let state = self.lock();
        let mut jobs: Vec<ScheduleJob> = state
            .schedule_jobs
            .values()
            .filter(|job| match signal {
                JobSignal::Cancel => job.cancel_signal,
                JobSignal::Rerun => job.rerun_signal,
                JobSignal::Ready => job.ready_signal,
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn update_schedule_job_status(
        &self,
        job_id: &str,
        src: JobStatus,
        dest: JobStatus,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.schedule_jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if job.status != src || src == dest || !transition_allowed(src, dest) {
            return Ok(false);
        }
        job.status = dest;
        let now = Utc::now();
        if dest == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if dest.is_terminal() {
            job.ended_at = Some(now);
        }
        Ok(true)
    }

    async fn force_schedule_job_status(&self, job_id: &str, dest: JobStatus) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.schedule_jobs.get_mut(job_id) else {
            return Ok(false);
        };
        job.status = dest;
        if dest == JobStatus::Waiting {
            job.ended_at = None;
        }
        Ok(true)
    }

    async fn set_schedule_signal(
        &self,
        job_id: &str,
        signal: JobSignal,
        on: bool,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.schedule_jobs.get_mut(job_id) else {
            return Ok(false);
        };
        let now = on.then(Utc::now);
        let (flag, stamp) = match signal {
            JobSignal::Cancel => (&mut job.cancel_signal, &mut job.cancel_at),
            JobSignal::Rerun => (&mut job.rerun_signal, &mut job.rerun_at),
            JobSignal::Ready => (&mut job.ready_signal, &mut job.ready_at),
        };
        if *flag == on {
            return Ok(false);
        }
        *flag = on;
        *stamp = now;
        Ok(true)
    }

    async fn set_schedule_progress(&self, job_id: &str, progress: i32) -> StoreResult<()> {
        if let Some(job) = self.lock().schedule_jobs.get_mut(job_id) {
            job.progress = progress;
        }
        Ok(())
    }

    async fn schedule_task_statuses(&self, job_id: &str) -> StoreResult<Vec<ScheduleTaskStatus>> {
        Ok(self
            .lock()
            .schedule_tasks
            .values()
            .filter(|task| task.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn update_schedule_task_status(
        &self,
        job_id: &str,
        task_id: &str,
        task_version: i64,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(task) = state
            .schedule_tasks
            .get_mut(&(job_id.to_string(), task_id.to_string()))
        else {
            return Ok(false);
        };
        if task.task_version != task_version
            || task.status != src
            || src == dest
            || !transition_allowed(src, dest)
        {
            return Ok(false);
        }
        task.status = dest;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn reset_schedule_task(
        &self,
        job_id: &str,
        task_id: &str,
        new_version: i64,
        spend_retry: bool,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(task) = state
            .schedule_tasks
            .get_mut(&(job_id.to_string(), task_id.to_string()))
        else {
            return Ok(false);
        };
        if new_version <= task.task_version || (spend_retry && task.auto_retries <= 0) {
            return Ok(false);
        }
        task.task_version = new_version;
        task.status = TaskStatus::Waiting;
        if spend_retry {
            task.auto_retries -= 1;
        }
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn upsert_task_report(&self, report: &TaskReport) -> StoreResult<()> {
        let key = (
            report.job_id.clone(),
            report.task_id.clone(),
            report.task_version,
            report.role.clone(),
            report.party_id.clone(),
        );
        self.lock().task_reports.insert(key, report.clone());
        Ok(())
    }

    async fn task_reports(
        &self,
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> StoreResult<Vec<TaskReport>> {
        Ok(self
            .lock()
            .task_reports
            .values()
            .filter(|report| {
                report.job_id == job_id
                    && report.task_id == task_id
                    && report.task_version == task_version
            })
            .cloned()
            .collect())
    }

    async fn create_job(&self, job: &Job, tasks: &[Task]) -> StoreResult<()> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.key) {
            return Err(StoreError::Message(format!("job {} already exists", job.key)));
        }
        state.jobs.insert(job.key.clone(), job.clone());
        for task in tasks {
            state.tasks.insert(task.key.clone(), task.clone());
        }
        Ok(())
    }

    async fn job(&self, key: &JobKey) -> StoreResult<Option<Job>> {
        Ok(self.lock().jobs.get(key).cloned())
    }

    async fn update_job_status(
        &self,
        key: &JobKey,
        src: JobStatus,
        dest: JobStatus,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(key) else {
            return Ok(false);
        };
        if job.status != src || src == dest || !transition_allowed(src, dest) {
            return Ok(false);
        }
        job.status = dest;
        let now = Utc::now();
        if dest == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if dest.is_terminal() {
            job.ended_at = Some(now);
        }
        Ok(true)
    }

    async fn force_job_status(&self, key: &JobKey, dest: JobStatus) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(key) else {
            return Ok(false);
        };
        job.status = dest;
        if dest == JobStatus::Waiting {
            job.ended_at = None;
            job.cancel_signal = false;
            job.cancel_at = None;
        }
        Ok(true)
    }

    async fn set_job_cancel_signal(&self, key: &JobKey, on: bool) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(key) else {
            return Ok(false);
        };
        if job.cancel_signal == on {
            return Ok(false);
        }
        job.cancel_signal = on;
        job.cancel_at = on.then(Utc::now);
        Ok(true)
    }

    async fn set_job_progress(&self, key: &JobKey, progress: i32) -> StoreResult<()> {
        if let Some(job) = self.lock().jobs.get_mut(key) {
            job.progress = progress;
        }
        Ok(())
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        let mut state = self.lock();
        for task in tasks {
            state.tasks.insert(task.key.clone(), task.clone());
        }
        Ok(())
    }

    async fn task(&self, key: &TaskKey) -> StoreResult<Option<Task>> {
        Ok(self.lock().tasks.get(key).cloned())
    }

    async fn latest_tasks(
        &self,
        job_id: &str,
        role: &str,
        party_id: &str,
    ) -> StoreResult<Vec<Task>> {
        let state = self.lock();
        let mut latest: BTreeMap<&str, &Task> = BTreeMap::new();
        for task in state.tasks.values() {
            if task.key.job_id != job_id
                || task.key.role != role
                || task.key.party_id != party_id
            {
                continue;
            }
            match latest.get(task.key.task_id.as_str()) {
                Some(existing) if existing.key.task_version >= task.key.task_version => {}
                _ => {
                    latest.insert(task.key.task_id.as_str(), task);
                }
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn latest_task(
        &self,
        job_id: &str,
        task_id: &str,
        role: &str,
        party_id: &str,
    ) -> StoreResult<Option<Task>> {
        let state = self.lock();
        Ok(state
            .tasks
            .values()
            .filter(|task| {
                task.key.job_id == job_id
                    && task.key.task_id == task_id
                    && task.key.role == role
                    && task.key.party_id == party_id
            })
            .max_by_key(|task| task.key.task_version)
            .cloned())
    }

    async fn update_task_status(
        &self,
        key: &TaskKey,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(key) else {
            return Ok(false);
        };
        if task.status != src || src == dest || !transition_allowed(src, dest) {
            return Ok(false);
        }
        task.status = dest;
        stamp_task(task, dest);
        Ok(true)
    }

    async fn update_task_party_status(
        &self,
        key: &TaskKey,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(key) else {
            return Ok(false);
        };
        if task.party_status != src || src == dest || !transition_allowed(src, dest) {
            return Ok(false);
        }
        task.party_status = dest;
        stamp_task(task, dest);
        Ok(true)
    }

    async fn register_engine(
        &self,
        engine_type: &str,
        engine_name: &str,
        total_cores: i64,
        total_memory: i64,
    ) -> StoreResult<()> {
        let mut state = self.lock();
        let key = (engine_type.to_string(), engine_name.to_string());
        let now = Utc::now();
        match state.engines.get_mut(&key) {
            Some(engine) => {
                // Remaining capacity shifts by the totals delta so in-use
                // grants stay accounted for.
                engine.remaining_cores += total_cores - engine.total_cores;
                engine.remaining_memory += total_memory - engine.total_memory;
                engine.total_cores = total_cores;
                engine.total_memory = total_memory;
                engine.updated_at = now;
            }
            None => {
                state.engines.insert(
                    key,
                    EngineRegistry {
                        engine_type: engine_type.to_string(),
                        engine_name: engine_name.to_string(),
                        total_cores,
                        total_memory,
                        remaining_cores: total_cores,
                        remaining_memory: total_memory,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn engine(
        &self,
        engine_type: &str,
        engine_name: &str,
    ) -> StoreResult<Option<EngineRegistry>> {
        Ok(self
            .lock()
            .engines
            .get(&(engine_type.to_string(), engine_name.to_string()))
            .cloned())
    }

    async fn apply_job_resource(&self, key: &JobKey) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get(key) else {
            return Ok(false);
        };
        if job.resource_in_use {
            return Ok(false);
        }
        let (cores, memory) = (job.cores, job.memory);
        let engine_key = (job.engine_type.clone(), job.engine_name.clone());
        let Some(engine) = state.engines.get_mut(&engine_key) else {
            return Ok(false);
        };
        if engine.remaining_cores < cores || engine.remaining_memory < memory {
            return Ok(false);
        }
        engine.remaining_cores -= cores;
        engine.remaining_memory -= memory;
        engine.updated_at = Utc::now();
        let job = state.jobs.get_mut(key).expect("job present");
        job.resource_in_use = true;
        job.resource_applied_at = Some(Utc::now());
        Ok(true)
    }

    async fn return_job_resource(&self, key: &JobKey) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get(key) else {
            return Ok(false);
        };
        if !job.resource_in_use {
            return Ok(false);
        }
        let (cores, memory) = (job.cores, job.memory);
        let engine_key = (job.engine_type.clone(), job.engine_name.clone());
        let Some(engine) = state.engines.get_mut(&engine_key) else {
            return Ok(false);
        };
        // Over-credit guard: a duplicate or out-of-order return must not
        // inflate the pool.
        if engine.remaining_cores + cores > engine.total_cores
            || engine.remaining_memory + memory > engine.total_memory
        {
            return Ok(false);
        }
        engine.remaining_cores += cores;
        engine.remaining_memory += memory;
        engine.updated_at = Utc::now();
        let job = state.jobs.get_mut(key).expect("job present");
        job.resource_in_use = false;
        job.resource_returned_at = Some(Utc::now());
        Ok(true)
    }

    async fn apply_task_resource(&self, key: &TaskKey) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get(key) else {
            return Ok(false);
        };
        if task.resource_in_use {
            return Ok(false);
        }
        let (cores, memory) = (task.task_cores, task.task_memory);
        let job_key = key.job_key();
        let Some(job) = state.jobs.get_mut(&job_key) else {
            return Ok(false);
        };
        if job.remaining_cores < cores || job.remaining_memory < memory {
            return Ok(false);
        }
        job.remaining_cores -= cores;
        job.remaining_memory -= memory;
        let task = state.tasks.get_mut(key).expect("task present");
        task.resource_in_use = true;
        Ok(true)
    }

    async fn return_task_resource(&self, key: &TaskKey) -> StoreResult<bool> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get(key) else {
            return Ok(false);
        };
        if !task.resource_in_use {
            return Ok(false);
        }
        let (cores, memory) = (task.task_cores, task.task_memory);
        let job_key = key.job_key();
        let Some(job) = state.jobs.get_mut(&job_key) else {
            return Ok(false);
        };
        if job.remaining_cores + cores > job.cores || job.remaining_memory + memory > job.memory {
            return Ok(false);
        }
        job.remaining_cores += cores;
        job.remaining_memory += memory;
        let task = state.tasks.get_mut(key).expect("task present");
        task.resource_in_use = false;
        Ok(true)
    }
}

fn stamp_task(task: &mut Task, dest: TaskStatus) {
    let now = Utc::now();
    if dest == TaskStatus::Running && task.started_at.is_none() {
        task.started_at = Some(now);
    }
    if dest.is_terminal() {
        task.ended_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::base::test_fixtures::{engine_defaults, job_fixture, task_fixture};

    #[tokio::test]
    async fn job_resource_apply_and_return_conserve_the_pool() {
        let backend = MemoryBackend::new();
        backend.register_engine("compute", "local", 16, 1 << 30).await.unwrap();
        let job = job_fixture("j-1", "guest", "9999", 8, 1 << 20);
        backend.create_job(&job, &[]).await.unwrap();

        assert!(backend.apply_job_resource(&job.key).await.unwrap());
        let engine = backend.engine("compute", "local").await.unwrap().unwrap();
        assert_eq!(engine.remaining_cores, 8);

        // Second apply is a guarded no-op.
        assert!(!backend.apply_job_resource(&job.key).await.unwrap());
        let engine = backend.engine("compute", "local").await.unwrap().unwrap();
        assert_eq!(engine.remaining_cores, 8);

        assert!(backend.return_job_resource(&job.key).await.unwrap());
        let engine = backend.engine("compute", "local").await.unwrap().unwrap();
        assert_eq!(engine.remaining_cores, 16);
        assert_eq!(engine.remaining_memory, 1 << 30);

        // Duplicate return cannot over-credit.
        assert!(!backend.return_job_resource(&job.key).await.unwrap());
        let engine = backend.engine("compute", "local").await.unwrap().unwrap();
        assert_eq!(engine.remaining_cores, engine.total_cores);
    }

    #[tokio::test]
    async fn oversized_apply_fails_without_mutation() {
        let backend = MemoryBackend::new();
        backend.register_engine("compute", "local", 4, 1 << 30).await.unwrap();
        let job = job_fixture("j-1", "guest", "9999", 8, 1 << 20);
        backend.create_job(&job, &[]).await.unwrap();

        assert!(!backend.apply_job_resource(&job.key).await.unwrap());
        let engine = backend.engine("compute", "local").await.unwrap().unwrap();
        assert_eq!(engine.remaining_cores, 4);
        let stored = backend.job(&job.key).await.unwrap().unwrap();
        assert!(!stored.resource_in_use);
    }

    #[tokio::test]
    async fn task_resource_draws_from_job_quota() {
        let backend = MemoryBackend::new();
        backend.register_engine("compute", "local", 16, 1 << 30).await.unwrap();
        let job = job_fixture("j-1", "guest", "9999", 8, 1 << 20);
        let task = task_fixture("j-1", "train_0", 0, "guest", "9999", 4, 1 << 10);
        backend.create_job(&job, &[task.clone()]).await.unwrap();

        assert!(backend.apply_task_resource(&task.key).await.unwrap());
        let stored = backend.job(&job.key).await.unwrap().unwrap();
        assert_eq!(stored.remaining_cores, 4);

        assert!(backend.return_task_resource(&task.key).await.unwrap());
        let stored = backend.job(&job.key).await.unwrap().unwrap();
        assert_eq!(stored.remaining_cores, 8);
        assert!(!backend.return_task_resource(&task.key).await.unwrap());
    }

    #[tokio::test]
    async fn status_updates_respect_transition_rules() {
        let backend = MemoryBackend::new();
        let job = job_fixture("j-1", "guest", "9999", 1, 1);
        let task = task_fixture("j-1", "a", 0, "guest", "9999", 1, 1);
        backend.create_job(&job, &[task.clone()]).await.unwrap();

        assert!(backend
            .update_task_status(&task.key, TaskStatus::Waiting, TaskStatus::Running)
            .await
            .unwrap());
        assert!(backend
            .update_task_status(&task.key, TaskStatus::Running, TaskStatus::Success)
            .await
            .unwrap());
        // A stale running report no-ops against the recorded success.
        assert!(!backend
            .update_task_status(&task.key, TaskStatus::Success, TaskStatus::Running)
            .await
            .unwrap());
        // A guard mismatch no-ops too.
        assert!(!backend
            .update_task_status(&task.key, TaskStatus::Waiting, TaskStatus::Failed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn latest_tasks_picks_max_version() {
        let backend = MemoryBackend::new();
        let job = job_fixture("j-1", "guest", "9999", 1, 1);
        let v0 = task_fixture("j-1", "a", 0, "guest", "9999", 1, 1);
        let mut v1 = task_fixture("j-1", "a", 1, "guest", "9999", 1, 1);
        v1.party_status = TaskStatus::Running;
        backend.create_job(&job, &[v0]).await.unwrap();
        backend.insert_tasks(&[v1]).await.unwrap();

        let latest = backend.latest_tasks("j-1", "guest", "9999").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].key.task_version, 1);
        let one = backend
            .latest_task("j-1", "a", "guest", "9999")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(one.key.task_version, 1);
    }

    #[tokio::test]
    async fn engine_reregistration_shifts_remaining_by_delta() {
        let backend = MemoryBackend::new();
        let (cores, memory) = engine_defaults();
        backend.register_engine("compute", "local", cores, memory).await.unwrap();
        let job = job_fixture("j-1", "guest", "9999", 4, 0);
        backend.create_job(&job, &[]).await.unwrap();
        backend.apply_job_resource(&job.key).await.unwrap();

        backend.register_engine("compute", "local", cores + 8, memory).await.unwrap();
        let engine = backend.engine("compute", "local").await.unwrap().unwrap();
        assert_eq!(engine.total_cores, cores + 8);
        // The 4 in-use cores stay accounted for.
        assert_eq!(engine.remaining_cores, cores + 8 - 4);
    }
}
