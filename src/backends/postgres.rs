//! Postgres backend.
//!
//! Every guarded write is a single conditional UPDATE (or one short
//! transaction for the two-row resource moves); `rows_affected` is the
//! landed/no-op signal. Transition legality is evaluated against the
//! observed source status before the statement is issued, so a lost race
//! simply affects zero rows.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::backends::base::{
    EngineRegistry, Job, JobKey, JobSignal, ScheduleJob, ScheduleTaskStatus, StateBackend,
    StoreResult, Task, TaskKey, TaskReport,
};
use crate::dag::PartyAddr;
use crate::status::{transition_allowed, JobStatus, SchedulingStatus, TaskStatus};

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|err| crate::backends::base::StoreError::Message(err.to_string()))?;
        Ok(())
    }
}

fn map_schedule_job(row: &PgRow) -> StoreResult<ScheduleJob> {
    Ok(ScheduleJob {
        job_id: row.try_get("job_id")?,
        dag: serde_json::from_value(row.try_get::<serde_json::Value, _>("dag")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        priority: row.try_get("priority")?,
        progress: row.try_get("progress")?,
        initiator: PartyAddr::new(
            row.try_get::<String, _>("initiator_role")?,
            row.try_get::<String, _>("initiator_party_id")?,
        ),
        cancel_signal: row.try_get("cancel_signal")?,
        cancel_at: row.try_get("cancel_at")?,
        rerun_signal: row.try_get("rerun_signal")?,
        rerun_at: row.try_get("rerun_at")?,
        ready_signal: row.try_get("ready_signal")?,
        ready_at: row.try_get("ready_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn map_schedule_task(row: &PgRow) -> StoreResult<ScheduleTaskStatus> {
    Ok(ScheduleTaskStatus {
        job_id: row.try_get("job_id")?,
        task_id: row.try_get("task_id")?,
        task_version: row.try_get("task_version")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        auto_retries: row.try_get("auto_retries")?,
        sync_type: row.try_get::<String, _>("sync_type")?.parse()?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_task_report(row: &PgRow) -> StoreResult<TaskReport> {
    Ok(TaskReport {
        job_id: row.try_get("job_id")?,
        task_id: row.try_get("task_id")?,
        task_version: row.try_get("task_version")?,
        role: row.try_get("role")?,
        party_id: row.try_get("party_id")?,
        party_status: row.try_get::<String, _>("party_status")?.parse()?,
        reported_at: row.try_get("reported_at")?,
    })
}

fn map_job(row: &PgRow) -> StoreResult<Job> {
    Ok(Job {
        key: JobKey {
            job_id: row.try_get("job_id")?,
            role: row.try_get("role")?,
            party_id: row.try_get("party_id")?,
        },
        dag: serde_json::from_value(row.try_get::<serde_json::Value, _>("dag")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        progress: row.try_get("progress")?,
        initiator: PartyAddr::new(
            row.try_get::<String, _>("initiator_role")?,
            row.try_get::<String, _>("initiator_party_id")?,
        ),
        scheduler_party: PartyAddr::new(
            row.try_get::<String, _>("scheduler_role")?,
            row.try_get::<String, _>("scheduler_party_id")?,
        ),
        engine_type: row.try_get("engine_type")?,
        engine_name: row.try_get("engine_name")?,
        cores: row.try_get("cores")?,
        memory: row.try_get("memory")?,
        remaining_cores: row.try_get("remaining_cores")?,
        remaining_memory: row.try_get("remaining_memory")?,
        resource_in_use: row.try_get("resource_in_use")?,
        resource_applied_at: row.try_get("resource_applied_at")?,
        resource_returned_at: row.try_get("resource_returned_at")?,
        cancel_signal: row.try_get("cancel_signal")?,
        cancel_at: row.try_get("cancel_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn map_task(row: &PgRow) -> StoreResult<Task> {
    Ok(Task {
        key: TaskKey {
            job_id: row.try_get("job_id")?,
            task_id: row.try_get("task_id")?,
            task_version: row.try_get("task_version")?,
            role: row.try_get("role")?,
            party_id: row.try_get("party_id")?,
        },
        component_ref: row.try_get("component_ref")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        party_status: row.try_get::<String, _>("party_status")?.parse()?,
        task_cores: row.try_get("task_cores")?,
        task_memory: row.try_get("task_memory")?,
        resource_in_use: row.try_get("resource_in_use")?,
        sync_type: row.try_get::<String, _>("sync_type")?.parse()?,
        provider: row.try_get("provider")?,
        worker_id: row.try_get("worker_id")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn map_engine(row: &PgRow) -> StoreResult<EngineRegistry> {
    Ok(EngineRegistry {
        engine_type: row.try_get("engine_type")?,
        engine_name: row.try_get("engine_name")?,
        total_cores: row.try_get("total_cores")?,
        total_memory: row.try_get("total_memory")?,
        remaining_cores: row.try_get("remaining_cores")?,
        remaining_memory: row.try_get("remaining_memory")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn insert_task_rows(
    conn: &mut sqlx::PgConnection,
    tasks: &[Task],
) -> StoreResult<()> {
    for task in tasks {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                job_id, task_id, task_version, role, party_id,
                component_ref, status, party_status,
                task_cores, task_memory, resource_in_use, sync_type,
                provider, worker_id, created_at, started_at, ended_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&task.key.job_id)
        .bind(&task.key.task_id)
        .bind(task.key.task_version)
        .bind(&task.key.role)
        .bind(&task.key.party_id)
        .bind(&task.component_ref)
        .bind(task.status.as_str())
        .bind(task.party_status.as_str())
        .bind(task.task_cores)
        .bind(task.task_memory)
        .bind(task.resource_in_use)
        .bind(task.sync_type.as_str())
        .bind(&task.provider)
        .bind(task.worker_id)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.ended_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl StateBackend for PostgresBackend {
    async fn create_schedule_job(
        &self,
        job: &ScheduleJob,
        tasks: &[ScheduleTaskStatus],
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO schedule_jobs (
                job_id, dag, status, priority, progress,
                initiator_role, initiator_party_id,
                cancel_signal, rerun_signal, ready_signal, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, FALSE, FALSE, $8)
            "#,
        )
        .bind(&job.job_id)
        .bind(serde_json::to_value(&job.dag)?)
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.progress)
        .bind(&job.initiator.role)
        .bind(&job.initiator.party_id)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;
        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO schedule_task_status (
                    job_id, task_id, task_version, status, auto_retries, sync_type, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&task.job_id)
            .bind(&task.task_id)
            .bind(task.task_version)
            .bind(task.status.as_str())
            .bind(task.auto_retries)
            .bind(task.sync_type.as_str())
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn schedule_job(&self, job_id: &str) -> StoreResult<Option<ScheduleJob>> {
        let row = sqlx::query("SELECT * FROM schedule_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_schedule_job).transpose()
    }

    async fn schedule_jobs_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> StoreResult<Vec<ScheduleJob>> {
        let sql = if status == JobStatus::Waiting {
            r#"
            SELECT * FROM schedule_jobs WHERE status = $1
            ORDER BY priority DESC, created_at ASC
            LIMIT $2
            "#
        } else {
            r#"
            SELECT * FROM schedule_jobs WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        };
        let rows = sqlx::query(sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_schedule_job).collect()
    }

    async fn schedule_jobs_with_signal(
        &self,
        signal: JobSignal,
        limit: i64,
    ) -> StoreResult<Vec<ScheduleJob>> {
        let sql = match signal {
            JobSignal::Cancel => {
                "SELECT * FROM schedule_jobs WHERE cancel_signal ORDER BY created_at ASC LIMIT $1"
            }
            JobSignal::Rerun => {
                "SELECT * FROM schedule_jobs WHERE rerun_signal ORDER BY created_at ASC LIMIT $1"
            }
            JobSignal::Ready => {
                "SELECT * FROM schedule_jobs WHERE ready_signal ORDER BY created_at ASC LIMIT $1"
            }
        };
        let rows = sqlx::query(sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(map_schedule_job).collect()
    }

    async fn update_schedule_job_status(
        &self,
        job_id: &str,
        src: JobStatus,
        dest: JobStatus,
    ) -> StoreResult<bool> {
        if src == dest || !transition_allowed(src, dest) {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE schedule_jobs
            SET status = $2,
                started_at = CASE WHEN $3 AND started_at IS NULL THEN NOW() ELSE started_at END,
                ended_at = CASE WHEN $4 THEN NOW() ELSE ended_at END
            WHERE job_id = $1 AND status = $5
            "#,
        )
        .bind(job_id)
        .bind(dest.as_str())
        .bind(dest == JobStatus::Running)
        .bind(dest.is_terminal())
        .bind(src.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn force_schedule_job_status(&self, job_id: &str, dest: JobStatus) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_jobs
            SET status = $2,
                ended_at = CASE WHEN $3 THEN NULL ELSE ended_at END
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(dest.as_str())
        .bind(dest == JobStatus::Waiting)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_schedule_signal(
        &self,
        job_id: &str,
        signal: JobSignal,
        on: bool,
    ) -> StoreResult<bool> {
        let sql = match signal {
            JobSignal::Cancel => {
                r#"
                UPDATE schedule_jobs
                SET cancel_signal = $2,
                    cancel_at = CASE WHEN $2 THEN NOW() ELSE NULL END
                WHERE job_id = $1 AND cancel_signal <> $2
                "#
            }
            JobSignal::Rerun => {
                r#"
                UPDATE schedule_jobs
                SET rerun_signal = $2,
                    rerun_at = CASE WHEN $2 THEN NOW() ELSE NULL END
                WHERE job_id = $1 AND rerun_signal <> $2
                "#
            }
            JobSignal::Ready => {
                r#"
                UPDATE schedule_jobs
                SET ready_signal = $2,
                    ready_at = CASE WHEN $2 THEN NOW() ELSE NULL END
                WHERE job_id = $1 AND ready_signal <> $2
                "#
            }
        };
        let result = sqlx::query(sql)
            .bind(job_id)
            .bind(on)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_schedule_progress(&self, job_id: &str, progress: i32) -> StoreResult<()> {
        sqlx::query("UPDATE schedule_jobs SET progress = $2 WHERE job_id = $1")
            .bind(job_id)
            .bind(progress)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn schedule_task_statuses(&self, job_id: &str) -> StoreResult<Vec<ScheduleTaskStatus>> {
        let rows = sqlx::query(
            "SELECT * FROM schedule_task_status WHERE job_id = $1 ORDER BY task_id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_schedule_task).collect()
    }

    async fn update_schedule_task_status(
        &self,
        job_id: &str,
        task_id: &str,
        task_version: i64,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool> {
        if src == dest || !transition_allowed(src, dest) {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE schedule_task_status
            SET status = $4, updated_at = NOW()
            WHERE job_id = $1 AND task_id = $2 AND task_version = $3 AND status = $5
            "#,
        )
        .bind(job_id)
        .bind(task_id)
        .bind(task_version)
        .bind(dest.as_str())
        .bind(src.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_schedule_task(
        &self,
        job_id: &str,
        task_id: &str,
        new_version: i64,
        spend_retry: bool,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_task_status
            SET task_version = $3,
                status = 'waiting',
                auto_retries = CASE WHEN $4 THEN auto_retries - 1 ELSE auto_retries END,
                updated_at = NOW()
            WHERE job_id = $1 AND task_id = $2 AND task_version < $3
              AND (NOT $4 OR auto_retries > 0)
            "#,
        )
        .bind(job_id)
        .bind(task_id)
        .bind(new_version)
        .bind(spend_retry)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_task_report(&self, report: &TaskReport) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_reports (
                job_id, task_id, task_version, role, party_id, party_status, reported_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id, task_id, task_version, role, party_id)
            DO UPDATE SET
                party_status = EXCLUDED.party_status,
                reported_at = EXCLUDED.reported_at
            "#,
        )
        .bind(&report.job_id)
        .bind(&report.task_id)
        .bind(report.task_version)
        .bind(&report.role)
        .bind(&report.party_id)
        .bind(report.party_status.as_str())
        .bind(report.reported_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task_reports(
        &self,
        job_id: &str,
        task_id: &str,
        task_version: i64,
    ) -> StoreResult<Vec<TaskReport>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM task_reports
            WHERE job_id = $1 AND task_id = $2 AND task_version = $3
            ORDER BY role, party_id
            "#,
        )
        .bind(job_id)
        .bind(task_id)
        .bind(task_version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task_report).collect()
    }

    async fn create_job(&self, job: &Job, tasks: &[Task]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, role, party_id, dag, status, progress,
                initiator_role, initiator_party_id,
                scheduler_role, scheduler_party_id,
                engine_type, engine_name,
                cores, memory, remaining_cores, remaining_memory,
                resource_in_use, cancel_signal, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, FALSE, FALSE, $17)
            "#,
        )
        .bind(&job.key.job_id)
        .bind(&job.key.role)
        .bind(&job.key.party_id)
        .bind(serde_json::to_value(&job.dag)?)
        .bind(job.status.as_str())
        .bind(job.progress)
        .bind(&job.initiator.role)
        .bind(&job.initiator.party_id)
        .bind(&job.scheduler_party.role)
        .bind(&job.scheduler_party.party_id)
        .bind(&job.engine_type)
        .bind(&job.engine_name)
        .bind(job.cores)
        .bind(job.memory)
        .bind(job.remaining_cores)
        .bind(job.remaining_memory)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;
        insert_task_rows(&mut *tx, tasks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn job(&self, key: &JobKey) -> StoreResult<Option<Job>> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE job_id = $1 AND role = $2 AND party_id = $3",
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_job).transpose()
    }

    async fn update_job_status(
        &self,
        key: &JobKey,
        src: JobStatus,
        dest: JobStatus,
    ) -> StoreResult<bool> {
        if src == dest || !transition_allowed(src, dest) {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $4,
                started_at = CASE WHEN $5 AND started_at IS NULL THEN NOW() ELSE started_at END,
                ended_at = CASE WHEN $6 THEN NOW() ELSE ended_at END
            WHERE job_id = $1 AND role = $2 AND party_id = $3 AND status = $7
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .bind(dest.as_str())
        .bind(dest == JobStatus::Running)
        .bind(dest.is_terminal())
        .bind(src.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn force_job_status(&self, key: &JobKey, dest: JobStatus) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $4,
                ended_at = CASE WHEN $5 THEN NULL ELSE ended_at END,
                cancel_signal = CASE WHEN $5 THEN FALSE ELSE cancel_signal END,
                cancel_at = CASE WHEN $5 THEN NULL ELSE cancel_at END
            WHERE job_id = $1 AND role = $2 AND party_id = $3
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .bind(dest.as_str())
        .bind(dest == JobStatus::Waiting)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_job_cancel_signal(&self, key: &JobKey, on: bool) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_signal = $4,
                cancel_at = CASE WHEN $4 THEN NOW() ELSE NULL END
            WHERE job_id = $1 AND role = $2 AND party_id = $3 AND cancel_signal <> $4
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .bind(on)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_job_progress(&self, key: &JobKey, progress: i32) -> StoreResult<()> {
        sqlx::query(
            "UPDATE jobs SET progress = $4 WHERE job_id = $1 AND role = $2 AND party_id = $3",
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .bind(progress)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_tasks(&self, tasks: &[Task]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_task_rows(&mut *tx, tasks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn task(&self, key: &TaskKey) -> StoreResult<Option<Task>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE job_id = $1 AND task_id = $2 AND task_version = $3
              AND role = $4 AND party_id = $5
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.task_id)
        .bind(key.task_version)
        .bind(&key.role)
        .bind(&key.party_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_task).transpose()
    }

    async fn latest_tasks(
        &self,
        job_id: &str,
        role: &str,
        party_id: &str,
    ) -> StoreResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (task_id) * FROM tasks
            WHERE job_id = $1 AND role = $2 AND party_id = $3
            ORDER BY task_id, task_version DESC
            "#,
        )
        .bind(job_id)
        .bind(role)
        .bind(party_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task).collect()
    }

    async fn latest_task(
        &self,
        job_id: &str,
        task_id: &str,
        role: &str,
        party_id: &str,
    ) -> StoreResult<Option<Task>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE job_id = $1 AND task_id = $2 AND role = $3 AND party_id = $4
            ORDER BY task_version DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(task_id)
        .bind(role)
        .bind(party_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_task).transpose()
    }

    async fn update_task_status(
        &self,
        key: &TaskKey,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool> {
        update_task_status_column(&self.pool, key, src, dest, "status").await
    }

    async fn update_task_party_status(
        &self,
        key: &TaskKey,
        src: TaskStatus,
        dest: TaskStatus,
    ) -> StoreResult<bool> {
        update_task_status_column(&self.pool, key, src, dest, "party_status").await
    }

    async fn register_engine(
        &self,
        engine_type: &str,
        engine_name: &str,
        total_cores: i64,
        total_memory: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO engine_registry (
                engine_type, engine_name,
                total_cores, total_memory, remaining_cores, remaining_memory, updated_at
            )
            VALUES ($1, $2, $3, $4, $3, $4, NOW())
            ON CONFLICT (engine_type, engine_name)
            DO UPDATE SET
                remaining_cores = engine_registry.remaining_cores
                    + EXCLUDED.total_cores - engine_registry.total_cores,
                remaining_memory = engine_registry.remaining_memory
                    + EXCLUDED.total_memory - engine_registry.total_memory,
                total_cores = EXCLUDED.total_cores,
                total_memory = EXCLUDED.total_memory,
                updated_at = NOW()
            "#,
        )
        .bind(engine_type)
        .bind(engine_name)
        .bind(total_cores)
        .bind(total_memory)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn engine(
        &self,
        engine_type: &str,
        engine_name: &str,
    ) -> StoreResult<Option<EngineRegistry>> {
        let row = sqlx::query(
            "SELECT * FROM engine_registry WHERE engine_type = $1 AND engine_name = $2",
        )
        .bind(engine_type)
        .bind(engine_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_engine).transpose()
    }

    async fn apply_job_resource(&self, key: &JobKey) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            r#"
            SELECT engine_type, engine_name, cores, memory, resource_in_use
            FROM jobs
            WHERE job_id = $1 AND role = $2 AND party_id = $3
            FOR UPDATE
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(false);
        };
        if row.try_get::<bool, _>("resource_in_use")? {
            return Ok(false);
        }
        let engine_type: String = row.try_get("engine_type")?;
        let engine_name: String = row.try_get("engine_name")?;
        let cores: i64 = row.try_get("cores")?;
        let memory: i64 = row.try_get("memory")?;

        let debit = sqlx::query(
            r#"
            UPDATE engine_registry
            SET remaining_cores = remaining_cores - $3,
                remaining_memory = remaining_memory - $4,
                updated_at = NOW()
            WHERE engine_type = $1 AND engine_name = $2
              AND remaining_cores >= $3 AND remaining_memory >= $4
            "#,
        )
        .bind(&engine_type)
        .bind(&engine_name)
        .bind(cores)
        .bind(memory)
        .execute(&mut *tx)
        .await?;
        if debit.rows_affected() != 1 {
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE jobs
            SET resource_in_use = TRUE, resource_applied_at = NOW()
            WHERE job_id = $1 AND role = $2 AND party_id = $3 AND resource_in_use = FALSE
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn return_job_resource(&self, key: &JobKey) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            r#"
            SELECT engine_type, engine_name, cores, memory, resource_in_use
            FROM jobs
            WHERE job_id = $1 AND role = $2 AND party_id = $3
            FOR UPDATE
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(false);
        };
        if !row.try_get::<bool, _>("resource_in_use")? {
            return Ok(false);
        }
        let engine_type: String = row.try_get("engine_type")?;
        let engine_name: String = row.try_get("engine_name")?;
        let cores: i64 = row.try_get("cores")?;
        let memory: i64 = row.try_get("memory")?;

        let credit = sqlx::query(
            r#"
            UPDATE engine_registry
            SET remaining_cores = remaining_cores + $3,
                remaining_memory = remaining_memory + $4,
                updated_at = NOW()
            WHERE engine_type = $1 AND engine_name = $2
              AND remaining_cores + $3 <= total_cores
              AND remaining_memory + $4 <= total_memory
            "#,
        )
        .bind(&engine_type)
        .bind(&engine_name)
        .bind(cores)
        .bind(memory)
        .execute(&mut *tx)
        .await?;
        if credit.rows_affected() != 1 {
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE jobs
            SET resource_in_use = FALSE, resource_returned_at = NOW()
            WHERE job_id = $1 AND role = $2 AND party_id = $3 AND resource_in_use = TRUE
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn apply_task_resource(&self, key: &TaskKey) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            r#"
            SELECT task_cores, task_memory, resource_in_use
            FROM tasks
            WHERE job_id = $1 AND task_id = $2 AND task_version = $3
              AND role = $4 AND party_id = $5
            FOR UPDATE
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.task_id)
        .bind(key.task_version)
        .bind(&key.role)
        .bind(&key.party_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(false);
        };
        if row.try_get::<bool, _>("resource_in_use")? {
            return Ok(false);
        }
        let cores: i64 = row.try_get("task_cores")?;
        let memory: i64 = row.try_get("task_memory")?;

        let debit = sqlx::query(
            r#"
            UPDATE jobs
            SET remaining_cores = remaining_cores - $4,
                remaining_memory = remaining_memory - $5
            WHERE job_id = $1 AND role = $2 AND party_id = $3
              AND remaining_cores >= $4 AND remaining_memory >= $5
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .bind(cores)
        .bind(memory)
        .execute(&mut *tx)
        .await?;
        if debit.rows_affected() != 1 {
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE tasks
            SET resource_in_use = TRUE
            WHERE job_id = $1 AND task_id = $2 AND task_version = $3
              AND role = $4 AND party_id = $5 AND resource_in_use = FALSE
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.task_id)
        .bind(key.task_version)
        .bind(&key.role)
        .bind(&key.party_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn return_task_resource(&self, key: &TaskKey) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(row) = sqlx::query(
            r#"
            SELECT task_cores, task_memory, resource_in_use
            FROM tasks
            WHERE job_id = $1 AND task_id = $2 AND task_version = $3
              AND role = $4 AND party_id = $5
            FOR UPDATE
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.task_id)
        .bind(key.task_version)
        .bind(&key.role)
        .bind(&key.party_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(false);
        };
        if !row.try_get::<bool, _>("resource_in_use")? {
            return Ok(false);
        }
        let cores: i64 = row.try_get("task_cores")?;
        let memory: i64 = row.try_get("task_memory")?;

        let credit = sqlx::query(
            r#"
            UPDATE jobs
            SET remaining_cores = remaining_cores + $4,
                remaining_memory = remaining_memory + $5
            WHERE job_id = $1 AND role = $2 AND party_id = $3
              AND remaining_cores + $4 <= cores
              AND remaining_memory + $5 <= memory
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.role)
        .bind(&key.party_id)
        .bind(cores)
        .bind(memory)
        .execute(&mut *tx)
        .await?;
        if credit.rows_affected() != 1 {
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE tasks
            SET resource_in_use = FALSE
            WHERE job_id = $1 AND task_id = $2 AND task_version = $3
              AND role = $4 AND party_id = $5 AND resource_in_use = TRUE
            "#,
        )
        .bind(&key.job_id)
        .bind(&key.task_id)
        .bind(key.task_version)
        .bind(&key.role)
        .bind(&key.party_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }
}

async fn update_task_status_column(
    pool: &PgPool,
    key: &TaskKey,
    src: TaskStatus,
    dest: TaskStatus,
    column: &str,
) -> StoreResult<bool> {
    if src == dest || !transition_allowed(src, dest) {
        return Ok(false);
    }
    // `column` is one of two compile-time literals, never caller input.
    let sql = format!(
        r#"
        UPDATE tasks
        SET {column} = $6,
            started_at = CASE WHEN $7 AND started_at IS NULL THEN NOW() ELSE started_at END,
            ended_at = CASE WHEN $8 THEN NOW() ELSE ended_at END
        WHERE job_id = $1 AND task_id = $2 AND task_version = $3
          AND role = $4 AND party_id = $5 AND {column} = $9
        "#
    );
    let result = sqlx::query(&sql)
        .bind(&key.job_id)
        .bind(&key.task_id)
        .bind(key.task_version)
        .bind(&key.role)
        .bind(&key.party_id)
        .bind(dest.as_str())
        .bind(dest == TaskStatus::Running)
        .bind(dest.is_terminal())
        .bind(src.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}
