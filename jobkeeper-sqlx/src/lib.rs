//! A PostgreSQL [`jobkeeper::store::Store`].
//!
//! Jobs live in the `jobkeeper_jobs` table. Run [`PgStore::migrate`] once on startup to create
//! it. Claims and completions are single guarded `UPDATE` statements, so any number of executors
//! can share a database.
//!
//! ```no_run
//! use jobkeeper::prelude::*;
//! use jobkeeper_sqlx::PgStore;
//!
//! # async fn run(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let store = PgStore::from(pool);
//! store.migrate().await?;
//! let executor = Executor::new(store, ExecutorConfig::default());
//! # Ok(())
//! # }
//! ```
use chrono::{DateTime, Utc};
use jobkeeper::{
    job::Job,
    store::{Expected, ProgressUpdate, StoreError},
};
use sqlx::{
    migrate::MigrateError,
    postgres::{PgArguments, PgQueryResult},
    query::Query,
    PgPool, Postgres,
};
use tracing::instrument;

mod store;
mod types;

use types::JobState;

macro_rules! insert_job {
    () => {
        r#"INSERT INTO jobkeeper_jobs (
            uid,
            group_id,
            job_type,
            priority,
            data,
            result,
            max_duration_seconds,
            max_retries,
            state,
            scheduled,
            total_executions,
            run_by,
            run_deadline,
            run_progress,
            last_executed,
            is_recurring,
            recurring_cron,
            consecutive_failures,
            last_failure_error,
            created,
            updated
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
            $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
        )"#
    };
}

const CREATE: &str = insert_job!();

const UPSERT: &str = concat!(
    insert_job!(),
    r#"
    ON CONFLICT (uid) DO UPDATE SET
        updated = EXCLUDED.updated,
        job_type = EXCLUDED.job_type,
        priority = EXCLUDED.priority,
        data = EXCLUDED.data,
        result = EXCLUDED.result,
        max_duration_seconds = EXCLUDED.max_duration_seconds,
        max_retries = EXCLUDED.max_retries,
        state = EXCLUDED.state,
        scheduled = EXCLUDED.scheduled,
        is_recurring = EXCLUDED.is_recurring,
        recurring_cron = EXCLUDED.recurring_cron
    WHERE jobkeeper_jobs.job_type <> EXCLUDED.job_type
        OR jobkeeper_jobs.priority <> EXCLUDED.priority
        OR jobkeeper_jobs.data <> EXCLUDED.data
        OR jobkeeper_jobs.max_duration_seconds <> EXCLUDED.max_duration_seconds
        OR jobkeeper_jobs.max_retries <> EXCLUDED.max_retries
        OR jobkeeper_jobs.is_recurring <> EXCLUDED.is_recurring
        OR jobkeeper_jobs.recurring_cron <> EXCLUDED.recurring_cron
    "#
);

/// A [`jobkeeper::store::Store`] backed by a PostgreSQL connection pool.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl std::ops::Deref for PgStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgStore {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

impl PgStore {
    /// Creates or updates the `jobkeeper_jobs` table.
    pub async fn migrate(&self) -> Result<(), MigrateError> {
        sqlx::migrate!().run(&self.pool).await?;
        tracing::debug!("Job store migrations applied");
        Ok(())
    }

    async fn find_job(&self, uid: &str) -> sqlx::Result<Option<Job>> {
        Ok(
            sqlx::query_as::<_, types::Job>("SELECT * FROM jobkeeper_jobs WHERE uid = $1")
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?
                .map(From::from),
        )
    }

    async fn exists(&self, uid: &str) -> sqlx::Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM jobkeeper_jobs WHERE uid = $1)")
            .bind(uid)
            .fetch_one(&self.pool)
            .await
    }

    async fn insert_job(&self, job: &Job) -> sqlx::Result<PgQueryResult> {
        bind_job(CREATE, job).execute(&self.pool).await
    }

    async fn upsert_job(&self, job: &Job) -> sqlx::Result<PgQueryResult> {
        bind_job(UPSERT, job).execute(&self.pool).await
    }

    async fn update_definition_of(&self, job: &Job) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE jobkeeper_jobs SET
                updated = $2,
                job_type = $3,
                priority = $4,
                data = $5,
                result = $6,
                max_duration_seconds = $7,
                max_retries = $8,
                state = $9,
                scheduled = $10,
                is_recurring = $11,
                recurring_cron = $12,
                group_id = $13
            WHERE uid = $1
            "#,
        )
        .bind(job.uid.as_str())
        .bind(job.updated)
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(job.data.as_str())
        .bind(job.result.as_str())
        .bind(job.max_duration_seconds)
        .bind(job.max_retries)
        .bind(JobState::from(job.state))
        .bind(job.scheduled)
        .bind(job.is_recurring)
        .bind(job.recurring_cron.as_str())
        .bind(job.group_id.as_deref())
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    #[instrument(skip_all, fields(job.uid = %job.uid))]
    async fn update_execution_of(&self, job: &Job, expected: Expected) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE jobkeeper_jobs SET
                updated = $4,
                result = $5,
                state = $6,
                scheduled = $7,
                total_executions = $8,
                run_by = $9,
                run_deadline = $10,
                run_progress = $11,
                last_executed = $12,
                consecutive_failures = $13,
                last_failure_error = $14,
                max_duration_seconds = $15
            WHERE uid = $1
            AND state = $2
            AND total_executions = $3
            "#,
        )
        .bind(job.uid.as_str())
        .bind(JobState::from(expected.state))
        .bind(expected.total_executions)
        .bind(job.updated)
        .bind(job.result.as_str())
        .bind(JobState::from(job.state))
        .bind(job.scheduled)
        .bind(job.total_executions)
        .bind(job.run_by.as_deref())
        .bind(job.run_deadline)
        .bind(job.run_progress)
        .bind(job.last_executed)
        .bind(job.consecutive_failures)
        .bind(job.last_failure_error.as_str())
        .bind(job.max_duration_seconds)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn update_progress_of(&self, update: &ProgressUpdate) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE jobkeeper_jobs SET
                updated = $3,
                run_progress = $4,
                result = $5
            WHERE uid = $1
            AND state = 'running'
            AND total_executions = $2
            "#,
        )
        .bind(update.uid.as_str())
        .bind(update.total_executions)
        .bind(update.updated)
        .bind(update.progress)
        .bind(update.result.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn ready_jobs(&self, now: DateTime<Utc>, limit: usize) -> sqlx::Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, types::Job>(
            r#"SELECT * FROM jobkeeper_jobs
            WHERE state = 'scheduled'
            AND scheduled <= $1
            ORDER BY priority DESC, scheduled ASC, uid ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(From::from)
        .collect())
    }

    async fn deadline_exceeded_jobs(&self, now: DateTime<Utc>) -> sqlx::Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, types::Job>(
            r#"SELECT * FROM jobkeeper_jobs
            WHERE state = 'running'
            AND run_deadline < $1
            ORDER BY run_deadline ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(From::from)
        .collect())
    }

    async fn next_scheduled_after(&self, now: DateTime<Utc>) -> sqlx::Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            r#"SELECT MIN(scheduled) FROM jobkeeper_jobs
            WHERE state = 'scheduled'
            AND scheduled > $1
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    async fn running_count(&self) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM jobkeeper_jobs WHERE state = 'running'")
            .fetch_one(&self.pool)
            .await
    }

    async fn delete_completed_before(&self, older_than: DateTime<Utc>) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"DELETE FROM jobkeeper_jobs
            WHERE NOT is_recurring
            AND state IN ('finished', 'failed', 'canceled')
            AND last_executed < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn delete_job(&self, uid: &str) -> sqlx::Result<u64> {
        Ok(sqlx::query("DELETE FROM jobkeeper_jobs WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn delete_group(&self, group_id: &str) -> sqlx::Result<u64> {
        Ok(sqlx::query("DELETE FROM jobkeeper_jobs WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn group_jobs(&self, group_id: &str) -> sqlx::Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, types::Job>(
            "SELECT * FROM jobkeeper_jobs WHERE group_id = $1 ORDER BY created, uid",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(From::from)
        .collect())
    }
}

fn bind_job<'q>(sql: &'q str, job: &'q Job) -> Query<'q, Postgres, PgArguments> {
    sqlx::query(sql)
        .bind(job.uid.as_str())
        .bind(job.group_id.as_deref())
        .bind(job.job_type.as_str())
        .bind(job.priority)
        .bind(job.data.as_str())
        .bind(job.result.as_str())
        .bind(job.max_duration_seconds)
        .bind(job.max_retries)
        .bind(JobState::from(job.state))
        .bind(job.scheduled)
        .bind(job.total_executions)
        .bind(job.run_by.as_deref())
        .bind(job.run_deadline)
        .bind(job.run_progress)
        .bind(job.last_executed)
        .bind(job.is_recurring)
        .bind(job.recurring_cron.as_str())
        .bind(job.consecutive_failures)
        .bind(job.last_failure_error.as_str())
        .bind(job.created)
        .bind(job.updated)
}

fn map_err(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => StoreError::BadState,
        error => StoreError::Database(Box::new(error)),
    }
}
