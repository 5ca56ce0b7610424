//! The durable storage contract jobs are persisted through.
//!
//! Correctness across multiple executor processes rests entirely on the conditional updates
//! provided here: [`Store::update_execution`] and [`Store::update_progress`] must apply
//! atomically, and only when the row still matches the caller's [`Expected`] guard. A failed
//! guard is reported as `Ok(false)` rather than as an error, since losing a claim race is the
//! normal outcome when several executors share a store.
//!
//! An in memory implementation is provided in [`memory`] and a suite of conformance tests for
//! implementors in [`testing`].
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, JobState};

pub mod memory;
pub mod testing;

/// The state a conditional execution update is guarded by.
///
/// `total_executions` is incremented on every claim, so together with `state` it identifies a
/// single lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub state: JobState,
    pub total_executions: i32,
}

/// A progress report for a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub uid: String,
    /// The lease the report belongs to.
    pub total_executions: i32,
    pub progress: i32,
    pub result: String,
    pub updated: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with [`StoreError::NotFound`] if there is no job with the given uid.
    async fn find(&self, uid: &str) -> Result<Job, StoreError>;

    /// Fails with [`StoreError::Duplicate`] if the uid is taken.
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Inserts the job, or overwrites the definition and scheduling fields of the existing job
    /// with the same uid. When none of the definition fields differ this is a no-op.
    async fn upsert(&self, job: &Job) -> Result<(), StoreError>;

    /// Updates type, priority, data, limits, recurrence, scheduling and group of an existing
    /// job. Fails with [`StoreError::NotFound`] if the uid is absent.
    async fn update_definition(&self, job: &Job) -> Result<(), StoreError>;

    /// Atomically writes the execution fields of `job` if the stored row still matches
    /// `expected`.
    ///
    /// Returns `Ok(false)` when the guard does not match and [`StoreError::NotFound`] when the
    /// job no longer exists.
    async fn update_execution(&self, job: &Job, expected: Expected) -> Result<bool, StoreError>;

    /// Writes progress and result, only while the job is running under the reported lease.
    ///
    /// `Ok(false)` means the lease has already been released.
    async fn update_progress(&self, update: &ProgressUpdate) -> Result<bool, StoreError>;

    /// Scheduled jobs due at `now`, by priority descending, scheduled time ascending, then uid.
    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Running jobs whose deadline is before `now`, oldest deadline first.
    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// The earliest scheduled time strictly after `now` among scheduled jobs.
    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn count_running(&self) -> Result<usize, StoreError>;

    /// Deletes non-recurring finished, failed and canceled jobs last executed before
    /// `older_than`. Returns the number of deleted jobs.
    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn delete_by_uid(&self, uid: &str) -> Result<(), StoreError>;

    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, StoreError>;

    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(String),
    #[error("Job {0} already exists")]
    Duplicate(String),
    #[error("Store in bad state")]
    BadState,
    #[error("Database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[async_trait]
impl<T> Store for Arc<T>
where
    T: Store + ?Sized,
{
    async fn find(&self, uid: &str) -> Result<Job, StoreError> {
        self.as_ref().find(uid).await
    }
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.as_ref().create(job).await
    }
    async fn upsert(&self, job: &Job) -> Result<(), StoreError> {
        self.as_ref().upsert(job).await
    }
    async fn update_definition(&self, job: &Job) -> Result<(), StoreError> {
        self.as_ref().update_definition(job).await
    }
    async fn update_execution(&self, job: &Job, expected: Expected) -> Result<bool, StoreError> {
        self.as_ref().update_execution(job, expected).await
    }
    async fn update_progress(&self, update: &ProgressUpdate) -> Result<bool, StoreError> {
        self.as_ref().update_progress(update).await
    }
    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.as_ref().list_ready(now, limit).await
    }
    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.as_ref().list_deadline_exceeded(now).await
    }
    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.as_ref().next_scheduled_time(now).await
    }
    async fn count_running(&self) -> Result<usize, StoreError> {
        self.as_ref().count_running().await
    }
    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        self.as_ref().delete_old(older_than).await
    }
    async fn delete_by_uid(&self, uid: &str) -> Result<(), StoreError> {
        self.as_ref().delete_by_uid(uid).await
    }
    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, StoreError> {
        self.as_ref().delete_by_group_id(group_id).await
    }
    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, StoreError> {
        self.as_ref().list_by_group_id(group_id).await
    }
}
