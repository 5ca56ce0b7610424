//! Provides an in memory implementation of [`Store`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and single process setups. All executors sharing an [`InMemoryStore`] must live in the same
//! process, and nothing survives a restart.
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Expected, ProgressUpdate, Store, StoreError};
use crate::job::{Job, JobState};

/// An in memory implementation of [`Store`].
///
/// Cloning is cheap and every clone refers to the same set of jobs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<BTreeMap<String, Job>>>,
}

impl InMemoryStore {
    /// Creates a new, empty, instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Job>>, StoreError> {
        self.jobs.read().map_err(|_| StoreError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Job>>, StoreError> {
        self.jobs.write().map_err(|_| StoreError::BadState)
    }
}

impl Job {
    fn overwrite_definition(&mut self, job: &Job) {
        self.updated = job.updated;
        self.job_type.clone_from(&job.job_type);
        self.priority = job.priority;
        self.data.clone_from(&job.data);
        self.result.clone_from(&job.result);
        self.max_duration_seconds = job.max_duration_seconds;
        self.max_retries = job.max_retries;
        self.state = job.state;
        self.scheduled = job.scheduled;
        self.is_recurring = job.is_recurring;
        self.recurring_cron.clone_from(&job.recurring_cron);
    }

    fn overwrite_execution(&mut self, job: &Job) {
        self.updated = job.updated;
        self.result.clone_from(&job.result);
        self.state = job.state;
        self.scheduled = job.scheduled;
        self.total_executions = job.total_executions;
        self.run_by.clone_from(&job.run_by);
        self.run_deadline = job.run_deadline;
        self.run_progress = job.run_progress;
        self.last_executed = job.last_executed;
        self.consecutive_failures = job.consecutive_failures;
        self.last_failure_error.clone_from(&job.last_failure_error);
        self.max_duration_seconds = job.max_duration_seconds;
    }

    fn is_purgeable(&self, older_than: DateTime<Utc>) -> bool {
        !self.is_recurring
            && matches!(
                self.state,
                JobState::Finished | JobState::Failed | JobState::Canceled
            )
            && self.last_executed.is_some_and(|at| at < older_than)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn find(&self, uid: &str) -> Result<Job, StoreError> {
        self.read()?
            .get(uid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(uid.to_owned()))
    }

    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.uid) {
            return Err(StoreError::Duplicate(job.uid.clone()));
        }
        jobs.insert(job.uid.clone(), job.clone());
        Ok(())
    }

    async fn upsert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job.uid) {
            None => {
                jobs.insert(job.uid.clone(), job.clone());
            }
            Some(existing) if existing.definition_differs(job) => {
                existing.overwrite_definition(job);
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn update_definition(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        let existing = jobs
            .get_mut(&job.uid)
            .ok_or_else(|| StoreError::NotFound(job.uid.clone()))?;
        existing.overwrite_definition(job);
        existing.group_id.clone_from(&job.group_id);
        Ok(())
    }

    async fn update_execution(&self, job: &Job, expected: Expected) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        let existing = jobs
            .get_mut(&job.uid)
            .ok_or_else(|| StoreError::NotFound(job.uid.clone()))?;
        if existing.expected() != expected {
            return Ok(false);
        }
        existing.overwrite_execution(job);
        Ok(true)
    }

    async fn update_progress(&self, update: &ProgressUpdate) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&update.uid) {
            Some(job)
                if job.state == JobState::Running
                    && job.total_executions == update.total_executions =>
            {
                job.updated = update.updated;
                job.run_progress = update.progress;
                job.result.clone_from(&update.result);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut ready = self
            .read()?
            .values()
            .filter(|job| job.state == JobState::Scheduled && job.scheduled <= now)
            .cloned()
            .collect::<Vec<_>>();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled.cmp(&b.scheduled))
                .then_with(|| a.uid.cmp(&b.uid))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut overdue = self
            .read()?
            .values()
            .filter(|job| {
                job.state == JobState::Running
                    && job.run_deadline.is_some_and(|deadline| deadline < now)
            })
            .cloned()
            .collect::<Vec<_>>();
        overdue.sort_by_key(|job| job.run_deadline);
        Ok(overdue)
    }

    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|job| job.state == JobState::Scheduled && job.scheduled > now)
            .map(|job| job.scheduled)
            .min())
    }

    async fn count_running(&self) -> Result<usize, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|job| job.state == JobState::Running)
            .count())
    }

    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_purgeable(older_than));
        Ok((before - jobs.len()) as u64)
    }

    async fn delete_by_uid(&self, uid: &str) -> Result<(), StoreError> {
        self.write()?.remove(uid);
        Ok(())
    }

    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, job| job.group_id.as_deref() != Some(group_id));
        Ok((before - jobs.len()) as u64)
    }

    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|job| job.group_id.as_deref() == Some(group_id))
            .cloned()
            .collect())
    }
}
