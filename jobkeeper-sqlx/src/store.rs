use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobkeeper::{
    job::Job,
    store::{Expected, ProgressUpdate, Store, StoreError},
};

use crate::{map_err, PgStore};

impl PgStore {
    /// Interprets the result of a guarded update of `uid`.
    async fn handle_guarded_update(
        &self,
        result: sqlx::Result<u64>,
        uid: &str,
    ) -> Result<bool, StoreError> {
        match result.map_err(map_err)? {
            0 if self.exists(uid).await.map_err(map_err)? => Ok(false),
            0 => Err(StoreError::NotFound(uid.to_owned())),
            1 => Ok(true),
            _ => Err(StoreError::BadState),
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn find(&self, uid: &str) -> Result<Job, StoreError> {
        self.find_job(uid)
            .await
            .map_err(map_err)?
            .ok_or_else(|| StoreError::NotFound(uid.to_owned()))
    }

    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        match self.insert_job(job).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(StoreError::Duplicate(job.uid.clone()))
            }
            Err(error) => Err(map_err(error)),
        }
    }

    async fn upsert(&self, job: &Job) -> Result<(), StoreError> {
        self.upsert_job(job).await.map_err(map_err)?;
        Ok(())
    }

    async fn update_definition(&self, job: &Job) -> Result<(), StoreError> {
        match self.update_definition_of(job).await.map_err(map_err)? {
            0 => Err(StoreError::NotFound(job.uid.clone())),
            _ => Ok(()),
        }
    }

    async fn update_execution(&self, job: &Job, expected: Expected) -> Result<bool, StoreError> {
        let result = self.update_execution_of(job, expected).await;
        self.handle_guarded_update(result, &job.uid).await
    }

    async fn update_progress(&self, update: &ProgressUpdate) -> Result<bool, StoreError> {
        Ok(self.update_progress_of(update).await.map_err(map_err)? > 0)
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.ready_jobs(now, limit).await.map_err(map_err)
    }

    async fn list_deadline_exceeded(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.deadline_exceeded_jobs(now).await.map_err(map_err)
    }

    async fn next_scheduled_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.next_scheduled_after(now).await.map_err(map_err)
    }

    async fn count_running(&self) -> Result<usize, StoreError> {
        let count = self.running_count().await.map_err(map_err)?;
        usize::try_from(count).map_err(|_| StoreError::BadState)
    }

    async fn delete_old(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        self.delete_completed_before(older_than)
            .await
            .map_err(map_err)
    }

    async fn delete_by_uid(&self, uid: &str) -> Result<(), StoreError> {
        self.delete_job(uid).await.map_err(map_err)?;
        Ok(())
    }

    async fn delete_by_group_id(&self, group_id: &str) -> Result<u64, StoreError> {
        self.delete_group(group_id).await.map_err(map_err)
    }

    async fn list_by_group_id(&self, group_id: &str) -> Result<Vec<Job>, StoreError> {
        self.group_jobs(group_id).await.map_err(map_err)
    }
}
