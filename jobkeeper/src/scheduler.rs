//! The producer side API: schedules, cancels, inspects and purges jobs.
use std::{sync::Arc, time::Duration};

use crate::{
    cron,
    events::{JobStateChange, JobStateChangeStream},
    executor::Shared,
    job::{now, Definition, Job, JobProgress},
    notifier::{Notify, WakeMessage},
    store::{Store, StoreError},
    JobkeeperError,
};

/// How many times [`Scheduler::cancel`] reloads a job which changed under it before giving up.
const CANCEL_ATTEMPTS: usize = 3;

/// Writes jobs to the store of the [`crate::executor::Executor`] it was created from.
///
/// Obtained through [`crate::executor::Executor::scheduler`]. Cheap to clone.
pub struct Scheduler<S> {
    store: Arc<S>,
    shared: Arc<Shared>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S> std::fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl<S> Scheduler<S>
where
    S: Store + 'static,
{
    pub(crate) fn new(store: Arc<S>, shared: Arc<Shared>) -> Self {
        Self { store, shared }
    }

    /// Schedules a one-off job.
    ///
    /// Fails with [`JobkeeperError::Duplicate`] if a job with the same uid exists, whatever its
    /// state.
    pub async fn run(&self, definition: Definition) -> Result<(), JobkeeperError> {
        definition.validate()?;
        self.create(definition.into_new_job(None)).await
    }

    /// Schedules one-off jobs sharing `group_id`.
    ///
    /// Every definition is validated before any job is created. Jobs are created in order, so a
    /// duplicate uid leaves the jobs before it scheduled.
    pub async fn run_group(
        &self,
        group_id: impl Into<String>,
        definitions: impl IntoIterator<Item = Definition>,
    ) -> Result<(), JobkeeperError> {
        let group_id = group_id.into();
        if group_id.is_empty() {
            return Err(JobkeeperError::InvalidArgument(
                "group id must not be empty".to_owned(),
            ));
        }

        let definitions = definitions.into_iter().collect::<Vec<_>>();
        definitions.iter().try_for_each(Definition::validate)?;

        for definition in definitions {
            self.create(definition.into_new_job(Some(group_id.clone())))
                .await?;
        }
        Ok(())
    }

    /// Creates or updates a recurring job running `job_type` on the grid of the cron `expression`.
    ///
    /// The job first runs at the next cron time after now. Calling this again with an unchanged
    /// definition leaves the job, and so its schedule, untouched.
    pub async fn add_recurring(
        &self,
        uid: impl Into<String>,
        job_type: impl Into<String>,
        expression: impl Into<String>,
        max_duration: Duration,
    ) -> Result<(), JobkeeperError> {
        let expression = expression.into();
        let scheduled = cron::next_fire_time(&expression, now())?;
        let definition = Definition::new(uid, job_type)
            .with_priority(Job::PRIORITY_ELEVATED)
            .with_max_duration(max_duration)
            .schedule_at(scheduled);
        definition.validate()?;

        let mut job = definition.into_new_job(None);
        job.is_recurring = true;
        job.recurring_cron = expression;

        self.store.upsert(&job).await?;
        tracing::debug!(job.uid = %job.uid, %scheduled, "Recurring job registered");
        self.shared.notifier.notify(WakeMessage::At(scheduled));
        Ok(())
    }

    /// Cancels a scheduled or running job so that it is never claimed again.
    ///
    /// A job running in this process has its [`crate::executor::JobContext`] cancelled. Canceling
    /// a missing or already completed job does nothing. Recurring jobs can't be canceled.
    pub async fn cancel(&self, uid: &str) -> Result<(), JobkeeperError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let mut job = match self.store.find(uid).await {
                Ok(job) => job,
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            if job.is_recurring {
                return Err(JobkeeperError::InvalidArgument(format!(
                    "recurring job {uid} can't be canceled"
                )));
            }
            if !job.state.is_active() {
                return Ok(());
            }

            let expected = job.expected();
            job.cancel(now());
            match self.store.update_execution(&job, expected).await {
                Ok(true) => {
                    if self.shared.cancel_running(uid) {
                        tracing::debug!(job.uid = uid, "Signalled running job to stop");
                    }
                    tracing::info!(job.uid = uid, "Job canceled");
                    self.shared.events.publish(JobStateChange::from(&job));
                    return Ok(());
                }
                Ok(false) => tracing::debug!(job.uid = uid, "Job changed while canceling, retrying"),
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
        Err(JobkeeperError::Conflict(uid.to_owned()))
    }

    /// Cancels every scheduled or running job of the group. Recurring jobs are skipped.
    pub async fn cancel_group(&self, group_id: &str) -> Result<(), JobkeeperError> {
        for job in self.store.list_by_group_id(group_id).await? {
            if !job.is_recurring && job.state.is_active() {
                self.cancel(&job.uid).await?;
            }
        }
        Ok(())
    }

    pub async fn progress(&self, uid: &str) -> Result<JobProgress, JobkeeperError> {
        Ok(self.store.find(uid).await?.progress())
    }

    pub async fn progress_for_group(
        &self,
        group_id: &str,
    ) -> Result<Vec<JobProgress>, JobkeeperError> {
        Ok(self
            .store
            .list_by_group_id(group_id)
            .await?
            .iter()
            .map(Job::progress)
            .collect())
    }

    /// Deletes the job, whatever its state.
    pub async fn purge_by_uid(&self, uid: &str) -> Result<(), JobkeeperError> {
        Ok(self.store.delete_by_uid(uid).await?)
    }

    /// Deletes every job of the group and returns how many there were.
    pub async fn purge_by_group(&self, group_id: &str) -> Result<u64, JobkeeperError> {
        Ok(self.store.delete_by_group_id(group_id).await?)
    }

    /// Job state changes made by this process from now on.
    pub fn subscribe(&self) -> JobStateChangeStream {
        self.shared.events.subscribe()
    }

    async fn create(&self, job: Job) -> Result<(), JobkeeperError> {
        match self.store.create(&job).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(uid)) => return Err(JobkeeperError::Duplicate(uid)),
            Err(err) => return Err(err.into()),
        }
        tracing::debug!(job.uid = %job.uid, job.job_type = %job.job_type, scheduled = %job.scheduled, "Job scheduled");
        self.shared.notifier.notify(WakeMessage::At(job.scheduled));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        job::JobState,
        store::{memory::InMemoryStore, MockStore},
    };

    fn scheduler() -> (
        Scheduler<InMemoryStore>,
        InMemoryStore,
        mpsc::UnboundedReceiver<WakeMessage>,
    ) {
        let store = InMemoryStore::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(Arc::new(store.clone()), Arc::new(Shared::new(sender)));
        (scheduler, store, receiver)
    }

    async fn running(store: &InMemoryStore, uid: &str) -> Job {
        let mut job = store.find(uid).await.unwrap();
        let expected = job.expected();
        job.claim("executor-test", now());
        assert!(store.update_execution(&job, expected).await.unwrap());
        job
    }

    #[tokio::test]
    async fn run_creates_scheduled_job_and_wakes_executor() {
        let (scheduler, store, mut wake) = scheduler();

        scheduler
            .run(Definition::new("x", "noop").with_data("payload"))
            .await
            .unwrap();

        let job = store.find("x").await.unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.data, "payload");
        assert_eq!(job.group_id, None);
        assert_matches!(wake.try_recv(), Ok(WakeMessage::At(at)) if at == job.scheduled);
    }

    #[tokio::test]
    async fn run_rejects_duplicate_uid() {
        let (scheduler, _store, _wake) = scheduler();
        scheduler.run(Definition::new("x", "noop")).await.unwrap();

        assert_matches!(
            scheduler.run(Definition::new("x", "other")).await,
            Err(JobkeeperError::Duplicate(uid)) if uid == "x"
        );
    }

    #[tokio::test]
    async fn run_validates_before_storing() {
        let (scheduler, store, mut wake) = scheduler();

        assert_matches!(
            scheduler.run(Definition::new("x", "")).await,
            Err(JobkeeperError::InvalidArgument(_))
        );
        assert_matches!(store.find("x").await, Err(StoreError::NotFound(_)));
        assert!(wake.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_group_assigns_group_id() {
        let (scheduler, store, _wake) = scheduler();

        scheduler
            .run_group(
                "export",
                [Definition::new("a", "noop"), Definition::new("b", "noop")],
            )
            .await
            .unwrap();

        let jobs = store.list_by_group_id("export").await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs
            .iter()
            .all(|job| job.group_id.as_deref() == Some("export")));
    }

    #[tokio::test]
    async fn run_group_creates_nothing_when_a_definition_is_invalid() {
        let (scheduler, store, _wake) = scheduler();

        assert_matches!(
            scheduler
                .run_group(
                    "export",
                    [Definition::new("a", "noop"), Definition::new("", "noop")],
                )
                .await,
            Err(JobkeeperError::InvalidArgument(_))
        );
        assert!(store.list_by_group_id("export").await.unwrap().is_empty());
        assert_matches!(
            scheduler.run_group("", [Definition::new("a", "noop")]).await,
            Err(JobkeeperError::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn add_recurring_schedules_next_fire_time() {
        let (scheduler, store, mut wake) = scheduler();
        let before = now();

        scheduler
            .add_recurring("r", "report", "*/5 * * * *", Duration::from_secs(30))
            .await
            .unwrap();

        let job = store.find("r").await.unwrap();
        assert!(job.is_recurring);
        assert_eq!(job.recurring_cron, "*/5 * * * *");
        assert_eq!(job.priority, Job::PRIORITY_ELEVATED);
        assert_eq!(job.max_retries, 0);
        assert_eq!(job.max_duration_seconds, 30);
        assert!(job.scheduled > before);
        assert!(job.scheduled <= before + TimeDelta::minutes(5));
        assert_matches!(wake.try_recv(), Ok(WakeMessage::At(at)) if at == job.scheduled);
    }

    #[tokio::test]
    async fn add_recurring_is_idempotent() {
        let (scheduler, store, _wake) = scheduler();
        scheduler
            .add_recurring("r", "report", "0 0 * * *", Duration::from_secs(30))
            .await
            .unwrap();
        let first = store.find("r").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        scheduler
            .add_recurring("r", "report", "0 0 * * *", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(store.find("r").await.unwrap(), first);
    }

    #[tokio::test]
    async fn add_recurring_updates_changed_definition() {
        let (scheduler, store, _wake) = scheduler();
        scheduler
            .add_recurring("r", "report", "0 0 * * *", Duration::from_secs(30))
            .await
            .unwrap();

        scheduler
            .add_recurring("r", "report", "*/10 * * * *", Duration::from_secs(30))
            .await
            .unwrap();

        let job = store.find("r").await.unwrap();
        assert_eq!(job.recurring_cron, "*/10 * * * *");
        assert!(job.scheduled <= now() + TimeDelta::minutes(10));
    }

    #[tokio::test]
    async fn add_recurring_rejects_invalid_cron() {
        let (scheduler, store, _wake) = scheduler();

        assert_matches!(
            scheduler
                .add_recurring("r", "report", "every day", Duration::from_secs(30))
                .await,
            Err(JobkeeperError::InvalidCron { expression, .. }) if expression == "every day"
        );
        assert_matches!(store.find("r").await, Err(StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn canceled_job_is_never_ready() {
        let (scheduler, store, _wake) = scheduler();
        scheduler.run(Definition::new("x", "noop")).await.unwrap();

        scheduler.cancel("x").await.unwrap();

        assert_eq!(store.find("x").await.unwrap().state, JobState::Canceled);
        assert!(store
            .list_ready(now() + TimeDelta::days(1), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cancel_signals_locally_running_job() {
        let (scheduler, store, _wake) = scheduler();
        let mut changes = scheduler.subscribe();
        scheduler.run(Definition::new("x", "noop")).await.unwrap();
        let job = running(&store, "x").await;
        let cancellation = CancellationToken::new();
        scheduler
            .shared
            .track_running("x", job.total_executions, cancellation.clone());

        scheduler.cancel("x").await.unwrap();

        assert!(cancellation.is_cancelled());
        let job = store.find("x").await.unwrap();
        assert_eq!(job.state, JobState::Canceled);
        assert_eq!(job.run_by, None);
        let change = changes.next().await.unwrap();
        assert_eq!(change.uid, "x");
        assert_eq!(change.state, JobState::Canceled);
    }

    #[tokio::test]
    async fn cancel_of_missing_or_completed_job_is_a_no_op() {
        let (scheduler, store, _wake) = scheduler();
        store
            .create(&Job::raw_job().with_uid("done").with_state(JobState::Finished))
            .await
            .unwrap();

        scheduler.cancel("missing").await.unwrap();
        scheduler.cancel("done").await.unwrap();

        assert_eq!(store.find("done").await.unwrap().state, JobState::Finished);
    }

    #[tokio::test]
    async fn recurring_job_cannot_be_canceled() {
        let (scheduler, store, _wake) = scheduler();
        scheduler
            .add_recurring("r", "report", "0 0 * * *", Duration::from_secs(30))
            .await
            .unwrap();

        assert_matches!(
            scheduler.cancel("r").await,
            Err(JobkeeperError::InvalidArgument(_))
        );
        assert_eq!(store.find("r").await.unwrap().state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn cancel_gives_up_when_job_keeps_changing() {
        let mut store = MockStore::new();
        store
            .expect_find()
            .times(CANCEL_ATTEMPTS)
            .returning(|_| Ok(Job::raw_job()));
        store
            .expect_update_execution()
            .times(CANCEL_ATTEMPTS)
            .returning(|_, _| Ok(false));
        let (sender, _wake) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(Arc::new(store), Arc::new(Shared::new(sender)));

        assert_matches!(
            scheduler.cancel("job").await,
            Err(JobkeeperError::Conflict(uid)) if uid == "job"
        );
    }

    #[tokio::test]
    async fn cancel_group_cancels_active_jobs() {
        let (scheduler, store, _wake) = scheduler();
        scheduler
            .run_group(
                "export",
                [
                    Definition::new("a", "noop"),
                    Definition::new("b", "noop"),
                    Definition::new("c", "noop"),
                ],
            )
            .await
            .unwrap();
        running(&store, "b").await;
        store
            .create(
                &Job::raw_job()
                    .with_uid("other")
                    .with_group_id("import"),
            )
            .await
            .unwrap();

        scheduler.cancel_group("export").await.unwrap();

        for uid in ["a", "b", "c"] {
            assert_eq!(store.find(uid).await.unwrap().state, JobState::Canceled);
        }
        assert_eq!(store.find("other").await.unwrap().state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn progress_reports_job_snapshots() {
        let (scheduler, store, _wake) = scheduler();
        scheduler
            .run_group(
                "export",
                [Definition::new("a", "noop"), Definition::new("b", "noop")],
            )
            .await
            .unwrap();
        running(&store, "a").await;

        assert_eq!(
            scheduler.progress("a").await.unwrap().state,
            JobState::Running
        );
        assert_matches!(
            scheduler.progress("missing").await,
            Err(JobkeeperError::Store(StoreError::NotFound(_)))
        );

        let mut states = scheduler
            .progress_for_group("export")
            .await
            .unwrap()
            .into_iter()
            .map(|progress| progress.state)
            .collect::<Vec<_>>();
        states.sort_by_key(|state| state.as_str());
        assert_eq!(states, [JobState::Running, JobState::Scheduled]);
    }

    #[tokio::test]
    async fn purge_deletes_jobs() {
        let (scheduler, store, _wake) = scheduler();
        scheduler.run(Definition::new("x", "noop")).await.unwrap();
        scheduler
            .run_group(
                "export",
                [Definition::new("a", "noop"), Definition::new("b", "noop")],
            )
            .await
            .unwrap();

        scheduler.purge_by_uid("x").await.unwrap();
        assert_eq!(scheduler.purge_by_group("export").await.unwrap(), 2);

        assert_matches!(store.find("x").await, Err(StoreError::NotFound(_)));
        assert!(store.list_by_group_id("export").await.unwrap().is_empty());
    }
}
