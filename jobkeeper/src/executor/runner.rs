use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use super::{registry::Registry, JobContext, Shared};
use crate::{
    backoff::Strategy,
    events::JobStateChange,
    job::{
        lifecycle::{Outcome, DEADLINE_EXCEEDED},
        now, Job, JobState,
    },
    notifier::{Notify, WakeMessage},
    progress::ProgressReporter,
    store::{Store, StoreError},
};

/// Runs claimed jobs and records their outcome.
pub(crate) struct JobRunner<S> {
    store: Arc<S>,
    registry: Arc<Registry>,
    shared: Arc<Shared>,
    retry_backoff: Arc<dyn Strategy + Send + Sync>,
}

impl<S> Clone for JobRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            shared: self.shared.clone(),
            retry_backoff: self.retry_backoff.clone(),
        }
    }
}

impl<S> JobRunner<S>
where
    S: Store + 'static,
{
    pub(crate) fn new(
        store: Arc<S>,
        registry: Arc<Registry>,
        shared: Arc<Shared>,
        retry_backoff: Arc<dyn Strategy + Send + Sync>,
    ) -> Self {
        Self {
            store,
            registry,
            shared,
            retry_backoff,
        }
    }

    /// Runs a job this executor has just claimed, `job` being the claimed row.
    #[instrument(skip_all, fields(job.uid = %job.uid, job.job_type = %job.job_type))]
    pub(crate) async fn execute(self, job: Job) {
        let started = Instant::now();
        let lease = job.total_executions;
        let cancellation = CancellationToken::new();
        self.shared
            .track_running(&job.uid, lease, cancellation.clone());

        tracing::debug!(attempt = lease, "Executing job");
        let outcome = self.invoke(&job, cancellation).await;

        self.shared.untrack_running(&job.uid, lease);
        self.record(&job.uid, lease, outcome, started.elapsed())
            .await;
    }

    async fn invoke(&self, job: &Job, cancellation: CancellationToken) -> Outcome {
        let Some(handler) = self.registry.get(&job.job_type) else {
            tracing::error!("No handler registered for job type {}", job.job_type);
            return Outcome::Unrecoverable(format!(
                "no handler registered for job type {}",
                job.job_type
            ));
        };

        let deadline = job.run_deadline.unwrap_or_else(now);
        let remaining = (deadline - now()).to_std().unwrap_or_default();
        let ctx = JobContext {
            uid: job.uid.clone(),
            job_type: job.job_type.clone(),
            data: job.data.clone(),
            deadline,
            attempt: job.total_executions,
            cancellation: cancellation.clone(),
        };
        let store: Arc<dyn Store> = self.store.clone();
        let progress = ProgressReporter::new(store, self.shared.events.clone(), job);

        let mut task =
            tokio::spawn(async move { handler.handle(ctx, progress).await }.in_current_span());

        match tokio::time::timeout(remaining, &mut task).await {
            Ok(Ok(Ok(result))) => Outcome::Success(result),
            Ok(Ok(Err(error))) => Outcome::Failure(error.to_string()),
            Ok(Err(error)) => Outcome::Failure(join_error_message(error)),
            Err(_elapsed) => {
                cancellation.cancel();
                task.abort();
                Outcome::Failure(DEADLINE_EXCEEDED.to_owned())
            }
        }
    }

    async fn record(&self, uid: &str, lease: i32, outcome: Outcome, duration: Duration) {
        let mut job = match self.store.find(uid).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                tracing::debug!("Job was deleted while running, discarding outcome");
                return;
            }
            Err(err) => {
                tracing::error!(?err, "Failed to load job {uid} to record its outcome");
                return;
            }
        };

        if job.total_executions != lease {
            tracing::debug!("Job was claimed again while running, discarding outcome");
            return;
        }

        let expected = job.expected();
        if !job.complete(&outcome, now(), self.retry_backoff.as_ref()) {
            tracing::debug!(job.state = %job.state, "Job is no longer running, discarding outcome");
            return;
        }

        match self.store.update_execution(&job, expected).await {
            Ok(true) => self.recorded(&job, &outcome, duration),
            Ok(false) => tracing::debug!("Lease lost while recording outcome"),
            Err(err) => tracing::error!(
                ?err,
                "Failed to record outcome of job {uid}, it will be reclaimed once its deadline passes"
            ),
        }
    }

    fn recorded(&self, job: &Job, outcome: &Outcome, duration: Duration) {
        match (job.state, outcome) {
            (JobState::Finished, _) => {
                tracing::info!(?duration, "Job finished")
            }
            (JobState::Scheduled, Outcome::Success(_)) => {
                tracing::info!(?duration, next = %job.scheduled, "Recurring job finished")
            }
            (JobState::Scheduled, _) => tracing::warn!(
                ?duration,
                error = %job.last_failure_error,
                consecutive_failures = job.consecutive_failures,
                next = %job.scheduled,
                "Job failed and will run again",
            ),
            _ => tracing::warn!(
                ?duration,
                error = %job.last_failure_error,
                consecutive_failures = job.consecutive_failures,
                "Job failed",
            ),
        }

        self.shared.events.publish(JobStateChange::from(job));
        if job.state == JobState::Scheduled {
            self.shared.notifier.notify(WakeMessage::At(job.scheduled));
        }
    }
}

fn join_error_message(error: JoinError) -> String {
    let message = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .map(|panic| format!("handler panicked: {panic}"))
            .unwrap_or(message),
        Err(_) => message,
    }
}
