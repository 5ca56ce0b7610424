use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{runner::JobRunner, Shared};
use crate::{
    backoff::Strategy,
    events::JobStateChange,
    job::now,
    notifier::{Notify, WakeMessage},
    store::{Store, StoreError},
};

/// What one processing cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleReport {
    pub(crate) started: usize,
    /// The earliest scheduled job after this cycle, unknown when backlogged.
    pub(crate) next: Option<DateTime<Utc>>,
    /// Ready jobs were left behind for lack of capacity.
    pub(crate) backlogged: bool,
}

/// The claim loop of an executor.
pub(crate) struct Poller<S> {
    store: Arc<S>,
    runner: JobRunner<S>,
    shared: Arc<Shared>,
    instance_id: String,
    max_running: usize,
    poll_interval: Duration,
    retry_backoff: Arc<dyn Strategy + Send + Sync>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    backlogged: bool,
}

impl<S> Poller<S>
where
    S: Store + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<S>,
        runner: JobRunner<S>,
        shared: Arc<Shared>,
        instance_id: String,
        workers: usize,
        max_running: usize,
        poll_interval: Duration,
        retry_backoff: Arc<dyn Strategy + Send + Sync>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            store,
            runner,
            shared,
            instance_id,
            max_running,
            poll_interval,
            retry_backoff,
            semaphore: Arc::new(Semaphore::new(workers)),
            tracker,
            backlogged: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut wake: mpsc::UnboundedReceiver<WakeMessage>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!(instance_id = %self.instance_id, "Starting job executor");
        let mut next_tick = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = wake.recv() => match message {
                    Some(WakeMessage::At(at)) => {
                        let at = instant_at(at);
                        if at < next_tick {
                            tracing::trace!(delay = ?at.saturating_duration_since(Instant::now()), "Processing rescheduled earlier");
                            next_tick = at;
                        }
                    }
                    Some(WakeMessage::IfBacklogged) => {
                        if self.backlogged {
                            next_tick = Instant::now();
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(next_tick) => {
                    let now = now();
                    let delay = match self.process(now).await {
                        Ok(report) => {
                            self.backlogged = report.backlogged;
                            let delay = report
                                .next
                                .and_then(|next| (next - now).to_std().ok())
                                .map_or(self.poll_interval, |until| until.min(self.poll_interval));
                            tracing::trace!(started = report.started, backlogged = report.backlogged, next = ?delay, "Processed ready jobs");
                            delay
                        }
                        Err(err) => {
                            tracing::error!(?err, next = ?self.poll_interval, "Failed to process ready jobs");
                            self.poll_interval
                        }
                    };
                    next_tick = Instant::now() + delay;
                }
            }
        }
        tracing::debug!(instance_id = %self.instance_id, "Job executor stopped");
    }

    /// Reclaims overdue jobs, then claims and starts as many ready jobs as there is capacity for.
    ///
    /// Fails, abandoning the rest of the cycle, if the store fails to list or count jobs.
    pub(crate) async fn process(&mut self, now: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        self.reclaim_overdue(now).await?;

        let running = self.store.count_running().await?;
        let slots = self
            .semaphore
            .available_permits()
            .min(self.max_running.saturating_sub(running));

        let mut ready = self.store.list_ready(now, slots + 1).await?;
        let mut backlogged = ready.len() > slots;
        ready.truncate(slots);

        let mut started = 0;
        for mut job in ready {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                backlogged = true;
                break;
            };

            let expected = job.expected();
            job.claim(&self.instance_id, now);
            match self.store.update_execution(&job, expected).await {
                Ok(true) => {
                    started += 1;
                    self.shared.events.publish(JobStateChange::from(&job));
                    let runner = self.runner.clone();
                    let shared = self.shared.clone();
                    self.tracker.spawn(async move {
                        runner.execute(job).await;
                        drop(permit);
                        shared.notifier.notify(WakeMessage::IfBacklogged);
                    });
                }
                Ok(false) => {
                    tracing::debug!(job.uid = %job.uid, "Job was claimed by another executor")
                }
                Err(StoreError::NotFound(_)) => {
                    tracing::debug!(job.uid = %job.uid, "Job was deleted before it could be claimed")
                }
                Err(err) => return Err(err),
            }
        }

        let next = if backlogged {
            None
        } else {
            self.store.next_scheduled_time(now).await?
        };

        Ok(CycleReport {
            started,
            next,
            backlogged,
        })
    }

    async fn reclaim_overdue(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        for mut job in self.store.list_deadline_exceeded(now).await? {
            let expected = job.expected();
            let run_by = job.run_by.take();
            if !job.expire(now, self.retry_backoff.as_ref()) {
                continue;
            }
            match self.store.update_execution(&job, expected).await {
                Ok(true) => {
                    tracing::warn!(
                        job.uid = %job.uid,
                        job.job_type = %job.job_type,
                        job.state = %job.state,
                        run_by = ?run_by,
                        "Reclaimed job whose deadline was exceeded",
                    );
                    self.shared.events.publish(JobStateChange::from(&job));
                }
                Ok(false) => {
                    tracing::debug!(job.uid = %job.uid, "Overdue job was already reclaimed")
                }
                Err(err) => {
                    tracing::error!(?err, job.uid = %job.uid, "Failed to reclaim overdue job")
                }
            }
        }
        Ok(())
    }
}

fn instant_at(at: DateTime<Utc>) -> Instant {
    Instant::now() + (at - now()).to_std().unwrap_or_default()
}
