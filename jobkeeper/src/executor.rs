//! The runtime which claims and runs jobs.
//!
//! An [`Executor`] owns a registry of [`Handler`]s, one per job type. Once spawned it runs a single
//! poll loop which, on every cycle:
//!
//! 1. reclaims running jobs whose lease ran out, recording a `deadline exceeded` failure;
//! 2. works out how many jobs it may start, bounded by its own worker count and by the number
//!    of jobs running across every executor sharing the store;
//! 3. claims that many ready jobs, highest priority first, through a conditional update, and
//!    runs each claimed job in its own task.
//!
//! The loop sleeps until the next job is due or the poll interval elapses, whichever comes first.
//! Scheduling a job wakes it early, as does a job finishing while ready jobs were left behind.
//!
//! Several executors, in one process or many, can share a store. Losing a claim race to another
//! executor is the expected outcome and is only logged at debug level.
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use fxhash::FxHashMap;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::ExecutorConfig,
    events::EventBus,
    notifier::WakeMessage,
    scheduler::Scheduler,
    store::Store,
    JobkeeperError,
};

mod handler;
mod poller;
mod purge;
mod registry;
mod runner;

pub use handler::{handler_fn, Handler, HandlerError, HandlerFn, JobContext};

use poller::Poller;
use purge::{PurgeHandler, PURGE_CRON, PURGE_MAX_DURATION, PURGE_TYPE, PURGE_UID};
use registry::Registry;
use runner::JobRunner;

/// State shared between an executor and the schedulers created from it.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) notifier: mpsc::UnboundedSender<WakeMessage>,
    pub(crate) events: EventBus,
    running: Mutex<FxHashMap<String, (i32, CancellationToken)>>,
}

impl Shared {
    pub(crate) fn new(notifier: mpsc::UnboundedSender<WakeMessage>) -> Self {
        Self {
            notifier,
            events: EventBus::new(),
            running: Default::default(),
        }
    }

    pub(crate) fn track_running(&self, uid: &str, lease: i32, cancellation: CancellationToken) {
        self.running()
            .insert(uid.to_owned(), (lease, cancellation));
    }

    pub(crate) fn untrack_running(&self, uid: &str, lease: i32) {
        let mut running = self.running();
        if running.get(uid).is_some_and(|(tracked, _)| *tracked == lease) {
            running.remove(uid);
        }
    }

    /// Cancels the job if it is running in this process.
    pub(crate) fn cancel_running(&self, uid: &str) -> bool {
        self.running()
            .get(uid)
            .map(|(_, cancellation)| cancellation.cancel())
            .is_some()
    }

    fn cancel_all_running(&self) {
        self.running()
            .values()
            .for_each(|(_, cancellation)| cancellation.cancel());
    }

    fn running(&self) -> MutexGuard<'_, FxHashMap<String, (i32, CancellationToken)>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claims and runs jobs of the registered types.
///
/// # Example
///
/// ```
/// use jobkeeper::prelude::*;
/// use jobkeeper::store::memory::InMemoryStore;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), JobkeeperError> {
/// let executor = Executor::new(InMemoryStore::new(), ExecutorConfig::default().with_workers(4))
///     .register("noop", handler_fn(|_ctx, _progress| async move { Ok(String::new()) }))?;
///
/// let handle = executor.spawn().await?;
/// handle.graceful_shutdown(Duration::from_secs(30)).await?;
/// # Ok(())
/// # }
/// ```
pub struct Executor<S> {
    store: Arc<S>,
    config: ExecutorConfig,
    registry: Registry,
    shared: Arc<Shared>,
    wake: mpsc::UnboundedReceiver<WakeMessage>,
}

impl<S> Executor<S>
where
    S: Store + 'static,
{
    pub fn new(store: S, config: ExecutorConfig) -> Self {
        let (sender, wake) = mpsc::unbounded_channel();
        Self {
            store: Arc::new(store),
            config,
            registry: Registry::default(),
            shared: Arc::new(Shared::new(sender)),
            wake,
        }
    }

    /// Registers the handler for jobs of `job_type`.
    ///
    /// Fails with [`JobkeeperError::AlreadyRegistered`] if the type already has a handler.
    pub fn register(
        mut self,
        job_type: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Result<Self, JobkeeperError> {
        self.registry.register(job_type.into(), Arc::new(handler))?;
        Ok(self)
    }

    /// A [`Scheduler`] writing to this executor's store and waking its poll loop.
    pub fn scheduler(&self) -> Scheduler<S> {
        Scheduler::new(self.store.clone(), self.shared.clone())
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Starts the poll loop.
    ///
    /// Unless retention is disabled this first registers the built-in purge job and upserts its
    /// recurring schedule.
    pub async fn spawn(mut self) -> Result<ExecutorHandle, JobkeeperError> {
        if let Some(retention) = self.config.retention() {
            self.registry.register(
                PURGE_TYPE.to_owned(),
                Arc::new(PurgeHandler::new(self.store.clone(), retention)),
            )?;
            self.scheduler()
                .add_recurring(PURGE_UID, PURGE_TYPE, PURGE_CRON, PURGE_MAX_DURATION)
                .await?;
        }

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let shared = self.shared.clone();
        let (poller, wake) = self.into_poller(tracker.clone());
        let handle = tokio::spawn(poller.run(wake, shutdown.clone()));

        Ok(ExecutorHandle {
            shutdown,
            handle,
            tracker,
            shared,
        })
    }

    fn into_poller(
        self,
        tracker: TaskTracker,
    ) -> (Poller<S>, mpsc::UnboundedReceiver<WakeMessage>) {
        let runner = JobRunner::new(
            self.store.clone(),
            Arc::new(self.registry),
            self.shared.clone(),
            self.config.retry_backoff(),
        );
        let poller = Poller::new(
            self.store,
            runner,
            self.shared,
            self.config.instance_id().to_owned(),
            self.config.workers(),
            self.config.max_running(),
            self.config.poll_interval(),
            self.config.retry_backoff(),
            tracker,
        );
        (poller, self.wake)
    }
}

impl<S> fmt::Debug for Executor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Controls a spawned [`Executor`].
#[derive(Debug)]
pub struct ExecutorHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    tracker: TaskTracker,
    shared: Arc<Shared>,
}

impl ExecutorHandle {
    /// Stops claiming new jobs and waits up to `grace` for running jobs to finish.
    ///
    /// Jobs still running after `grace` are canceled and left to the deadline sweep of the
    /// remaining executors, and [`JobkeeperError::GracefulShutdownFailed`] is returned.
    pub async fn graceful_shutdown(self, grace: Duration) -> Result<(), JobkeeperError> {
        tracing::debug!("Shutting down job executor");
        self.shutdown.cancel();
        self.handle.await.map_err(|err| {
            tracing::error!(?err, "Job executor poll loop failed");
            JobkeeperError::GracefulShutdownFailed
        })?;

        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                running = self.tracker.len(),
                "Jobs still running after the grace period, canceling them"
            );
            self.shared.cancel_all_running();
            return Err(JobkeeperError::GracefulShutdownFailed);
        }

        tracing::info!("Job executor gracefully stopped");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::{
        backoff::BackoffStrategy,
        events::{JobStateChange, JobStateChangeStream},
        job::{now, Definition, Job, JobState},
        store::{memory::InMemoryStore, MockStore, StoreError},
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> ExecutorConfig {
        ExecutorConfig::default()
            .with_instance_id("executor-test")
            .with_retention(None)
    }

    fn noop() -> impl Handler {
        handler_fn(|_ctx, _progress| async move { Ok("ok".to_owned()) })
    }

    async fn wait_for(
        changes: &mut JobStateChangeStream,
        uid: &str,
        state: JobState,
    ) -> JobStateChange {
        let changes = changes.timeout(WAIT);
        tokio::pin!(changes);
        loop {
            match changes.next().await {
                Some(Ok(change)) if change.uid == uid && change.state == state => return change,
                Some(Ok(_)) => continue,
                Some(Err(_)) => panic!("Timed out waiting for job {uid} to become {state}"),
                None => panic!("Job state change stream closed"),
            }
        }
    }

    #[tokio::test]
    async fn one_off_job_runs_to_completion() {
        let store = InMemoryStore::new();
        let executor = Executor::new(store.clone(), config())
            .register("noop", noop())
            .unwrap();
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let handle = executor.spawn().await.unwrap();

        scheduler.run(Definition::new("x", "noop")).await.unwrap();
        wait_for(&mut changes, "x", JobState::Finished).await;

        let job = store.find("x").await.unwrap();
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.consecutive_failures, 0);
        assert_eq!(job.result, "ok");
        assert_eq!(job.run_progress, Job::PROGRESS_MAX);
        assert_eq!(job.total_executions, 1);
        handle.graceful_shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn recurring_job_recovers_after_failure() {
        let store = InMemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = Executor::new(store.clone(), config())
            .register("echo", {
                let calls = calls.clone();
                handler_fn(move |ctx: JobContext, _progress| {
                    let calls = calls.clone();
                    async move {
                        match calls.fetch_add(1, Ordering::SeqCst) {
                            0 => Err("first run fails".into()),
                            _ => Ok(ctx.uid),
                        }
                    }
                })
            })
            .unwrap();
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());

        scheduler
            .add_recurring("y", "echo", "* * * * *", Duration::from_secs(60))
            .await
            .unwrap();

        let scheduled = store.find("y").await.unwrap().scheduled;
        assert_eq!(poller.process(scheduled).await.unwrap().started, 1);
        let change = wait_for(&mut changes, "y", JobState::Scheduled).await;
        assert_eq!(change.consecutive_failures, 1);
        assert_eq!(change.last_failure_error, "first run fails");

        let scheduled = store.find("y").await.unwrap().scheduled;
        assert_eq!(poller.process(scheduled).await.unwrap().started, 1);
        wait_for(&mut changes, "y", JobState::Scheduled).await;

        let job = store.find("y").await.unwrap();
        assert_eq!(job.consecutive_failures, 0);
        assert_eq!(job.total_executions, 2);
        assert_eq!(job.state, JobState::Scheduled);
        assert!(job.scheduled > now());
    }

    #[tokio::test]
    async fn failed_one_off_job_is_retried_after_backoff() {
        let store = InMemoryStore::new();
        let executor = Executor::new(store.clone(), config())
            .register(
                "fail",
                handler_fn(|_ctx, _progress| async move { Err("nope".into()) }),
            )
            .unwrap();
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());

        scheduler
            .run(Definition::new("retry", "fail").with_max_retries(1))
            .await
            .unwrap();

        poller.process(now()).await.unwrap();
        let change = wait_for(&mut changes, "retry", JobState::Scheduled).await;
        assert_eq!(change.consecutive_failures, 1);

        let job = store.find("retry").await.unwrap();
        assert!(job.scheduled > now() + TimeDelta::seconds(10));
        assert_eq!(poller.process(now()).await.unwrap().started, 0);

        poller.process(job.scheduled).await.unwrap();
        wait_for(&mut changes, "retry", JobState::Failed).await;

        let job = store.find("retry").await.unwrap();
        assert_eq!(job.consecutive_failures, 2);
        assert!(store
            .list_ready(job.scheduled + TimeDelta::days(1), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn job_without_handler_fails_without_retry() {
        let store = InMemoryStore::new();
        let executor = Executor::new(store.clone(), config());
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());

        scheduler
            .run(Definition::new("orphan", "unknown").with_max_retries(3))
            .await
            .unwrap();
        poller.process(now()).await.unwrap();
        wait_for(&mut changes, "orphan", JobState::Failed).await;

        let job = store.find("orphan").await.unwrap();
        assert_eq!(job.consecutive_failures, 1);
        assert!(job.last_failure_error.contains("no handler registered"));
    }

    #[tokio::test]
    async fn panicking_handler_is_recorded_as_failure() {
        let store = InMemoryStore::new();
        let executor = Executor::new(store.clone(), config())
            .register(
                "panic",
                handler_fn(|_ctx, _progress| async move {
                    if true {
                        panic!("boom");
                    }
                    Ok(String::new())
                }),
            )
            .unwrap();
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());

        scheduler.run(Definition::new("p", "panic")).await.unwrap();
        poller.process(now()).await.unwrap();
        wait_for(&mut changes, "p", JobState::Failed).await;

        let job = store.find("p").await.unwrap();
        assert_eq!(job.last_failure_error, "handler panicked: boom");
    }

    #[tokio::test]
    async fn hung_handler_is_aborted_at_its_deadline() {
        let store = InMemoryStore::new();
        let executor = Executor::new(store.clone(), config())
            .register(
                "hang",
                handler_fn(|ctx: JobContext, _progress| async move {
                    ctx.cancelled().await;
                    std::future::pending::<()>().await;
                    Ok(String::new())
                }),
            )
            .unwrap();
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());

        scheduler
            .run(Definition::new("h", "hang").with_max_duration(Duration::from_secs(1)))
            .await
            .unwrap();
        poller.process(now()).await.unwrap();
        wait_for(&mut changes, "h", JobState::Failed).await;

        let job = store.find("h").await.unwrap();
        assert_eq!(job.last_failure_error, "deadline exceeded");
        assert_eq!(job.run_by, None);
    }

    #[tokio::test]
    async fn overdue_jobs_of_dead_executors_are_reclaimed() {
        let store = InMemoryStore::new();
        let claimed_at = now() - TimeDelta::minutes(5);
        let mut job = Job::raw_job()
            .with_uid("stuck")
            .with_max_duration_seconds(1)
            .with_max_retries(1);
        store.create(&job).await.unwrap();
        let expected = job.expected();
        job.claim("executor-dead", claimed_at);
        assert!(store.update_execution(&job, expected).await.unwrap());

        let executor = Executor::new(store.clone(), config());
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());
        let report = poller.process(claimed_at + TimeDelta::seconds(2)).await.unwrap();

        assert_eq!(report.started, 0);
        let job = store.find("stuck").await.unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.consecutive_failures, 1);
        assert_eq!(job.last_failure_error, "deadline exceeded");
        assert_eq!(job.run_by, None);
    }

    #[tokio::test]
    async fn reclaiming_with_saturated_backoff_keeps_the_loop_alive() {
        let store = InMemoryStore::new();
        let claimed_at = now() - TimeDelta::minutes(5);
        let mut stuck = Job::raw_job()
            .with_uid("stuck")
            .with_max_duration_seconds(1)
            .with_max_retries(100);
        stuck.consecutive_failures = 31;
        store.create(&stuck).await.unwrap();
        let expected = stuck.expected();
        stuck.claim("executor-dead", claimed_at);
        assert!(store.update_execution(&stuck, expected).await.unwrap());

        let executor = Executor::new(
            store.clone(),
            config().with_retry_backoff(BackoffStrategy::exponential(TimeDelta::seconds(1))),
        )
        .register("noop", noop())
        .unwrap();
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let handle = executor.spawn().await.unwrap();

        wait_for(&mut changes, "stuck", JobState::Scheduled).await;
        scheduler.run(Definition::new("x", "noop")).await.unwrap();
        wait_for(&mut changes, "x", JobState::Finished).await;

        let stuck = store.find("stuck").await.unwrap();
        assert_eq!(stuck.consecutive_failures, 32);
        assert!(stuck.scheduled > now() + TimeDelta::days(300));
        handle.graceful_shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn finished_job_wakes_backlogged_loop() {
        let store = InMemoryStore::new();
        store
            .create(
                &Job::raw_job()
                    .with_uid("first")
                    .with_priority(Job::PRIORITY_ELEVATED),
            )
            .await
            .unwrap();
        store.create(&Job::raw_job().with_uid("second")).await.unwrap();
        let executor = Executor::new(
            store.clone(),
            config()
                .with_workers(1)
                .with_poll_interval(Duration::from_secs(600)),
        )
        .register("noop", noop())
        .unwrap();
        let mut changes = executor.scheduler().subscribe();
        let started = tokio::time::Instant::now();
        let handle = executor.spawn().await.unwrap();

        wait_for(&mut changes, "first", JobState::Finished).await;
        wait_for(&mut changes, "second", JobState::Finished).await;

        assert!(started.elapsed() < WAIT);
        assert_eq!(store.count_running().await.unwrap(), 0);
        handle.graceful_shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn loop_sleeps_until_next_job_instead_of_poll_interval() {
        let store = InMemoryStore::new();
        let scheduled = now() + TimeDelta::milliseconds(300);
        store
            .create(&Job::raw_job().with_uid("soon").with_scheduled(scheduled))
            .await
            .unwrap();
        let executor = Executor::new(
            store.clone(),
            config().with_poll_interval(Duration::from_secs(600)),
        )
        .register("noop", noop())
        .unwrap();
        let mut changes = executor.scheduler().subscribe();
        let handle = executor.spawn().await.unwrap();

        let change = wait_for(&mut changes, "soon", JobState::Running).await;
        assert!(change.at >= scheduled);
        wait_for(&mut changes, "soon", JobState::Finished).await;
        handle.graceful_shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn only_one_executor_claims_a_job() {
        let store = InMemoryStore::new();
        store.create(&Job::raw_job().with_uid("contested")).await.unwrap();
        let tracker = TaskTracker::new();
        let (mut first, _first_wake) = Executor::new(store.clone(), config().with_instance_id("a"))
            .register("noop", noop())
            .unwrap()
            .into_poller(tracker.clone());
        let (mut second, _second_wake) =
            Executor::new(store.clone(), config().with_instance_id("b"))
                .register("noop", noop())
                .unwrap()
                .into_poller(tracker.clone());

        let now = now();
        let (first, second) = tokio::join!(first.process(now), second.process(now));

        assert_eq!(first.unwrap().started + second.unwrap().started, 1);
        tracker.close();
        tracker.wait().await;
        assert_eq!(store.find("contested").await.unwrap().total_executions, 1);
    }

    #[tokio::test]
    async fn capacity_limits_claims_and_marks_backlog() {
        let store = InMemoryStore::new();
        let release = CancellationToken::new();
        let executor = Executor::new(store.clone(), config().with_workers(2))
            .register("wait", {
                let release = release.clone();
                handler_fn(move |_ctx, _progress| {
                    let release = release.clone();
                    async move {
                        release.cancelled().await;
                        Ok(String::new())
                    }
                })
            })
            .unwrap();
        let scheduler = executor.scheduler();
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());
        for uid in ["a", "b", "c"] {
            scheduler.run(Definition::new(uid, "wait")).await.unwrap();
        }

        let report = poller.process(now()).await.unwrap();

        assert_eq!(report.started, 2);
        assert!(report.backlogged);
        assert_eq!(report.next, None);
        assert_eq!(store.count_running().await.unwrap(), 2);

        let report = poller.process(now()).await.unwrap();
        assert_eq!(report.started, 0);
        assert!(report.backlogged);
        release.cancel();
    }

    #[tokio::test]
    async fn global_running_ceiling_is_respected() {
        let store = InMemoryStore::new();
        let running = Job::raw_job().with_uid("elsewhere");
        store.create(&running).await.unwrap();
        let expected = running.expected();
        let mut running = running;
        running.claim("executor-other", now());
        assert!(store.update_execution(&running, expected).await.unwrap());
        store.create(&Job::raw_job().with_uid("ready")).await.unwrap();

        let executor = Executor::new(store.clone(), config().with_max_running(1))
            .register("noop", noop())
            .unwrap();
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());
        let report = poller.process(now()).await.unwrap();

        assert_eq!(report.started, 0);
        assert!(report.backlogged);
        assert_eq!(store.find("ready").await.unwrap().state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn idle_cycle_reports_next_scheduled_time() {
        let store = InMemoryStore::new();
        let executor = Executor::new(store.clone(), config());
        let scheduler = executor.scheduler();
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());
        let later = now() + TimeDelta::minutes(3);
        scheduler
            .run(Definition::new("later", "noop").schedule_at(later))
            .await
            .unwrap();

        let report = poller.process(now()).await.unwrap();

        assert_eq!(report.started, 0);
        assert!(!report.backlogged);
        assert_eq!(report.next, Some(later));
    }

    #[tokio::test]
    async fn store_failure_aborts_only_the_cycle() {
        let mut store = MockStore::new();
        store
            .expect_list_deadline_exceeded()
            .times(1)
            .returning(|_| Err(StoreError::BadState));
        let executor = Executor::new(store, config());
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());

        assert_matches!(poller.process(now()).await, Err(StoreError::BadState));
    }

    #[tokio::test]
    async fn failing_reclaim_does_not_abort_the_cycle() {
        let mut store = MockStore::new();
        store.expect_list_deadline_exceeded().returning(|now| {
            let mut job = Job::raw_job().with_uid("stuck");
            job.claim("executor-dead", now - TimeDelta::minutes(5));
            Ok(vec![job])
        });
        store
            .expect_update_execution()
            .returning(|_, _| Err(StoreError::Database("connection reset".into())));
        store
            .expect_count_running()
            .returning(|| Ok(ExecutorConfig::DEFAULT_MAX_RUNNING));
        store
            .expect_list_ready()
            .withf(|_, limit| *limit == 1)
            .returning(|_, _| Ok(vec![]));
        store
            .expect_next_scheduled_time()
            .returning(|_| Ok(None));
        let executor = Executor::new(store, config());
        let (mut poller, _wake) = executor.into_poller(TaskTracker::new());

        let report = poller.process(now()).await.unwrap();

        assert_eq!(report.started, 0);
        assert!(!report.backlogged);
    }

    #[tokio::test]
    async fn spawn_schedules_purge_job() {
        let store = InMemoryStore::new();
        let executor = Executor::new(
            store.clone(),
            config().with_retention(Some(TimeDelta::days(5))),
        );

        let handle = executor.spawn().await.unwrap();

        let purge = store.find(PURGE_UID).await.unwrap();
        assert!(purge.is_recurring);
        assert_eq!(purge.recurring_cron, PURGE_CRON);
        assert_eq!(purge.priority, Job::PRIORITY_ELEVATED);
        handle.graceful_shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn spawn_without_retention_skips_purge_job() {
        let store = InMemoryStore::new();

        let handle = Executor::new(store.clone(), config())
            .spawn()
            .await
            .unwrap();

        assert_matches!(store.find(PURGE_UID).await, Err(StoreError::NotFound(_)));
        handle.graceful_shutdown(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn purge_job_type_is_reserved() {
        let executor = Executor::new(
            InMemoryStore::new(),
            config().with_retention(Some(TimeDelta::days(5))),
        )
        .register(PURGE_TYPE, noop())
        .unwrap();

        assert_matches!(
            executor.spawn().await,
            Err(JobkeeperError::AlreadyRegistered(_))
        );
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_running_jobs() {
        let store = InMemoryStore::new();
        let executor = Executor::new(store.clone(), config())
            .register(
                "slow",
                handler_fn(|_ctx, _progress| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok("done".to_owned())
                }),
            )
            .unwrap();
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let handle = executor.spawn().await.unwrap();

        scheduler.run(Definition::new("slow", "slow")).await.unwrap();
        wait_for(&mut changes, "slow", JobState::Running).await;
        handle.graceful_shutdown(WAIT).await.unwrap();

        assert_eq!(store.find("slow").await.unwrap().state, JobState::Finished);
    }

    #[tokio::test]
    async fn graceful_shutdown_cancels_jobs_exceeding_grace_period() {
        let store = InMemoryStore::new();
        let executor = Executor::new(store.clone(), config())
            .register(
                "stubborn",
                handler_fn(|ctx: JobContext, _progress| async move {
                    ctx.cancelled().await;
                    Err("canceled".into())
                }),
            )
            .unwrap();
        let scheduler = executor.scheduler();
        let mut changes = scheduler.subscribe();
        let handle = executor.spawn().await.unwrap();

        scheduler
            .run(Definition::new("stubborn", "stubborn"))
            .await
            .unwrap();
        wait_for(&mut changes, "stubborn", JobState::Running).await;

        assert_matches!(
            handle.graceful_shutdown(Duration::from_millis(50)).await,
            Err(JobkeeperError::GracefulShutdownFailed)
        );
        wait_for(&mut changes, "stubborn", JobState::Failed).await;
    }
}
