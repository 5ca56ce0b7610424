use std::{fmt, sync::Arc, time::Duration};

use chrono::TimeDelta;
use rand::{distributions::Alphanumeric, Rng};

use crate::backoff::{BackoffStrategy, Strategy};

/// Configuration of an [`crate::executor::Executor`].
///
/// ```
/// use jobkeeper::config::ExecutorConfig;
/// use jobkeeper::backoff::BackoffStrategy;
/// use chrono::TimeDelta;
/// use std::time::Duration;
///
/// let config = ExecutorConfig::default()
///     .with_instance_id("worker-1")
///     .with_workers(4)
///     .with_poll_interval(Duration::from_secs(10))
///     .with_retry_backoff(BackoffStrategy::exponential(TimeDelta::seconds(5)));
///
/// assert_eq!(config.instance_id(), "worker-1");
/// assert_eq!(config.workers(), 4);
/// ```
#[derive(Clone)]
pub struct ExecutorConfig {
    instance_id: String,
    workers: usize,
    max_running: usize,
    poll_interval: Duration,
    retention: Option<TimeDelta>,
    retry_backoff: Arc<dyn Strategy + Send + Sync>,
}

impl ExecutorConfig {
    pub const DEFAULT_WORKERS: usize = 10;
    pub const DEFAULT_MAX_RUNNING: usize = 10;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_RETENTION: TimeDelta = TimeDelta::days(5);
    pub const DEFAULT_RETRY_DELAY: TimeDelta = TimeDelta::seconds(15);

    /// Identifies this executor in [`crate::job::Job::run_by`]. Should be unique among the
    /// executors sharing a store.
    pub fn with_instance_id(self, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..self
        }
    }

    /// Number of handlers this executor runs at once.
    pub fn with_workers(self, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..self
        }
    }

    /// Ceiling on running jobs across every executor sharing the store.
    pub fn with_max_running(self, max_running: usize) -> Self {
        Self {
            max_running: max_running.max(1),
            ..self
        }
    }

    /// The longest the poll loop sleeps between cycles.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    /// How long finished, failed and canceled one-off jobs are kept. `None` disables purging.
    pub fn with_retention(self, retention: Option<TimeDelta>) -> Self {
        Self { retention, ..self }
    }

    /// Delay before a failed one-off job with retries left runs again.
    pub fn with_retry_backoff(self, retry_backoff: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            retry_backoff: Arc::new(retry_backoff),
            ..self
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn retention(&self) -> Option<TimeDelta> {
        self.retention
    }

    pub(crate) fn retry_backoff(&self) -> Arc<dyn Strategy + Send + Sync> {
        self.retry_backoff.clone()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            instance_id: random_instance_id(),
            workers: Self::DEFAULT_WORKERS,
            max_running: Self::DEFAULT_MAX_RUNNING,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            retention: Some(Self::DEFAULT_RETENTION),
            retry_backoff: Arc::new(BackoffStrategy::constant(Self::DEFAULT_RETRY_DELAY)),
        }
    }
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("instance_id", &self.instance_id)
            .field("workers", &self.workers)
            .field("max_running", &self.max_running)
            .field("poll_interval", &self.poll_interval)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

fn random_instance_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("executor-{suffix}")
}
