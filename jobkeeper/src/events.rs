//! In process notifications of job state changes.
//!
//! Every claim, progress report and completion performed by an executor is published on a
//! broadcast channel. Subscribers only see changes made by executors in their own process, and a
//! subscriber which falls too far behind skips the oldest events.
use std::pin::Pin;

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{Job, JobState};

/// A snapshot of a job right after it changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateChange {
    pub uid: String,
    pub group_id: Option<String>,
    pub job_type: String,
    pub state: JobState,
    pub progress: i32,
    pub result: String,
    pub total_executions: i32,
    pub consecutive_failures: i32,
    pub last_failure_error: String,
    pub at: DateTime<Utc>,
}

impl From<&Job> for JobStateChange {
    fn from(job: &Job) -> Self {
        Self {
            uid: job.uid.clone(),
            group_id: job.group_id.clone(),
            job_type: job.job_type.clone(),
            state: job.state,
            progress: job.run_progress,
            result: job.result.clone(),
            total_executions: job.total_executions,
            consecutive_failures: job.consecutive_failures,
            last_failure_error: job.last_failure_error.clone(),
            at: job.updated,
        }
    }
}

pub type JobStateChangeStream = Pin<Box<dyn Stream<Item = JobStateChange> + Send>>;

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<JobStateChange>,
}

impl EventBus {
    const CAPACITY: usize = 1024;

    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    pub(crate) fn publish(&self, change: JobStateChange) {
        // No subscribers is not an error.
        let _ = self.sender.send(change);
    }

    pub(crate) fn subscribe(&self) -> JobStateChangeStream {
        let mut receiver = self.sender.subscribe();
        Box::pin(stream! {
            loop {
                match receiver.recv().await {
                    Ok(change) => yield change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Job state change subscriber lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
