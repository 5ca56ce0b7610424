//! The persisted unit of schedulable work.
//!
//! A [`Job`] row is the only state shared between executors. It is created by the
//! [`crate::scheduler::Scheduler`], claimed and completed by the [`crate::executor::Executor`],
//! and mutated exclusively through [`crate::store::Store`] conditional updates once claimed.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Expected;

pub mod definition;
pub(crate) mod lifecycle;

pub use definition::Definition;

/// A persisted background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique and immutable. For recurring jobs this is also the deduplication key.
    pub uid: String,
    /// Logical grouping for bulk cancellation and purging.
    pub group_id: Option<String>,
    /// The name of the [`crate::executor::Handler`] which runs this job.
    pub job_type: String,
    /// Higher priority jobs are claimed first among equally due jobs.
    pub priority: i32,
    /// Opaque handler specific payload.
    pub data: String,
    /// Output of the last successful execution.
    pub result: String,
    /// Length of the execution lease.
    pub max_duration_seconds: i32,
    /// Once `consecutive_failures` exceeds this a one-off job becomes [`JobState::Failed`].
    pub max_retries: i32,
    pub state: JobState,
    /// When the job becomes eligible to run.
    pub scheduled: DateTime<Utc>,
    /// Incremented on every claim. Identifies the current lease.
    pub total_executions: i32,
    /// The executor instance holding the lease.
    pub run_by: Option<String>,
    /// Only meaningful while the job is [`JobState::Running`].
    pub run_deadline: Option<DateTime<Utc>>,
    pub run_progress: i32,
    /// Start time of the most recent execution.
    pub last_executed: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub recurring_cron: String,
    pub consecutive_failures: i32,
    pub last_failure_error: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Job {
    pub const PRIORITY_NORMAL: i32 = 0;
    pub const PRIORITY_ELEVATED: i32 = 1;

    pub const PROGRESS_MIN: i32 = 0;
    pub const PROGRESS_MAX: i32 = 100;

    /// The guard a conditional update of this job, as currently loaded, must match.
    pub fn expected(&self) -> Expected {
        Expected {
            state: self.state,
            total_executions: self.total_executions,
        }
    }

    /// Whether the definition fields differ, i.e. whether an upsert has anything to write.
    pub fn definition_differs(&self, other: &Job) -> bool {
        self.job_type != other.job_type
            || self.priority != other.priority
            || self.data != other.data
            || self.max_duration_seconds != other.max_duration_seconds
            || self.max_retries != other.max_retries
            || self.is_recurring != other.is_recurring
            || self.recurring_cron != other.recurring_cron
    }

    pub fn progress(&self) -> JobProgress {
        JobProgress {
            state: self.state,
            progress: self.run_progress,
            result: self.result.clone(),
            failure: self.last_failure_error.clone(),
        }
    }
}

/// The primary state machine field of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Scheduled,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Scheduled and running jobs can still be canceled.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown job state: {0}")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(UnknownJobState(other.to_owned())),
        }
    }
}

/// A read only snapshot of how far a job has got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub state: JobState,
    pub progress: i32,
    pub result: String,
    pub failure: String,
}

/// The current time truncated to millisecond precision.
///
/// Every timestamp written to a job goes through here so that values survive a round trip
/// through stores with coarser precision than [`chrono`].
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
