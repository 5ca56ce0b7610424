use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::JobkeeperError;

use super::{now, Job, JobState};

/// Describes a one-off job to be handed to [`crate::scheduler::Scheduler::run`].
///
/// All the parameters a handler receives must be in the job data, as JSON or whatever the
/// handler can interpret.
///
/// # Example
///
/// ```
/// use jobkeeper::job::Definition;
/// use std::time::Duration;
///
/// let definition = Definition::new("export-42", "export")
///     .with_data("{\"repo\":42}")
///     .with_max_retries(3)
///     .with_max_duration(Duration::from_secs(300));
///
/// assert!(definition.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Definition {
    uid: String,
    job_type: String,
    data: String,
    priority: i32,
    max_retries: u16,
    max_duration: Duration,
    scheduled_at: Option<DateTime<Utc>>,
}

impl Definition {
    const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(60);

    pub fn new(uid: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            job_type: job_type.into(),
            data: String::new(),
            priority: Job::PRIORITY_NORMAL,
            max_retries: 0,
            max_duration: Self::DEFAULT_MAX_DURATION,
            scheduled_at: None,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn with_data(self, data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..self
        }
    }

    /// Serializes `data` as the job payload.
    pub fn with_json_data<T: Serialize>(self, data: &T) -> Result<Self, JobkeeperError> {
        Ok(Self {
            data: serde_json::to_string(data)?,
            ..self
        })
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_max_retries(self, max_retries: u16) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_max_duration(self, max_duration: Duration) -> Self {
        Self {
            max_duration,
            ..self
        }
    }

    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    /// Schedules the job `delay` from now.
    ///
    /// Fails with [`JobkeeperError::InvalidArgument`] if that time is out of range.
    pub fn schedule_in(self, delay: TimeDelta) -> Result<Self, JobkeeperError> {
        let scheduled_at = now().checked_add_signed(delay).ok_or_else(|| {
            JobkeeperError::InvalidArgument(format!("delay of job {} is out of range", self.uid))
        })?;
        Ok(self.schedule_at(scheduled_at))
    }

    pub fn validate(&self) -> Result<(), JobkeeperError> {
        if self.uid.is_empty() {
            return Err(JobkeeperError::InvalidArgument(
                "job uid must not be empty".to_owned(),
            ));
        }
        if self.job_type.is_empty() {
            return Err(JobkeeperError::InvalidArgument(format!(
                "job type must not be empty for job {}",
                self.uid
            )));
        }
        if self.max_duration < Duration::from_secs(1) {
            return Err(JobkeeperError::InvalidArgument(format!(
                "max duration of job {} must be at least one second",
                self.uid
            )));
        }
        Ok(())
    }

    pub(crate) fn into_new_job(self, group_id: Option<String>) -> Job {
        let now = now();
        Job {
            uid: self.uid,
            group_id,
            job_type: self.job_type,
            priority: self.priority,
            data: self.data,
            result: String::new(),
            max_duration_seconds: i32::try_from(self.max_duration.as_secs()).unwrap_or(i32::MAX),
            max_retries: self.max_retries.into(),
            state: JobState::Scheduled,
            scheduled: self.scheduled_at.unwrap_or(now),
            total_executions: 0,
            run_by: None,
            run_deadline: None,
            run_progress: Job::PROGRESS_MIN,
            last_executed: None,
            is_recurring: false,
            recurring_cron: String::new(),
            consecutive_failures: 0,
            last_failure_error: String::new(),
            created: now,
            updated: now,
        }
    }
}
