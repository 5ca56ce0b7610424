//! State transitions of a [`Job`].
//!
//! These functions only mutate the in memory value; persisting the result through a guarded
//! [`crate::store::Store::update_execution`] is up to the caller.
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backoff::{Strategy, MAX_BACKOFF},
    cron,
};

use super::{Job, JobState};

pub(crate) const DEADLINE_EXCEEDED: &str = "deadline exceeded";
pub(crate) const CANCELED: &str = "canceled";

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success(String),
    Failure(String),
    /// A failure retrying can't fix, e.g. no handler registered for the job type.
    Unrecoverable(String),
}

impl Outcome {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl Job {
    /// Takes a lease on the job for `instance_id`.
    pub(crate) fn claim(&mut self, instance_id: &str, now: DateTime<Utc>) {
        let max_duration_seconds = self.max_duration_seconds.max(1);

        self.max_duration_seconds = max_duration_seconds;
        self.updated = now;
        self.last_executed = Some(now);
        self.state = JobState::Running;
        self.run_deadline = Some(now + TimeDelta::seconds(max_duration_seconds.into()));
        self.run_by = Some(instance_id.to_owned());
        self.run_progress = Job::PROGRESS_MIN;
        self.total_executions += 1;
        self.result = String::new();
    }

    /// Records the outcome of an execution and reschedules the job if it should run again.
    ///
    /// Returns `false`, leaving the job untouched, unless the job is running, or was canceled
    /// while running and succeeded nonetheless.
    pub(crate) fn complete(
        &mut self,
        outcome: &Outcome,
        now: DateTime<Utc>,
        retry_backoff: &(dyn Strategy + Send + Sync),
    ) -> bool {
        let applicable = match self.state {
            JobState::Running => true,
            JobState::Canceled => outcome.is_success(),
            _ => false,
        };
        if !applicable {
            return false;
        }

        self.updated = now;
        self.run_by = None;
        self.run_deadline = None;

        match outcome {
            Outcome::Success(result) => {
                self.result = result.clone();
                self.state = JobState::Finished;
                self.run_progress = Job::PROGRESS_MAX;
                self.consecutive_failures = 0;
            }
            Outcome::Failure(error) | Outcome::Unrecoverable(error) => {
                self.result = String::new();
                self.state = JobState::Failed;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_failure_error = error.clone();
            }
        }

        if self.is_recurring {
            self.reschedule(now);
            return true;
        }

        let retryable = matches!(outcome, Outcome::Failure(_))
            && self.consecutive_failures <= self.max_retries;
        if retryable {
            let failures = u32::try_from(self.consecutive_failures).unwrap_or(u32::MAX);
            self.state = JobState::Scheduled;
            self.scheduled = retry_at(now, retry_backoff.backoff(failures));
            self.run_progress = Job::PROGRESS_MIN;
        }

        true
    }

    /// Marks a job whose lease ran out without a completion update.
    pub(crate) fn expire(
        &mut self,
        now: DateTime<Utc>,
        retry_backoff: &(dyn Strategy + Send + Sync),
    ) -> bool {
        self.complete(
            &Outcome::Failure(DEADLINE_EXCEEDED.to_owned()),
            now,
            retry_backoff,
        )
    }

    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) {
        self.updated = now;
        self.state = JobState::Canceled;
        self.run_by = None;
        self.run_deadline = None;
    }

    fn reschedule(&mut self, now: DateTime<Utc>) {
        match cron::next_fire_time(&self.recurring_cron, now) {
            Ok(next) => {
                self.state = JobState::Scheduled;
                self.scheduled = next;
            }
            Err(err) => {
                self.state = JobState::Failed;
                self.last_failure_error = if self.last_failure_error.is_empty() {
                    format!("failed to parse cron string: {err}")
                } else {
                    format!(
                        "failed to parse cron string: {err}; {}",
                        self.last_failure_error
                    )
                };
            }
        }
    }
}

/// `now + backoff`, with the backoff clamped to `0..=MAX_BACKOFF`.
fn retry_at(now: DateTime<Utc>, backoff: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(backoff.clamp(TimeDelta::zero(), MAX_BACKOFF))
        .unwrap_or(now)
}
