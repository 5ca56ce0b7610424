use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "jobkeeper_job_state", rename_all = "lowercase")]
pub(crate) enum JobState {
    Scheduled,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl From<JobState> for jobkeeper::job::JobState {
    fn from(value: JobState) -> Self {
        match value {
            JobState::Scheduled => Self::Scheduled,
            JobState::Running => Self::Running,
            JobState::Finished => Self::Finished,
            JobState::Failed => Self::Failed,
            JobState::Canceled => Self::Canceled,
        }
    }
}

impl From<jobkeeper::job::JobState> for JobState {
    fn from(value: jobkeeper::job::JobState) -> Self {
        match value {
            jobkeeper::job::JobState::Scheduled => Self::Scheduled,
            jobkeeper::job::JobState::Running => Self::Running,
            jobkeeper::job::JobState::Finished => Self::Finished,
            jobkeeper::job::JobState::Failed => Self::Failed,
            jobkeeper::job::JobState::Canceled => Self::Canceled,
        }
    }
}

/// A row of `jobkeeper_jobs`.
#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub uid: String,
    pub group_id: Option<String>,
    pub job_type: String,
    pub priority: i32,
    pub data: String,
    pub result: String,
    pub max_duration_seconds: i32,
    pub max_retries: i32,
    pub state: JobState,
    pub scheduled: DateTime<Utc>,
    pub total_executions: i32,
    pub run_by: Option<String>,
    pub run_deadline: Option<DateTime<Utc>>,
    pub run_progress: i32,
    pub last_executed: Option<DateTime<Utc>>,
    pub is_recurring: bool,
    pub recurring_cron: String,
    pub consecutive_failures: i32,
    pub last_failure_error: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl From<Job> for jobkeeper::job::Job {
    fn from(value: Job) -> Self {
        Self {
            uid: value.uid,
            group_id: value.group_id,
            job_type: value.job_type,
            priority: value.priority,
            data: value.data,
            result: value.result,
            max_duration_seconds: value.max_duration_seconds,
            max_retries: value.max_retries,
            state: value.state.into(),
            scheduled: value.scheduled,
            total_executions: value.total_executions,
            run_by: value.run_by,
            run_deadline: value.run_deadline,
            run_progress: value.run_progress,
            last_executed: value.last_executed,
            is_recurring: value.is_recurring,
            recurring_cron: value.recurring_cron,
            consecutive_failures: value.consecutive_failures,
            last_failure_error: value.last_failure_error,
            created: value.created,
            updated: value.updated,
        }
    }
}
