use std::{error::Error, future::Future};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressReporter;

/// The error a [`Handler`] fails with. Only its [`Display`](std::fmt::Display) output is kept, as
/// the job's `last_failure_error`.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Business logic for one job type.
///
/// A handler is registered with [`crate::executor::Executor::register`] and invoked once for
/// every execution of a job of its type. Returning `Ok` finishes the job (or reschedules it, if
/// it is recurring) with the returned string as its result. Returning `Err` or panicking counts as
/// a failure.
///
/// Each execution runs in its own task and is aborted once the job's lease runs out. Long running
/// handlers should watch [`JobContext::cancelled`] to stop promptly when the job is canceled.
///
/// # Example
///
/// ```
/// use jobkeeper::executor::{Handler, HandlerError, JobContext};
/// use jobkeeper::progress::ProgressReporter;
/// use async_trait::async_trait;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Export {
///     repo_id: u64,
/// }
///
/// struct ExportHandler;
///
/// #[async_trait]
/// impl Handler for ExportHandler {
///     async fn handle(
///         &self,
///         ctx: JobContext,
///         progress: ProgressReporter,
///     ) -> Result<String, HandlerError> {
///         let export: Export = ctx.json()?;
///         progress.set_progress(50, "exporting").await?;
///         Ok(format!("exported repository {}", export.repo_id))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        ctx: JobContext,
        progress: ProgressReporter,
    ) -> Result<String, HandlerError>;
}

/// What a [`Handler`] knows about the execution it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub uid: String,
    pub job_type: String,
    /// The opaque payload the job was scheduled with.
    pub data: String,
    /// When the lease runs out and the execution is aborted.
    pub deadline: DateTime<Utc>,
    /// Which execution of the job this is, starting at 1.
    pub attempt: i32,
    pub(crate) cancellation: CancellationToken,
}

impl JobContext {
    /// Deserializes the job payload from JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes once the job is canceled or its lease runs out.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Wraps an async closure as a [`Handler`].
///
/// ```
/// use jobkeeper::executor::{handler_fn, JobContext};
///
/// let handler = handler_fn(|ctx: JobContext, _progress| async move {
///     Ok(ctx.data.to_uppercase())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(JobContext, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, HandlerError>> + Send,
{
    HandlerFn(f)
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(JobContext, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, HandlerError>> + Send,
{
    async fn handle(
        &self,
        ctx: JobContext,
        progress: ProgressReporter,
    ) -> Result<String, HandlerError> {
        (self.0)(ctx, progress).await
    }
}
