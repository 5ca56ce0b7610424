//! Durable background jobs over a shared store.
//!
//! Jobs are rows in a [`store::Store`]. A [`scheduler::Scheduler`] writes them, an
//! [`executor::Executor`] polls the store for due jobs, claims them through a conditional
//! update, and runs the [`executor::Handler`] registered for their type. Several executors, in
//! one process or many, can share a store: the claim is the only coordination between them.
//!
//! One-off jobs run once and are retried with a backoff up to their retry ceiling. Recurring jobs
//! follow a cron expression and are rescheduled after every execution, whether it failed or not.
//!
//! # Example
//!
//! ```
//! use jobkeeper::prelude::*;
//! use jobkeeper::store::memory::InMemoryStore;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), JobkeeperError> {
//! let executor = Executor::new(InMemoryStore::new(), ExecutorConfig::default())
//!     .register("greet", handler_fn(|ctx: JobContext, _progress| async move {
//!         Ok(format!("hello {}", ctx.data))
//!     }))?;
//! let scheduler = executor.scheduler();
//! let handle = executor.spawn().await?;
//!
//! scheduler
//!     .run(Definition::new("greet-world", "greet").with_data("world"))
//!     .await?;
//!
//! handle.graceful_shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
use thiserror::Error;

pub mod backoff;
pub mod config;
pub mod cron;
pub mod events;
pub mod executor;
pub mod job;
mod notifier;
pub mod prelude;
pub mod progress;
pub mod scheduler;
pub mod store;

use store::StoreError;

#[derive(Debug, Error)]
pub enum JobkeeperError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid cron expression {expression:?}: {source}")]
    InvalidCron {
        expression: String,
        #[source]
        source: ::cron::error::Error,
    },
    #[error("Job {0} already exists")]
    Duplicate(String),
    #[error("A handler is already registered for job type {0}")]
    AlreadyRegistered(String),
    #[error("Job {0} was concurrently modified")]
    Conflict(String),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}
