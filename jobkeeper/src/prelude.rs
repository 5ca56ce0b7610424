//! The purpose of this module is to alleviate the need to import many of the `jobkeeper` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobkeeper::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::config::ExecutorConfig;
pub use crate::events::{JobStateChange, JobStateChangeStream};
pub use crate::executor::{
    handler_fn, Executor, ExecutorHandle, Handler, HandlerError, JobContext,
};
pub use crate::job::{Definition, Job, JobProgress, JobState};
pub use crate::progress::ProgressReporter;
pub use crate::scheduler::Scheduler;
pub use crate::store::{Store, StoreError};
pub use crate::JobkeeperError;
