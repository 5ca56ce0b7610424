use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    events::{EventBus, JobStateChange},
    job::{now, Job},
    store::{ProgressUpdate, Store},
    JobkeeperError,
};

/// Lets a running [`crate::executor::Handler`] report how far it has got.
///
/// Reports are written to the store only while this execution still holds the job's lease. Once
/// the lease is gone, because the job was canceled, completed or reclaimed after its deadline,
/// every further report is silently dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn Store>,
    events: EventBus,
    snapshot: JobStateChange,
    released: AtomicBool,
}

impl ProgressReporter {
    pub(crate) fn new(store: Arc<dyn Store>, events: EventBus, job: &Job) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                events,
                snapshot: JobStateChange::from(job),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Records `progress`, clamped to [`Job::PROGRESS_MIN`]..=[`Job::PROGRESS_MAX`], and an
    /// intermediate `result`.
    ///
    /// Fails only when the store does.
    pub async fn set_progress(
        &self,
        progress: i32,
        result: impl Into<String>,
    ) -> Result<(), JobkeeperError> {
        if self.is_released() {
            return Ok(());
        }

        let snapshot = &self.inner.snapshot;
        let update = ProgressUpdate {
            uid: snapshot.uid.clone(),
            total_executions: snapshot.total_executions,
            progress: progress.clamp(Job::PROGRESS_MIN, Job::PROGRESS_MAX),
            result: result.into(),
            updated: now(),
        };

        if self.inner.store.update_progress(&update).await? {
            self.inner.events.publish(JobStateChange {
                progress: update.progress,
                result: update.result,
                at: update.updated,
                ..snapshot.clone()
            });
        } else {
            tracing::debug!(job.uid = %snapshot.uid, "Lease released, ignoring further progress");
            self.inner.released.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Whether the lease this reporter was created for is known to be gone.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("uid", &self.inner.snapshot.uid)
            .field("total_executions", &self.inner.snapshot.total_executions)
            .field("released", &self.is_released())
            .finish()
    }
}
