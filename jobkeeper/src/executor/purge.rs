use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;

use super::{Handler, HandlerError, JobContext};
use crate::{job::now, progress::ProgressReporter, store::Store};

pub(crate) const PURGE_UID: &str = "jobkeeper:purge";
pub(crate) const PURGE_TYPE: &str = "jobkeeper:purge";
pub(crate) const PURGE_CRON: &str = "0 15 */4 * * *";
pub(crate) const PURGE_MAX_DURATION: Duration = Duration::from_secs(5);

/// Deletes one-off jobs which completed longer than `retention` ago.
pub(crate) struct PurgeHandler<S> {
    store: Arc<S>,
    retention: TimeDelta,
}

impl<S> PurgeHandler<S> {
    pub(crate) fn new(store: Arc<S>, retention: TimeDelta) -> Self {
        Self { store, retention }
    }
}

#[async_trait]
impl<S> Handler for PurgeHandler<S>
where
    S: Store + 'static,
{
    async fn handle(
        &self,
        _ctx: JobContext,
        _progress: ProgressReporter,
    ) -> Result<String, HandlerError> {
        let deleted = self.store.delete_old(now() - self.retention).await?;
        if deleted > 0 {
            tracing::info!(deleted, "Purged old jobs");
        }
        Ok(format!("deleted {deleted} jobs"))
    }
}
