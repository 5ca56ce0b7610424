use std::{fmt, sync::Arc};

use fxhash::FxHashMap;

use super::Handler;
use crate::JobkeeperError;

/// The handlers of one executor, keyed by job type.
#[derive(Default, Clone)]
pub(crate) struct Registry {
    handlers: FxHashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub(crate) fn register(
        &mut self,
        job_type: String,
        handler: Arc<dyn Handler>,
    ) -> Result<(), JobkeeperError> {
        if job_type.is_empty() {
            return Err(JobkeeperError::InvalidArgument(
                "job type must not be empty".to_owned(),
            ));
        }
        if self.handlers.contains_key(&job_type) {
            return Err(JobkeeperError::AlreadyRegistered(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(job_type).cloned()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
