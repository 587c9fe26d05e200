use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

/// Called after an element wins the value slot for its key, with the key and
/// the accepted value.
pub type PutHook = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Called for every tombstone applied. Concurrent re-adds may leave the key
/// present afterwards; check `has` if that matters.
pub type DeleteHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Configurable values for the datastore.
#[derive(Clone)]
pub struct Options {
    /// How often the current heads are re-announced.
    pub rebroadcast_interval: Duration,
    /// How long to wait for a DAG fetch before dropping the job. Zero
    /// disables the timeout.
    pub dag_syncer_timeout: Duration,
    /// Number of workers walking the DAG job queue.
    pub num_workers: usize,
    /// Soft cap on a transaction's accumulated delta size; crossing it
    /// commits the transaction.
    pub max_batch_delta_size: usize,
    pub put_hook: Option<PutHook>,
    pub delete_hook: Option<DeleteHook>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            rebroadcast_interval: Duration::from_secs(60),
            dag_syncer_timeout: Duration::from_secs(5 * 60),
            num_workers: 5,
            max_batch_delta_size: 100 * 1024,
            put_hook: None,
            delete_hook: None,
        }
    }
}

impl Options {
    pub fn verify(&self) -> Result<(), Error> {
        if self.rebroadcast_interval.is_zero() {
            return Err(Error::InvalidOption(
                "rebroadcast interval must be positive".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(Error::InvalidOption(
                "number of workers must be positive".to_string(),
            ));
        }
        if self.max_batch_delta_size == 0 {
            return Err(Error::InvalidOption(
                "max batch delta size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("rebroadcast_interval", &self.rebroadcast_interval)
            .field("dag_syncer_timeout", &self.dag_syncer_timeout)
            .field("num_workers", &self.num_workers)
            .field("max_batch_delta_size", &self.max_batch_delta_size)
            .field("put_hook", &self.put_hook.is_some())
            .field("delete_hook", &self.delete_hook.is_some())
            .finish()
    }
}
