use std::collections::HashSet;

use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::dag::DagSyncer;
use crate::delta::{delta_merge, Delta};
use crate::error::Error;
use crate::key::HierarchicalKey;
use crate::store::Store;

enum Operation {
    Put { key: HierarchicalKey, value: Vec<u8> },
    Remove { key: HierarchicalKey },
}

/// Groups puts and removes into one delta published as a single DAG node, so
/// observers see either none or all of them. Dropping an uncommitted
/// transaction discards its operations without side effects.
pub struct AtomicTransaction<D, B> {
    store: Store<D, B>,
    operations: Vec<Operation>,
    modified: HashSet<String>,
    delta_size: usize,
    committed: bool,
}

impl<D, B> AtomicTransaction<D, B>
where
    D: DagSyncer + 'static,
    B: Broadcaster + 'static,
{
    pub(crate) fn new(store: Store<D, B>) -> Self {
        Self {
            store,
            operations: Vec::new(),
            modified: HashSet::new(),
            delta_size: 0,
            committed: false,
        }
    }

    /// Queues a put. Crossing the configured delta-size cap commits the
    /// transaction immediately.
    pub async fn put(&mut self, key: &HierarchicalKey, value: &[u8]) -> Result<(), Error> {
        if self.committed {
            return Err(Error::AlreadyCommitted);
        }
        self.delta_size += key.as_str().len() + value.len();
        self.modified.insert(key.as_str().to_string());
        self.operations.push(Operation::Put {
            key: key.clone(),
            value: value.to_vec(),
        });
        self.auto_commit().await
    }

    /// Queues a remove of every live instance of `key`.
    pub async fn remove(&mut self, key: &HierarchicalKey) -> Result<(), Error> {
        if self.committed {
            return Err(Error::AlreadyCommitted);
        }
        self.delta_size += key.as_str().len();
        self.modified.insert(key.as_str().to_string());
        self.operations.push(Operation::Remove { key: key.clone() });
        self.auto_commit().await
    }

    /// Whether `key` has pending operations in this transaction.
    pub fn has_key(&self, key: &HierarchicalKey) -> bool {
        self.modified.contains(key.as_str())
    }

    /// Publishes all queued operations as one delta, announced on each of
    /// `topics` (empty means the store's default topics). A second commit
    /// fails with `AlreadyCommitted`.
    pub async fn commit(&mut self, topics: &[&str]) -> Result<(), Error> {
        if self.committed {
            return Err(Error::AlreadyCommitted);
        }
        self.store.ensure_running()?;

        let mut combined = Delta::default();
        for operation in &self.operations {
            let delta = match operation {
                Operation::Put { key, value } => {
                    self.store.set().create_delta_to_add(key.as_str(), value)
                }
                Operation::Remove { key } => {
                    self.store.set().create_delta_to_remove(key.as_str())?
                }
            };
            combined = delta_merge(&combined, &delta);
        }

        if combined.is_empty() {
            self.committed = true;
            return Ok(());
        }

        let topics: Vec<String> = if topics.is_empty() {
            self.store.default_broadcast_topics()
        } else {
            topics.iter().map(|t| t.to_string()).collect()
        };
        self.store.publish_delta(combined, &topics).await?;
        self.committed = true;
        Ok(())
    }

    async fn auto_commit(&mut self) -> Result<(), Error> {
        if self.delta_size > self.store.max_batch_delta_size() {
            debug!(
                delta_size = self.delta_size,
                "transaction crossed the delta size cap, committing"
            );
            return self.commit(&[]).await;
        }
        Ok(())
    }
}

impl<D, B> Drop for AtomicTransaction<D, B> {
    fn drop(&mut self) {
        if !self.committed && !self.operations.is_empty() {
            debug!(
                operations = self.operations.len(),
                "transaction dropped without commit, rolling back"
            );
            self.operations.clear();
        }
    }
}
