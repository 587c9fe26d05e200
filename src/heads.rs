use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libipld::cid::Cid;
use sled::Batch;
use tracing::{debug, warn};

use crate::error::Error;
use crate::key::HierarchicalKey;
use crate::storage::StateStore;

#[derive(Debug, Clone)]
struct HeadEntry {
    height: u64,
    /// Empty string when the head was published without an explicit topic.
    topic: String,
}

/// The current Merkle-DAG frontier: every CID without a known descendant,
/// with its height and the topic it was announced under. Persisted under
/// `<namespace>/<cid>` as `"<height>[@<topic>]"` and re-primed from storage
/// on open.
pub struct HeadStore {
    store: StateStore,
    namespace: HierarchicalKey,
    cache: Mutex<HashMap<Cid, HeadEntry>>,
}

impl HeadStore {
    pub fn new(store: StateStore, namespace: HierarchicalKey) -> Result<Self, Error> {
        let heads = Self {
            store,
            namespace,
            cache: Mutex::new(HashMap::new()),
        };
        heads.prime_cache()?;
        Ok(heads)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Cid, HeadEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn head_key(&self, cid: &Cid) -> String {
        format!("{}/{}", self.namespace, cid)
    }

    fn encode_entry(height: u64, topic: &str) -> String {
        if topic.is_empty() {
            height.to_string()
        } else {
            format!("{height}@{topic}")
        }
    }

    /// Rebuilds the in-memory map from storage; called once on open.
    fn prime_cache(&self) -> Result<(), Error> {
        let prefix = format!("{}/", self.namespace);
        let mut cache = self.lock();
        for item in self.store.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let cid_str = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            let cid = match Cid::try_from(cid_str.as_str()) {
                Ok(cid) => cid,
                Err(e) => {
                    warn!(key = %cid_str, "skipping head entry with undecodable cid: {e}");
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&value);
            let (height_str, topic) = match text.split_once('@') {
                Some((h, t)) => (h, t),
                None => (text.as_ref(), ""),
            };
            let height = height_str
                .parse::<u64>()
                .map_err(|e| Error::codec(format!("invalid head height {height_str:?}: {e}")))?;
            cache.insert(
                cid,
                HeadEntry {
                    height,
                    topic: topic.to_string(),
                },
            );
        }
        Ok(())
    }

    pub fn is_head(&self, cid: &Cid) -> bool {
        self.lock().contains_key(cid)
    }

    pub fn height(&self, cid: &Cid) -> Option<u64> {
        self.lock().get(cid).map(|e| e.height)
    }

    pub fn topic(&self, cid: &Cid) -> Option<String> {
        self.lock().get(cid).map(|e| e.topic.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Inserts or overwrites a head. The batched write commits before the
    /// cache changes; a storage failure leaves memory untouched.
    pub fn add(&self, cid: &Cid, height: u64, topic: Option<&str>) -> Result<(), Error> {
        let topic = topic.unwrap_or_default();
        debug!(%cid, height, "adding head");
        let mut batch = Batch::default();
        batch.insert(
            self.head_key(cid).into_bytes(),
            Self::encode_entry(height, topic).into_bytes(),
        );
        self.store.apply_batch(batch)?;
        self.lock().insert(
            *cid,
            HeadEntry {
                height,
                topic: topic.to_string(),
            },
        );
        Ok(())
    }

    /// Atomically deletes `old` and inserts `new` at `height`.
    pub fn replace(&self, old: &Cid, new: &Cid, height: u64, topic: Option<&str>) -> Result<(), Error> {
        let topic = topic.unwrap_or_default();
        debug!(%old, %new, height, "replacing head");
        let mut batch = Batch::default();
        batch.insert(
            self.head_key(new).into_bytes(),
            Self::encode_entry(height, topic).into_bytes(),
        );
        batch.remove(self.head_key(old).into_bytes());
        self.store.apply_batch(batch)?;
        let mut cache = self.lock();
        cache.remove(old);
        cache.insert(
            *new,
            HeadEntry {
                height,
                topic: topic.to_string(),
            },
        );
        Ok(())
    }

    /// The current heads plus the maximum height. Iteration order is
    /// unspecified.
    pub fn list(&self) -> (Vec<Cid>, u64) {
        let cache = self.lock();
        let mut heads = Vec::with_capacity(cache.len());
        let mut max_height = 0;
        for (cid, entry) in cache.iter() {
            heads.push(*cid);
            max_height = max_height.max(entry.height);
        }
        (heads, max_height)
    }
}
