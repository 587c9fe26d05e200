use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use sled::Batch;
use tracing::trace;

use crate::config::{DeleteHook, PutHook};
use crate::delta::{Delta, Element};
use crate::error::Error;
use crate::key::HierarchicalKey;
use crate::storage::StateStore;

// Layout under the set namespace:
//   <ns>/s/<key>/<id>  element instance marker
//   <ns>/t/<key>/<id>  tombstone for that instance
//   <ns>/k/<key>/v     winning value
//   <ns>/k/<key>/p     winning priority, decimal text
const ELEMS_NAMESPACE: &str = "s";
const TOMBS_NAMESPACE: &str = "t";
const KEYS_NAMESPACE: &str = "k";
const VALUE_SUFFIX: &str = "v";
const PRIORITY_SUFFIX: &str = "p";

/// Add-wins observed-remove set with a priority-ordered value per key,
/// after the delta-CRDT construction of <https://arxiv.org/abs/1410.2803>.
/// All state lives in the backing store; the struct itself only carries the
/// namespace, the merge lock and the observer hooks. The value with the
/// highest priority wins; ties go to the lexicographically greater value.
pub struct AddWinsSet {
    store: StateStore,
    namespace: HierarchicalKey,
    // Serialises merges so the (priority, value) pair per key is decided
    // against a consistent view. One global lock: per-key locks would have
    // to be held for the whole batch anyway.
    mutex: Mutex<()>,
    put_hook: Option<PutHook>,
    delete_hook: Option<DeleteHook>,
}

impl AddWinsSet {
    pub fn new(
        store: StateStore,
        namespace: HierarchicalKey,
        put_hook: Option<PutHook>,
        delete_hook: Option<DeleteHook>,
    ) -> Self {
        Self {
            store,
            namespace,
            mutex: Mutex::new(()),
            put_hook,
            delete_hook,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `<ns><key>`; `key` is canonical (leading slash).
    pub fn key_prefix(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    /// `<ns>/s<key>`
    pub fn elems_prefix(&self, key: &str) -> String {
        format!("{}/{ELEMS_NAMESPACE}{key}", self.namespace)
    }

    /// `<ns>/t<key>`
    pub fn tombs_prefix(&self, key: &str) -> String {
        format!("{}/{TOMBS_NAMESPACE}{key}", self.namespace)
    }

    /// `<ns>/k<key>`
    pub fn keys_key(&self, key: &str) -> String {
        format!("{}/{KEYS_NAMESPACE}{key}", self.namespace)
    }

    /// `<ns>/k<key>/v`
    pub fn value_key(&self, key: &str) -> String {
        format!("{}/{VALUE_SUFFIX}", self.keys_key(key))
    }

    /// `<ns>/k<key>/p`
    pub fn priority_key(&self, key: &str) -> String {
        format!("{}/{PRIORITY_SUFFIX}", self.keys_key(key))
    }

    /// A new delta adding `key = value`. The element id is filled by the
    /// driver once the publishing block's CID is known.
    pub fn create_delta_to_add(&self, key: &str, value: &[u8]) -> Delta {
        Delta {
            priority: 0,
            elements: vec![Element {
                key: key.to_string(),
                value: value.to_vec(),
                id: String::new(),
            }],
            tombstones: vec![],
        }
    }

    /// A new delta tombstoning every live instance of `key`. Empty when the
    /// key is absent; the driver suppresses publication then.
    pub fn create_delta_to_remove(&self, key: &str) -> Result<Delta, Error> {
        let _guard = self.lock();
        let prefix = format!("{}/", self.elems_prefix(key));
        let mut tombstones = Vec::new();
        for item in self.store.scan_prefix(prefix.as_bytes()) {
            let (entry_key, _) = item?;
            let id = std::str::from_utf8(&entry_key[prefix.len()..])
                .map_err(|e| Error::codec(format!("invalid element id: {e}")))?
                .to_string();
            if !self.in_tombs_key_id(key, &id)? {
                tombstones.push(Element {
                    key: key.to_string(),
                    value: Vec::new(),
                    id,
                });
            }
        }
        Ok(Delta {
            priority: 0,
            elements: vec![],
            tombstones,
        })
    }

    /// Applies a delta under `id` (the CID string of the block that carried
    /// it). Elements are filed under `id`, the winning value is updated per
    /// the (priority, value) rule, and tombstones are recorded. The whole
    /// delta commits as a single batch; replaying it is a no-op.
    pub fn merge(&self, delta: &Delta, id: &str) -> Result<(), Error> {
        let _guard = self.lock();
        let mut batch = Batch::default();
        // Value decisions against keys already updated earlier in this same
        // delta are resolved through the pending map; the batch itself is
        // not readable before commit.
        let mut pending: HashMap<&str, (u64, Vec<u8>)> = HashMap::new();
        let mut accepted: Vec<&Element> = Vec::new();

        for element in &delta.elements {
            batch.insert(
                format!("{}/{id}", self.elems_prefix(&element.key)).into_bytes(),
                Vec::new(),
            );

            let (current_priority, current_value) = match pending.get(element.key.as_str()) {
                Some((priority, value)) => (*priority, Some(value.clone())),
                None => (
                    self.priority(&element.key)?,
                    self.store.get(self.value_key(&element.key))?,
                ),
            };
            let wins = delta.priority > current_priority
                || (delta.priority == current_priority
                    && match &current_value {
                        Some(current) => element.value > *current,
                        None => true,
                    });
            if wins {
                trace!(key = %element.key, priority = delta.priority, "value accepted");
                batch.insert(
                    self.value_key(&element.key).into_bytes(),
                    element.value.clone(),
                );
                batch.insert(
                    self.priority_key(&element.key).into_bytes(),
                    delta.priority.to_string().into_bytes(),
                );
                pending.insert(element.key.as_str(), (delta.priority, element.value.clone()));
                accepted.push(element);
            }
        }

        for tomb in &delta.tombstones {
            batch.insert(
                format!("{}/{}", self.tombs_prefix(&tomb.key), tomb.id).into_bytes(),
                Vec::new(),
            );
        }

        self.store.apply_batch(batch)?;

        // Hooks run after the state is durable; they cannot fail the merge.
        if let Some(hook) = &self.put_hook {
            for element in accepted {
                hook(&element.key, &element.value);
            }
        }
        if let Some(hook) = &self.delete_hook {
            for tomb in &delta.tombstones {
                hook(&tomb.key);
            }
        }
        Ok(())
    }

    /// The winning priority for `key`; zero when the key has never won.
    pub fn priority(&self, key: &str) -> Result<u64, Error> {
        match self.store.get(self.priority_key(key))? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                text.parse::<u64>()
                    .map_err(|e| Error::codec(format!("invalid priority {text:?}: {e}")))
            }
            None => Ok(0),
        }
    }

    /// Whether any instance of `key` exists that has not been tombstoned.
    pub fn in_elems_not_tombstoned(&self, key: &str) -> Result<bool, Error> {
        let prefix = format!("{}/", self.elems_prefix(key));
        for item in self.store.scan_prefix(prefix.as_bytes()) {
            let (entry_key, _) = item?;
            let id = std::str::from_utf8(&entry_key[prefix.len()..])
                .map_err(|e| Error::codec(format!("invalid element id: {e}")))?;
            if !self.in_tombs_key_id(key, id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_value_in_set(&self, key: &str) -> Result<bool, Error> {
        self.in_elems_not_tombstoned(key)
    }

    /// Whether the instance `id` of `key` has been tombstoned.
    pub fn in_tombs_key_id(&self, key: &str, id: &str) -> Result<bool, Error> {
        self.store
            .contains_key(format!("{}/{id}", self.tombs_prefix(key)))
    }

    /// The current value for `key`, if the key is observable.
    pub fn element(&self, key: &str) -> Result<Vec<u8>, Error> {
        if !self.in_elems_not_tombstoned(key)? {
            return Err(Error::NotFound);
        }
        self.store.get(self.value_key(key))?.ok_or(Error::NotFound)
    }

    /// Lazy scan of every observable `(key, value)` pair under `prefix`.
    /// Restart by calling again.
    pub fn query_elements<'a>(
        &'a self,
        prefix: &str,
    ) -> impl Iterator<Item = Result<(String, Vec<u8>), Error>> + 'a {
        let keys_prefix = self.keys_key("");
        let scan_prefix = self.keys_key(prefix);
        let value_suffix = format!("/{VALUE_SUFFIX}");
        self.store
            .scan_prefix(scan_prefix.into_bytes())
            .filter_map(move |item| {
                let (entry_key, value) = match item {
                    Ok(kv) => kv,
                    Err(e) => return Some(Err(e)),
                };
                let path = String::from_utf8_lossy(&entry_key).into_owned();
                let user_key = path
                    .strip_prefix(&keys_prefix)
                    .and_then(|p| p.strip_suffix(&value_suffix))?
                    .to_string();
                match self.in_elems_not_tombstoned(&user_key) {
                    Ok(true) => Some(Ok((user_key, value))),
                    Ok(false) => None,
                    Err(e) => Some(Err(e)),
                }
            })
    }

    /// Collects `query_elements` under the merge lock, so the result never
    /// straddles a half-applied delta.
    pub fn snapshot_query(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let _guard = self.lock();
        self.query_elements(prefix).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn new_set(store: &StateStore) -> AddWinsSet {
        AddWinsSet::new(
            store.clone(),
            HierarchicalKey::new("/namespace").unwrap(),
            None,
            None,
        )
    }

    fn add_delta(priority: u64, key: &str, value: &[u8]) -> Delta {
        Delta {
            priority,
            elements: vec![Element {
                key: key.to_string(),
                value: value.to_vec(),
                id: String::new(),
            }],
            tombstones: vec![],
        }
    }

    #[test]
    fn namespace_paths() {
        let store = StateStore::temporary().unwrap();
        let set = new_set(&store);
        assert_eq!(set.key_prefix("/key"), "/namespace/key");
        assert_eq!(set.elems_prefix("/key"), "/namespace/s/key");
        assert_eq!(set.tombs_prefix("/key"), "/namespace/t/key");
        assert_eq!(set.value_key("/key"), "/namespace/k/key/v");
        assert_eq!(set.priority_key("/key"), "/namespace/k/key/p");
    }

    #[test]
    fn value_ordering_rules() -> Result<(), anyhow::Error> {
        let store = StateStore::temporary()?;
        let set = new_set(&store);

        assert!(!set.is_value_in_set("/key")?);
        set.merge(&add_delta(11, "/key", b"V456"), "ID1")?;
        assert!(set.is_value_in_set("/key")?);
        assert_eq!(set.element("/key")?, b"V456");
        assert_eq!(set.priority("/key")?, 11);

        // Lower priority loses.
        set.merge(&add_delta(10, "/key", b"V999"), "ID2")?;
        assert_eq!(set.element("/key")?, b"V456");
        assert_eq!(set.priority("/key")?, 11);

        // Same priority, lexicographically smaller loses.
        set.merge(&add_delta(11, "/key", b"V455"), "ID3")?;
        assert_eq!(set.element("/key")?, b"V456");

        // Same priority, lexicographically larger wins.
        set.merge(&add_delta(11, "/key", b"V457"), "ID4")?;
        assert_eq!(set.element("/key")?, b"V457");

        // Higher priority wins regardless of value.
        set.merge(&add_delta(12, "/key", b"A"), "ID5")?;
        assert_eq!(set.element("/key")?, b"A");
        assert_eq!(set.priority("/key")?, 12);
        Ok(())
    }

    #[test]
    fn merge_is_idempotent() -> Result<(), anyhow::Error> {
        let store = StateStore::temporary()?;
        let set = new_set(&store);
        let delta = add_delta(3, "/abc", b"cba");
        set.merge(&delta, "ID1")?;
        let before: Vec<_> = set.snapshot_query("")?;
        set.merge(&delta, "ID1")?;
        assert_eq!(set.snapshot_query("")?, before);
        assert_eq!(set.element("/abc")?, b"cba");
        Ok(())
    }

    #[test]
    fn tombstones_shadow_elements() -> Result<(), anyhow::Error> {
        let store = StateStore::temporary()?;
        let set = new_set(&store);
        set.merge(&add_delta(5, "/abc", b"cba"), "ID1")?;

        let remove = set.create_delta_to_remove("/abc")?;
        assert_eq!(remove.tombstones.len(), 1);
        assert_eq!(remove.tombstones[0].id, "ID1");
        set.merge(&remove, "ID2")?;

        assert!(!set.is_value_in_set("/abc")?);
        assert!(set.in_tombs_key_id("/abc", "ID1")?);
        assert!(matches!(set.element("/abc"), Err(Error::NotFound)));

        // A second remove finds nothing live.
        assert!(set.create_delta_to_remove("/abc")?.is_empty());

        // Re-adding under a fresh id makes the key observable again.
        set.merge(&add_delta(6, "/abc", b"new"), "ID3")?;
        assert!(set.is_value_in_set("/abc")?);
        assert_eq!(set.element("/abc")?, b"new");
        Ok(())
    }

    #[test]
    fn query_skips_tombstoned_and_respects_prefix() -> Result<(), anyhow::Error> {
        let store = StateStore::temporary()?;
        let set = new_set(&store);
        set.merge(&add_delta(1, "/a/1", b"one"), "ID1")?;
        set.merge(&add_delta(1, "/a/2", b"two"), "ID2")?;
        set.merge(&add_delta(1, "/b/1", b"other"), "ID3")?;
        let remove = set.create_delta_to_remove("/a/2")?;
        set.merge(&remove, "ID4")?;

        let under_a = set.snapshot_query("/a")?;
        assert_eq!(under_a, vec![("/a/1".to_string(), b"one".to_vec())]);

        let all = set.snapshot_query("")?;
        assert_eq!(all.len(), 2);

        // The iterator is restartable.
        assert_eq!(set.query_elements("/a").count(), 1);
        assert_eq!(set.query_elements("/a").count(), 1);
        Ok(())
    }

    #[test]
    fn hooks_fire_for_accepted_writes_only() -> Result<(), anyhow::Error> {
        let puts = Arc::new(AtomicUsize::new(0));
        let deletes = Arc::new(AtomicUsize::new(0));
        let store = StateStore::temporary()?;
        let set = AddWinsSet::new(
            store,
            HierarchicalKey::new("/namespace")?,
            Some({
                let puts = puts.clone();
                Arc::new(move |_k: &str, _v: &[u8]| {
                    puts.fetch_add(1, Ordering::SeqCst);
                })
            }),
            Some({
                let deletes = deletes.clone();
                Arc::new(move |_k: &str| {
                    deletes.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        set.merge(&add_delta(2, "/k", b"b"), "ID1")?;
        // Rejected value: hook must not fire.
        set.merge(&add_delta(1, "/k", b"z"), "ID2")?;
        assert_eq!(puts.load(Ordering::SeqCst), 1);

        let remove = set.create_delta_to_remove("/k")?;
        set.merge(&remove, "ID3")?;
        assert_eq!(deletes.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
