use std::path::Path;

use sled::{Batch, Tree};

use crate::error::Error;

/// Ordered byte-key/byte-value backend for set and head state. Keys are
/// compared lexicographically; batched writes commit all-or-nothing.
#[derive(Clone)]
pub struct StateStore {
    tree: Tree,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(path)?;
        let tree = db.open_tree("state")?;
        Ok(Self { tree })
    }

    /// An ephemeral store backed by a temporary sled database.
    pub fn temporary() -> Result<Self, Error> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree("state")?;
        Ok(Self { tree })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    pub fn insert(&self, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.tree.insert(key.as_ref(), value.into())?;
        Ok(())
    }

    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<(), Error> {
        self.tree.remove(key)?;
        Ok(())
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool, Error> {
        Ok(self.tree.contains_key(key)?)
    }

    pub fn apply_batch(&self, batch: Batch) -> Result<(), Error> {
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// Lazy, lexicographically ordered scan of every entry under `prefix`.
    pub fn scan_prefix(
        &self,
        prefix: impl AsRef<[u8]>,
    ) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), Error>> {
        self.tree
            .scan_prefix(prefix)
            .map(|r| r.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(Error::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_and_scan() -> Result<(), anyhow::Error> {
        let store = StateStore::temporary()?;
        let mut batch = Batch::default();
        batch.insert(&b"/a/2"[..], &b"two"[..]);
        batch.insert(&b"/a/1"[..], &b"one"[..]);
        batch.insert(&b"/b/1"[..], &b"other"[..]);
        store.apply_batch(batch)?;

        let scanned: Vec<_> = store
            .scan_prefix(b"/a/")
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(
            scanned,
            vec![
                (b"/a/1".to_vec(), b"one".to_vec()),
                (b"/a/2".to_vec(), b"two".to_vec()),
            ]
        );
        assert!(store.contains_key(b"/b/1")?);
        store.remove(b"/b/1")?;
        assert!(!store.contains_key(b"/b/1")?);
        Ok(())
    }

    #[test]
    fn survives_reopen_on_disk() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        let store = StateStore::open(&path)?;
        store.insert(b"/k", b"v".to_vec())?;
        drop(store);

        let reopened = StateStore::open(&path)?;
        assert_eq!(reopened.get(b"/k")?, Some(b"v".to_vec()));
        Ok(())
    }
}
