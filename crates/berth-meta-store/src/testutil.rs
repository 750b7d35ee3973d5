//! In-memory backends for tests.

use crate::content::ContentBackend;
use crate::snapshot::{Kind, Mount, Snapshotter, Usage};
use berth_common::{Digest, Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Blob store keeping only sizes
#[derive(Default)]
pub struct MemContent {
    pub blobs: Mutex<BTreeMap<Digest, i64>>,
}

impl MemContent {
    pub fn insert(&self, digest: &Digest, size: i64) {
        self.blobs.lock().insert(digest.clone(), size);
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.lock().contains_key(digest)
    }
}

impl ContentBackend for MemContent {
    fn size(&self, digest: &Digest) -> Result<i64> {
        self.blobs
            .lock()
            .get(digest)
            .copied()
            .ok_or_else(|| Error::not_found(format!("blob {digest}")))
    }

    fn delete(&self, digest: &Digest) -> Result<()> {
        self.blobs
            .lock()
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("blob {digest}")))
    }
}

/// Snapshot backend recording kind and parent per key
#[derive(Default)]
pub struct MemSnapshotter {
    pub snapshots: Mutex<BTreeMap<String, (Kind, String)>>,
    /// Fail every prepare
    pub fail_prepare: Mutex<bool>,
}

impl MemSnapshotter {
    pub fn keys(&self) -> Vec<String> {
        self.snapshots.lock().keys().cloned().collect()
    }

    fn create(&self, key: &str, parent: &str, kind: Kind) -> Result<Vec<Mount>> {
        if *self.fail_prepare.lock() {
            return Err(Error::storage("backend unavailable"));
        }
        let mut snapshots = self.snapshots.lock();
        if snapshots.contains_key(key) {
            return Err(Error::already_exists(format!("backend snapshot {key}")));
        }
        if !parent.is_empty() && !snapshots.contains_key(parent) {
            return Err(Error::not_found(format!("backend parent {parent}")));
        }
        snapshots.insert(key.to_string(), (kind, parent.to_string()));
        Ok(vec![Mount {
            kind: "bind".into(),
            source: format!("/snapshots/{key}"),
            options: vec![if kind == Kind::View { "ro" } else { "rw" }.into()],
        }])
    }
}

impl Snapshotter for MemSnapshotter {
    fn prepare(&self, key: &str, parent: &str) -> Result<Vec<Mount>> {
        self.create(key, parent, Kind::Active)
    }

    fn view(&self, key: &str, parent: &str) -> Result<Vec<Mount>> {
        self.create(key, parent, Kind::View)
    }

    fn commit(&self, name: &str, key: &str) -> Result<()> {
        let mut snapshots = self.snapshots.lock();
        let (_, parent) = snapshots
            .remove(key)
            .ok_or_else(|| Error::not_found(format!("backend snapshot {key}")))?;
        snapshots.insert(name.to_string(), (Kind::Committed, parent));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.snapshots
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("backend snapshot {key}")))
    }

    fn stat(&self, key: &str) -> Result<Kind> {
        self.snapshots
            .lock()
            .get(key)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| Error::not_found(format!("backend snapshot {key}")))
    }

    fn mounts(&self, key: &str) -> Result<Vec<Mount>> {
        self.stat(key)?;
        Ok(vec![Mount {
            kind: "bind".into(),
            source: format!("/snapshots/{key}"),
            options: Vec::new(),
        }])
    }

    fn walk(&self, f: &mut dyn FnMut(&str) -> Result<()>) -> Result<()> {
        for key in self.keys() {
            f(&key)?;
        }
        Ok(())
    }

    fn usage(&self, key: &str) -> Result<Usage> {
        self.stat(key)?;
        Ok(Usage { inodes: 1, size: 4096 })
    }
}
