//! Namespaced snapshotter.
//!
//! [`MetaSnapshotter`] records every snapshot in the lineage store and
//! forwards the storage work to the backend under a key unique to the
//! namespace and snapshot id, so callers in different namespaces may use
//! the same keys. Backend snapshots are removed by the garbage collector
//! once their record is gone.

use super::{Info, Kind, Mount, SnapshotOpts, Snapshotter, Usage, storage};
use crate::Db;
use crate::events::Event;
use crate::kv;
use crate::leases;
use crate::schema;
use crate::tx::Context;
use berth_common::{Error, Filter, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Backend key of snapshot `id` in `ns`
pub(crate) fn backend_key(ns: &str, id: u64, key: &str) -> String {
    format!("{ns}/{id}/{key}")
}

pub struct MetaSnapshotter {
    name: String,
    db: Arc<Db>,
    backend: Arc<dyn Snapshotter>,
}

impl MetaSnapshotter {
    /// Facade for the backend registered as `name`
    pub fn new(db: Arc<Db>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let backend = db
            .snapshotter(&name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("snapshotter {name:?} is not configured")))?;
        Ok(Self { name, db, backend })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stat(&self, ctx: &Context<'_>, key: &str) -> Result<Info> {
        self.db
            .view(ctx, |ctx| storage::get_info(ctx, &self.name, key).map(|(_, info, _)| info))
    }

    pub fn update(&self, ctx: &Context<'_>, info: &Info, fieldpaths: &[&str]) -> Result<Info> {
        self.db
            .update(ctx, |ctx| storage::update_info(ctx, &self.name, info, fieldpaths))
    }

    /// Usage measured by the backend for active snapshots, recorded at
    /// commit otherwise
    pub fn usage(&self, ctx: &Context<'_>, key: &str) -> Result<Usage> {
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let (id, info, usage) = storage::get_info(ctx, &self.name, key)?;
            if info.kind == Kind::Active {
                self.backend.usage(&backend_key(ns, id, key))
            } else {
                Ok(usage)
            }
        })
    }

    pub fn mounts(&self, ctx: &Context<'_>, key: &str) -> Result<Vec<Mount>> {
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let (id, _, _) = storage::get_info(ctx, &self.name, key)?;
            self.backend.mounts(&backend_key(ns, id, key))
        })
    }

    pub fn prepare(&self, ctx: &Context<'_>, key: &str, parent: &str, opts: &SnapshotOpts) -> Result<Vec<Mount>> {
        self.create(ctx, Kind::Active, key, parent, opts)
    }

    pub fn view(&self, ctx: &Context<'_>, key: &str, parent: &str, opts: &SnapshotOpts) -> Result<Vec<Mount>> {
        self.create(ctx, Kind::View, key, parent, opts)
    }

    fn create(&self, ctx: &Context<'_>, kind: Kind, key: &str, parent: &str, opts: &SnapshotOpts) -> Result<Vec<Mount>> {
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let snapshot = storage::create_snapshot(ctx, &self.name, kind, key, parent, opts)?;
            tx.update(|kv| leases::attach_snapshot(kv, ns, ctx.lease(), &self.name, key))?;

            let bkey = backend_key(ns, snapshot.id, key);
            let bparent = snapshot
                .parent_ids
                .first()
                .map(|pid| backend_key(ns, *pid, parent))
                .unwrap_or_default();
            // A backend failure rolls the record back with the transaction.
            let mounts = if kind == Kind::View {
                self.backend.view(&bkey, &bparent)?
            } else {
                self.backend.prepare(&bkey, &bparent)?
            };
            tx.publish(
                ns,
                Event::SnapshotPrepare {
                    snapshotter: self.name.clone(),
                    key: key.to_string(),
                    parent: parent.to_string(),
                },
            );
            Ok(mounts)
        })
    }

    pub fn commit(&self, ctx: &Context<'_>, name: &str, key: &str, opts: &SnapshotOpts) -> Result<()> {
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let (id, info, _) = storage::get_info(ctx, &self.name, key)?;
            if info.kind != Kind::Active {
                return Err(Error::failed_precondition(format!(
                    "snapshot {key} is {}, only active snapshots can be committed",
                    info.kind
                )));
            }
            let bkey = backend_key(ns, id, key);
            let usage = self.backend.usage(&bkey)?;
            let id = storage::commit_active(ctx, &self.name, key, name, usage, opts)?;
            tx.update(|kv| {
                leases::attach_snapshot(&mut *kv, ns, ctx.lease(), &self.name, name)?;
                leases::detach_snapshot(kv, ns, ctx.lease(), &self.name, key)
            })?;
            self.backend.commit(&backend_key(ns, id, name), &bkey)?;
            tx.publish(
                ns,
                Event::SnapshotCommit {
                    snapshotter: self.name.clone(),
                    key: key.to_string(),
                    name: name.to_string(),
                },
            );
            Ok(())
        })
    }

    /// Remove the record; the backend snapshot goes at the next collection
    pub fn remove(&self, ctx: &Context<'_>, key: &str) -> Result<()> {
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            storage::remove(ctx, &self.name, key)?;
            tx.update(|kv| leases::detach_snapshot(kv, ns, ctx.lease(), &self.name, key))?;
            tx.publish(
                ns,
                Event::SnapshotRemove {
                    snapshotter: self.name.clone(),
                    key: key.to_string(),
                },
            );
            Ok(())
        })
    }

    /// Visit snapshots matching any of `filters`
    pub fn walk(&self, ctx: &Context<'_>, filters: &[&str], f: impl FnMut(&Info) -> Result<()>) -> Result<()> {
        let filter = Filter::parse_all(filters)?;
        self.db
            .view(ctx, |ctx| storage::walk_info(ctx, &self.name, &filter, f))
    }
}

/// Remove backend snapshots without a record in any namespace.
///
/// Runs in a write transaction so no snapshot can be created while the
/// backend is walked.
pub(crate) fn cleanup(db: &Db, name: &str, backend: &dyn Snapshotter) -> Result<usize> {
    db.update(&Context::background(), |ctx| {
        let tx = ctx.transaction()?;
        let expected = tx.view(|kv| {
            let mut expected = HashSet::new();
            for ns in kv::children(kv, &schema::version_root())? {
                for key in storage::keys(kv, &ns, name)? {
                    if let Some((id, _, _)) = storage::read(kv, &ns, name, &key)? {
                        expected.insert(backend_key(&ns, id, &key));
                    }
                }
            }
            Ok(expected)
        })?;

        let mut orphans = Vec::new();
        backend.walk(&mut |bkey| {
            if !expected.contains(bkey) {
                orphans.push(bkey.to_string());
            }
            Ok(())
        })?;

        // Children are created after their parents; remove newest first.
        orphans.sort_by_key(|k| std::cmp::Reverse(orphan_id(k)));
        let mut removed = 0;
        for bkey in orphans {
            match backend.remove(&bkey) {
                Ok(()) => {
                    debug!(snapshotter = name, key = %bkey, "removed backend snapshot");
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove snapshot {} from {}: {}", bkey, name, e),
            }
        }
        if removed > 0 {
            info!("Removed {} orphaned snapshot(s) from {}", removed, name);
        }
        Ok(removed)
    })
}

/// Snapshot id embedded in a backend key, 0 for foreign keys
fn orphan_id(bkey: &str) -> u64 {
    bkey.split('/')
        .nth(1)
        .and_then(|id| id.parse().ok())
        .unwrap_or_default()
}
