//! Snapshot lineage records.
//!
//! Each snapshotter in a namespace keeps its records under
//! `v1/<ns>/snapshots/<sn>/<key>`. Records get an increasing numeric id that
//! survives commit renames; parent/child edges are mirrored in the
//! `(parent id, child id) -> child key` index so children are found without
//! a scan and a parent with children cannot be removed.
//!
//! The functions here require a transaction on the context.

use super::{Info, Kind, Snapshot, SnapshotOpts, Usage};
use crate::error::corrupt;
use crate::fields::{self, MapUpdate};
use crate::kv::{self, KvRead, KvWrite, check_component};
use crate::schema::{self, KEY_ID, KEY_INODES, KEY_KIND, KEY_LABELS, KEY_PARENT, KEY_SIZE};
use crate::tx::Context;
use berth_common::types::now;
use berth_common::{Error, Filter, Labels, Result, labels};
use std::collections::{BTreeMap, HashSet};

/// Snapshotter names share graph node keys with snapshot keys and
/// `gc.ref.snapshot.<snapshotter>/<suffix>` labels, so they cannot hold `/`
pub fn check_snapshotter(name: &str) -> Result<()> {
    check_component("snapshotter", name)?;
    if name.contains('/') {
        return Err(Error::invalid_argument(format!(
            "snapshotter {name:?} must not contain '/'"
        )));
    }
    Ok(())
}

/// Create an active or view snapshot
pub fn create_snapshot(
    ctx: &Context<'_>,
    snapshotter: &str,
    kind: Kind,
    key: &str,
    parent: &str,
    opts: &SnapshotOpts,
) -> Result<Snapshot> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    tx.update(|kv| create(kv, ns, snapshotter, kind, key, parent, &opts.labels))
}

/// Lineage of an active or view snapshot
pub fn get_snapshot(ctx: &Context<'_>, snapshotter: &str, key: &str) -> Result<Snapshot> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    tx.view(|kv| {
        let (id, info, _) = require(kv, ns, snapshotter, key)?;
        if info.kind == Kind::Committed {
            return Err(Error::failed_precondition(format!(
                "snapshot {key} is committed, not a working snapshot"
            )));
        }
        Ok(Snapshot {
            id,
            kind: info.kind,
            parent_ids: parent_ids(kv, ns, snapshotter, &info.parent)?,
        })
    })
}

/// Id, info and recorded usage of a snapshot of any kind
pub fn get_info(ctx: &Context<'_>, snapshotter: &str, key: &str) -> Result<(u64, Info, Usage)> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    tx.view(|kv| require(kv, ns, snapshotter, key))
}

/// Promote an active snapshot to a committed one named `name`
pub fn commit_active(
    ctx: &Context<'_>,
    snapshotter: &str,
    key: &str,
    name: &str,
    usage: Usage,
    opts: &SnapshotOpts,
) -> Result<u64> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    tx.update(|kv| commit(kv, ns, snapshotter, key, name, usage, &opts.labels))
}

/// Remove a snapshot that has no children
pub fn remove(ctx: &Context<'_>, snapshotter: &str, key: &str) -> Result<(u64, Kind)> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    let removed = tx.update(|kv| remove_record(kv, ns, snapshotter, key))?;
    tx.mark_snapshotter_dirty(snapshotter);
    Ok(removed)
}

/// Update the labels of a snapshot.
///
/// With no field paths the labels are replaced wholesale; otherwise only
/// `labels` and `labels.<key>` may be named.
pub fn update_info(ctx: &Context<'_>, snapshotter: &str, info: &Info, fieldpaths: &[&str]) -> Result<Info> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    labels::validate_all(&info.labels)?;
    let plan = MapUpdate::labels_only(&info.labels, fieldpaths, "snapshot")?;

    tx.update(|kv| {
        let path = schema::snapshot(ns, snapshotter, &info.name);
        if !kv::exists(kv, &path)? {
            return Err(Error::not_found(format!(
                "snapshot {} in {snapshotter}",
                info.name
            )));
        }
        plan.apply(kv, &path.join(KEY_LABELS))?;
        fields::write_timestamp(kv, &path.join(schema::KEY_UPDATED_AT), &now())?;
        let (_, updated, _) = require(kv, ns, snapshotter, &info.name)?;
        Ok(updated)
    })
}

/// Visit every snapshot matching `filter`, in ascending key order
pub fn walk_info(
    ctx: &Context<'_>,
    snapshotter: &str,
    filter: &Filter,
    mut f: impl FnMut(&Info) -> Result<()>,
) -> Result<()> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    let infos = tx.view(|kv| {
        let mut out = Vec::new();
        for key in kv::children(kv, &schema::snapshotter(ns, snapshotter))? {
            if let Some((_, info, _)) = read(kv, ns, snapshotter, &key)?
                && filter.matches(&info)
            {
                out.push(info);
            }
        }
        Ok(out)
    })?;
    // Callbacks run after the table is released so they may issue reads.
    infos.iter().try_for_each(&mut f)
}

/// Map of snapshot id to key
pub fn id_map(ctx: &Context<'_>, snapshotter: &str) -> Result<BTreeMap<u64, String>> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    tx.view(|kv| {
        let mut ids = BTreeMap::new();
        for key in kv::children(kv, &schema::snapshotter(ns, snapshotter))? {
            if let Some((id, _, _)) = read(kv, ns, snapshotter, &key)? {
                ids.insert(id, key);
            }
        }
        Ok(ids)
    })
}

/// Keys of the direct children of `key`
pub fn children(ctx: &Context<'_>, snapshotter: &str, key: &str) -> Result<Vec<String>> {
    let tx = ctx.transaction()?;
    let ns = ctx.namespace()?;
    tx.view(|kv| {
        let (id, _, _) = require(kv, ns, snapshotter, key)?;
        child_keys(kv, ns, snapshotter, id)
    })
}

/// Read a record, `None` if absent
pub(crate) fn read<K: KvRead + ?Sized>(
    kv: &K,
    ns: &str,
    snapshotter: &str,
    key: &str,
) -> Result<Option<(u64, Info, Usage)>> {
    let path = schema::snapshot(ns, snapshotter, key);
    if !kv::exists(kv, &path)? {
        return Ok(None);
    }
    let id = fields::read_uvarint(kv, &path.join(KEY_ID))?
        .ok_or_else(|| corrupt(&path, "missing id"))?;
    let kind = kv
        .get(path.join(KEY_KIND).as_bytes())?
        .and_then(|b| b.first().copied())
        .and_then(Kind::from_byte)
        .ok_or_else(|| corrupt(&path, "missing or invalid kind"))?;
    let parent = fields::read_string(kv, &path.join(KEY_PARENT))?.unwrap_or_default();
    let (created_at, updated_at) = fields::read_timestamps(kv, &path)?;
    let labels = fields::read_map(kv, &path.join(KEY_LABELS))?;
    let usage = Usage {
        inodes: fields::read_varint(kv, &path.join(KEY_INODES))?.unwrap_or_default(),
        size: fields::read_varint(kv, &path.join(KEY_SIZE))?.unwrap_or_default(),
    };

    let info = Info {
        kind,
        name: key.to_string(),
        parent,
        labels,
        created_at,
        updated_at,
    };
    Ok(Some((id, info, usage)))
}

/// Read a record, `NotFound` if absent
pub(crate) fn require<K: KvRead + ?Sized>(
    kv: &K,
    ns: &str,
    snapshotter: &str,
    key: &str,
) -> Result<(u64, Info, Usage)> {
    read(kv, ns, snapshotter, key)?
        .ok_or_else(|| Error::not_found(format!("snapshot {key} in {snapshotter}")))
}

/// Keys of every record in a snapshotter
pub(crate) fn keys<K: KvRead + ?Sized>(kv: &K, ns: &str, snapshotter: &str) -> Result<Vec<String>> {
    Ok(kv::children(kv, &schema::snapshotter(ns, snapshotter))?)
}

/// Child keys recorded in the parent index
pub(crate) fn child_keys<K: KvRead + ?Sized>(kv: &K, ns: &str, snapshotter: &str, id: u64) -> Result<Vec<String>> {
    let prefix = schema::parent_index_prefix(ns, snapshotter, id).child_prefix();
    kv.entries(&prefix)?
        .into_iter()
        .map(|(k, v)| {
            String::from_utf8(v).map_err(|e| corrupt(String::from_utf8_lossy(&k), e).into())
        })
        .collect()
}

/// Ancestor ids of `parent`, `parent` itself first
fn parent_ids<K: KvRead + ?Sized>(kv: &K, ns: &str, snapshotter: &str, parent: &str) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    let mut next = parent.to_string();
    while !next.is_empty() {
        let (id, info, _) = require(kv, ns, snapshotter, &next)?;
        if !seen.insert(id) {
            return Err(corrupt(schema::snapshot(ns, snapshotter, &next), "parent cycle").into());
        }
        ids.push(id);
        next = info.parent;
    }
    Ok(ids)
}

fn next_id<K: KvWrite + ?Sized>(kv: &mut K, ns: &str, snapshotter: &str) -> Result<u64> {
    let path = schema::sequence(ns, snapshotter);
    let id = fields::read_uvarint(kv, &path)?.unwrap_or_default() + 1;
    fields::write_uvarint(kv, &path, id)?;
    Ok(id)
}

/// Look up a parent, which must exist and be committed
fn committed_parent<K: KvRead + ?Sized>(kv: &K, ns: &str, snapshotter: &str, parent: &str) -> Result<u64> {
    let (id, info, _) = read(kv, ns, snapshotter, parent)?
        .ok_or_else(|| Error::not_found(format!("parent snapshot {parent} in {snapshotter}")))?;
    if info.kind != Kind::Committed {
        return Err(Error::failed_precondition(format!(
            "parent snapshot {parent} is {}, not committed",
            info.kind
        )));
    }
    Ok(id)
}

fn write_record<K: KvWrite + ?Sized>(
    kv: &mut K,
    path: &kv::Path,
    id: u64,
    info: &Info,
    usage: Option<Usage>,
) -> Result<()> {
    kv::create_bucket(kv, path)?;
    fields::write_uvarint(kv, &path.join(KEY_ID), id)?;
    kv.put(path.join(KEY_KIND).as_bytes(), &[info.kind.to_byte()])?;
    fields::write_optional_string(kv, &path.join(KEY_PARENT), &info.parent)?;
    fields::write_timestamps(kv, path, &info.created_at, &info.updated_at)?;
    fields::write_map(kv, &path.join(KEY_LABELS), &info.labels)?;
    if let Some(usage) = usage {
        fields::write_varint(kv, &path.join(KEY_INODES), usage.inodes)?;
        fields::write_varint(kv, &path.join(KEY_SIZE), usage.size)?;
    }
    Ok(())
}

pub(crate) fn create<K: KvWrite + ?Sized>(
    kv: &mut K,
    ns: &str,
    snapshotter: &str,
    kind: Kind,
    key: &str,
    parent: &str,
    labels: &Labels,
) -> Result<Snapshot> {
    if kind == Kind::Committed {
        return Err(Error::invalid_argument(
            "snapshots can only be created as active or view",
        ));
    }
    check_snapshotter(snapshotter)?;
    check_component("snapshot key", key)?;
    labels::validate_all(labels)?;
    schema::ensure_namespace(kv, ns)?;

    let path = schema::snapshot(ns, snapshotter, key);
    if kv::exists(kv, &path)? {
        return Err(Error::already_exists(format!("snapshot {key} in {snapshotter}")));
    }
    let parent_id = if parent.is_empty() {
        None
    } else {
        Some(committed_parent(kv, ns, snapshotter, parent)?)
    };

    let id = next_id(kv, ns, snapshotter)?;
    let ts = now();
    let info = Info {
        kind,
        name: key.to_string(),
        parent: parent.to_string(),
        labels: labels.clone(),
        created_at: ts,
        updated_at: ts,
    };
    write_record(kv, &path, id, &info, None)?;
    if let Some(pid) = parent_id {
        fields::write_string(kv, &schema::parent_index_entry(ns, snapshotter, pid, id), key)?;
    }

    Ok(Snapshot {
        id,
        kind,
        parent_ids: parent_ids(kv, ns, snapshotter, parent)?,
    })
}

pub(crate) fn commit<K: KvWrite + ?Sized>(
    kv: &mut K,
    ns: &str,
    snapshotter: &str,
    key: &str,
    name: &str,
    usage: Usage,
    labels: &Labels,
) -> Result<u64> {
    check_component("snapshot name", name)?;
    labels::validate_all(labels)?;

    let target = schema::snapshot(ns, snapshotter, name);
    if kv::exists(kv, &target)? {
        return Err(Error::already_exists(format!("snapshot {name} in {snapshotter}")));
    }
    let (id, active, _) = require(kv, ns, snapshotter, key)?;
    if active.kind != Kind::Active {
        return Err(Error::failed_precondition(format!(
            "snapshot {key} is {}, only active snapshots can be committed",
            active.kind
        )));
    }

    let ts = now();
    let info = Info {
        kind: Kind::Committed,
        name: name.to_string(),
        parent: active.parent.clone(),
        labels: labels.clone(),
        created_at: ts,
        updated_at: ts,
    };
    write_record(kv, &target, id, &info, Some(usage))?;
    kv::delete_bucket(kv, &schema::snapshot(ns, snapshotter, key))?;

    if !active.parent.is_empty() {
        let (pid, _, _) = require(kv, ns, snapshotter, &active.parent)?;
        fields::write_string(kv, &schema::parent_index_entry(ns, snapshotter, pid, id), name)?;
    }
    Ok(id)
}

pub(crate) fn remove_record<K: KvWrite + ?Sized>(
    kv: &mut K,
    ns: &str,
    snapshotter: &str,
    key: &str,
) -> Result<(u64, Kind)> {
    let (id, info, _) = require(kv, ns, snapshotter, key)?;
    let children = child_keys(kv, ns, snapshotter, id)?;
    if let Some(child) = children.first() {
        return Err(Error::failed_precondition(format!(
            "cannot remove snapshot {key} in {snapshotter}: {} child snapshot(s) exist, including {child}",
            children.len()
        )));
    }

    if !info.parent.is_empty() {
        match read(kv, ns, snapshotter, &info.parent)? {
            Some((pid, _, _)) => {
                kv.delete(schema::parent_index_entry(ns, snapshotter, pid, id).as_bytes())?;
            }
            None => tracing::warn!(
                "snapshot {} in {} references missing parent {}",
                key,
                snapshotter,
                info.parent
            ),
        }
    }
    kv::delete_bucket(kv, &schema::snapshot(ns, snapshotter, key))?;
    Ok((id, info.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Db, DbOptions};
    use tempfile::tempdir;

    const SN: &str = "overlay";

    fn open() -> (tempfile::TempDir, Db) {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("meta.redb"), DbOptions::default()).unwrap();
        (dir, db)
    }

    fn ctx() -> Context<'static> {
        Context::with_namespace_only("default")
    }

    fn opts() -> SnapshotOpts {
        SnapshotOpts::default()
    }

    /// Prepare and commit `name` on top of `parent`
    fn committed(db: &Db, name: &str, parent: &str) -> u64 {
        db.update(&ctx(), |ctx| {
            let active = format!("{name}-active");
            create_snapshot(ctx, SN, Kind::Active, &active, parent, &opts())?;
            commit_active(ctx, SN, &active, name, Usage::default(), &opts())
        })
        .unwrap()
    }

    #[test]
    fn test_requires_transaction() {
        let err = create_snapshot(&ctx(), SN, Kind::Active, "a", "", &opts()).unwrap_err();
        assert!(err.is_no_transaction());
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, db) = open();
        let s = db
            .update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::Active, "a", "", &opts()))
            .unwrap();
        assert_eq!(s.kind, Kind::Active);
        assert!(s.parent_ids.is_empty());

        let got = db.view(&ctx(), |ctx| get_snapshot(ctx, SN, "a")).unwrap();
        assert_eq!(got, s);

        let err = db
            .update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::View, "a", "", &opts()))
            .unwrap_err();
        assert!(err.is_already_exists());

        let err = db
            .update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::Committed, "b", "", &opts()))
            .unwrap_err();
        assert!(err.is_invalid_argument());

        let err = db
            .update(&ctx(), |ctx| create_snapshot(ctx, "a/b", Kind::Active, "k", "", &opts()))
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_parent_must_exist_and_be_committed() {
        let (_dir, db) = open();
        let err = db
            .update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::Active, "a", "missing", &opts()))
            .unwrap_err();
        assert!(err.is_not_found());

        db.update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::Active, "work", "", &opts()))
            .unwrap();
        let err = db
            .update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::Active, "b", "work", &opts()))
            .unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn test_commit_round_trip() {
        let (_dir, db) = open();
        let base = committed(&db, "base", "");
        let mid = committed(&db, "mid", "base");

        let before = db
            .update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::Active, "k", "mid", &opts()))
            .unwrap();
        assert_eq!(before.parent_ids, vec![mid, base]);

        let usage = Usage { inodes: 3, size: 4096 };
        let id = db
            .update(&ctx(), |ctx| commit_active(ctx, SN, "k", "n", usage, &opts()))
            .unwrap();
        assert_eq!(id, before.id);

        let err = db.view(&ctx(), |ctx| get_snapshot(ctx, SN, "k")).unwrap_err();
        assert!(err.is_not_found());

        let (nid, info, got_usage) = db.view(&ctx(), |ctx| get_info(ctx, SN, "n")).unwrap();
        assert_eq!(nid, before.id);
        assert_eq!(info.kind, Kind::Committed);
        assert_eq!(info.parent, "mid");
        assert_eq!(got_usage, usage);

        // committed records are not working snapshots
        let err = db.view(&ctx(), |ctx| get_snapshot(ctx, SN, "n")).unwrap_err();
        assert!(err.is_failed_precondition());

        // the chain is intact when building on the committed snapshot
        let child = db
            .update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::View, "v", "n", &opts()))
            .unwrap();
        assert_eq!(child.parent_ids, vec![before.id, mid, base]);

        let kids = db.view(&ctx(), |ctx| children(ctx, SN, "mid")).unwrap();
        assert_eq!(kids, vec!["n".to_string()]);
    }

    #[test]
    fn test_commit_preconditions() {
        let (_dir, db) = open();
        committed(&db, "taken", "");
        db.update(&ctx(), |ctx| {
            create_snapshot(ctx, SN, Kind::Active, "a", "", &opts())?;
            create_snapshot(ctx, SN, Kind::View, "v", "", &opts())
        })
        .unwrap();

        let err = db
            .update(&ctx(), |ctx| commit_active(ctx, SN, "a", "taken", Usage::default(), &opts()))
            .unwrap_err();
        assert!(err.is_already_exists());

        let err = db
            .update(&ctx(), |ctx| commit_active(ctx, SN, "v", "n", Usage::default(), &opts()))
            .unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn test_remove_order_follows_children() {
        let (_dir, db) = open();
        committed(&db, "s1", "");
        committed(&db, "s2", "s1");
        committed(&db, "s3", "s2");

        let err = db.update(&ctx(), |ctx| remove(ctx, SN, "s1")).unwrap_err();
        assert!(err.is_failed_precondition());

        for key in ["s3", "s2", "s1"] {
            let (_, kind) = db.update(&ctx(), |ctx| remove(ctx, SN, key)).unwrap();
            assert_eq!(kind, Kind::Committed);
            let remaining = db.view(&ctx(), |ctx| id_map(ctx, SN)).unwrap();
            assert!(remaining.values().all(|k| k != key));
            // nothing left points at the removed snapshot
            let mut parents = Vec::new();
            db.view(&ctx(), |ctx| {
                walk_info(ctx, SN, &Filter::always(), |info| {
                    parents.push(info.parent.clone());
                    Ok(())
                })
            })
            .unwrap();
            assert!(parents.iter().all(|p| p != key));
        }
        assert!(db.view(&ctx(), |ctx| id_map(ctx, SN)).unwrap().is_empty());
    }

    #[test]
    fn test_update_info_labels_only() {
        let (_dir, db) = open();
        let labels = labels::from_pairs([("a", "1"), ("b", "2")]);
        db.update(&ctx(), |ctx| {
            create_snapshot(ctx, SN, Kind::Active, "k", "", &SnapshotOpts::with_labels(labels))
        })
        .unwrap();

        let mut info = Info::new("k");
        info.labels = labels::from_pairs([("b", "3"), ("c", "4")]);
        let updated = db
            .update(&ctx(), |ctx| update_info(ctx, SN, &info, &["labels.b"]))
            .unwrap();
        assert_eq!(updated.labels, labels::from_pairs([("a", "1"), ("b", "3")]));
        assert_eq!(updated.kind, Kind::Active);

        let updated = db.update(&ctx(), |ctx| update_info(ctx, SN, &info, &[])).unwrap();
        assert_eq!(updated.labels, info.labels);

        let err = db
            .update(&ctx(), |ctx| update_info(ctx, SN, &info, &["parent"]))
            .unwrap_err();
        assert!(err.is_invalid_argument());
        let err = db
            .update(&ctx(), |ctx| update_info(ctx, SN, &info, &["labels", "parent"]))
            .unwrap_err();
        assert!(err.is_invalid_argument());
        let current = db.view(&ctx(), |ctx| get_info(ctx, SN, "k")).unwrap();
        assert_eq!(current.1.labels, info.labels);

        let missing = Info::new("nope");
        let err = db
            .update(&ctx(), |ctx| update_info(ctx, SN, &missing, &[]))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_walk_filters_in_key_order() {
        let (_dir, db) = open();
        db.update(&ctx(), |ctx| {
            for key in ["c", "a", "b"] {
                let labels = labels::from_pairs([("pick", if key == "b" { "no" } else { "yes" })]);
                create_snapshot(ctx, SN, Kind::Active, key, "", &SnapshotOpts::with_labels(labels))?;
            }
            Ok(())
        })
        .unwrap();

        let mut seen = Vec::new();
        let filter = Filter::parse("labels.pick==yes").unwrap();
        db.view(&ctx(), |ctx| {
            walk_info(ctx, SN, &filter, |info| {
                seen.push(info.name.clone());
                Ok(())
            })
        })
        .unwrap();
        assert_eq!(seen, vec!["a", "c"]);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let (_dir, db) = open();
        db.update(&ctx(), |ctx| create_snapshot(ctx, SN, Kind::Active, "a", "", &opts()))
            .unwrap();
        let other = Context::with_namespace_only("other");
        let err = db.view(&other, |ctx| get_info(ctx, SN, "a")).unwrap_err();
        assert!(err.is_not_found());
    }
}
