//! Schema migrations.
//!
//! The schema version is a uvarint under the top-level `dbversion` key.
//! Migration `i` upgrades a database at version `i` to `i + 1`; opening a
//! database runs every pending migration and stores the new version in the
//! same write transaction.

use crate::error::corrupt;
use crate::fields;
use crate::kv::{self, KvRead, KvWrite};
use crate::schema::{self, KEY_CREATED_AT, KEY_INODES, KEY_SCHEMA_VERSION, KEY_SIZE, KEY_UPDATED_AT};
use crate::snapshot::{Kind, storage};
use berth_common::{Error, Result};
use tracing::{debug, info};

type MigrateFn = fn(&mut dyn KvWrite) -> Result<()>;

/// A single schema upgrade step
pub struct Migration {
    pub name: &'static str,
    pub migrate: MigrateFn,
}

/// Upgrades in the order they apply
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "parent-index",
        migrate: rebuild_parent_index,
    },
    Migration {
        name: "content-updated-at",
        migrate: backfill_content_updated_at,
    },
    Migration {
        name: "snapshot-usage",
        migrate: backfill_snapshot_usage,
    },
];

/// Version a database has after every migration
pub const SCHEMA_VERSION: u64 = MIGRATIONS.len() as u64;

/// Stored schema version, 0 for a database that never recorded one
pub fn read_version<K: KvRead + ?Sized>(kv: &K) -> Result<u64> {
    let Some(raw) = kv.get(KEY_SCHEMA_VERSION)? else {
        return Ok(0);
    };
    kv::uvarint(&raw)
        .map(|(v, _)| v)
        .ok_or_else(|| corrupt("dbversion", "invalid uvarint").into())
}

/// Apply pending migrations and return the resulting version
pub fn migrate(kv: &mut dyn KvWrite) -> Result<u64> {
    let current = read_version(&*kv)?;
    if current > SCHEMA_VERSION {
        return Err(Error::failed_precondition(format!(
            "database schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if current == SCHEMA_VERSION {
        debug!(version = current, "schema up to date");
        return Ok(current);
    }

    let start = usize::try_from(current).unwrap_or(MIGRATIONS.len());
    for m in &MIGRATIONS[start..] {
        info!("Applying schema migration {}", m.name);
        (m.migrate)(&mut *kv).map_err(|e| e.context(format!("migration {}", m.name)))?;
    }
    kv.put(KEY_SCHEMA_VERSION, &kv::encode_uvarint(SCHEMA_VERSION))?;
    info!(
        "Migrated metadata schema from version {} to {}",
        current, SCHEMA_VERSION
    );
    Ok(SCHEMA_VERSION)
}

/// Every (namespace, snapshotter) pair holding snapshot records
fn snapshotters(kv: &dyn KvWrite) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for ns in kv::children(kv, &schema::version_root())? {
        for sn in kv::children(kv, &schema::snapshotters(&ns))? {
            out.push((ns.clone(), sn));
        }
    }
    Ok(out)
}

fn rebuild_parent_index(kv: &mut dyn KvWrite) -> Result<()> {
    for (ns, sn) in snapshotters(&*kv)? {
        let mut edges = Vec::new();
        for key in storage::keys(&*kv, &ns, &sn)? {
            let Some((id, info, _)) = storage::read(&*kv, &ns, &sn, &key)? else {
                continue;
            };
            if info.parent.is_empty() {
                continue;
            }
            match storage::read(&*kv, &ns, &sn, &info.parent)? {
                Some((pid, _, _)) => edges.push((pid, id, key)),
                None => tracing::warn!(
                    "snapshot {} in {}/{} references missing parent {}",
                    key,
                    ns,
                    sn,
                    info.parent
                ),
            }
        }
        for (pid, id, key) in edges {
            fields::write_string(&mut *kv, &schema::parent_index_entry(&ns, &sn, pid, id), &key)?;
        }
    }
    Ok(())
}

fn backfill_content_updated_at(kv: &mut dyn KvWrite) -> Result<()> {
    let mut pending = Vec::new();
    for ns in kv::children(&*kv, &schema::version_root())? {
        for digest in kv::children(&*kv, &schema::blobs(&ns))? {
            let blob = schema::blob(&ns, &digest);
            if kv.get(blob.join(KEY_UPDATED_AT).as_bytes())?.is_none()
                && let Some(created) = kv.get(blob.join(KEY_CREATED_AT).as_bytes())?
            {
                pending.push((blob, created));
            }
        }
    }
    for (blob, created) in pending {
        kv.put(blob.join(KEY_UPDATED_AT).as_bytes(), &created)?;
    }
    Ok(())
}

fn backfill_snapshot_usage(kv: &mut dyn KvWrite) -> Result<()> {
    let mut pending = Vec::new();
    for (ns, sn) in snapshotters(&*kv)? {
        for key in storage::keys(&*kv, &ns, &sn)? {
            let Some((_, info, _)) = storage::read(&*kv, &ns, &sn, &key)? else {
                continue;
            };
            let path = schema::snapshot(&ns, &sn, &key);
            if info.kind == Kind::Committed && kv.get(path.join(KEY_SIZE).as_bytes())?.is_none() {
                pending.push(path);
            }
        }
    }
    for path in pending {
        fields::write_varint(&mut *kv, &path.join(KEY_INODES), 0)?;
        fields::write_varint(&mut *kv, &path.join(KEY_SIZE), 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::Context;
    use crate::{Db, DbOptions};
    use berth_common::Labels;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, Db) {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("meta.redb"), DbOptions::default()).unwrap();
        (dir, db)
    }

    fn write<R>(db: &Db, f: impl FnOnce(&mut dyn KvWrite) -> Result<R>) -> Result<R> {
        db.update(&Context::background(), |ctx| ctx.transaction()?.update(f))
    }

    fn set_version(db: &Db, version: u64) {
        write(db, |kv| Ok(kv.put(KEY_SCHEMA_VERSION, &kv::encode_uvarint(version))?)).unwrap();
    }

    #[test]
    fn test_fresh_database_is_current() {
        let (_dir, db) = open();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(write(&db, |kv| migrate(kv)).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_version_rejected() {
        let (_dir, db) = open();
        set_version(&db, SCHEMA_VERSION + 1);
        let err = write(&db, |kv| migrate(kv)).unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn test_newer_version_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        let db = Db::open(&path, DbOptions::default()).unwrap();
        set_version(&db, SCHEMA_VERSION + 1);
        drop(db);
        let err = Db::open(&path, DbOptions::default()).unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn test_parent_index_rebuilt() {
        let (_dir, db) = open();
        write(&db, |kv| {
            storage::create(&mut *kv, "default", "overlay", Kind::Active, "a", "", &Labels::new())?;
            storage::commit(&mut *kv, "default", "overlay", "a", "base", Default::default(), &Labels::new())?;
            storage::create(&mut *kv, "default", "overlay", Kind::Active, "child", "base", &Labels::new())?;
            // drop the index as an old database would lack it
            kv::delete_children(&mut *kv, &schema::parent_index("default", "overlay"))?;
            Ok(())
        })
        .unwrap();
        set_version(&db, 0);

        let children = write(&db, |kv| {
            migrate(&mut *kv)?;
            storage::child_keys(&*kv, "default", "overlay", 1)
        })
        .unwrap();
        assert_eq!(children, vec!["child"]);
    }

    #[test]
    fn test_backfills() {
        let (_dir, db) = open();
        let blob = schema::blob("default", "sha256:aa");
        let committed = schema::snapshot("default", "overlay", "base");
        write(&db, |kv| {
            storage::create(&mut *kv, "default", "overlay", Kind::Active, "a", "", &Labels::new())?;
            storage::commit(&mut *kv, "default", "overlay", "a", "base", Default::default(), &Labels::new())?;
            kv.delete(committed.join(KEY_SIZE).as_bytes())?;
            kv.delete(committed.join(KEY_INODES).as_bytes())?;

            kv::create_bucket(&mut *kv, &blob)?;
            fields::write_string(&mut *kv, &blob.join(KEY_CREATED_AT), "2024-01-02T03:04:05Z")?;
            Ok(())
        })
        .unwrap();
        set_version(&db, 1);

        write(&db, |kv| migrate(kv)).unwrap();
        let (updated, size) = db
            .view(&Context::background(), |ctx| {
                ctx.transaction()?.view(|kv| {
                    Ok((
                        fields::read_string(kv, &blob.join(KEY_UPDATED_AT))?,
                        fields::read_varint(kv, &committed.join(KEY_SIZE))?,
                    ))
                })
            })
            .unwrap();
        assert_eq!(updated.as_deref(), Some("2024-01-02T03:04:05Z"));
        assert_eq!(size, Some(0));
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }
}
