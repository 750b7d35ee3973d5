//! The metadata database.
//!
//! [`Db`] owns the redb file and the collaborators the stores and the
//! garbage collector need: snapshotter and content backends, the event
//! publisher and the collectible resource registry. All writers are
//! serialized by redb; readers see the state as of `begin_read`.

use crate::collector::CollectorRegistry;
use crate::content::ContentBackend;
use crate::error::MetaStoreError;
use crate::events::{self, Publisher};
use crate::kv;
use crate::migrations;
use crate::schema;
use crate::snapshot::{Snapshotter, storage};
use crate::tables;
use crate::tx::{Context, Effects, Tx};
use berth_common::config::MetadataConfig;
use berth_common::{Error, Result, TypeRegistry};
use parking_lot::{Mutex, RwLock};
use redb::{Database, Durability};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

type MutationCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Collaborators and tuning for a [`Db`]
#[derive(Clone, Default)]
pub struct DbOptions {
    /// Commit without fsync
    pub no_sync: bool,
    pub collectors: CollectorRegistry,
    pub publisher: Option<Arc<dyn Publisher>>,
    /// Snapshot backends by snapshotter name
    pub snapshotters: BTreeMap<String, Arc<dyn Snapshotter>>,
    pub content: Option<Arc<dyn ContentBackend>>,
    /// Decoders for container and sandbox payloads
    pub types: Arc<TypeRegistry>,
}

impl DbOptions {
    pub fn from_config(config: &MetadataConfig) -> Self {
        Self {
            no_sync: config.no_sync,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_snapshotter(mut self, name: impl Into<String>, backend: Arc<dyn Snapshotter>) -> Self {
        self.snapshotters.insert(name.into(), backend);
        self
    }

    #[must_use]
    pub fn with_content_backend(mut self, backend: Arc<dyn ContentBackend>) -> Self {
        self.content = Some(backend);
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn with_types(mut self, types: TypeRegistry) -> Self {
        self.types = Arc::new(types);
        self
    }

    #[must_use]
    pub fn with_collectors(mut self, collectors: CollectorRegistry) -> Self {
        self.collectors = collectors;
        self
    }
}

impl fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbOptions")
            .field("no_sync", &self.no_sync)
            .field("collectors", &self.collectors)
            .field("snapshotters", &self.snapshotters.keys().collect::<Vec<_>>())
            .field("content", &self.content.is_some())
            .finish_non_exhaustive()
    }
}

/// Namespaced metadata database
pub struct Db {
    db: Database,
    options: DbOptions,
    /// Committed transactions that removed something, since the last collection
    dirty: AtomicU64,
    dirty_snapshotters: Mutex<BTreeSet<String>>,
    dirty_content: Mutex<BTreeSet<String>>,
    mutation_callbacks: RwLock<Vec<MutationCallback>>,
}

impl Db {
    /// Open (or create) the database and migrate it to the current schema
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let path = path.as_ref();
        for name in options.snapshotters.keys() {
            storage::check_snapshotter(name)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(MetaStoreError::from)?;
        let db = Self {
            db,
            options,
            dirty: AtomicU64::new(0),
            dirty_snapshotters: Mutex::new(BTreeSet::new()),
            dirty_content: Mutex::new(BTreeSet::new()),
            mutation_callbacks: RwLock::new(Vec::new()),
        };
        let version = db.init()?;
        info!(
            "Opened metadata database at {} (schema version {})",
            path.display(),
            version
        );
        Ok(db)
    }

    /// Create the table eagerly and apply pending migrations atomically
    fn init(&self) -> Result<u64> {
        let txn = self.db.begin_write().map_err(MetaStoreError::from)?;
        {
            let _t = txn.open_table(tables::META).map_err(MetaStoreError::from)?;
        }
        let tx = Tx::write(txn);
        let version = tx.update(|kv| migrations::migrate(kv))?;
        tx.commit()?;
        Ok(version)
    }

    pub fn options(&self) -> &DbOptions {
        &self.options
    }

    pub fn collectors(&self) -> &CollectorRegistry {
        &self.options.collectors
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.options.types
    }

    /// Backend registered for `snapshotter`
    pub fn snapshotter(&self, name: &str) -> Option<&Arc<dyn Snapshotter>> {
        self.options.snapshotters.get(name)
    }

    pub fn content_backend(&self) -> Option<&Arc<dyn ContentBackend>> {
        self.options.content.as_ref()
    }

    /// Call `f` after every committed write transaction; the argument tells
    /// whether the transaction removed something
    pub fn register_mutation_callback(&self, f: impl Fn(bool) + Send + Sync + 'static) {
        self.mutation_callbacks.write().push(Box::new(f));
    }

    /// Run `f` in a transaction.
    ///
    /// A transaction already on `ctx` is joined; asking for a writable one
    /// while it is read-only fails. Otherwise a new transaction is opened,
    /// committed when `f` succeeds and rolled back when it fails.
    /// Cancellation is only honored before a transaction is acquired.
    pub fn with_transaction<R>(
        &self,
        ctx: &Context<'_>,
        writable: bool,
        f: impl FnOnce(&Context<'_>) -> Result<R>,
    ) -> Result<R> {
        if let Some(tx) = ctx.tx() {
            if writable && !tx.is_writable() {
                return Err(Error::failed_precondition(
                    "write transaction required, context holds a read-only one",
                ));
            }
            return f(ctx);
        }
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let tx = if writable {
            let mut txn = self.db.begin_write().map_err(MetaStoreError::from)?;
            if self.options.no_sync {
                let _ = txn.set_durability(Durability::Eventual);
            }
            Tx::write(txn)
        } else {
            Tx::read(self.db.begin_read().map_err(MetaStoreError::from)?)
        };

        let value = f(&ctx.with_tx(&tx))?;
        let mutated = tx.is_mutated();
        let dirty = tx.is_dirty();
        let effects = tx.commit()?;
        self.after_commit(effects, mutated, dirty);
        Ok(value)
    }

    /// Read-only transaction
    pub fn view<R>(&self, ctx: &Context<'_>, f: impl FnOnce(&Context<'_>) -> Result<R>) -> Result<R> {
        self.with_transaction(ctx, false, f)
    }

    /// Read-write transaction
    pub fn update<R>(&self, ctx: &Context<'_>, f: impl FnOnce(&Context<'_>) -> Result<R>) -> Result<R> {
        self.with_transaction(ctx, true, f)
    }

    fn after_commit(&self, effects: Effects, mutated: bool, dirty: bool) {
        let Effects {
            events,
            snapshotters,
            content,
        } = effects;
        if !snapshotters.is_empty() {
            self.dirty_snapshotters.lock().extend(snapshotters);
        }
        if !content.is_empty() {
            self.dirty_content.lock().extend(content);
        }
        events::publish_all(self.options.publisher.as_deref(), events);

        if mutated {
            if dirty {
                self.dirty.fetch_add(1, Ordering::AcqRel);
            }
            for cb in self.mutation_callbacks.read().iter() {
                cb(dirty);
            }
        }
    }

    /// Number of committed removals since the last collection
    pub fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    /// Take the snapshotters and digests needing backend cleanup
    pub(crate) fn take_dirty(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        self.dirty.store(0, Ordering::Release);
        let snapshotters = std::mem::take(&mut *self.dirty_snapshotters.lock());
        let content = std::mem::take(&mut *self.dirty_content.lock());
        debug!(
            snapshotters = snapshotters.len(),
            content = content.len(),
            "taking dirty backend state"
        );
        (snapshotters, content)
    }

    /// Namespaces that hold at least one bucket
    pub fn namespaces(&self, ctx: &Context<'_>) -> Result<Vec<String>> {
        self.view(ctx, |ctx| {
            ctx.transaction()?
                .view(|kv| Ok(kv::children(kv, &schema::version_root())?))
        })
    }

    /// Persisted schema version
    pub fn schema_version(&self) -> Result<u64> {
        self.view(&Context::background(), |ctx| {
            ctx.transaction()?.view(|kv| migrations::read_version(kv))
        })
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("options", &self.options)
            .field("dirty", &self.dirty())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Path as KvPath;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, Db) {
        let dir = tempdir().unwrap();
        let db = Db::open(dir.path().join("meta.redb"), DbOptions::default()).unwrap();
        (dir, db)
    }

    fn put(ctx: &Context<'_>, key: &str) -> Result<()> {
        ctx.transaction()?
            .update(|kv| Ok(kv.put(KvPath::new(key).as_bytes(), b"1")?))
    }

    fn exists(db: &Db, key: &str) -> bool {
        db.view(&Context::background(), |ctx| {
            ctx.transaction()?
                .view(|kv| Ok(kv.get(KvPath::new(key).as_bytes())?.is_some()))
        })
        .unwrap()
    }

    #[test]
    fn test_commit_on_success() {
        let (_dir, db) = open();
        db.update(&Context::background(), |ctx| put(ctx, "a")).unwrap();
        assert!(exists(&db, "a"));
    }

    #[test]
    fn test_rollback_on_error() {
        let (_dir, db) = open();
        let err = db
            .update(&Context::background(), |ctx| {
                put(ctx, "a")?;
                Err::<(), _>(Error::invalid_argument("nope"))
            })
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(!exists(&db, "a"));
    }

    #[test]
    fn test_nested_calls_join_transaction() {
        let (_dir, db) = open();
        let result = db.update(&Context::background(), |ctx| {
            put(ctx, "outer")?;
            db.update(ctx, |inner| put(inner, "inner"))?;
            Err::<(), _>(Error::internal("abort both"))
        });
        assert!(result.is_err());
        assert!(!exists(&db, "outer"));
        assert!(!exists(&db, "inner"));
    }

    #[test]
    fn test_write_in_read_transaction_fails() {
        let (_dir, db) = open();
        let err = db
            .view(&Context::background(), |ctx| db.update(ctx, |ctx| put(ctx, "a")))
            .unwrap_err();
        assert!(err.is_failed_precondition());

        let err = db
            .view(&Context::background(), |ctx| put(ctx, "a"))
            .unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn test_cancelled_before_acquire() {
        let (_dir, db) = open();
        let token = crate::CancelToken::new();
        token.cancel();
        let ctx = Context::background().with_cancel(token);
        let err = db.update(&ctx, |ctx| put(ctx, "a")).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_mutation_callbacks() {
        let (_dir, db) = open();
        let calls = Arc::new(AtomicUsize::new(0));
        let dirty_calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            let dirty_calls = Arc::clone(&dirty_calls);
            db.register_mutation_callback(move |dirty| {
                calls.fetch_add(1, Ordering::SeqCst);
                if dirty {
                    dirty_calls.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        db.update(&Context::background(), |ctx| put(ctx, "a")).unwrap();
        // reads and empty writes are not mutations
        db.view(&Context::background(), |_| Ok(())).unwrap();
        db.update(&Context::background(), |_| Ok(())).unwrap();
        db.update(&Context::background(), |ctx| {
            put(ctx, "b")?;
            ctx.transaction()?.mark_snapshotter_dirty("overlay");
            Ok(())
        })
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dirty_calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.dirty(), 1);
        let (snapshotters, content) = db.take_dirty();
        assert!(snapshotters.contains("overlay"));
        assert!(content.is_empty());
        assert_eq!(db.dirty(), 0);
    }

    #[test]
    fn test_snapshotter_names_checked_on_open() {
        let dir = tempdir().unwrap();
        let backend: Arc<dyn Snapshotter> = Arc::new(crate::testutil::MemSnapshotter::default());
        let err = Db::open(
            dir.path().join("meta.redb"),
            DbOptions::default().with_snapshotter("a/b", backend),
        )
        .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_reopen_keeps_schema_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.redb");
        let db = Db::open(&path, DbOptions::default()).unwrap();
        let version = db.schema_version().unwrap();
        assert_eq!(version, migrations::SCHEMA_VERSION);
        drop(db);
        let db = Db::open(&path, DbOptions::default()).unwrap();
        assert_eq!(db.schema_version().unwrap(), version);
    }
}
