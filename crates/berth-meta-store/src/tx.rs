//! Transactions and the request context.
//!
//! Every store operation takes a [`Context`]. It carries the namespace, an
//! optional lease and cancellation token, and, once inside
//! [`Db::with_transaction`](crate::Db::with_transaction), the active
//! transaction. Nested operations find the transaction on the context and
//! join it instead of opening their own.

use crate::error::{MetaStoreError, MetaStoreResult};
use crate::events::Event;
use crate::kv::{KvRead, KvWrite};
use crate::tables;
use berth_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

enum Inner {
    Read(redb::ReadTransaction),
    Write(redb::WriteTransaction),
}

/// Side effects applied by the database after a successful commit
#[derive(Default)]
pub(crate) struct Effects {
    /// Events to publish, with their namespace
    pub events: Vec<(String, Event)>,
    /// Snapshotters whose backends may hold orphaned snapshots
    pub snapshotters: BTreeSet<String>,
    /// Digests whose backend blobs may now be unreferenced
    pub content: BTreeSet<String>,
}

/// An open read or write transaction
pub struct Tx {
    inner: Inner,
    mutated: AtomicBool,
    dirty: AtomicBool,
    effects: Mutex<Effects>,
}

impl Tx {
    pub(crate) fn read(txn: redb::ReadTransaction) -> Self {
        Self::new(Inner::Read(txn))
    }

    pub(crate) fn write(txn: redb::WriteTransaction) -> Self {
        Self::new(Inner::Write(txn))
    }

    fn new(inner: Inner) -> Self {
        Self {
            inner,
            mutated: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            effects: Mutex::new(Effects::default()),
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.inner, Inner::Write(_))
    }

    /// Run `f` against the metadata table
    pub(crate) fn view<R>(&self, f: impl FnOnce(&dyn KvRead) -> Result<R>) -> Result<R> {
        match &self.inner {
            Inner::Read(txn) => {
                let table = txn.open_table(tables::META).map_err(MetaStoreError::from)?;
                f(&table)
            }
            Inner::Write(txn) => {
                let table = txn.open_table(tables::META).map_err(MetaStoreError::from)?;
                f(&table)
            }
        }
    }

    /// Run `f` against the metadata table for writing
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut dyn KvWrite) -> Result<R>) -> Result<R> {
        match &self.inner {
            Inner::Read(_) => Err(Error::failed_precondition(
                "write operation in a read-only transaction",
            )),
            Inner::Write(txn) => {
                let mut table = txn.open_table(tables::META).map_err(MetaStoreError::from)?;
                let result = f(&mut table)?;
                self.mutated.store(true, Ordering::Release);
                Ok(result)
            }
        }
    }

    /// Record a removal so the collector learns the store is dirty
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn mark_snapshotter_dirty(&self, snapshotter: &str) {
        self.mark_dirty();
        self.effects.lock().snapshotters.insert(snapshotter.to_string());
    }

    pub(crate) fn mark_content_dirty(&self, digest: &str) {
        self.mark_dirty();
        self.effects.lock().content.insert(digest.to_string());
    }

    /// Queue an event for publication once the transaction commits
    pub(crate) fn publish(&self, namespace: &str, event: Event) {
        self.effects.lock().events.push((namespace.to_string(), event));
    }

    pub(crate) fn is_mutated(&self) -> bool {
        self.mutated.load(Ordering::Acquire)
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Commit and hand back the queued side effects
    pub(crate) fn commit(self) -> MetaStoreResult<Effects> {
        match self.inner {
            Inner::Read(txn) => drop(txn),
            Inner::Write(txn) => txn.commit()?,
        }
        Ok(self.effects.into_inner())
    }
}

/// Cooperative cancellation flag shared between a caller and its operations
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-request context
#[derive(Clone, Default)]
pub struct Context<'t> {
    namespace: Option<String>,
    lease: Option<String>,
    cancel: Option<CancelToken>,
    tx: Option<&'t Tx>,
}

impl Context<'static> {
    /// Empty context without namespace or transaction
    pub fn background() -> Self {
        Self::default()
    }

    /// Context scoped to `namespace`
    pub fn with_namespace_only(namespace: impl Into<String>) -> Self {
        Self::background().with_namespace(namespace)
    }
}

impl<'t> Context<'t> {
    #[must_use]
    pub fn with_namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_lease(&self, lease: impl Into<String>) -> Self {
        Self {
            lease: Some(lease.into()),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn without_lease(&self) -> Self {
        Self {
            lease: None,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_cancel(&self, token: CancelToken) -> Self {
        Self {
            cancel: Some(token),
            ..self.clone()
        }
    }

    /// Attach a transaction; operations using the result join it
    pub fn with_tx<'a>(&self, tx: &'a Tx) -> Context<'a> {
        Context {
            namespace: self.namespace.clone(),
            lease: self.lease.clone(),
            cancel: self.cancel.clone(),
            tx: Some(tx),
        }
    }

    /// The namespace; operations that need one fail without it
    pub fn namespace(&self) -> Result<&str> {
        self.namespace
            .as_deref()
            .ok_or_else(|| Error::failed_precondition("namespace is required"))
    }

    pub fn lease(&self) -> Option<&str> {
        self.lease.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    pub fn tx(&self) -> Option<&'t Tx> {
        self.tx
    }

    /// The active transaction; store functions require one
    pub fn transaction(&self) -> Result<&'t Tx> {
        self.tx.ok_or(Error::NoTransaction)
    }
}
