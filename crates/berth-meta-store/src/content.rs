//! Content metadata.
//!
//! Blob bytes live in a [`ContentBackend`] shared by every namespace; the
//! store only records which namespaces know a digest, with its size and
//! labels. A blob is deleted from the backend by the garbage collector once
//! no namespace references it.

use crate::Db;
use crate::error::corrupt;
use crate::events::Event;
use crate::fields::{self, MapUpdate};
use crate::kv::{self, KvRead, KvWrite};
use crate::leases;
use crate::schema::{self, KEY_LABELS, KEY_SIZE, KEY_UPDATED_AT};
use crate::tx::Context;
use berth_common::filters::label_field;
use berth_common::types::{Timestamp, now};
use berth_common::{Adaptor, Digest, Error, Filter, Labels, Result, labels};
use std::sync::Arc;
use tracing::debug;

/// Blob storage shared by all namespaces
pub trait ContentBackend: Send + Sync {
    /// Size of a stored blob, `NotFound` if absent
    fn size(&self, digest: &Digest) -> Result<i64>;

    fn delete(&self, digest: &Digest) -> Result<()>;
}

/// Metadata of one blob in a namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentInfo {
    pub digest: Digest,
    pub size: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub labels: Labels,
}

impl ContentInfo {
    pub fn new(digest: Digest, size: i64) -> Self {
        Self {
            digest,
            size,
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
            labels: Labels::new(),
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

impl Adaptor for ContentInfo {
    fn field(&self, fieldpath: &[String]) -> Option<String> {
        match fieldpath.first().map(String::as_str)? {
            "digest" => Some(self.digest.to_string()),
            "size" => Some(self.size.to_string()),
            "labels" => label_field(&self.labels, &fieldpath[1..]),
            _ => None,
        }
    }
}

/// Namespaced content metadata store
pub struct ContentStore {
    db: Arc<Db>,
}

impl ContentStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn info(&self, ctx: &Context<'_>, digest: &Digest) -> Result<ContentInfo> {
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?.view(|kv| {
                read(kv, ns, digest.as_str())?
                    .ok_or_else(|| Error::not_found(format!("content {digest}")))
            })
        })
    }

    /// Content matching any of `filters`, in digest order
    pub fn list(&self, ctx: &Context<'_>, filters: &[&str]) -> Result<Vec<ContentInfo>> {
        let filter = Filter::parse_all(filters)?;
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?.view(|kv| {
                let mut out = Vec::new();
                for digest in digests(kv, ns)? {
                    if let Some(info) = read(kv, ns, &digest)?
                        && filter.matches(&info)
                    {
                        out.push(info);
                    }
                }
                Ok(out)
            })
        })
    }

    /// Record a committed blob.
    ///
    /// When a backend is configured the blob must already be stored with
    /// the recorded size.
    pub fn create(&self, ctx: &Context<'_>, info: ContentInfo) -> Result<ContentInfo> {
        labels::validate_all(&info.labels)?;
        if let Some(backend) = self.db.content_backend() {
            let size = backend.size(&info.digest)?;
            if size != info.size {
                return Err(Error::failed_precondition(format!(
                    "unexpected commit size {size}, expected {} for {}",
                    info.size, info.digest
                )));
            }
        }

        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let lease = ctx.lease();
            ctx.transaction()?.update(|kv| {
                schema::ensure_namespace(kv, ns)?;
                let path = schema::blob(ns, info.digest.as_str());
                if !kv::create_bucket(kv, &path)? {
                    return Err(Error::already_exists(format!("content {}", info.digest)));
                }
                leases::attach_content(kv, ns, lease, info.digest.as_str())?;

                let ts = now();
                fields::write_varint(kv, &path.join(KEY_SIZE), info.size)?;
                fields::write_timestamps(kv, &path, &ts, &ts)?;
                fields::write_map(kv, &path.join(KEY_LABELS), &info.labels)?;
                Ok(ContentInfo {
                    created_at: ts,
                    updated_at: ts,
                    ..info
                })
            })
        })
    }

    /// Update labels; `labels` and `labels.<key>` are the only field paths
    pub fn update(&self, ctx: &Context<'_>, info: &ContentInfo, fieldpaths: &[&str]) -> Result<ContentInfo> {
        labels::validate_all(&info.labels)?;
        let plan = MapUpdate::labels_only(&info.labels, fieldpaths, "content")?;
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?.update(|kv| {
                let digest = info.digest.as_str();
                let path = schema::blob(ns, digest);
                if !kv::exists(kv, &path)? {
                    return Err(Error::not_found(format!("content {digest}")));
                }
                plan.apply(kv, &path.join(KEY_LABELS))?;
                fields::write_timestamp(kv, &path.join(KEY_UPDATED_AT), &now())?;
                read(kv, ns, digest)?.ok_or_else(|| Error::internal("content vanished during update"))
            })
        })
    }

    pub fn delete(&self, ctx: &Context<'_>, digest: &Digest) -> Result<()> {
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let lease = ctx.lease();
            let tx = ctx.transaction()?;
            tx.update(|kv| {
                if remove_record(kv, ns, digest.as_str())?.is_none() {
                    return Err(Error::not_found(format!("content {digest}")));
                }
                leases::detach_content(kv, ns, lease, digest.as_str())
            })?;
            tx.mark_content_dirty(digest.as_str());
            tx.publish(ns, Event::ContentDelete { digest: digest.to_string() });
            Ok(())
        })
    }
}

pub(crate) fn read<K: KvRead + ?Sized>(kv: &K, ns: &str, digest: &str) -> Result<Option<ContentInfo>> {
    let path = schema::blob(ns, digest);
    if !kv::exists(kv, &path)? {
        return Ok(None);
    }
    let (created_at, updated_at) = fields::read_timestamps(kv, &path)?;
    Ok(Some(ContentInfo {
        digest: Digest::parse(digest).map_err(|e| corrupt(&path, e))?,
        size: fields::read_varint(kv, &path.join(KEY_SIZE))?.unwrap_or_default(),
        created_at,
        updated_at,
        labels: fields::read_map(kv, &path.join(KEY_LABELS))?,
    }))
}

pub(crate) fn digests<K: KvRead + ?Sized>(kv: &K, ns: &str) -> Result<Vec<String>> {
    Ok(kv::children(kv, &schema::blobs(ns))?)
}

/// Remove a content record, returning its size if it existed
pub(crate) fn remove_record<K: KvWrite + ?Sized>(kv: &mut K, ns: &str, digest: &str) -> Result<Option<i64>> {
    let path = schema::blob(ns, digest);
    if !kv::exists(kv, &path)? {
        return Ok(None);
    }
    let size = fields::read_varint(kv, &path.join(KEY_SIZE))?.unwrap_or_default();
    kv::delete_bucket(kv, &path)?;
    debug!("removed content {} from namespace {}", digest, ns);
    Ok(Some(size))
}

/// Whether any namespace still records `digest`
pub(crate) fn referenced<K: KvRead + ?Sized>(kv: &K, digest: &str) -> Result<bool> {
    for ns in kv::children(kv, &schema::version_root())? {
        if kv::exists(kv, &schema::blob(&ns, digest))? {
            return Ok(true);
        }
    }
    Ok(false)
}
