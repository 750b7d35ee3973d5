//! Leases.
//!
//! A lease is a root for the garbage collector: everything it lists (and,
//! unless it is flat, everything reachable from that) survives collection
//! until the lease is deleted or expires. Create operations attach their
//! new object to the lease carried on the context.

use crate::Db;
use crate::events::Event;
use crate::fields;
use crate::kv::{self, KvRead, KvWrite, check_component};
use crate::schema::{self, BUCKET_CONTENT, BUCKET_RESOURCES, BUCKET_SNAPSHOTS, KEY_LABELS};
use crate::snapshot::storage;
use crate::tx::Context;
use berth_common::filters::label_field;
use berth_common::types::{Timestamp, now, validate_identifier};
use berth_common::{Adaptor, Digest, Error, Filter, Labels, Result, labels};
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

/// Resource type for content blobs
pub const RESOURCE_CONTENT: &str = "content";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: String,
    pub created_at: Timestamp,
    pub labels: Labels,
}

impl Lease {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Timestamp::default(),
            labels: Labels::new(),
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Whether the lease only keeps its direct resources alive
    pub fn is_flat(&self) -> bool {
        self.labels.contains_key(labels::LABEL_GC_FLAT)
    }
}

impl Adaptor for Lease {
    fn field(&self, fieldpath: &[String]) -> Option<String> {
        match fieldpath.first().map(String::as_str)? {
            "id" => Some(self.id.clone()),
            "labels" => label_field(&self.labels, &fieldpath[1..]),
            _ => None,
        }
    }
}

/// A resource held by a lease.
///
/// `kind` is `content`, `snapshots/<snapshotter>` or the name of a
/// registered collectible resource.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Resource {
    pub id: String,
    pub kind: String,
}

impl Resource {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }

    pub fn content(digest: &Digest) -> Self {
        Self::new(RESOURCE_CONTENT, digest.as_str())
    }

    pub fn snapshot(snapshotter: &str, key: &str) -> Self {
        Self::new(format!("{BUCKET_SNAPSHOTS}/{snapshotter}"), key)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeleteOpts {
    /// Run a collection after the lease is gone and wait for it
    pub synchronous: bool,
}

/// Generate a lease id unlikely to collide
pub fn generate_id() -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{}-{suffix:08x}", now().timestamp_nanos_opt().unwrap_or_default())
}

/// Lease manager
pub struct LeaseManager {
    db: Arc<Db>,
}

impl LeaseManager {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn create(&self, ctx: &Context<'_>, lease: Lease) -> Result<Lease> {
        validate_identifier(&lease.id).map_err(|e| e.context("lease"))?;
        labels::validate_all(&lease.labels)?;
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            let created = tx.update(|kv| {
                schema::ensure_namespace(kv, ns)?;
                let path = schema::lease(ns, &lease.id);
                if !kv::create_bucket(kv, &path)? {
                    return Err(Error::already_exists(format!("lease {:?}", lease.id)));
                }
                let created_at = now();
                fields::write_timestamp(kv, &path.join(schema::KEY_CREATED_AT), &created_at)?;
                fields::write_map(kv, &path.join(KEY_LABELS), &lease.labels)?;
                Ok(Lease {
                    created_at,
                    ..lease
                })
            })?;
            tx.publish(ns, Event::LeaseCreate { id: created.id.clone() });
            Ok(created)
        })
    }

    pub fn list(&self, ctx: &Context<'_>, filters: &[&str]) -> Result<Vec<Lease>> {
        let filter = Filter::parse_all(filters)?;
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?.view(|kv| {
                let mut out = Vec::new();
                for id in kv::children(kv, &schema::leases(ns))? {
                    if let Some(lease) = read(kv, ns, &id)?
                        && filter.matches(&lease)
                    {
                        out.push(lease);
                    }
                }
                Ok(out)
            })
        })
    }

    /// Delete a lease.
    ///
    /// A synchronous delete collects garbage after the delete commits and
    /// therefore cannot run inside a caller's transaction.
    pub fn delete(&self, ctx: &Context<'_>, id: &str, opts: DeleteOpts) -> Result<()> {
        if opts.synchronous && ctx.tx().is_some() {
            return Err(Error::failed_precondition(
                "synchronous lease delete cannot run in a transaction",
            ));
        }
        self.db.update(ctx, |ctx| {
            let ns = ctx.namespace()?;
            let tx = ctx.transaction()?;
            tx.update(|kv| {
                if !kv::delete_bucket(kv, &schema::lease(ns, id))? {
                    return Err(Error::not_found(format!("lease {id:?}")));
                }
                Ok(())
            })?;
            tx.mark_dirty();
            tx.publish(ns, Event::LeaseDelete { id: id.to_string() });
            Ok(())
        })?;

        if opts.synchronous {
            let stats = self.db.garbage_collect(&ctx.without_lease())?;
            debug!(lease = id, "synchronous collection after lease delete: {:?}", stats);
        }
        Ok(())
    }

    pub fn add_resource(&self, ctx: &Context<'_>, lease: &str, resource: &Resource) -> Result<()> {
        let path = self.resource_path(ctx, lease, resource)?;
        self.db.update(ctx, |ctx| {
            ctx.transaction()?.update(|kv| {
                require_lease(kv, ctx.namespace()?, lease)?;
                kv::create_bucket(kv, &path)?;
                Ok(())
            })
        })
    }

    pub fn delete_resource(&self, ctx: &Context<'_>, lease: &str, resource: &Resource) -> Result<()> {
        let path = self.resource_path(ctx, lease, resource)?;
        self.db.update(ctx, |ctx| {
            let tx = ctx.transaction()?;
            let removed = tx.update(|kv| {
                require_lease(kv, ctx.namespace()?, lease)?;
                Ok(kv::delete_bucket(kv, &path)?)
            })?;
            if removed {
                tx.mark_dirty();
            }
            Ok(())
        })
    }

    pub fn list_resources(&self, ctx: &Context<'_>, lease: &str) -> Result<Vec<Resource>> {
        self.db.view(ctx, |ctx| {
            let ns = ctx.namespace()?;
            ctx.transaction()?.view(|kv| {
                require_lease(kv, ns, lease)?;
                resources(kv, ns, lease)
            })
        })
    }

    /// Bucket path recording `resource` under `lease`
    fn resource_path(&self, ctx: &Context<'_>, lease: &str, resource: &Resource) -> Result<kv::Path> {
        let ns = ctx.namespace()?;
        check_component("resource id", &resource.id)?;
        let base = schema::lease(ns, lease);
        let mut parts = resource.kind.splitn(2, '/');
        match (parts.next().unwrap_or_default(), parts.next()) {
            (RESOURCE_CONTENT, None) => {
                let digest = Digest::parse(resource.id.as_str())?;
                Ok(base.join(BUCKET_CONTENT).join(digest.as_str()))
            }
            (BUCKET_SNAPSHOTS, Some(snapshotter)) => {
                storage::check_snapshotter(snapshotter)?;
                Ok(base.join(BUCKET_SNAPSHOTS).join(snapshotter).join(&resource.id))
            }
            (name, None) if self.db.collectors().by_name(name).is_some() => {
                Ok(base.join(BUCKET_RESOURCES).join(name).join(&resource.id))
            }
            _ => Err(Error::invalid_argument(format!(
                "unsupported lease resource type {:?}",
                resource.kind
            ))),
        }
    }
}

/// Read one lease, `None` if absent
pub(crate) fn read<K: KvRead + ?Sized>(kv: &K, ns: &str, id: &str) -> Result<Option<Lease>> {
    let path = schema::lease(ns, id);
    if !kv::exists(kv, &path)? {
        return Ok(None);
    }
    Ok(Some(Lease {
        id: id.to_string(),
        created_at: fields::read_timestamp(kv, &path.join(schema::KEY_CREATED_AT))?.unwrap_or_default(),
        labels: fields::read_map(kv, &path.join(KEY_LABELS))?,
    }))
}

pub(crate) fn ids<K: KvRead + ?Sized>(kv: &K, ns: &str) -> Result<Vec<String>> {
    Ok(kv::children(kv, &schema::leases(ns))?)
}

fn require_lease<K: KvRead + ?Sized>(kv: &K, ns: &str, id: &str) -> Result<()> {
    if kv::exists(kv, &schema::lease(ns, id))? {
        Ok(())
    } else {
        Err(Error::not_found(format!("lease {id:?}")))
    }
}

/// Every resource recorded under a lease, content first
pub(crate) fn resources<K: KvRead + ?Sized>(kv: &K, ns: &str, id: &str) -> Result<Vec<Resource>> {
    let base = schema::lease(ns, id);
    let mut out = Vec::new();
    for digest in kv::children(kv, &base.join(BUCKET_CONTENT))? {
        out.push(Resource::new(RESOURCE_CONTENT, digest));
    }
    let snapshots = base.join(BUCKET_SNAPSHOTS);
    for snapshotter in kv::children(kv, &snapshots)? {
        for key in kv::children(kv, &snapshots.join(&snapshotter))? {
            out.push(Resource::snapshot(&snapshotter, &key));
        }
    }
    let other = base.join(BUCKET_RESOURCES);
    for kind in kv::children(kv, &other)? {
        for rid in kv::children(kv, &other.join(&kind))? {
            out.push(Resource::new(kind.as_str(), rid));
        }
    }
    Ok(out)
}

/// Add a content blob to the context lease, if any
pub(crate) fn attach_content<K: KvWrite + ?Sized>(
    kv: &mut K,
    ns: &str,
    lease: Option<&str>,
    digest: &str,
) -> Result<()> {
    let Some(lease) = lease else {
        return Ok(());
    };
    attach(kv, ns, lease, &schema::lease(ns, lease).join(BUCKET_CONTENT).join(digest))
}

pub(crate) fn detach_content<K: KvWrite + ?Sized>(
    kv: &mut K,
    ns: &str,
    lease: Option<&str>,
    digest: &str,
) -> Result<()> {
    if let Some(lease) = lease {
        kv::delete_bucket(kv, &schema::lease(ns, lease).join(BUCKET_CONTENT).join(digest))?;
    }
    Ok(())
}

/// Add a snapshot to the context lease, if any
pub(crate) fn attach_snapshot<K: KvWrite + ?Sized>(
    kv: &mut K,
    ns: &str,
    lease: Option<&str>,
    snapshotter: &str,
    key: &str,
) -> Result<()> {
    let Some(lease) = lease else {
        return Ok(());
    };
    let path = schema::lease(ns, lease)
        .join(BUCKET_SNAPSHOTS)
        .join(snapshotter)
        .join(key);
    attach(kv, ns, lease, &path)
}

pub(crate) fn detach_snapshot<K: KvWrite + ?Sized>(
    kv: &mut K,
    ns: &str,
    lease: Option<&str>,
    snapshotter: &str,
    key: &str,
) -> Result<()> {
    if let Some(lease) = lease {
        let path = schema::lease(ns, lease)
            .join(BUCKET_SNAPSHOTS)
            .join(snapshotter)
            .join(key);
        kv::delete_bucket(kv, &path)?;
    }
    Ok(())
}

fn attach<K: KvWrite + ?Sized>(kv: &mut K, ns: &str, lease: &str, path: &kv::Path) -> Result<()> {
    if !kv::exists(kv, &schema::lease(ns, lease))? {
        return Err(Error::not_found(format!("lease {lease:?} does not exist")));
    }
    if kv::create_bucket(kv, path)? {
        debug!("attached {} to lease {}", path, lease);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbOptions;
    use crate::collector::{CollectionContext, CollectorRegistry, ResourceCollector};
    use berth_gc::ResourceType;
    use tempfile::tempdir;

    const D1: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";

    struct Ingests;

    impl ResourceCollector for Ingests {
        fn name(&self) -> &str {
            "ingests"
        }

        fn reference_label(&self) -> &str {
            "ingest"
        }

        fn start_collection(&self) -> Result<Box<dyn CollectionContext>> {
            Err(Error::internal("not used"))
        }
    }

    fn open() -> (tempfile::TempDir, LeaseManager) {
        let dir = tempdir().unwrap();
        let mut collectors = CollectorRegistry::new();
        collectors.register(ResourceType(0x10), Arc::new(Ingests));
        let db = Db::open(
            dir.path().join("meta.redb"),
            DbOptions::default().with_collectors(collectors),
        )
        .unwrap();
        (dir, LeaseManager::new(Arc::new(db)))
    }

    fn ctx() -> Context<'static> {
        Context::with_namespace_only("default")
    }

    #[test]
    fn test_create_list_delete() {
        let (_dir, lm) = open();
        let lease = lm
            .create(
                &ctx(),
                Lease::new("l1").with_labels(labels::from_pairs([(labels::LABEL_GC_FLAT, "")])),
            )
            .unwrap();
        assert!(lease.is_flat());
        assert!(lease.created_at > Timestamp::default());

        let err = lm.create(&ctx(), Lease::new("l1")).unwrap_err();
        assert!(err.is_already_exists());
        lm.create(&ctx(), Lease::new("l2")).unwrap();

        let all = lm.list(&ctx(), &[]).unwrap();
        assert_eq!(all.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(), vec!["l1", "l2"]);
        let flat = lm.list(&ctx(), &[r#"labels."containerd.io/gc.flat""#]).unwrap();
        assert_eq!(flat, vec![lease]);

        lm.delete(&ctx(), "l1", DeleteOpts::default()).unwrap();
        let err = lm.delete(&ctx(), "l1", DeleteOpts::default()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(lm.list(&ctx(), &[]).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_id() {
        let (_dir, lm) = open();
        let err = lm.create(&ctx(), Lease::new("-bad")).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_resources() {
        let (_dir, lm) = open();
        lm.create(&ctx(), Lease::new("l")).unwrap();
        let content = Resource::new(RESOURCE_CONTENT, D1);
        let snap = Resource::snapshot("overlay", "layer/1");
        let ingest = Resource::new("ingests", "upload-1");
        for r in [&content, &snap, &ingest] {
            lm.add_resource(&ctx(), "l", r).unwrap();
        }
        // adding twice is a no-op
        lm.add_resource(&ctx(), "l", &content).unwrap();

        assert_eq!(
            lm.list_resources(&ctx(), "l").unwrap(),
            vec![content.clone(), snap.clone(), ingest.clone()]
        );

        lm.delete_resource(&ctx(), "l", &snap).unwrap();
        assert_eq!(lm.list_resources(&ctx(), "l").unwrap(), vec![content, ingest]);
    }

    #[test]
    fn test_resource_validation() {
        let (_dir, lm) = open();
        lm.create(&ctx(), Lease::new("l")).unwrap();

        for bad in [
            Resource::new("unknown", "x"),
            Resource::new(RESOURCE_CONTENT, "not-a-digest"),
            Resource::new("snapshots", "k"),
            Resource::new("content/extra", D1),
            Resource::snapshot("a/b", "k"),
        ] {
            let err = lm.add_resource(&ctx(), "l", &bad).unwrap_err();
            assert!(err.is_invalid_argument(), "{bad:?}: {err}");
        }

        let err = lm
            .add_resource(&ctx(), "missing", &Resource::new(RESOURCE_CONTENT, D1))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_synchronous_delete_rejects_transaction() {
        let (_dir, lm) = open();
        lm.create(&ctx(), Lease::new("l")).unwrap();
        let err = lm
            .db
            .update(&ctx(), |ctx| lm.delete(ctx, "l", DeleteOpts { synchronous: true }))
            .unwrap_err();
        assert!(err.is_failed_precondition());
    }

    #[test]
    fn test_generated_ids_are_valid() {
        let id = generate_id();
        assert!(validate_identifier(&id).is_ok());
        assert_ne!(id, generate_id());
    }
}
