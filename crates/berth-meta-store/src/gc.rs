//! Garbage collection over the metadata graph.
//!
//! A collection runs in one write transaction: roots are scanned in every
//! namespace, the live set is marked through label references, parents,
//! lease resources and collector callbacks, and every unmarked lease,
//! image, snapshot, content record and collectible resource is removed.
//! Backend snapshots and blobs are cleaned after the commit.

use crate::Db;
use crate::collector::{CollectionContext, CollectorRegistry};
use crate::content;
use crate::containers;
use crate::events::Event;
use crate::images;
use crate::kv::{self, KvRead, KvWrite};
use crate::leases::{self, RESOURCE_CONTENT, Resource};
use crate::sandboxes;
use crate::schema::{self, BUCKET_SNAPSHOTS};
use crate::snapshot::{snapshotter, storage};
use crate::tx::{Context, Tx};
use berth_common::labels::{
    LABEL_GC_EXPIRE, LABEL_GC_REF_CONTENT, LABEL_GC_REF_SNAPSHOT, LABEL_GC_ROOT, reference_suffix,
};
use berth_common::types::{Timestamp, now, parse_timestamp};
use berth_common::{Digest, Error, Labels, Result};
use berth_gc::{Node, ResourceType};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type Contexts = BTreeMap<ResourceType, Box<dyn CollectionContext>>;

/// Outcome of one collection
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    /// Recorded size of the removed content
    pub bytes_freed: u64,
    /// Removed nodes per resource type
    pub removed: BTreeMap<ResourceType, usize>,
    pub mark: Duration,
    pub sweep: Duration,
    pub total: Duration,
}

impl GcStats {
    fn record(&mut self, ty: ResourceType) {
        *self.removed.entry(ty).or_default() += 1;
    }

    /// Removed nodes of `ty`
    pub fn removed(&self, ty: ResourceType) -> usize {
        self.removed.get(&ty).copied().unwrap_or_default()
    }

    pub fn total_removed(&self) -> usize {
        self.removed.values().sum()
    }
}

impl berth_gc::Stats for GcStats {
    fn elapsed(&self) -> Duration {
        self.total
    }
}

impl berth_gc::Collector for Db {
    type Stats = GcStats;

    fn garbage_collect(&self) -> Result<GcStats> {
        Self::garbage_collect(self, &Context::background())
    }
}

impl Db {
    /// Run one full collection.
    ///
    /// The collection opens its own write transaction, so `ctx` must not
    /// carry one. Any error rolls back every removal.
    pub fn garbage_collect(&self, ctx: &Context<'_>) -> Result<GcStats> {
        if ctx.tx().is_some() {
            return Err(Error::failed_precondition(
                "garbage collection cannot run inside a transaction",
            ));
        }
        let started = Instant::now();
        let mut contexts = start_collections(self.collectors())?;

        let result = self.update(&ctx.without_lease(), |ctx| {
            let tx = ctx.transaction()?;
            let mut stats = GcStats::default();
            let registry = self.collectors();

            let mark_start = Instant::now();
            let live = tx.view(|kv| mark_live(kv, registry, &mut contexts))?;
            stats.mark = mark_start.elapsed();

            let sweep_start = Instant::now();
            tx.update(|kv| sweep(kv, tx, &live, &mut contexts, &mut stats))?;
            stats.sweep = sweep_start.elapsed();
            Ok(stats)
        });

        let mut stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                for (ty, cc) in contexts {
                    if let Err(ce) = cc.cancel() {
                        warn!("Failed to cancel collection of {}: {}", ty, ce);
                    }
                }
                return Err(e);
            }
        };
        for (ty, cc) in contexts {
            if let Err(e) = cc.finish() {
                warn!("Failed to finish collection of {}: {}", ty, e);
            }
        }

        self.cleanup_backends();
        stats.total = started.elapsed();
        info!(
            removed = stats.total_removed(),
            bytes_freed = stats.bytes_freed,
            "garbage collection finished in {:?}",
            stats.total
        );
        Ok(stats)
    }

    /// Remove backend state left behind by removed records
    fn cleanup_backends(&self) {
        let (snapshotters, digests) = self.take_dirty();
        for name in snapshotters {
            let Some(backend) = self.snapshotter(&name).cloned() else {
                debug!(snapshotter = %name, "no backend registered, skipping cleanup");
                continue;
            };
            if let Err(e) = snapshotter::cleanup(self, &name, backend.as_ref()) {
                warn!("Snapshot cleanup of {} failed: {}", name, e);
            }
        }

        let Some(backend) = self.content_backend().cloned() else {
            return;
        };
        for digest in digests {
            let referenced = self.view(&Context::background(), |ctx| {
                ctx.transaction()?.view(|kv| content::referenced(kv, &digest))
            });
            match referenced {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to check references of {}: {}", digest, e);
                    continue;
                }
            }
            let deleted = Digest::parse(digest.as_str()).and_then(|d| backend.delete(&d));
            match deleted {
                Ok(()) => debug!(digest = %digest, "removed blob"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to remove blob {}: {}", digest, e),
            }
        }
    }
}

fn start_collections(registry: &CollectorRegistry) -> Result<Contexts> {
    let mut contexts = Contexts::new();
    for (ty, collector) in registry.iter() {
        match collector.start_collection() {
            Ok(cc) => {
                contexts.insert(ty, cc);
            }
            Err(e) => {
                for (started, cc) in contexts {
                    if let Err(ce) = cc.cancel() {
                        warn!("Failed to cancel collection of {}: {}", started, ce);
                    }
                }
                return Err(e.context(format!("start collection of {}", collector.name())));
            }
        }
    }
    Ok(contexts)
}

/// Whether `labels` carry an expiry in the past
fn expired(labels: &Labels, at: &Timestamp) -> bool {
    let Some(value) = labels.get(LABEL_GC_EXPIRE) else {
        return false;
    };
    match parse_timestamp(value) {
        Ok(expiry) => expiry < *at,
        Err(e) => {
            warn!("Ignoring invalid {} label {:?}: {}", LABEL_GC_EXPIRE, value, e);
            false
        }
    }
}

fn is_root(labels: &Labels, at: &Timestamp) -> bool {
    labels.contains_key(LABEL_GC_ROOT) && !expired(labels, at)
}

fn snapshot_node(ns: &str, snapshotter: &str, key: &str) -> Node {
    Node::new(ResourceType::SNAPSHOT, ns, format!("{snapshotter}/{key}"))
}

/// Node of a lease resource, `None` for unknown resource kinds
fn resource_node(registry: &CollectorRegistry, ns: &str, resource: &Resource) -> Option<Node> {
    if resource.kind == RESOURCE_CONTENT {
        return Some(Node::new(ResourceType::CONTENT, ns, resource.id.as_str()));
    }
    if let Some(sn) = resource
        .kind
        .strip_prefix(BUCKET_SNAPSHOTS)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        return Some(snapshot_node(ns, sn, &resource.id));
    }
    registry
        .by_name(&resource.kind)
        .map(|ty| Node::new(ty, ns, resource.id.as_str()))
}

/// Nodes referenced by labels
fn label_refs(ns: &str, labels: &Labels, prefixes: &[(ResourceType, String)], f: &mut dyn FnMut(Node)) {
    for (key, value) in labels {
        if value.is_empty() {
            continue;
        }
        if reference_suffix(key, LABEL_GC_REF_CONTENT).is_some() {
            f(Node::new(ResourceType::CONTENT, ns, value.as_str()));
        } else if let Some(rest) = key.strip_prefix(LABEL_GC_REF_SNAPSHOT) {
            let sn = rest.split('/').next().unwrap_or_default();
            if !sn.is_empty() {
                f(snapshot_node(ns, sn, value));
            }
        } else if let Some((ty, _)) = prefixes
            .iter()
            .find(|(_, prefix)| reference_suffix(key, prefix).is_some())
        {
            f(Node::new(*ty, ns, value.as_str()));
        }
    }
}

/// Ancestors of a snapshot node, nearest first
fn snapshot_ancestors<K: KvRead + ?Sized>(kv: &K, node: &Node) -> Result<Vec<Node>> {
    let mut out = Vec::new();
    let Some((sn, key)) = node.key.split_once('/') else {
        return Ok(out);
    };
    let mut seen = HashSet::new();
    let mut current = key.to_string();
    while let Some((_, info, _)) = storage::read(kv, &node.namespace, sn, &current)? {
        if info.parent.is_empty() || !seen.insert(info.parent.clone()) {
            break;
        }
        out.push(snapshot_node(&node.namespace, sn, &info.parent));
        current = info.parent;
    }
    Ok(out)
}

/// Scan roots and mark everything reachable from them
fn mark_live<K: KvRead + ?Sized>(kv: &K, registry: &CollectorRegistry, contexts: &mut Contexts) -> Result<HashSet<Node>> {
    let at = now();
    let mut roots = Vec::new();
    let mut flat = Vec::new();

    for ns in kv::children(kv, &schema::version_root())? {
        for id in leases::ids(kv, &ns)? {
            let Some(lease) = leases::read(kv, &ns, &id)? else {
                continue;
            };
            if expired(&lease.labels, &at) {
                debug!(namespace = %ns, lease = %id, "lease expired");
                continue;
            }
            let node = Node::new(ResourceType::LEASE, ns.as_str(), id.as_str());
            if !lease.is_flat() {
                roots.push(node);
                continue;
            }
            flat.push(node);
            for resource in leases::resources(kv, &ns, &id)? {
                let Some(node) = resource_node(registry, &ns, &resource) else {
                    continue;
                };
                // A snapshot cannot outlive its parents.
                if node.ty == ResourceType::SNAPSHOT {
                    flat.extend(snapshot_ancestors(kv, &node)?);
                }
                flat.push(node);
            }
            for cc in contexts.values_mut() {
                cc.leased(&ns, &id, &mut |n| flat.push(n))?;
            }
        }

        for digest in content::digests(kv, &ns)? {
            if let Some(info) = content::read(kv, &ns, &digest)?
                && is_root(&info.labels, &at)
            {
                roots.push(Node::new(ResourceType::CONTENT, ns.as_str(), digest));
            }
        }

        for sn in kv::children(kv, &schema::snapshotters(&ns))? {
            for key in storage::keys(kv, &ns, &sn)? {
                if let Some((_, info, _)) = storage::read(kv, &ns, &sn, &key)?
                    && is_root(&info.labels, &at)
                {
                    roots.push(snapshot_node(&ns, &sn, &key));
                }
            }
        }

        for name in images::names(kv, &ns)? {
            if let Some(image) = images::read(kv, &ns, &name)?
                && !expired(&image.labels, &at)
            {
                roots.push(Node::new(ResourceType::IMAGE, ns.as_str(), name));
            }
        }

        for id in containers::ids(kv, &ns)? {
            roots.push(Node::new(ResourceType::CONTAINER, ns.as_str(), id));
        }
        for id in sandboxes::ids(kv, &ns)? {
            roots.push(Node::new(ResourceType::SANDBOX, ns.as_str(), id));
        }

        for cc in contexts.values_mut() {
            cc.active(&ns, &mut |n| roots.push(n))?;
        }
    }
    debug!(roots = roots.len(), flat = flat.len(), "scanned gc roots");

    let prefixes = registry.reference_prefixes();
    berth_gc::mark(roots, flat, |node, f| {
        references(kv, registry, &prefixes, contexts, node, f)
    })
}

/// Outgoing edges of one node
fn references<K: KvRead + ?Sized>(
    kv: &K,
    registry: &CollectorRegistry,
    prefixes: &[(ResourceType, String)],
    contexts: &mut Contexts,
    node: &Node,
    f: &mut dyn FnMut(Node),
) -> Result<()> {
    let ns = node.namespace.as_str();
    match node.ty {
        ResourceType::CONTENT => {
            if let Some(info) = content::read(kv, ns, &node.key)? {
                label_refs(ns, &info.labels, prefixes, f);
            }
        }
        ResourceType::SNAPSHOT => {
            if let Some((sn, key)) = node.key.split_once('/')
                && let Some((_, info, _)) = storage::read(kv, ns, sn, key)?
            {
                if !info.parent.is_empty() {
                    f(snapshot_node(ns, sn, &info.parent));
                }
                label_refs(ns, &info.labels, prefixes, f);
            }
        }
        ResourceType::IMAGE => {
            if let Some(image) = images::read(kv, ns, &node.key)? {
                f(Node::new(ResourceType::CONTENT, ns, image.target.digest.as_str()));
                label_refs(ns, &image.labels, prefixes, f);
            }
        }
        ResourceType::CONTAINER => {
            if let Some(container) = containers::read(kv, ns, &node.key)? {
                if !container.snapshotter.is_empty() && !container.snapshot_key.is_empty() {
                    f(snapshot_node(ns, &container.snapshotter, &container.snapshot_key));
                }
                label_refs(ns, &container.labels, prefixes, f);
            }
        }
        ResourceType::SANDBOX => {
            if let Some(sandbox) = sandboxes::read(kv, ns, &node.key)? {
                label_refs(ns, &sandbox.labels, prefixes, f);
            }
        }
        ResourceType::LEASE => {
            for resource in leases::resources(kv, ns, &node.key)? {
                if let Some(next) = resource_node(registry, ns, &resource) {
                    f(next);
                }
            }
            for cc in contexts.values_mut() {
                cc.leased(ns, &node.key, f)?;
            }
        }
        ty => {
            if let Some(cc) = contexts.get_mut(&ty) {
                cc.references(node, f)?;
            }
        }
    }
    Ok(())
}

/// Remove every unmarked node
fn sweep(
    kv: &mut dyn KvWrite,
    tx: &Tx,
    live: &HashSet<Node>,
    contexts: &mut Contexts,
    stats: &mut GcStats,
) -> Result<()> {
    for ns in kv::children(&*kv, &schema::version_root())? {
        for id in leases::ids(&*kv, &ns)? {
            if !live.contains(&Node::new(ResourceType::LEASE, ns.as_str(), id.as_str()))
                && kv::delete_bucket(&mut *kv, &schema::lease(&ns, &id))?
            {
                debug!(namespace = %ns, lease = %id, "removed lease");
                stats.record(ResourceType::LEASE);
            }
        }

        for name in images::names(&*kv, &ns)? {
            if !live.contains(&Node::new(ResourceType::IMAGE, ns.as_str(), name.as_str()))
                && images::remove_record(&mut *kv, &ns, &name)?
            {
                debug!(namespace = %ns, image = %name, "removed image");
                stats.record(ResourceType::IMAGE);
                tx.publish(&ns, Event::ImageDelete { name });
            }
        }

        for sn in kv::children(&*kv, &schema::snapshotters(&ns))? {
            sweep_snapshots(&mut *kv, tx, &ns, &sn, live, stats)?;
        }

        for digest in content::digests(&*kv, &ns)? {
            if live.contains(&Node::new(ResourceType::CONTENT, ns.as_str(), digest.as_str())) {
                continue;
            }
            if let Some(size) = content::remove_record(&mut *kv, &ns, &digest)? {
                stats.bytes_freed += u64::try_from(size).unwrap_or_default();
                stats.record(ResourceType::CONTENT);
                tx.mark_content_dirty(&digest);
                tx.publish(&ns, Event::ContentDelete { digest });
            }
        }
    }

    for (ty, cc) in contexts.iter_mut() {
        let mut all = Vec::new();
        cc.all(&mut |n| all.push(n))?;
        for node in all.into_iter().filter(|n| !live.contains(n)) {
            cc.remove(&node)?;
            debug!(node = %node, "removed collectible resource");
            stats.record(*ty);
        }
    }
    Ok(())
}

/// Remove unmarked snapshots of one snapshotter, children first
fn sweep_snapshots(
    kv: &mut dyn KvWrite,
    tx: &Tx,
    ns: &str,
    sn: &str,
    live: &HashSet<Node>,
    stats: &mut GcStats,
) -> Result<()> {
    let mut candidates = Vec::new();
    for key in storage::keys(&*kv, ns, sn)? {
        if live.contains(&snapshot_node(ns, sn, &key)) {
            continue;
        }
        if let Some((id, _, _)) = storage::read(&*kv, ns, sn, &key)? {
            candidates.push((id, key));
        }
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = false;
    for (_, key) in candidates {
        match storage::remove_record(&mut *kv, ns, sn, &key) {
            Ok(_) => {
                debug!(namespace = ns, snapshotter = sn, key = %key, "removed snapshot");
                stats.record(ResourceType::SNAPSHOT);
                removed = true;
                tx.publish(
                    ns,
                    Event::SnapshotRemove {
                        snapshotter: sn.to_string(),
                        key,
                    },
                );
            }
            Err(e) if e.is_failed_precondition() => {
                warn!("Skipping snapshot {} in {}: {}", key, sn, e);
            }
            Err(e) => return Err(e),
        }
    }
    if removed {
        tx.mark_snapshotter_dirty(sn);
    }
    Ok(())
}
