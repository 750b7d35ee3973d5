//! Externally registered collectible resources.
//!
//! A collector lets the garbage collector manage a resource kind it knows
//! nothing about. Each collection cycle starts a [`CollectionContext`],
//! asks it for all, active and leased nodes and for outgoing references,
//! then removes the unreachable ones through it.

use berth_common::labels::LABEL_GC_REF_PREFIX;
use berth_common::{Result, types::validate_identifier};
use berth_gc::{Node, ResourceType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Per-cycle view of a collectible resource kind
pub trait CollectionContext: Send {
    /// Every node of this kind
    fn all(&mut self, f: &mut dyn FnMut(Node)) -> Result<()>;

    /// Nodes that are always live, such as ones still being created
    fn active(&mut self, namespace: &str, f: &mut dyn FnMut(Node)) -> Result<()>;

    /// Nodes held by `lease` beyond what the lease bucket records
    fn leased(&mut self, namespace: &str, lease: &str, f: &mut dyn FnMut(Node)) -> Result<()>;

    /// Outgoing edges of `node`
    fn references(&mut self, node: &Node, f: &mut dyn FnMut(Node)) -> Result<()>;

    /// Remove an unreachable node
    fn remove(&mut self, node: &Node) -> Result<()>;

    /// The cycle failed; nothing removed should take effect
    fn cancel(self: Box<Self>) -> Result<()>;

    /// The cycle committed
    fn finish(self: Box<Self>) -> Result<()>;
}

/// A collectible resource kind
pub trait ResourceCollector: Send + Sync {
    /// Resource type name used in lease resources
    fn name(&self) -> &str;

    /// Label suffix after `containerd.io/gc.ref.` that references this kind
    fn reference_label(&self) -> &str;

    fn start_collection(&self) -> Result<Box<dyn CollectionContext>>;
}

/// Collectors keyed by resource type, built once at startup
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    collectors: BTreeMap<ResourceType, Arc<dyn ResourceCollector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `collector` for `ty`.
    ///
    /// # Panics
    ///
    /// Registering a tag outside the collectible range, a tag twice, a
    /// name twice, or a name or reference label reserved by the built-in
    /// kinds is a programming error.
    pub fn register(&mut self, ty: ResourceType, collector: Arc<dyn ResourceCollector>) {
        assert!(
            ty.is_collectible(),
            "resource type {ty} is not in the collectible range"
        );
        assert!(
            !self.collectors.contains_key(&ty),
            "resource type {ty} registered twice"
        );
        let name = collector.name();
        assert!(
            validate_identifier(name).is_ok() && !matches!(name, "content" | "snapshots"),
            "invalid collectible resource name {name:?}"
        );
        assert!(
            self.by_name(name).is_none(),
            "collectible resource name {name:?} registered twice"
        );
        let label = collector.reference_label();
        assert!(
            !label.is_empty() && label != "content" && !label.starts_with("snapshot"),
            "reserved reference label {label:?}"
        );
        self.collectors.insert(ty, collector);
    }

    pub fn get(&self, ty: ResourceType) -> Option<&Arc<dyn ResourceCollector>> {
        self.collectors.get(&ty)
    }

    /// Resource type registered under a lease resource name
    pub fn by_name(&self, name: &str) -> Option<ResourceType> {
        self.collectors
            .iter()
            .find(|(_, c)| c.name() == name)
            .map(|(ty, _)| *ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, &Arc<dyn ResourceCollector>)> {
        self.collectors.iter().map(|(ty, c)| (*ty, c))
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Full reference label prefix for each registered kind
    pub(crate) fn reference_prefixes(&self) -> Vec<(ResourceType, String)> {
        self.collectors
            .iter()
            .map(|(ty, c)| (*ty, format!("{LABEL_GC_REF_PREFIX}{}", c.reference_label())))
            .collect()
    }
}

impl fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.collectors.iter().map(|(ty, c)| (ty, c.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    impl ResourceCollector for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn reference_label(&self) -> &str {
            self.1
        }

        fn start_collection(&self) -> Result<Box<dyn CollectionContext>> {
            Err(berth_common::Error::internal("not used"))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = CollectorRegistry::new();
        reg.register(ResourceType(0x10), Arc::new(Named("ingests", "ingest")));
        assert_eq!(reg.by_name("ingests"), Some(ResourceType(0x10)));
        assert!(reg.get(ResourceType(0x10)).is_some());
        assert_eq!(
            reg.reference_prefixes(),
            vec![(ResourceType(0x10), "containerd.io/gc.ref.ingest".to_string())]
        );
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_tag_panics() {
        let mut reg = CollectorRegistry::new();
        reg.register(ResourceType(0x10), Arc::new(Named("a", "a")));
        reg.register(ResourceType(0x10), Arc::new(Named("b", "b")));
    }

    #[test]
    #[should_panic(expected = "collectible range")]
    fn test_builtin_tag_panics() {
        let mut reg = CollectorRegistry::new();
        reg.register(ResourceType::CONTENT, Arc::new(Named("a", "a")));
    }

    #[test]
    #[should_panic(expected = "invalid collectible resource name")]
    fn test_reserved_name_panics() {
        let mut reg = CollectorRegistry::new();
        reg.register(ResourceType(0x11), Arc::new(Named("content", "x")));
    }
}
