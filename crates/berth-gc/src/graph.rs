//! Graph model and the mark phase.

use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Kind tag of a graph node.
///
/// Built-in kinds live below [`ResourceType::COLLECTIBLE_MIN`]; externally
/// registered collectible kinds use the range up to [`ResourceType::MAX`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceType(pub u8);

impl ResourceType {
    pub const UNKNOWN: Self = Self(0);
    pub const CONTENT: Self = Self(1);
    pub const SNAPSHOT: Self = Self(2);
    pub const CONTAINER: Self = Self(3);
    pub const IMAGE: Self = Self(4);
    pub const LEASE: Self = Self(5);
    pub const SANDBOX: Self = Self(6);

    /// First tag available to collectible resources
    pub const COLLECTIBLE_MIN: Self = Self(0x10);
    /// Last usable tag
    pub const MAX: Self = Self(0x7f);

    /// Whether the tag is in the collectible range
    #[must_use]
    pub const fn is_collectible(self) -> bool {
        self.0 >= Self::COLLECTIBLE_MIN.0 && self.0 <= Self::MAX.0
    }

    /// Human-readable name of the built-in kinds
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            1 => "content",
            2 => "snapshot",
            3 => "container",
            4 => "image",
            5 => "lease",
            6 => "sandbox",
            0x10..=0x7f => "collectible",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_collectible() {
            write!(f, "collectible({:#x})", self.0)
        } else {
            f.write_str(self.name())
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A namespaced node in the reachability graph
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Node {
    pub ty: ResourceType,
    pub namespace: String,
    pub key: String,
}

impl Node {
    pub fn new(ty: ResourceType, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            ty,
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.ty, self.namespace, self.key)
    }
}

/// Compute the live set.
///
/// `roots` are expanded transitively through `refs`. `flat` nodes are live
/// but not expanded on their own account; if a transitive root later
/// reaches a flat node it is expanded then. `refs` reports the outgoing
/// edges of a node through the callback and may fail, which aborts the mark.
pub fn mark<E, R>(
    roots: impl IntoIterator<Item = Node>,
    flat: impl IntoIterator<Item = Node>,
    mut refs: R,
) -> Result<HashSet<Node>, E>
where
    R: FnMut(&Node, &mut dyn FnMut(Node)) -> Result<(), E>,
{
    let mut live: HashSet<Node> = flat.into_iter().collect();
    let mut expanded: HashSet<Node> = HashSet::new();
    let mut queue: VecDeque<Node> = VecDeque::new();

    for root in roots {
        if expanded.insert(root.clone()) {
            queue.push_back(root);
        }
    }

    while let Some(node) = queue.pop_front() {
        refs(&node, &mut |next| {
            if expanded.insert(next.clone()) {
                queue.push_back(next);
            }
        })?;
    }

    live.extend(expanded);
    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn content(key: &str) -> Node {
        Node::new(ResourceType::CONTENT, "ns", key)
    }

    fn graph(edges: &[(&str, &str)]) -> HashMap<Node, Vec<Node>> {
        let mut g: HashMap<Node, Vec<Node>> = HashMap::new();
        for (from, to) in edges {
            g.entry(content(from)).or_default().push(content(to));
        }
        g
    }

    fn walk(g: &HashMap<Node, Vec<Node>>) -> impl FnMut(&Node, &mut dyn FnMut(Node)) -> Result<(), ()> + '_ {
        |n: &Node, f: &mut dyn FnMut(Node)| {
            for next in g.get(n).into_iter().flatten() {
                f(next.clone());
            }
            Ok(())
        }
    }

    #[test]
    fn test_mark_transitive() {
        let g = graph(&[("a", "b"), ("b", "c"), ("d", "e")]);
        let live = mark([content("a")], [], walk(&g)).unwrap();
        assert!(live.contains(&content("a")));
        assert!(live.contains(&content("b")));
        assert!(live.contains(&content("c")));
        assert!(!live.contains(&content("d")));
        assert!(!live.contains(&content("e")));
    }

    #[test]
    fn test_mark_handles_cycles() {
        let g = graph(&[("a", "b"), ("b", "a")]);
        let live = mark([content("a")], [], walk(&g)).unwrap();
        assert_eq!(live.len(), 2);
    }

    #[test]
    fn test_flat_nodes_not_expanded() {
        let g = graph(&[("a", "b")]);
        let live = mark([], [content("a")], walk(&g)).unwrap();
        assert!(live.contains(&content("a")));
        assert!(!live.contains(&content("b")));
    }

    #[test]
    fn test_flat_node_expanded_when_reached_by_root() {
        let g = graph(&[("r", "a"), ("a", "b")]);
        let live = mark([content("r")], [content("a")], walk(&g)).unwrap();
        assert!(live.contains(&content("b")));
    }

    #[test]
    fn test_mark_error_aborts() {
        let result: Result<_, &str> = mark([content("a")], [], |_, _| Err("boom"));
        assert_eq!(result.unwrap_err(), "boom");
    }

    #[test]
    fn test_resource_type_ranges() {
        assert!(!ResourceType::CONTENT.is_collectible());
        assert!(ResourceType(0x10).is_collectible());
        assert!(ResourceType::MAX.is_collectible());
        assert!(!ResourceType(0x80).is_collectible());
        assert_eq!(ResourceType::SNAPSHOT.to_string(), "snapshot");
    }
}
