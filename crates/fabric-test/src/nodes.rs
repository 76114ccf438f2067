//! Node cache backed by a mutable in-memory list.

use fabric_api::{Node, NodeCache, NodeSelector};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    nodes: Vec<Node>,
    synced: bool,
}

/// A node cache tests can edit while the reconciler reads it.
#[derive(Clone, Default)]
pub struct StaticNodeCache {
    inner: Arc<RwLock<Inner>>,
}

impl StaticNodeCache {
    /// A synced cache holding `nodes`.
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                nodes,
                synced: true,
            })),
        }
    }

    /// An empty cache that has not finished its initial sync.
    pub fn unsynced() -> Self {
        Self::default()
    }

    pub fn set_synced(&self, synced: bool) {
        self.inner.write().synced = synced;
    }

    /// Adds `node`, replacing any node of the same name.
    pub fn upsert(&self, node: Node) {
        let mut inner = self.inner.write();
        match inner.nodes.iter().position(|n| n.name == node.name) {
            Some(i) => inner.nodes[i] = node,
            None => inner.nodes.push(node),
        }
    }

    pub fn remove(&self, name: &str) {
        self.inner.write().nodes.retain(|n| n.name != name);
    }
}

impl NodeCache for StaticNodeCache {
    fn list(&self, selector: &NodeSelector) -> Vec<Node> {
        self.inner
            .read()
            .nodes
            .iter()
            .filter(|node| selector.matches(node))
            .cloned()
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.inner.read().synced
    }
}
