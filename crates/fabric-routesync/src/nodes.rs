//! Node address resolution against the orchestrator's node cache.

use fabric_api::{Node, NodeAddressType, NodeCache, NodeSelector};
use fabric_types::{IpAddress, IpFamily};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, RouteSyncError};

/// Resolves node names to internal addresses and back.
#[derive(Clone)]
pub struct NodeAddressResolver {
    cache: Arc<dyn NodeCache>,
    selector: NodeSelector,
}

impl NodeAddressResolver {
    pub fn new(cache: Arc<dyn NodeCache>, selector: NodeSelector) -> Self {
        Self { cache, selector }
    }

    /// Returns true once the node cache finished its initial sync.
    pub fn has_synced(&self) -> bool {
        self.cache.has_synced()
    }

    /// Nodes matching the configured selector.
    pub fn nodes(&self) -> Vec<Node> {
        self.cache.list(&self.selector)
    }

    /// First internal address of `family` on node `name`.
    pub fn resolve(&self, name: &str, family: IpFamily) -> Result<IpAddress> {
        self.nodes()
            .iter()
            .filter(|node| node.name == name)
            .flat_map(internal_addresses)
            .find(|addr| addr.family() == family)
            .ok_or_else(|| RouteSyncError::no_address(name, family))
    }

    /// Map of every internal address to the node owning it.
    ///
    /// When two nodes report the same address the first listed keeps it.
    pub fn address_index(&self) -> HashMap<IpAddress, String> {
        let mut index = HashMap::new();
        for node in self.nodes() {
            for addr in internal_addresses(&node) {
                index.entry(addr).or_insert_with(|| node.name.clone());
            }
        }
        index
    }
}

/// Parsed internal addresses of `node`, in reported order.
fn internal_addresses(node: &Node) -> Vec<IpAddress> {
    node.addresses
        .iter()
        .filter(|a| a.kind == NodeAddressType::InternalIp)
        .filter_map(|a| match a.address.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!(node = %node.name, address = %a.address, error = %e, "Skipping unparsable node address");
                None
            }
        })
        .collect()
}
