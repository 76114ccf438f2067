//! Orchestrator node cache interface.
//!
//! The node cache is a locally synchronized copy of the orchestrator's node
//! objects. Reading it never touches the network, so the trait is
//! synchronous.

use fabric_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of a node address, as reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAddressType {
    Hostname,
    #[serde(rename = "InternalIP")]
    InternalIp,
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    #[serde(rename = "InternalDNS")]
    InternalDns,
    #[serde(rename = "ExternalDNS")]
    ExternalDns,
}

/// One reported node address.
///
/// `address` is kept as reported; consumers parse it against the type they
/// expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: NodeAddressType,
    pub address: String,
}

impl NodeAddress {
    /// Creates a new node address.
    pub fn new(kind: NodeAddressType, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }

    /// Creates an internal IP address entry.
    pub fn internal_ip(address: impl Into<String>) -> Self {
        Self::new(NodeAddressType::InternalIp, address)
    }
}

/// A cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
    #[serde(default)]
    pub pod_cidrs: Vec<IpPrefix>,
}

impl Node {
    /// Creates a node with no addresses.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a reported address.
    pub fn with_address(mut self, address: NodeAddress) -> Self {
        self.addresses.push(address);
        self
    }

    /// Adds an assigned pod CIDR.
    pub fn with_pod_cidr(mut self, cidr: IpPrefix) -> Self {
        self.pod_cidrs.push(cidr);
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl NodeSelector {
    /// Selects every node.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Returns true if every selector label is present on `node` with the same value.
    pub fn matches(&self, node: &Node) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| node.labels.get(k) == Some(v))
    }
}

/// The orchestrator's node cache.
pub trait NodeCache: Send + Sync {
    /// Lists cached nodes matching `selector`.
    fn list(&self, selector: &NodeSelector) -> Vec<Node>;

    /// Returns true once the cache has completed its initial sync.
    fn has_synced(&self) -> bool;
}
