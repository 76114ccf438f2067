//! Route intents and views.

use fabric_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pod-CIDR route: traffic for `destination` goes to `target_node`.
///
/// A blackhole route is one whose table entry points at an address no
/// known node owns. For those `target_node` carries the raw next-hop
/// string rather than a node name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpPrefix,
    pub target_node: String,
    #[serde(default)]
    pub blackhole: bool,
}

/// A route the orchestrator wants to exist.
pub type RouteIntent = Route;

/// A route as currently observed in the fabric.
pub type RouteView = Route;

impl Route {
    /// Creates a route to a named node.
    pub fn new(destination: IpPrefix, target_node: impl Into<String>) -> Self {
        Self {
            destination,
            target_node: target_node.into(),
            blackhole: false,
        }
    }

    /// Creates a blackhole route whose next hop resolved to no node.
    pub fn blackhole(destination: IpPrefix, next_hop: impl Into<String>) -> Self {
        Self {
            destination,
            target_node: next_hop.into(),
            blackhole: true,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.destination, self.target_node)?;
        if self.blackhole {
            write!(f, " (blackhole)")?;
        }
        Ok(())
    }
}
