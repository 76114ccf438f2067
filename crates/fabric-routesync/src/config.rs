//! Route synchronizer configuration.

use fabric_api::{NodeSelector, RouterId};
use fabric_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, RouteSyncError};

/// Default prefix of the managed node security group name.
pub const DEFAULT_NODE_SECURITY_GROUP_PREFIX: &str = "routesync";

/// Default seconds between controller passes.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10;

/// Default number of route operations a controller pass runs at once.
pub const DEFAULT_MAX_CONCURRENT_ROUTES: usize = 10;

/// Configuration for the route reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSyncConfig {
    /// Router whose table carries the pod-CIDR routes.
    pub router_id: RouterId,
    /// Whether the node security group and its rules are managed.
    pub manage_security_groups: bool,
    /// Prefix of the node security group name: `<prefix>-<cluster>-nodes`.
    pub node_security_group_prefix: String,
    /// Nodes considered when resolving next hops.
    pub node_selector: NodeSelector,
    /// Periodic controller settings.
    pub controller: ControllerConfig,
}

impl Default for RouteSyncConfig {
    fn default() -> Self {
        Self {
            router_id: RouterId::default(),
            manage_security_groups: false,
            node_security_group_prefix: DEFAULT_NODE_SECURITY_GROUP_PREFIX.to_string(),
            node_selector: NodeSelector::everything(),
            controller: ControllerConfig::default(),
        }
    }
}

impl RouteSyncConfig {
    /// Creates a configuration for `router_id` with defaults elsewhere.
    pub fn new(router_id: RouterId) -> Self {
        Self {
            router_id,
            ..Self::default()
        }
    }

    /// Enables or disables security group automation.
    pub fn with_security_groups(mut self, enabled: bool) -> Self {
        self.manage_security_groups = enabled;
        self
    }

    /// Checks the configuration for values the reconciler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.router_id.is_empty() {
            return Err(RouteSyncError::invalid_config("router_id", "must be set"));
        }
        if self.manage_security_groups && self.node_security_group_prefix.trim().is_empty() {
            return Err(RouteSyncError::invalid_config(
                "node_security_group_prefix",
                "must not be empty when security groups are managed",
            ));
        }
        self.controller.validate()
    }
}

/// Configuration for the periodic route controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Seconds between passes.
    pub sync_interval_secs: u64,
    /// Maximum route operations in flight during one pass.
    pub max_concurrent_routes: usize,
    /// Prefixes the cluster allocates pod CIDRs from. Stale routes inside
    /// them are deleted. Left empty, only routes to a destination some node
    /// currently claims are deleted.
    pub cluster_cidrs: Vec<IpPrefix>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_concurrent_routes: DEFAULT_MAX_CONCURRENT_ROUTES,
            cluster_cidrs: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Interval between passes.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Returns true if `destination` lies inside one of the cluster CIDRs.
    pub fn owns_destination(&self, destination: &IpPrefix) -> bool {
        self.cluster_cidrs.iter().any(|cidr| {
            cidr.family() == destination.family()
                && cidr.prefix_len() <= destination.prefix_len()
                && cidr.contains(destination.address())
        })
    }

    fn validate(&self) -> Result<()> {
        if self.sync_interval_secs == 0 {
            return Err(RouteSyncError::invalid_config(
                "controller.sync_interval_secs",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_routes == 0 {
            return Err(RouteSyncError::invalid_config(
                "controller.max_concurrent_routes",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
