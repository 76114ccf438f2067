//! Port API.
//!
//! Ports are owned and versioned by the fabric. The only update the fabric
//! offers is a whole-field replace of `security_groups` and/or
//! `allowed_address_pairs`; there is no element-level delta.

use async_trait::async_trait;
use fabric_types::{IpAddress, IpPrefix};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::FabricResult;
use crate::types::{NetworkId, PortId, SecurityGroupId};

/// An address (or prefix) a port may send from besides its fixed IPs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllowedAddressPair {
    pub ip_address: IpPrefix,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

impl AllowedAddressPair {
    /// Creates a pair for `ip_address` on the port's own MAC.
    pub fn new(ip_address: IpPrefix) -> Self {
        Self {
            ip_address,
            mac_address: None,
        }
    }
}

/// A fabric port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub network_id: NetworkId,
    #[serde(default)]
    pub fixed_ips: Vec<IpAddress>,
    #[serde(default)]
    pub security_groups: BTreeSet<SecurityGroupId>,
    #[serde(default)]
    pub allowed_address_pairs: Vec<AllowedAddressPair>,
    #[serde(default = "default_port_security")]
    pub port_security_enabled: bool,
}

fn default_port_security() -> bool {
    true
}

impl Port {
    /// Returns true if any allowed-address-pair covers exactly `cidr`.
    pub fn has_allowed_address(&self, cidr: &IpPrefix) -> bool {
        self.allowed_address_pairs
            .iter()
            .any(|pair| &pair.ip_address == cidr)
    }

    /// Returns true if the port carries security group `id`.
    pub fn has_security_group(&self, id: &SecurityGroupId) -> bool {
        self.security_groups.contains(id)
    }

    /// Returns true if `addr` is one of the port's fixed IPs.
    pub fn owns_address(&self, addr: &IpAddress) -> bool {
        self.fixed_ips.contains(addr)
    }
}

/// Server-side filter for `list_ports`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    pub network_id: Option<NetworkId>,
    pub fixed_ip: Option<IpAddress>,
}

impl PortFilter {
    /// Filters ports on `network_id` owning `fixed_ip`.
    pub fn by_address(network_id: NetworkId, fixed_ip: IpAddress) -> Self {
        Self {
            network_id: Some(network_id),
            fixed_ip: Some(fixed_ip),
        }
    }

    /// Returns true if `port` passes the filter.
    pub fn matches(&self, port: &Port) -> bool {
        self.network_id
            .as_ref()
            .map_or(true, |net| &port.network_id == net)
            && self
                .fixed_ip
                .as_ref()
                .map_or(true, |ip| port.owns_address(ip))
    }
}

/// Whole-field replacement request for `update_port`.
///
/// Fields left as `None` are not sent and keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<BTreeSet<SecurityGroupId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_address_pairs: Option<Vec<AllowedAddressPair>>,
}

impl PortUpdate {
    /// Replaces the port's security groups.
    pub fn security_groups(groups: BTreeSet<SecurityGroupId>) -> Self {
        Self {
            security_groups: Some(groups),
            ..Self::default()
        }
    }

    /// Replaces the port's allowed-address-pairs.
    pub fn allowed_address_pairs(pairs: Vec<AllowedAddressPair>) -> Self {
        Self {
            allowed_address_pairs: Some(pairs),
            ..Self::default()
        }
    }
}

/// Port API consumed by the route synchronizer.
#[async_trait]
pub trait PortApi: Send + Sync {
    /// Lists ports matching `filter`.
    async fn list_ports(&self, filter: &PortFilter) -> FabricResult<Vec<Port>>;

    /// Reads one port.
    async fn get_port(&self, id: &PortId) -> FabricResult<Port>;

    /// Applies a whole-field replace and returns the updated port.
    async fn update_port(&self, id: &PortId, update: &PortUpdate) -> FabricResult<Port>;

    /// Reports whether ports accept allowed-address-pairs.
    async fn supports_allowed_address_pairs(&self) -> FabricResult<bool> {
        Ok(true)
    }
}
