//! Security group and rule API.

use async_trait::async_trait;
use fabric_types::{IpFamily, IpPrefix};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::FabricResult;
use crate::types::{RuleId, SecurityGroupId};

/// Traffic direction a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

impl fmt::Display for RuleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => write!(f, "ingress"),
            Self::Egress => write!(f, "egress"),
        }
    }
}

/// A security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: SecurityGroupId,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// The content of a rule, without the ID the fabric assigns.
///
/// `protocol` of `None` means any protocol; port ranges of `None` mean any
/// port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSpec {
    pub security_group_id: SecurityGroupId,
    pub direction: RuleDirection,
    #[serde(rename = "ethertype")]
    pub ether_type: IpFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip_prefix: Option<IpPrefix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_group_id: Option<SecurityGroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_min: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range_max: Option<u16>,
}

impl RuleSpec {
    /// An ingress rule on `group` for any protocol and port.
    pub fn ingress(group: SecurityGroupId, ether_type: IpFamily) -> Self {
        Self {
            security_group_id: group,
            direction: RuleDirection::Ingress,
            ether_type,
            protocol: None,
            remote_ip_prefix: None,
            remote_group_id: None,
            port_range_min: None,
            port_range_max: None,
        }
    }

    /// Restricts the rule to traffic from `prefix`.
    pub fn with_remote_prefix(mut self, prefix: IpPrefix) -> Self {
        self.remote_ip_prefix = Some(prefix);
        self
    }

    /// Restricts the rule to traffic from members of `group`.
    pub fn with_remote_group(mut self, group: SecurityGroupId) -> Self {
        self.remote_group_id = Some(group);
        self
    }

    /// Restricts the rule to `protocol` (e.g. "tcp").
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Restricts the rule to destination ports `min..=max`.
    pub fn with_port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range_min = Some(min);
        self.port_range_max = Some(max);
        self
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.direction,
            self.ether_type,
            self.protocol.as_deref().unwrap_or("any")
        )?;
        if let Some(prefix) = &self.remote_ip_prefix {
            write!(f, " from {}", prefix)?;
        }
        if let Some(group) = &self.remote_group_id {
            write!(f, " from group {}", group)?;
        }
        match (self.port_range_min, self.port_range_max) {
            (Some(min), Some(max)) => write!(f, " ports {}-{}", min, max),
            (Some(min), None) => write!(f, " ports {}-", min),
            (None, Some(max)) => write!(f, " ports -{}", max),
            (None, None) => Ok(()),
        }
    }
}

/// A rule as stored by the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: RuleId,
    #[serde(flatten)]
    pub spec: RuleSpec,
}

/// Server-side filter for `list_rules`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFilter {
    pub security_group_id: SecurityGroupId,
    pub direction: Option<RuleDirection>,
    pub ether_type: Option<IpFamily>,
    pub remote_ip_prefix: Option<IpPrefix>,
}

impl RuleFilter {
    /// All rules of `group`.
    pub fn group(group: SecurityGroupId) -> Self {
        Self {
            security_group_id: group,
            direction: None,
            ether_type: None,
            remote_ip_prefix: None,
        }
    }

    /// Ingress rules of `group` whose remote prefix is exactly `prefix`.
    pub fn ingress_from(group: SecurityGroupId, prefix: IpPrefix) -> Self {
        Self {
            security_group_id: group,
            direction: Some(RuleDirection::Ingress),
            ether_type: Some(prefix.family()),
            remote_ip_prefix: Some(prefix),
        }
    }

    /// Returns true if `rule` passes the filter.
    pub fn matches(&self, rule: &SecurityGroupRule) -> bool {
        let spec = &rule.spec;
        spec.security_group_id == self.security_group_id
            && self.direction.map_or(true, |d| spec.direction == d)
            && self.ether_type.map_or(true, |e| spec.ether_type == e)
            && self
                .remote_ip_prefix
                .map_or(true, |p| spec.remote_ip_prefix == Some(p))
    }
}

/// Security group API consumed by the route synchronizer.
#[async_trait]
pub trait SecurityGroupApi: Send + Sync {
    /// Creates a security group.
    async fn create_group(&self, name: &str, description: &str) -> FabricResult<SecurityGroup>;

    /// Finds a security group by exact name.
    async fn lookup_group_by_name(&self, name: &str) -> FabricResult<Option<SecurityGroup>>;

    /// Lists rules matching `filter`.
    async fn list_rules(&self, filter: &RuleFilter) -> FabricResult<Vec<SecurityGroupRule>>;

    /// Creates a rule. An identical existing rule yields a conflict.
    async fn create_rule(&self, spec: &RuleSpec) -> FabricResult<SecurityGroupRule>;

    /// Deletes a rule. A missing rule yields not-found.
    async fn delete_rule(&self, id: &RuleId) -> FabricResult<()>;
}
