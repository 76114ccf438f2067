//! Security group rule diffing and application.

use fabric_api::{RuleSpec, SecurityGroupApi, SecurityGroupId, SecurityGroupRule};
use fabric_types::{IpAddress, IpPrefix};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cancel::guarded;
use crate::error::Result;
use crate::rollback::{RollbackStack, UndoAction};

/// Returns true if two rules describe the same traffic.
///
/// Compared: direction, ether type, protocol (case-insensitive), remote IP
/// prefix and the port range bounds. IDs and group references are not.
pub fn same_rule(a: &RuleSpec, b: &RuleSpec) -> bool {
    a.direction == b.direction
        && a.ether_type == b.ether_type
        && same_protocol(a.protocol.as_deref(), b.protocol.as_deref())
        && a.remote_ip_prefix == b.remote_ip_prefix
        && a.port_range_min == b.port_range_min
        && a.port_range_max == b.port_range_max
}

fn same_protocol(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

/// Rules to create and delete to turn an existing set into a wanted one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub to_create: Vec<RuleSpec>,
    pub to_delete: Vec<SecurityGroupRule>,
}

impl RuleDiff {
    /// Returns true if the sets already match.
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }

    /// Keeps only the creations.
    pub fn creations_only(self) -> Self {
        Self {
            to_create: self.to_create,
            to_delete: Vec::new(),
        }
    }
}

/// Computes the set difference between `wanted` and `existing` under
/// [`same_rule`].
///
/// Order of either input does not matter. A wanted rule listed twice is
/// created once.
pub fn diff(wanted: &[RuleSpec], existing: &[SecurityGroupRule]) -> RuleDiff {
    let mut to_create: Vec<RuleSpec> = Vec::new();
    for want in wanted {
        let present = existing.iter().any(|have| same_rule(&have.spec, want));
        let queued = to_create.iter().any(|queued| same_rule(queued, want));
        if !present && !queued {
            to_create.push(want.clone());
        }
    }

    let to_delete = existing
        .iter()
        .filter(|have| !wanted.iter().any(|want| same_rule(&have.spec, want)))
        .cloned()
        .collect();

    RuleDiff {
        to_create,
        to_delete,
    }
}

/// Ingress rule admitting traffic sourced from a pod CIDR.
pub fn pod_cidr_rule(group: &SecurityGroupId, cidr: IpPrefix) -> RuleSpec {
    RuleSpec::ingress(group.clone(), cidr.family()).with_remote_prefix(cidr)
}

/// Ingress rule admitting traffic sourced from a node address.
pub fn node_address_rule(group: &SecurityGroupId, node: IpAddress) -> RuleSpec {
    RuleSpec::ingress(group.clone(), node.family()).with_remote_prefix(node.host_prefix())
}

/// Rules the node group needs for a route of `cidr` via `next_hop`.
pub fn route_rules(group: &SecurityGroupId, cidr: IpPrefix, next_hop: IpAddress) -> Vec<RuleSpec> {
    vec![pod_cidr_rule(group, cidr), node_address_rule(group, next_hop)]
}

/// Applies `diff`, recording the inverse of every rule it changes.
///
/// A create that conflicts means the rule already exists, and a delete that
/// finds nothing means it is already gone; neither is an error and neither
/// is recorded for rollback.
pub async fn apply_rule_diff(
    api: &dyn SecurityGroupApi,
    diff: RuleDiff,
    rollback: &mut RollbackStack,
    cancel: &CancellationToken,
) -> Result<()> {
    for spec in diff.to_create {
        match guarded(cancel, api.create_rule(&spec)).await {
            Ok(rule) => {
                info!(group = %spec.security_group_id, rule = %spec, id = %rule.id, "Created security group rule");
                rollback.push(UndoAction::DeleteRule(rule.id));
            }
            Err(e) if e.is_conflict() => {
                warn!(group = %spec.security_group_id, rule = %spec, "Rule already exists, treating as created");
            }
            Err(e) => {
                warn!(group = %spec.security_group_id, rule = %spec, error = %e, "Failed to create rule");
                return Err(e.into());
            }
        }
    }

    for rule in diff.to_delete {
        match guarded(cancel, api.delete_rule(&rule.id)).await {
            Ok(()) => {
                info!(group = %rule.spec.security_group_id, rule = %rule.spec, id = %rule.id, "Deleted security group rule");
                rollback.push(UndoAction::CreateRule(rule.spec));
            }
            Err(e) if e.is_not_found() => {
                warn!(id = %rule.id, "Rule already gone, treating as deleted");
            }
            Err(e) => {
                warn!(id = %rule.id, error = %e, "Failed to delete rule");
                return Err(e.into());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_api::RuleId;
    use fabric_types::IpFamily;
    use pretty_assertions::assert_eq;

    fn group() -> SecurityGroupId {
        SecurityGroupId::new("sg-nodes")
    }

    fn from(prefix: &str) -> RuleSpec {
        RuleSpec::ingress(group(), IpFamily::V4).with_remote_prefix(prefix.parse().unwrap())
    }

    fn stored(id: &str, spec: RuleSpec) -> SecurityGroupRule {
        SecurityGroupRule {
            id: RuleId::new(id),
            spec,
        }
    }

    #[test]
    fn test_diff_empty_wanted_deletes_everything() {
        let a = stored("a", from("10.244.1.0/24"));
        let b = stored("b", from("192.168.1.5/32"));

        let d = diff(&[], &[a.clone(), b.clone()]);

        assert!(d.to_create.is_empty());
        assert_eq!(d.to_delete, vec![a, b]);
    }

    #[test]
    fn test_diff_port_range_difference() {
        let wanted = from("10.244.1.0/24").with_protocol("tcp").with_port_range(80, 80);
        let existing = stored(
            "a",
            from("10.244.1.0/24").with_protocol("tcp").with_port_range(80, 81),
        );

        let d = diff(&[wanted.clone()], &[existing.clone()]);

        assert_eq!(d.to_create, vec![wanted]);
        assert_eq!(d.to_delete, vec![existing]);
    }

    #[test]
    fn test_diff_ignores_order() {
        let a = from("10.244.1.0/24");
        let b = from("192.168.1.5/32");
        let existing = vec![stored("2", b.clone()), stored("1", a.clone())];

        assert!(diff(&[a, b], &existing).is_empty());
    }

    #[test]
    fn test_diff_protocol_case_insensitive() {
        let wanted = from("10.244.1.0/24").with_protocol("TCP");
        let existing = stored("a", from("10.244.1.0/24").with_protocol("tcp"));

        assert!(diff(&[wanted], &[existing]).is_empty());
    }

    #[test]
    fn test_diff_any_protocol_differs_from_named() {
        let wanted = from("10.244.1.0/24");
        let existing = stored("a", from("10.244.1.0/24").with_protocol("udp"));

        let d = diff(&[wanted.clone()], &[existing.clone()]);
        assert_eq!(d.to_create, vec![wanted]);
        assert_eq!(d.to_delete, vec![existing]);
    }

    #[test]
    fn test_diff_ignores_ids_and_group_refs() {
        let wanted = from("10.244.1.0/24");
        let existing = stored(
            "whatever",
            RuleSpec::ingress(SecurityGroupId::new("other"), IpFamily::V4)
                .with_remote_prefix("10.244.1.0/24".parse().unwrap())
                .with_remote_group(SecurityGroupId::new("peer")),
        );

        assert!(diff(&[wanted], &[existing]).is_empty());
    }

    #[test]
    fn test_diff_dedupes_wanted() {
        let a = from("10.244.1.0/24");
        let d = diff(&[a.clone(), a.clone()], &[]);
        assert_eq!(d.to_create, vec![a]);
    }

    #[test]
    fn test_route_rules() {
        let rules = route_rules(
            &group(),
            "10.244.1.0/24".parse().unwrap(),
            "192.168.1.5".parse().unwrap(),
        );
        assert_eq!(rules, vec![from("10.244.1.0/24"), from("192.168.1.5/32")]);

        let v6 = node_address_rule(&group(), "fd00::5".parse().unwrap());
        assert_eq!(v6.ether_type, IpFamily::V6);
        assert_eq!(v6.remote_ip_prefix.unwrap().to_string(), "fd00::5/128");
    }

    #[test]
    fn test_creations_only() {
        let d = diff(&[from("10.244.1.0/24")], &[stored("x", from("10.0.0.0/8"))]);
        let d = d.creations_only();
        assert_eq!(d.to_create.len(), 1);
        assert!(d.to_delete.is_empty());
    }
}
