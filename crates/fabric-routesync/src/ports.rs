//! Next-hop port lookup and per-port convergence.
//!
//! Both port fields the reconciler touches are replaced whole by the
//! fabric, so every change re-reads the port first and records the exact
//! previous value for rollback.

use fabric_api::{
    AllowedAddressPair, NetworkId, Port, PortApi, PortFilter, PortId, PortUpdate,
    SecurityGroupId,
};
use fabric_types::{IpAddress, IpPrefix};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cancel::guarded;
use crate::error::{Result, RouteSyncError};
use crate::rollback::{RollbackStack, UndoAction};

/// Finds the single port owning `address` on the router's networks.
///
/// Networks are searched in order and the first with exactly one match
/// wins. More than one match on a network is an error, as is no match on
/// any of them.
pub async fn find_port_by_address(
    ports: &dyn PortApi,
    address: &IpAddress,
    networks: &[NetworkId],
    cancel: &CancellationToken,
) -> Result<Port> {
    for network in networks {
        let filter = PortFilter::by_address(network.clone(), *address);
        let mut found = guarded(cancel, ports.list_ports(&filter)).await?;
        match found.len() {
            0 => continue,
            1 => {
                let port = found.remove(0);
                debug!(address = %address, network = %network, port = %port.id, "Found next-hop port");
                return Ok(port);
            }
            count => {
                return Err(RouteSyncError::AmbiguousPort {
                    address: *address,
                    network: network.clone(),
                    count,
                })
            }
        }
    }
    Err(RouteSyncError::PortNotFound { address: *address })
}

/// Ensures `cidr` is among the port's allowed-address-pairs.
///
/// Returns true if the port was updated.
pub async fn add_allowed_address(
    ports: &dyn PortApi,
    port_id: &PortId,
    cidr: IpPrefix,
    rollback: &mut RollbackStack,
    cancel: &CancellationToken,
) -> Result<bool> {
    let port = guarded(cancel, ports.get_port(port_id)).await?;
    if port.has_allowed_address(&cidr) {
        debug!(port = %port_id, cidr = %cidr, "Allowed address already present");
        return Ok(false);
    }

    let previous = port.allowed_address_pairs;
    let mut pairs = previous.clone();
    pairs.push(AllowedAddressPair::new(cidr));
    guarded(
        cancel,
        ports.update_port(port_id, &PortUpdate::allowed_address_pairs(pairs)),
    )
    .await?;

    info!(port = %port_id, cidr = %cidr, "Added allowed address pair");
    rollback.push(UndoAction::RestoreAllowedAddressPairs {
        port: port_id.clone(),
        pairs: previous,
    });
    Ok(true)
}

/// Ensures `cidr` is not among the port's allowed-address-pairs.
///
/// Returns true if the port was updated.
pub async fn remove_allowed_address(
    ports: &dyn PortApi,
    port_id: &PortId,
    cidr: IpPrefix,
    rollback: &mut RollbackStack,
    cancel: &CancellationToken,
) -> Result<bool> {
    let port = guarded(cancel, ports.get_port(port_id)).await?;
    if !port.has_allowed_address(&cidr) {
        debug!(port = %port_id, cidr = %cidr, "Allowed address already absent");
        return Ok(false);
    }

    let previous = port.allowed_address_pairs;
    let pairs: Vec<_> = previous
        .iter()
        .filter(|pair| pair.ip_address != cidr)
        .cloned()
        .collect();
    guarded(
        cancel,
        ports.update_port(port_id, &PortUpdate::allowed_address_pairs(pairs)),
    )
    .await?;

    info!(port = %port_id, cidr = %cidr, "Removed allowed address pair");
    rollback.push(UndoAction::RestoreAllowedAddressPairs {
        port: port_id.clone(),
        pairs: previous,
    });
    Ok(true)
}

/// Ensures the port carries security group `group`.
///
/// Returns true if the port was updated.
pub async fn add_security_group(
    ports: &dyn PortApi,
    port_id: &PortId,
    group: &SecurityGroupId,
    rollback: &mut RollbackStack,
    cancel: &CancellationToken,
) -> Result<bool> {
    let port = guarded(cancel, ports.get_port(port_id)).await?;
    if port.has_security_group(group) {
        debug!(port = %port_id, group = %group, "Port already in security group");
        return Ok(false);
    }

    let previous = port.security_groups;
    let mut groups = previous.clone();
    groups.insert(group.clone());
    guarded(
        cancel,
        ports.update_port(port_id, &PortUpdate::security_groups(groups)),
    )
    .await?;

    info!(port = %port_id, group = %group, "Added port to security group");
    rollback.push(UndoAction::RestoreSecurityGroups {
        port: port_id.clone(),
        groups: previous,
    });
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fabric_api::{FabricError, FabricResult};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct Ports(Mutex<Vec<Port>>);

    #[async_trait]
    impl PortApi for Ports {
        async fn list_ports(&self, filter: &PortFilter) -> FabricResult<Vec<Port>> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|p| filter.matches(p))
                .cloned()
                .collect())
        }

        async fn get_port(&self, id: &PortId) -> FabricResult<Port> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .find(|p| &p.id == id)
                .cloned()
                .ok_or_else(|| FabricError::not_found(format!("port {}", id)))
        }

        async fn update_port(&self, id: &PortId, update: &PortUpdate) -> FabricResult<Port> {
            let mut ports = self.0.lock().unwrap();
            let port = ports
                .iter_mut()
                .find(|p| &p.id == id)
                .ok_or_else(|| FabricError::not_found(format!("port {}", id)))?;
            if let Some(groups) = &update.security_groups {
                port.security_groups = groups.clone();
            }
            if let Some(pairs) = &update.allowed_address_pairs {
                port.allowed_address_pairs = pairs.clone();
            }
            Ok(port.clone())
        }
    }

    fn port(id: &str, network: &str, ip: &str) -> Port {
        Port {
            id: PortId::new(id),
            network_id: NetworkId::new(network),
            fixed_ips: vec![ip.parse().unwrap()],
            security_groups: BTreeSet::new(),
            allowed_address_pairs: vec![],
            port_security_enabled: true,
        }
    }

    fn networks() -> Vec<NetworkId> {
        vec![NetworkId::new("net-a"), NetworkId::new("net-b")]
    }

    #[tokio::test]
    async fn test_lookup_searches_networks_in_order() {
        let ports = Ports(Mutex::new(vec![port("p-b", "net-b", "192.168.1.5")]));
        let addr: IpAddress = "192.168.1.5".parse().unwrap();

        let found = find_port_by_address(&ports, &addr, &networks(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(found.id, PortId::new("p-b"));
    }

    #[tokio::test]
    async fn test_lookup_not_found() {
        let ports = Ports(Mutex::new(vec![port("p-c", "net-c", "192.168.1.5")]));
        let addr: IpAddress = "192.168.1.5".parse().unwrap();

        let err = find_port_by_address(&ports, &addr, &networks(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, RouteSyncError::PortNotFound { address: addr });
    }

    #[tokio::test]
    async fn test_lookup_ambiguous() {
        let ports = Ports(Mutex::new(vec![
            port("p1", "net-a", "192.168.1.5"),
            port("p2", "net-a", "192.168.1.5"),
        ]));
        let addr: IpAddress = "192.168.1.5".parse().unwrap();

        let err = find_port_by_address(&ports, &addr, &networks(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RouteSyncError::AmbiguousPort {
                address: addr,
                network: NetworkId::new("net-a"),
                count: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_allowed_address_add_is_idempotent() {
        let ports = Ports(Mutex::new(vec![port("p1", "net-a", "192.168.1.5")]));
        let id = PortId::new("p1");
        let cidr: IpPrefix = "10.244.1.0/24".parse().unwrap();
        let cancel = CancellationToken::new();
        let mut rollback = RollbackStack::new("test");

        assert!(add_allowed_address(&ports, &id, cidr, &mut rollback, &cancel)
            .await
            .unwrap());
        assert!(!add_allowed_address(&ports, &id, cidr, &mut rollback, &cancel)
            .await
            .unwrap());

        assert_eq!(
            rollback.actions(),
            &[UndoAction::RestoreAllowedAddressPairs {
                port: id.clone(),
                pairs: vec![],
            }]
        );
        assert!(ports.get_port(&id).await.unwrap().has_allowed_address(&cidr));
    }

    #[tokio::test]
    async fn test_allowed_address_remove_keeps_others() {
        let keep = AllowedAddressPair::new("10.244.2.0/24".parse().unwrap());
        let gone = AllowedAddressPair::new("10.244.1.0/24".parse().unwrap());
        let mut p = port("p1", "net-a", "192.168.1.5");
        p.allowed_address_pairs = vec![gone.clone(), keep.clone()];
        let ports = Ports(Mutex::new(vec![p]));
        let id = PortId::new("p1");
        let mut rollback = RollbackStack::new("test");

        assert!(remove_allowed_address(
            &ports,
            &id,
            gone.ip_address,
            &mut rollback,
            &CancellationToken::new()
        )
        .await
        .unwrap());

        assert_eq!(
            ports.get_port(&id).await.unwrap().allowed_address_pairs,
            vec![keep.clone()]
        );
        assert_eq!(
            rollback.actions(),
            &[UndoAction::RestoreAllowedAddressPairs {
                port: id,
                pairs: vec![gone, keep],
            }]
        );
    }

    #[tokio::test]
    async fn test_security_group_add_keeps_existing_groups() {
        let mut p = port("p1", "net-a", "192.168.1.5");
        p.security_groups.insert(SecurityGroupId::new("default"));
        let ports = Ports(Mutex::new(vec![p]));
        let id = PortId::new("p1");
        let nodes = SecurityGroupId::new("sg-nodes");
        let mut rollback = RollbackStack::new("test");

        assert!(
            add_security_group(&ports, &id, &nodes, &mut rollback, &CancellationToken::new())
                .await
                .unwrap()
        );

        let groups = ports.get_port(&id).await.unwrap().security_groups;
        assert_eq!(groups.len(), 2);
        assert!(groups.contains(&nodes));
        assert_eq!(
            rollback.actions(),
            &[UndoAction::RestoreSecurityGroups {
                port: id,
                groups: [SecurityGroupId::new("default")].into_iter().collect(),
            }]
        );
    }
}
