//! Route reconciler: ListRoutes, CreateRoute and DeleteRoute.
//!
//! A CreateRoute or DeleteRoute is a short sequence of fabric mutations:
//! the route table entry, the node security group rules, and the next-hop
//! port's allowed-address-pairs and group membership. Each step first
//! checks whether the fabric is already in the wanted state, so repeating
//! an operation is harmless. Each step that did change something records
//! its inverse, and a failed operation is unwound before the error is
//! returned.

use fabric_api::{
    NetworkId, NodeCache, Port, PortApi, RouteTableEntry, RouterApi, RuleFilter,
    SecurityGroupApi, SecurityGroupId, SecurityGroupRule,
};
use fabric_types::{IpAddress, IpPrefix};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::guarded;
use crate::config::RouteSyncConfig;
use crate::error::{Result, RouteSyncError};
use crate::groups::NodeSecurityGroup;
use crate::nodes::NodeAddressResolver;
use crate::ports;
use crate::rollback::{FabricUndo, RollbackStack};
use crate::route::{Route, RouteIntent, RouteView};
use crate::rules::{apply_rule_diff, diff, pod_cidr_rule, route_rules, same_rule};
use crate::table::{table_for, RouteTableUpdater, TableUpdateMode};

/// Handles to the three fabric APIs.
#[derive(Clone)]
pub struct FabricClients {
    pub routers: Arc<dyn RouterApi>,
    pub ports: Arc<dyn PortApi>,
    pub security_groups: Arc<dyn SecurityGroupApi>,
}

impl FabricClients {
    /// Uses one backend for all three APIs.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: RouterApi + PortApi + SecurityGroupApi + 'static,
    {
        Self {
            routers: backend.clone(),
            ports: backend.clone(),
            security_groups: backend,
        }
    }
}

/// Optional fabric features, detected once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FabricCapabilities {
    /// Routers accept single-entry route adds and removes.
    pub atomic_routes: bool,
    /// Ports accept allowed-address-pairs.
    pub allowed_address_pairs: bool,
}

impl FabricCapabilities {
    /// Asks the fabric which optional features it offers.
    pub async fn detect(clients: &FabricClients, cancel: &CancellationToken) -> Result<Self> {
        let atomic_routes = guarded(cancel, clients.routers.supports_atomic_routes()).await?;
        let allowed_address_pairs =
            guarded(cancel, clients.ports.supports_allowed_address_pairs()).await?;
        Ok(Self {
            atomic_routes,
            allowed_address_pairs,
        })
    }

    /// Route table strategy these capabilities call for.
    pub fn table_mode(&self) -> TableUpdateMode {
        if self.atomic_routes {
            TableUpdateMode::Atomic
        } else {
            TableUpdateMode::Classical
        }
    }
}

/// Reconciles pod-CIDR routes for one cluster against one fabric router.
pub struct RouteReconciler {
    config: RouteSyncConfig,
    capabilities: FabricCapabilities,
    clients: FabricClients,
    nodes: NodeAddressResolver,
    table: Arc<dyn RouteTableUpdater>,
    node_group: NodeSecurityGroup,
}

impl RouteReconciler {
    /// Validates `config`, detects fabric capabilities and builds a reconciler.
    #[instrument(skip_all, fields(router = %config.router_id))]
    pub async fn connect(
        config: RouteSyncConfig,
        clients: FabricClients,
        node_cache: Arc<dyn NodeCache>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let capabilities = FabricCapabilities::detect(&clients, cancel).await?;
        info!(
            atomic_routes = capabilities.atomic_routes,
            allowed_address_pairs = capabilities.allowed_address_pairs,
            "Detected fabric capabilities"
        );
        Self::with_capabilities(config, clients, node_cache, capabilities)
    }

    /// Builds a reconciler with known capabilities, skipping detection.
    pub fn with_capabilities(
        config: RouteSyncConfig,
        clients: FabricClients,
        node_cache: Arc<dyn NodeCache>,
        capabilities: FabricCapabilities,
    ) -> Result<Self> {
        config.validate()?;
        let table = table_for(
            capabilities.table_mode(),
            clients.routers.clone(),
            config.router_id.clone(),
        );
        let nodes = NodeAddressResolver::new(node_cache, config.node_selector.clone());
        let node_group = NodeSecurityGroup::new(config.node_security_group_prefix.clone());
        info!(
            router = %config.router_id,
            mode = %table.mode(),
            manage_security_groups = config.manage_security_groups,
            "Route reconciler ready"
        );
        Ok(Self {
            config,
            capabilities,
            clients,
            nodes,
            table,
            node_group,
        })
    }

    pub fn config(&self) -> &RouteSyncConfig {
        &self.config
    }

    pub fn capabilities(&self) -> FabricCapabilities {
        self.capabilities
    }

    pub fn table_mode(&self) -> TableUpdateMode {
        self.table.mode()
    }

    /// Node address resolver over the configured node selection.
    pub fn nodes(&self) -> &NodeAddressResolver {
        &self.nodes
    }

    /// Lists the routes in the router's table.
    ///
    /// Entries whose next hop no node owns are reported as blackholes. With
    /// security group automation on, entries whose node side is not fully
    /// converged yet are left out so the caller creates them again.
    #[instrument(skip(self, cancel))]
    pub async fn list_routes(
        &self,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RouteView>> {
        if !self.nodes.has_synced() {
            return Err(RouteSyncError::NodeCacheNotSynced);
        }
        let owners = self.nodes.address_index();
        let router = guarded(cancel, self.clients.routers.get_router(&self.config.router_id)).await?;

        let mut check = if self.config.manage_security_groups {
            Some(ConvergenceCheck::load(self, cluster_name, cancel).await?)
        } else {
            None
        };

        let mut routes = Vec::with_capacity(router.routes.len());
        for entry in &router.routes {
            let Some(node) = owners.get(&entry.next_hop) else {
                routes.push(Route::blackhole(entry.destination, entry.next_hop.to_string()));
                continue;
            };
            if let Some(check) = check.as_mut() {
                if !check.is_converged(entry, cancel).await? {
                    debug!(entry = %entry, node = %node, "Route not converged, hiding it");
                    continue;
                }
            }
            routes.push(Route::new(entry.destination, node.clone()));
        }

        debug!(count = routes.len(), "Listed routes");
        Ok(routes)
    }

    /// Makes traffic for `route.destination` flow to `route.target_node`.
    #[instrument(skip(self, route, cancel), fields(route = %route))]
    pub async fn create_route(
        &self,
        cluster_name: &str,
        name_hint: &str,
        route: &RouteIntent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if route.blackhole {
            return Err(RouteSyncError::InvalidRoute(format!(
                "cannot create blackhole route {}",
                route
            )));
        }
        let next_hop = self
            .nodes
            .resolve(&route.target_node, route.destination.family())?;
        let entry = RouteTableEntry::new(route.destination, next_hop);
        info!(next_hop = %next_hop, "Creating route");

        let mut rollback = RollbackStack::new(format!("create {}", route));
        let result = self
            .apply_create(cluster_name, entry, &mut rollback, cancel)
            .await;
        self.settle(rollback, result).await
    }

    /// Removes the route and the per-route node state created for it.
    ///
    /// The node address rule is left in place; other routes via the same
    /// node may still need it.
    #[instrument(skip(self, route, cancel), fields(route = %route))]
    pub async fn delete_route(
        &self,
        cluster_name: &str,
        route: &RouteView,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let resolved = if route.blackhole {
            None
        } else {
            Some(
                self.nodes
                    .resolve(&route.target_node, route.destination.family())?,
            )
        };

        let router = guarded(cancel, self.clients.routers.get_router(&self.config.router_id)).await?;
        let (entry, next_hop) = match resolved {
            Some(next_hop) => {
                let entry = RouteTableEntry::new(route.destination, next_hop);
                (router.has_route(&entry).then_some(entry), Some(next_hop))
            }
            None => {
                let entry = router
                    .routes_to(&route.destination)
                    .find(|e| e.next_hop.to_string() == route.target_node)
                    .copied();
                let next_hop = entry
                    .map(|e| e.next_hop)
                    .or_else(|| route.target_node.parse::<IpAddress>().ok());
                (entry, next_hop)
            }
        };
        info!(in_table = entry.is_some(), "Deleting route");

        let mut rollback = RollbackStack::new(format!("delete {}", route));
        let result = self
            .apply_delete(
                cluster_name,
                route.destination,
                entry,
                next_hop,
                route.blackhole,
                &mut rollback,
                cancel,
            )
            .await;
        self.settle(rollback, result).await
    }

    async fn apply_create(
        &self,
        cluster_name: &str,
        entry: RouteTableEntry,
        rollback: &mut RollbackStack,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let router = guarded(cancel, self.clients.routers.get_router(&self.config.router_id)).await?;
        if router.has_route(&entry) {
            debug!(entry = %entry, "Route table entry already present");
        } else if let Some(undo) = self.table.add_entry(entry, cancel).await? {
            rollback.push(undo);
        }

        let group = if self.config.manage_security_groups {
            let group = self
                .node_group
                .ensure(&*self.clients.security_groups, cluster_name, cancel)
                .await?;
            self.add_route_rules(&group, &entry, rollback, cancel).await?;
            Some(group)
        } else {
            None
        };

        let port = self.next_hop_port(&entry.next_hop, cancel).await?;
        if !port.port_security_enabled {
            info!(port = %port.id, "Port security disabled, leaving port untouched");
            return Ok(());
        }

        if self.capabilities.allowed_address_pairs {
            ports::add_allowed_address(
                &*self.clients.ports,
                &port.id,
                entry.destination,
                rollback,
                cancel,
            )
            .await?;
        }
        if let Some(group) = group {
            ports::add_security_group(&*self.clients.ports, &port.id, &group, rollback, cancel)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_delete(
        &self,
        cluster_name: &str,
        destination: IpPrefix,
        entry: Option<RouteTableEntry>,
        next_hop: Option<IpAddress>,
        blackhole: bool,
        rollback: &mut RollbackStack,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match entry {
            Some(entry) => {
                if let Some(undo) = self.table.remove_entry(entry, cancel).await? {
                    rollback.push(undo);
                }
            }
            None => debug!(destination = %destination, "No matching route table entry"),
        }

        if self.config.manage_security_groups {
            match self
                .node_group
                .find(&*self.clients.security_groups, cluster_name, cancel)
                .await?
            {
                Some(group) => {
                    self.remove_route_rules(&group, destination, rollback, cancel)
                        .await?
                }
                None => debug!("Node security group absent, no rules to remove"),
            }
        }

        let Some(next_hop) = next_hop else {
            debug!("Next hop is not an address, skipping port cleanup");
            return Ok(());
        };
        let port = match self.next_hop_port(&next_hop, cancel).await {
            Ok(port) => port,
            Err(e) if blackhole && e.is_port_lookup() => {
                info!(next_hop = %next_hop, error = %e, "Blackhole next hop has no port, skipping port cleanup");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !port.port_security_enabled {
            debug!(port = %port.id, "Port security disabled, leaving port untouched");
            return Ok(());
        }

        if self.capabilities.allowed_address_pairs {
            ports::remove_allowed_address(
                &*self.clients.ports,
                &port.id,
                destination,
                rollback,
                cancel,
            )
            .await?;
        }
        Ok(())
    }

    /// Creates the pod CIDR and node address rules that are missing.
    async fn add_route_rules(
        &self,
        group: &SecurityGroupId,
        entry: &RouteTableEntry,
        rollback: &mut RollbackStack,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let api = &*self.clients.security_groups;
        let mut existing = Vec::new();
        for prefix in [entry.destination, entry.next_hop.host_prefix()] {
            let filter = RuleFilter::ingress_from(group.clone(), prefix);
            existing.extend(guarded(cancel, api.list_rules(&filter)).await?);
        }

        let wanted = route_rules(group, entry.destination, entry.next_hop);
        apply_rule_diff(api, diff(&wanted, &existing).creations_only(), rollback, cancel).await
    }

    /// Deletes the pod CIDR rule for `destination`.
    async fn remove_route_rules(
        &self,
        group: &SecurityGroupId,
        destination: IpPrefix,
        rollback: &mut RollbackStack,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let api = &*self.clients.security_groups;
        let filter = RuleFilter::ingress_from(group.clone(), destination);
        let pod_rule = pod_cidr_rule(group, destination);
        let owned: Vec<_> = guarded(cancel, api.list_rules(&filter))
            .await?
            .into_iter()
            .filter(|rule| same_rule(&rule.spec, &pod_rule))
            .collect();

        apply_rule_diff(api, diff(&[], &owned), rollback, cancel).await
    }

    async fn next_hop_port(&self, next_hop: &IpAddress, cancel: &CancellationToken) -> Result<Port> {
        let networks = self.attached_networks(cancel).await?;
        ports::find_port_by_address(&*self.clients.ports, next_hop, &networks, cancel).await
    }

    async fn attached_networks(&self, cancel: &CancellationToken) -> Result<Vec<NetworkId>> {
        Ok(guarded(
            cancel,
            self.clients
                .routers
                .list_attached_networks(&self.config.router_id),
        )
        .await?)
    }

    /// Discards the rollback stack on success, unwinds it on failure.
    ///
    /// A cancelled operation is not unwound: its committed steps are each
    /// individually valid and the next pass converges the rest.
    async fn settle(&self, rollback: RollbackStack, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                rollback.discard();
                Ok(())
            }
            Err(e) if e.is_cancelled() => {
                warn!(committed = rollback.len(), "Cancelled, leaving committed steps in place");
                rollback.discard();
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, steps = rollback.len(), "Operation failed, rolling back");
                let undo = FabricUndo {
                    table: &*self.table,
                    ports: &*self.clients.ports,
                    security_groups: &*self.clients.security_groups,
                };
                let failed = rollback.unwind(&undo).await;
                if failed > 0 {
                    error!(failed, "Rollback incomplete");
                }
                Err(e)
            }
        }
    }
}

/// Per-call cache for the convergence check of ListRoutes.
struct ConvergenceCheck<'a> {
    ports: &'a dyn PortApi,
    check_address_pairs: bool,
    group: Option<SecurityGroupId>,
    rules: Vec<SecurityGroupRule>,
    networks: Vec<NetworkId>,
    next_hop_ports: HashMap<IpAddress, Option<Port>>,
}

impl<'a> ConvergenceCheck<'a> {
    async fn load(
        reconciler: &'a RouteReconciler,
        cluster_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ConvergenceCheck<'a>> {
        let api = &*reconciler.clients.security_groups;
        let group = reconciler.node_group.find(api, cluster_name, cancel).await?;
        let (rules, networks) = match &group {
            Some(group) => (
                guarded(cancel, api.list_rules(&RuleFilter::group(group.clone()))).await?,
                reconciler.attached_networks(cancel).await?,
            ),
            None => (Vec::new(), Vec::new()),
        };

        Ok(Self {
            ports: &*reconciler.clients.ports,
            check_address_pairs: reconciler.capabilities.allowed_address_pairs,
            group,
            rules,
            networks,
            next_hop_ports: HashMap::new(),
        })
    }

    async fn is_converged(
        &mut self,
        entry: &RouteTableEntry,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(group) = self.group.clone() else {
            return Ok(false);
        };

        let wanted = route_rules(&group, entry.destination, entry.next_hop);
        if !diff(&wanted, &self.rules).to_create.is_empty() {
            return Ok(false);
        }

        let Some(port) = self.port_for(&entry.next_hop, cancel).await? else {
            return Ok(false);
        };
        if !port.port_security_enabled {
            return Ok(true);
        }
        if !port.has_security_group(&group) {
            return Ok(false);
        }
        Ok(!self.check_address_pairs || port.has_allowed_address(&entry.destination))
    }

    async fn port_for(
        &mut self,
        next_hop: &IpAddress,
        cancel: &CancellationToken,
    ) -> Result<Option<Port>> {
        if let Some(cached) = self.next_hop_ports.get(next_hop) {
            return Ok(cached.clone());
        }
        let port = match ports::find_port_by_address(self.ports, next_hop, &self.networks, cancel)
            .await
        {
            Ok(port) => Some(port),
            Err(e) if e.is_port_lookup() => {
                debug!(next_hop = %next_hop, error = %e, "Next-hop port lookup failed");
                None
            }
            Err(e) => return Err(e),
        };
        self.next_hop_ports.insert(*next_hop, port.clone());
        Ok(port)
    }
}
