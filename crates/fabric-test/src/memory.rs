//! In-memory fabric with fault injection.
//!
//! Implements the router, port and security group APIs over shared state.
//! Every API call yields to the scheduler first so concurrent callers
//! interleave the way they would against a remote fabric.

use async_trait::async_trait;
use fabric_api::{
    AllowedAddressPair, FabricError, FabricResult, NetworkId, Port, PortApi, PortFilter, PortId,
    PortUpdate, RouteTableEntry, Router, RouterApi, RouterId, RuleFilter, RuleId, RuleSpec,
    SecurityGroup, SecurityGroupApi, SecurityGroupId, SecurityGroupRule,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Optional features the fabric advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricOptions {
    pub atomic_routes: bool,
    pub allowed_address_pairs: bool,
}

impl FabricOptions {
    /// Whole-table route updates, allowed-address-pairs supported.
    pub fn classical() -> Self {
        Self {
            atomic_routes: false,
            allowed_address_pairs: true,
        }
    }

    /// Incremental route updates, allowed-address-pairs supported.
    pub fn atomic() -> Self {
        Self {
            atomic_routes: true,
            allowed_address_pairs: true,
        }
    }
}

impl Default for FabricOptions {
    fn default() -> Self {
        Self::classical()
    }
}

/// Kinds of fabric API call, as recorded by [`MemoryFabric::calls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FabricCall {
    GetRouter,
    UpdateRoutes,
    AddRoutes,
    RemoveRoutes,
    ListAttachedNetworks,
    ListPorts,
    GetPort,
    UpdatePort,
    CreateGroup,
    LookupGroup,
    ListRules,
    CreateRule,
    DeleteRule,
}

impl FabricCall {
    /// Returns true if the call changes fabric state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            FabricCall::UpdateRoutes
                | FabricCall::AddRoutes
                | FabricCall::RemoveRoutes
                | FabricCall::UpdatePort
                | FabricCall::CreateGroup
                | FabricCall::CreateRule
                | FabricCall::DeleteRule
        )
    }
}

/// Observable port state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortState {
    pub security_groups: BTreeSet<SecurityGroupId>,
    pub allowed_address_pairs: BTreeSet<AllowedAddressPair>,
}

/// Order-insensitive view of everything the reconciler can change.
///
/// Rules are compared by content since a re-created rule gets a new ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricSnapshot {
    pub routes: BTreeMap<RouterId, BTreeSet<RouteTableEntry>>,
    pub groups: BTreeSet<String>,
    pub rules: BTreeSet<String>,
    pub ports: BTreeMap<PortId, PortState>,
}

#[derive(Default)]
struct FabricState {
    routers: BTreeMap<RouterId, Router>,
    networks: BTreeMap<RouterId, Vec<NetworkId>>,
    ports: BTreeMap<PortId, Port>,
    groups: Vec<SecurityGroup>,
    rules: BTreeMap<RuleId, SecurityGroupRule>,
    next_id: u64,
    calls: Vec<FabricCall>,
    mutations: usize,
    fail_at_mutation: Option<usize>,
    queued_failures: HashMap<FabricCall, VecDeque<FabricError>>,
}

impl FabricState {
    fn allocate(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", kind, self.next_id)
    }

    fn router_mut(&mut self, id: &RouterId) -> FabricResult<&mut Router> {
        self.routers
            .get_mut(id)
            .ok_or_else(|| FabricError::not_found(format!("router {}", id)))
    }

    fn port_mut(&mut self, id: &PortId) -> FabricResult<&mut Port> {
        self.ports
            .get_mut(id)
            .ok_or_else(|| FabricError::not_found(format!("port {}", id)))
    }
}

/// Shared in-memory fabric. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryFabric {
    options: FabricOptions,
    state: Arc<Mutex<FabricState>>,
}

impl MemoryFabric {
    pub fn new(options: FabricOptions) -> Self {
        Self {
            options,
            state: Arc::default(),
        }
    }

    pub fn options(&self) -> FabricOptions {
        self.options
    }

    // ------------------------------------------------------------------
    // Seeding and inspection; none of these count as API calls.
    // ------------------------------------------------------------------

    /// Adds a router with interfaces on `networks`.
    pub fn add_router(&self, id: &str, networks: &[&str]) -> RouterId {
        let id = RouterId::new(id);
        let mut state = self.state.lock();
        state.routers.insert(
            id.clone(),
            Router {
                id: id.clone(),
                name: id.to_string(),
                routes: Vec::new(),
            },
        );
        state
            .networks
            .insert(id.clone(), networks.iter().map(|n| NetworkId::new(*n)).collect());
        id
    }

    /// Puts an entry straight into a router's table.
    pub fn seed_route(&self, router: &RouterId, entry: RouteTableEntry) {
        if let Some(router) = self.state.lock().routers.get_mut(router) {
            router.routes.push(entry);
        }
    }

    pub fn add_port(&self, port: Port) -> PortId {
        let id = port.id.clone();
        self.state.lock().ports.insert(id.clone(), port);
        id
    }

    pub fn set_port_security(&self, port: &PortId, enabled: bool) {
        if let Some(port) = self.state.lock().ports.get_mut(port) {
            port.port_security_enabled = enabled;
        }
    }

    pub fn seed_group(&self, name: &str) -> SecurityGroupId {
        let mut state = self.state.lock();
        let id = SecurityGroupId::new(state.allocate("sg"));
        state.groups.push(SecurityGroup {
            id: id.clone(),
            name: name.to_string(),
            description: String::new(),
        });
        id
    }

    pub fn seed_rule(&self, spec: RuleSpec) -> RuleId {
        let mut state = self.state.lock();
        let id = RuleId::new(state.allocate("rule"));
        state.rules.insert(
            id.clone(),
            SecurityGroupRule {
                id: id.clone(),
                spec,
            },
        );
        id
    }

    pub fn router(&self, id: &RouterId) -> Option<Router> {
        self.state.lock().routers.get(id).cloned()
    }

    pub fn port(&self, id: &PortId) -> Option<Port> {
        self.state.lock().ports.get(id).cloned()
    }

    pub fn groups(&self) -> Vec<SecurityGroup> {
        self.state.lock().groups.clone()
    }

    pub fn rules(&self) -> Vec<SecurityGroupRule> {
        self.state.lock().rules.values().cloned().collect()
    }

    /// Rules of `group` with their remote prefix rendered, sorted.
    pub fn rule_prefixes(&self, group: &SecurityGroupId) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .state
            .lock()
            .rules
            .values()
            .filter(|rule| &rule.spec.security_group_id == group)
            .filter_map(|rule| rule.spec.remote_ip_prefix.map(|p| p.to_string()))
            .collect();
        prefixes.sort();
        prefixes
    }

    pub fn snapshot(&self) -> FabricSnapshot {
        let state = self.state.lock();
        FabricSnapshot {
            routes: state
                .routers
                .iter()
                .map(|(id, router)| (id.clone(), router.routes.iter().copied().collect()))
                .collect(),
            groups: state.groups.iter().map(|g| g.name.clone()).collect(),
            rules: state
                .rules
                .values()
                .map(|rule| format!("{}: {}", rule.spec.security_group_id, rule.spec))
                .collect(),
            ports: state
                .ports
                .iter()
                .map(|(id, port)| {
                    (
                        id.clone(),
                        PortState {
                            security_groups: port.security_groups.clone(),
                            allowed_address_pairs: port
                                .allowed_address_pairs
                                .iter()
                                .cloned()
                                .collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Call accounting and fault injection.
    // ------------------------------------------------------------------

    /// Every API call made so far, in order.
    pub fn calls(&self) -> Vec<FabricCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, call: FabricCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Number of mutating calls attempted so far, failed ones included.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }

    /// Forgets recorded calls and mutation counts.
    pub fn reset_counters(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.mutations = 0;
        state.fail_at_mutation = None;
    }

    /// Makes the `n`-th mutating call from now fail without applying.
    pub fn fail_nth_mutation(&self, n: usize) {
        let mut state = self.state.lock();
        state.fail_at_mutation = Some(state.mutations + n);
    }

    /// Makes the next call of kind `call` fail with `error`.
    pub fn fail_next(&self, call: FabricCall, error: FabricError) {
        self.state
            .lock()
            .queued_failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.fail_at_mutation = None;
        state.queued_failures.clear();
    }

    /// Records `call`, applies any injected fault and locks the state.
    async fn enter(&self, call: FabricCall) -> FabricResult<MutexGuard<'_, FabricState>> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.calls.push(call);
        if let Some(error) = state
            .queued_failures
            .get_mut(&call)
            .and_then(|queue| queue.pop_front())
        {
            debug!(?call, %error, "Injected fabric failure");
            return Err(error);
        }
        if call.is_mutation() {
            state.mutations += 1;
            if state.fail_at_mutation == Some(state.mutations) {
                debug!(?call, mutation = state.mutations, "Injected fabric failure");
                return Err(FabricError::transport(format!(
                    "injected failure of mutation #{}",
                    state.mutations
                )));
            }
        }
        Ok(state)
    }
}

fn same_rule_content(a: &RuleSpec, b: &RuleSpec) -> bool {
    let lower = |p: &Option<String>| p.as_ref().map(|p| p.to_ascii_lowercase());
    a.security_group_id == b.security_group_id
        && a.direction == b.direction
        && a.ether_type == b.ether_type
        && lower(&a.protocol) == lower(&b.protocol)
        && a.remote_ip_prefix == b.remote_ip_prefix
        && a.remote_group_id == b.remote_group_id
        && a.port_range_min == b.port_range_min
        && a.port_range_max == b.port_range_max
}

#[async_trait]
impl RouterApi for MemoryFabric {
    async fn get_router(&self, id: &RouterId) -> FabricResult<Router> {
        let mut state = self.enter(FabricCall::GetRouter).await?;
        state.router_mut(id).map(|r| r.clone())
    }

    async fn update_routes(
        &self,
        id: &RouterId,
        routes: Vec<RouteTableEntry>,
    ) -> FabricResult<Router> {
        let mut state = self.enter(FabricCall::UpdateRoutes).await?;
        let router = state.router_mut(id)?;
        router.routes = routes;
        Ok(router.clone())
    }

    async fn list_attached_networks(&self, id: &RouterId) -> FabricResult<Vec<NetworkId>> {
        let state = self.enter(FabricCall::ListAttachedNetworks).await?;
        state
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| FabricError::not_found(format!("router {}", id)))
    }

    async fn supports_atomic_routes(&self) -> FabricResult<bool> {
        Ok(self.options.atomic_routes)
    }

    async fn add_routes(&self, id: &RouterId, routes: &[RouteTableEntry]) -> FabricResult<Router> {
        if !self.options.atomic_routes {
            return Err(FabricError::not_supported("atomic route update"));
        }
        let mut state = self.enter(FabricCall::AddRoutes).await?;
        let router = state.router_mut(id)?;
        for entry in routes {
            if !router.routes.contains(entry) {
                router.routes.push(*entry);
            }
        }
        Ok(router.clone())
    }

    async fn remove_routes(
        &self,
        id: &RouterId,
        routes: &[RouteTableEntry],
    ) -> FabricResult<Router> {
        if !self.options.atomic_routes {
            return Err(FabricError::not_supported("atomic route update"));
        }
        let mut state = self.enter(FabricCall::RemoveRoutes).await?;
        let router = state.router_mut(id)?;
        router.routes.retain(|entry| !routes.contains(entry));
        Ok(router.clone())
    }
}

#[async_trait]
impl PortApi for MemoryFabric {
    async fn list_ports(&self, filter: &PortFilter) -> FabricResult<Vec<Port>> {
        let state = self.enter(FabricCall::ListPorts).await?;
        Ok(state
            .ports
            .values()
            .filter(|port| filter.matches(port))
            .cloned()
            .collect())
    }

    async fn get_port(&self, id: &PortId) -> FabricResult<Port> {
        let mut state = self.enter(FabricCall::GetPort).await?;
        state.port_mut(id).map(|p| p.clone())
    }

    async fn update_port(&self, id: &PortId, update: &PortUpdate) -> FabricResult<Port> {
        if update.allowed_address_pairs.is_some() && !self.options.allowed_address_pairs {
            return Err(FabricError::not_supported("allowed-address-pairs"));
        }
        let mut state = self.enter(FabricCall::UpdatePort).await?;
        let port = state.port_mut(id)?;
        if let Some(groups) = &update.security_groups {
            port.security_groups = groups.clone();
        }
        if let Some(pairs) = &update.allowed_address_pairs {
            port.allowed_address_pairs = pairs.clone();
        }
        Ok(port.clone())
    }

    async fn supports_allowed_address_pairs(&self) -> FabricResult<bool> {
        Ok(self.options.allowed_address_pairs)
    }
}

#[async_trait]
impl SecurityGroupApi for MemoryFabric {
    async fn create_group(&self, name: &str, description: &str) -> FabricResult<SecurityGroup> {
        let mut state = self.enter(FabricCall::CreateGroup).await?;
        let group = SecurityGroup {
            id: SecurityGroupId::new(state.allocate("sg")),
            name: name.to_string(),
            description: description.to_string(),
        };
        state.groups.push(group.clone());
        Ok(group)
    }

    async fn lookup_group_by_name(&self, name: &str) -> FabricResult<Option<SecurityGroup>> {
        let state = self.enter(FabricCall::LookupGroup).await?;
        Ok(state.groups.iter().find(|g| g.name == name).cloned())
    }

    async fn list_rules(&self, filter: &RuleFilter) -> FabricResult<Vec<SecurityGroupRule>> {
        let state = self.enter(FabricCall::ListRules).await?;
        Ok(state
            .rules
            .values()
            .filter(|rule| filter.matches(rule))
            .cloned()
            .collect())
    }

    async fn create_rule(&self, spec: &RuleSpec) -> FabricResult<SecurityGroupRule> {
        let mut state = self.enter(FabricCall::CreateRule).await?;
        if !state.groups.iter().any(|g| g.id == spec.security_group_id) {
            return Err(FabricError::not_found(format!(
                "security group {}",
                spec.security_group_id
            )));
        }
        if state
            .rules
            .values()
            .any(|rule| same_rule_content(&rule.spec, spec))
        {
            return Err(FabricError::conflict(format!("rule {}", spec)));
        }

        let rule = SecurityGroupRule {
            id: RuleId::new(state.allocate("rule")),
            spec: spec.clone(),
        };
        state.rules.insert(rule.id.clone(), rule.clone());
        Ok(rule)
    }

    async fn delete_rule(&self, id: &RuleId) -> FabricResult<()> {
        let mut state = self.enter(FabricCall::DeleteRule).await?;
        state
            .rules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FabricError::not_found(format!("rule {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_types::IpFamily;
    use pretty_assertions::assert_eq;

    fn entry(dest: &str, nh: &str) -> RouteTableEntry {
        RouteTableEntry::new(dest.parse().unwrap(), nh.parse().unwrap())
    }

    #[tokio::test]
    async fn test_fail_nth_mutation_skips_reads() {
        let fabric = MemoryFabric::new(FabricOptions::atomic());
        let router = fabric.add_router("r1", &["net-a"]);
        fabric.fail_nth_mutation(2);

        fabric.get_router(&router).await.unwrap();
        fabric
            .add_routes(&router, &[entry("10.244.1.0/24", "192.168.1.5")])
            .await
            .unwrap();
        let err = fabric
            .add_routes(&router, &[entry("10.244.2.0/24", "192.168.1.6")])
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(fabric.mutation_count(), 2);
        assert_eq!(fabric.router(&router).unwrap().routes.len(), 1);

        // Only the one call fails.
        fabric
            .add_routes(&router, &[entry("10.244.2.0/24", "192.168.1.6")])
            .await
            .unwrap();
        assert_eq!(fabric.router(&router).unwrap().routes.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_by_kind() {
        let fabric = MemoryFabric::default();
        let router = fabric.add_router("r1", &[]);
        fabric.fail_next(FabricCall::GetRouter, FabricError::not_found("router r1"));

        assert!(fabric.get_router(&router).await.unwrap_err().is_not_found());
        assert!(fabric.get_router(&router).await.is_ok());
        assert_eq!(fabric.call_count(FabricCall::GetRouter), 2);
    }

    #[tokio::test]
    async fn test_classical_rejects_incremental_updates() {
        let fabric = MemoryFabric::new(FabricOptions::classical());
        let router = fabric.add_router("r1", &[]);
        let err = fabric
            .add_routes(&router, &[entry("10.244.1.0/24", "192.168.1.5")])
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NotSupported { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_rule_conflicts_and_missing_rule_not_found() {
        let fabric = MemoryFabric::default();
        let group = fabric.seed_group("nodes");
        let spec = RuleSpec::ingress(group.clone(), IpFamily::V4)
            .with_protocol("TCP")
            .with_remote_prefix("10.244.1.0/24".parse().unwrap());

        let rule = fabric.create_rule(&spec).await.unwrap();
        let again = spec.clone().with_protocol("tcp");
        assert!(fabric.create_rule(&again).await.unwrap_err().is_conflict());

        fabric.delete_rule(&rule.id).await.unwrap();
        assert!(fabric.delete_rule(&rule.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rule_needs_existing_group() {
        let fabric = MemoryFabric::default();
        let spec = RuleSpec::ingress(SecurityGroupId::new("missing"), IpFamily::V4);
        assert!(fabric.create_rule(&spec).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_snapshot_ignores_order_and_rule_ids() {
        let fabric = MemoryFabric::default();
        let router = fabric.add_router("r1", &[]);
        let a = entry("10.244.1.0/24", "192.168.1.5");
        let b = entry("10.244.2.0/24", "192.168.1.6");
        fabric.update_routes(&router, vec![a, b]).await.unwrap();
        let group = fabric.seed_group("nodes");
        let spec = RuleSpec::ingress(group, IpFamily::V4);
        let id = fabric.seed_rule(spec.clone());
        let before = fabric.snapshot();

        fabric.update_routes(&router, vec![b, a]).await.unwrap();
        fabric.delete_rule(&id).await.unwrap();
        fabric.create_rule(&spec).await.unwrap();

        assert_eq!(fabric.snapshot(), before);
    }
}
