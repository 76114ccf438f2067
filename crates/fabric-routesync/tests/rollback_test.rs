//! Failure atomicity: a CreateRoute or DeleteRoute that fails part way
//! leaves the fabric as it found it.

use async_trait::async_trait;
use fabric_api::{
    FabricError, FabricResult, NetworkId, RouteTableEntry, Router, RouterApi, RouterId,
    RuleFilter, RuleId, RuleSpec, SecurityGroup, SecurityGroupApi, SecurityGroupRule,
};
use fabric_routesync::{FabricClients, Route, RouteReconciler, RouteSyncConfig, RouteSyncError};
use fabric_test::{
    addr, init_logging, prefix, Cluster, FabricCall, FabricOptions, MemoryFabric, CLUSTER,
    NODE_GROUP, ROUTER,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn connect(cluster: &Cluster) -> RouteReconciler {
    connect_with(cluster, FabricClients::from_backend(Arc::new(cluster.fabric.clone()))).await
}

async fn connect_with(cluster: &Cluster, clients: FabricClients) -> RouteReconciler {
    init_logging();
    let config = RouteSyncConfig::new(ROUTER.into()).with_security_groups(true);
    RouteReconciler::connect(
        config,
        clients,
        Arc::new(cluster.nodes.clone()),
        &CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn route() -> Route {
    Route::new(prefix("10.244.1.0/24"), "worker-1")
}

/// Mutations a successful create issues on a cluster with the node group seeded.
async fn create_mutations(options: FabricOptions) -> usize {
    let cluster = Cluster::two_workers(options);
    cluster.fabric.seed_group(NODE_GROUP);
    let reconciler = connect(&cluster).await;
    reconciler
        .create_route(CLUSTER, "worker-1", &route(), &CancellationToken::new())
        .await
        .unwrap();
    cluster.fabric.mutation_count()
}

async fn assert_create_atomic(options: FabricOptions) {
    let total = create_mutations(options).await;
    assert_eq!(total, 5, "table entry, two rules, two port updates");

    for n in 1..=total {
        let cluster = Cluster::two_workers(options);
        cluster.fabric.seed_group(NODE_GROUP);
        let reconciler = connect(&cluster).await;
        let before = cluster.fabric.snapshot();
        cluster.fabric.fail_nth_mutation(n);

        let err = reconciler
            .create_route(CLUSTER, "worker-1", &route(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(
            matches!(err, RouteSyncError::Fabric(FabricError::Transport { .. })),
            "mutation {}: {:?}",
            n,
            err
        );
        assert_eq!(cluster.fabric.snapshot(), before, "failing mutation {}", n);
    }
}

async fn assert_delete_atomic(options: FabricOptions) {
    for n in 1..=3 {
        let cluster = Cluster::two_workers(options);
        cluster.fabric.seed_group(NODE_GROUP);
        let reconciler = connect(&cluster).await;
        let cancel = CancellationToken::new();
        reconciler
            .create_route(CLUSTER, "worker-1", &route(), &cancel)
            .await
            .unwrap();
        let before = cluster.fabric.snapshot();
        cluster.fabric.reset_counters();
        cluster.fabric.fail_nth_mutation(n);

        let err = reconciler
            .delete_route(CLUSTER, &route(), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_retryable(), "mutation {}: {:?}", n, err);
        assert_eq!(cluster.fabric.snapshot(), before, "failing mutation {}", n);
    }
}

#[tokio::test]
async fn test_create_rolls_back_at_every_step_classical() {
    assert_create_atomic(FabricOptions::classical()).await;
}

#[tokio::test]
async fn test_create_rolls_back_at_every_step_atomic() {
    assert_create_atomic(FabricOptions::atomic()).await;
}

#[tokio::test]
async fn test_delete_rolls_back_at_every_step_classical() {
    assert_delete_atomic(FabricOptions::classical()).await;
}

#[tokio::test]
async fn test_delete_rolls_back_at_every_step_atomic() {
    assert_delete_atomic(FabricOptions::atomic()).await;
}

#[tokio::test]
async fn test_successful_create_issues_no_compensation() {
    let cluster = Cluster::two_workers(FabricOptions::classical());
    cluster.fabric.seed_group(NODE_GROUP);
    let reconciler = connect(&cluster).await;

    reconciler
        .create_route(CLUSTER, "worker-1", &route(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cluster.fabric.call_count(FabricCall::DeleteRule), 0);
    assert_eq!(cluster.fabric.call_count(FabricCall::UpdateRoutes), 1);
    assert_eq!(cluster.fabric.call_count(FabricCall::UpdatePort), 2);
}

#[tokio::test]
async fn test_rollback_keeps_preexisting_state() {
    let cluster = Cluster::two_workers(FabricOptions::classical());
    cluster.fabric.seed_group(NODE_GROUP);
    let reconciler = connect(&cluster).await;
    let cancel = CancellationToken::new();
    // The node rule already exists from an earlier route via worker-1.
    reconciler
        .create_route(
            CLUSTER,
            "worker-1",
            &Route::new(prefix("10.244.11.0/24"), "worker-1"),
            &cancel,
        )
        .await
        .unwrap();
    let before = cluster.fabric.snapshot();
    cluster.fabric.fail_next(
        FabricCall::UpdatePort,
        FabricError::transport("connection reset"),
    );

    reconciler
        .create_route(CLUSTER, "worker-1", &route(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(cluster.fabric.snapshot(), before);
    assert_eq!(cluster.table().len(), 1);
}

#[tokio::test]
async fn test_undo_failure_keeps_triggering_error() {
    let cluster = Cluster::two_workers(FabricOptions::classical());
    cluster.fabric.seed_group(NODE_GROUP);
    let reconciler = connect(&cluster).await;
    // Fail the last port update, then the rule delete the unwind issues.
    cluster.fabric.fail_nth_mutation(5);
    cluster
        .fabric
        .fail_next(FabricCall::DeleteRule, FabricError::transport("unwind failed"));

    let err = reconciler
        .create_route(CLUSTER, "worker-1", &route(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RouteSyncError::Fabric(FabricError::transport("injected failure of mutation #5"))
    );
    // The unwind carried on past the failed step.
    assert!(cluster.table().is_empty());
    assert!(cluster.worker_port_state(1).allowed_address_pairs.is_empty());
}

/// Security group API that cancels a token once the first rule is created.
struct CancelAfterRule {
    inner: MemoryFabric,
    cancel: CancellationToken,
}

#[async_trait]
impl SecurityGroupApi for CancelAfterRule {
    async fn create_group(&self, name: &str, description: &str) -> FabricResult<SecurityGroup> {
        self.inner.create_group(name, description).await
    }

    async fn lookup_group_by_name(&self, name: &str) -> FabricResult<Option<SecurityGroup>> {
        self.inner.lookup_group_by_name(name).await
    }

    async fn list_rules(&self, filter: &RuleFilter) -> FabricResult<Vec<SecurityGroupRule>> {
        self.inner.list_rules(filter).await
    }

    async fn create_rule(&self, spec: &RuleSpec) -> FabricResult<SecurityGroupRule> {
        let rule = self.inner.create_rule(spec).await?;
        self.cancel.cancel();
        Ok(rule)
    }

    async fn delete_rule(&self, id: &RuleId) -> FabricResult<()> {
        self.inner.delete_rule(id).await
    }
}

#[tokio::test]
async fn test_cancelled_create_keeps_committed_steps() {
    let cluster = Cluster::two_workers(FabricOptions::classical());
    cluster.fabric.seed_group(NODE_GROUP);
    let cancel = CancellationToken::new();
    let backend = Arc::new(cluster.fabric.clone());
    let clients = FabricClients {
        routers: backend.clone(),
        ports: backend,
        security_groups: Arc::new(CancelAfterRule {
            inner: cluster.fabric.clone(),
            cancel: cancel.clone(),
        }),
    };
    let reconciler = connect_with(&cluster, clients).await;

    let err = reconciler
        .create_route(CLUSTER, "worker-1", &route(), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(cluster.table().len(), 1);
    assert_eq!(cluster.fabric.rules().len(), 1);
    assert_eq!(cluster.fabric.call_count(FabricCall::DeleteRule), 0);
    assert_eq!(cluster.fabric.call_count(FabricCall::UpdatePort), 0);

    // A fresh attempt converges the rest.
    reconciler
        .create_route(CLUSTER, "worker-1", &route(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(cluster.fabric.rules().len(), 2);
    assert!(cluster
        .worker_port_state(1)
        .has_allowed_address(&prefix("10.244.1.0/24")));
}

#[tokio::test]
async fn test_precancelled_operation_makes_no_calls() {
    let cluster = Cluster::two_workers(FabricOptions::classical());
    let reconciler = connect(&cluster).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = reconciler
        .create_route(CLUSTER, "worker-1", &route(), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(cluster.fabric.calls().is_empty());
}

/// Router API where another writer adds `entry` right after the first read.
struct ConcurrentWriter {
    inner: MemoryFabric,
    router: RouterId,
    entry: RouteTableEntry,
    written: AtomicBool,
}

#[async_trait]
impl RouterApi for ConcurrentWriter {
    async fn get_router(&self, id: &RouterId) -> FabricResult<Router> {
        let router = self.inner.get_router(id).await?;
        if !self.written.swap(true, Ordering::SeqCst) {
            self.inner.seed_route(&self.router, self.entry);
        }
        Ok(router)
    }

    async fn update_routes(
        &self,
        id: &RouterId,
        routes: Vec<RouteTableEntry>,
    ) -> FabricResult<Router> {
        self.inner.update_routes(id, routes).await
    }

    async fn list_attached_networks(&self, id: &RouterId) -> FabricResult<Vec<NetworkId>> {
        self.inner.list_attached_networks(id).await
    }

    async fn supports_atomic_routes(&self) -> FabricResult<bool> {
        self.inner.supports_atomic_routes().await
    }

    async fn add_routes(&self, id: &RouterId, routes: &[RouteTableEntry]) -> FabricResult<Router> {
        self.inner.add_routes(id, routes).await
    }

    async fn remove_routes(
        &self,
        id: &RouterId,
        routes: &[RouteTableEntry],
    ) -> FabricResult<Router> {
        self.inner.remove_routes(id, routes).await
    }
}

async fn assert_rollback_keeps_entry_added_by_other_writer(options: FabricOptions) {
    let cluster = Cluster::two_workers(options);
    cluster.fabric.seed_group(NODE_GROUP);
    let entry = RouteTableEntry::new(prefix("10.244.1.0/24"), addr("192.168.1.5"));
    let backend = Arc::new(cluster.fabric.clone());
    let clients = FabricClients {
        routers: Arc::new(ConcurrentWriter {
            inner: cluster.fabric.clone(),
            router: cluster.router.clone(),
            entry,
            written: AtomicBool::new(false),
        }),
        ports: backend.clone(),
        security_groups: backend,
    };
    let reconciler = connect_with(&cluster, clients).await;
    cluster.fabric.fail_next(
        FabricCall::UpdatePort,
        FabricError::transport("connection reset"),
    );

    let err = reconciler
        .create_route(CLUSTER, "worker-1", &route(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RouteSyncError::Fabric(FabricError::transport("connection reset"))
    );
    // The entry belongs to the other writer, so the unwind leaves it.
    assert_eq!(
        cluster.table(),
        vec![("10.244.1.0/24".to_string(), "192.168.1.5".to_string())]
    );
    assert_eq!(cluster.fabric.call_count(FabricCall::UpdateRoutes), 0);
    assert_eq!(cluster.fabric.call_count(FabricCall::AddRoutes), 0);
    assert_eq!(cluster.fabric.call_count(FabricCall::RemoveRoutes), 0);
    assert!(cluster.fabric.rules().is_empty());
}

#[tokio::test]
async fn test_rollback_keeps_entry_added_by_other_writer_atomic() {
    assert_rollback_keeps_entry_added_by_other_writer(FabricOptions::atomic()).await;
}

#[tokio::test]
async fn test_rollback_keeps_entry_added_by_other_writer_classical() {
    assert_rollback_keeps_entry_added_by_other_writer(FabricOptions::classical()).await;
}
