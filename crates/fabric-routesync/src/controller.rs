//! Periodic route controller.
//!
//! Each pass derives the wanted routes from the nodes' pod CIDRs, lists the
//! routes the reconciler reports, and issues the creates and deletes that
//! close the gap. Operations within a pass run concurrently up to a bound.
//!
//! A listed route is only deleted when its destination is claimed by a node
//! or lies inside a configured cluster CIDR. Everything else on the router
//! belongs to someone else.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::error::{Result, RouteSyncError};
use crate::reconciler::RouteReconciler;
use crate::route::Route;

/// Outcome of one controller pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl SyncReport {
    /// Returns true if the pass changed nothing and hit no errors.
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.deleted == 0 && self.failed == 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} deleted={} failed={}",
            self.created, self.deleted, self.failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteOp {
    Create,
    Delete,
}

/// Drives a [`RouteReconciler`] towards the node cache's pod CIDRs.
pub struct RouteController {
    reconciler: Arc<RouteReconciler>,
    cluster_name: String,
    config: ControllerConfig,
}

impl RouteController {
    pub fn new(reconciler: Arc<RouteReconciler>, cluster_name: impl Into<String>) -> Self {
        let config = reconciler.config().controller.clone();
        if config.cluster_cidrs.is_empty() {
            info!("No cluster CIDRs configured, routes of departed nodes will be kept");
        }
        Self {
            reconciler,
            cluster_name: cluster_name.into(),
            config,
        }
    }

    /// Routes the node cache asks for, one per node pod CIDR.
    pub fn desired_routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = self
            .reconciler
            .nodes()
            .nodes()
            .into_iter()
            .flat_map(|node| {
                node.pod_cidrs
                    .iter()
                    .map(|cidr| Route::new(*cidr, node.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        routes.sort();
        routes.dedup();
        routes
    }

    /// Runs one reconciliation pass.
    #[instrument(skip(self, cancel), fields(cluster = %self.cluster_name))]
    pub async fn sync_once(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        if !self.reconciler.nodes().has_synced() {
            return Err(RouteSyncError::NodeCacheNotSynced);
        }

        let desired = self.desired_routes();
        let listed = self
            .reconciler
            .list_routes(&self.cluster_name, cancel)
            .await?;

        let present: HashSet<&Route> = listed.iter().filter(|r| !r.blackhole).collect();
        let wanted: HashSet<&Route> = desired.iter().collect();
        let claimed: HashSet<_> = desired.iter().map(|r| r.destination).collect();

        let deletes: Vec<(RouteOp, Route)> = listed
            .iter()
            .filter(|route| route.blackhole || !wanted.contains(route))
            .filter(|route| {
                claimed.contains(&route.destination)
                    || self.config.owns_destination(&route.destination)
            })
            .map(|route| (RouteOp::Delete, route.clone()))
            .collect();
        let creates: Vec<(RouteOp, Route)> = desired
            .iter()
            .filter(|route| !present.contains(route))
            .map(|route| (RouteOp::Create, route.clone()))
            .collect();

        debug!(
            desired = desired.len(),
            listed = listed.len(),
            deletes = deletes.len(),
            creates = creates.len(),
            "Planned route operations"
        );

        // A stale route and its replacement share per-destination rules and
        // port state, so deletes finish before creates start.
        let mut report = SyncReport::default();
        self.apply_ops(deletes, &mut report, cancel).await?;
        self.apply_ops(creates, &mut report, cancel).await?;

        if report.is_noop() {
            debug!("Routes in sync");
        } else {
            info!(%report, "Route sync pass complete");
        }
        Ok(report)
    }

    async fn apply_ops(
        &self,
        ops: Vec<(RouteOp, Route)>,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let outcomes: Vec<(RouteOp, Route, Result<()>)> = stream::iter(ops)
            .map(|(op, route)| async move {
                let result = match op {
                    RouteOp::Create => {
                        self.reconciler
                            .create_route(&self.cluster_name, &route.target_node, &route, cancel)
                            .await
                    }
                    RouteOp::Delete => {
                        self.reconciler
                            .delete_route(&self.cluster_name, &route, cancel)
                            .await
                    }
                };
                (op, route, result)
            })
            .buffer_unordered(self.config.max_concurrent_routes.max(1))
            .collect()
            .await;

        for (op, route, result) in outcomes {
            match (op, result) {
                (RouteOp::Create, Ok(())) => report.created += 1,
                (RouteOp::Delete, Ok(())) => report.deleted += 1,
                (_, Err(e)) if e.is_cancelled() => return Err(e),
                (op, Err(e)) => {
                    report.failed += 1;
                    warn!(route = %route, op = ?op, error = %e, "Route operation failed");
                }
            }
        }
        Ok(())
    }

    /// Runs passes every `sync_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            cluster = %self.cluster_name,
            interval_secs = self.config.sync_interval_secs,
            "Starting route controller"
        );
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sync_once(&cancel).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => break,
                Err(RouteSyncError::NodeCacheNotSynced) => {
                    debug!("Node cache not synced yet, waiting for next pass");
                }
                Err(e) => warn!(error = %e, "Route sync pass failed"),
            }
        }

        info!(cluster = %self.cluster_name, "Route controller stopped");
        Ok(())
    }
}
