//! Pod-CIDR route synchronization for a virtual-network fabric.
//!
//! Keeps a fabric router's static routes, the cluster's node security
//! group, and the next-hop ports' allowed-address-pairs in line with the
//! pod CIDRs assigned to cluster nodes.
//!
//! - [`reconciler`]: ListRoutes, CreateRoute and DeleteRoute
//! - [`controller`]: periodic passes that drive the reconciler
//! - [`table`]: classical (locked whole-table) and atomic route updates
//! - [`rules`]: security group rule diffing
//! - [`rollback`]: compensating actions for failed operations
//!
//! # Example
//!
//! ```ignore
//! use fabric_routesync::{FabricClients, Route, RouteReconciler, RouteSyncConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let config = RouteSyncConfig::new("router-1".into()).with_security_groups(true);
//! let reconciler =
//!     RouteReconciler::connect(config, FabricClients::from_backend(fabric), nodes, &cancel).await?;
//!
//! let route = Route::new("10.244.1.0/24".parse()?, "worker-1");
//! reconciler.create_route("prod", "worker-1", &route, &cancel).await?;
//! ```

mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod groups;
pub mod nodes;
pub mod ports;
pub mod reconciler;
pub mod rollback;
pub mod route;
pub mod rules;
pub mod table;

pub use config::{ControllerConfig, RouteSyncConfig};
pub use controller::{RouteController, SyncReport};
pub use error::{Result, RouteSyncError};
pub use groups::NodeSecurityGroup;
pub use nodes::NodeAddressResolver;
pub use reconciler::{FabricCapabilities, FabricClients, RouteReconciler};
pub use rollback::{RollbackStack, UndoAction, UndoExecutor};
pub use route::{Route, RouteIntent, RouteView};
pub use rules::{diff, same_rule, RuleDiff};
pub use table::{AtomicTable, ClassicalTable, RouteTableUpdater, TableUpdateMode};
