//! Typed interfaces to the virtual-network fabric.
//!
//! This crate describes the external collaborators the route synchronizer
//! talks to, without binding to any particular transport:
//!
//! - [`types`]: Type-safe resource IDs (router, network, port, group, rule)
//! - [`error`]: Fabric status codes and the error taxonomy
//! - [`api`]: Async traits for the router, port and security-group APIs,
//!   plus the orchestrator-side node cache
//!
//! # Example
//!
//! ```ignore
//! use fabric_api::{RouterApi, RouterId, FabricResult};
//!
//! async fn table_len(routers: &dyn RouterApi, id: &RouterId) -> FabricResult<usize> {
//!     Ok(routers.get_router(id).await?.routes.len())
//! }
//! ```

pub mod api;
pub mod error;
pub mod types;

pub use api::{
    AllowedAddressPair, Node, NodeAddress, NodeAddressType, NodeCache, NodeSelector, Port,
    PortApi, PortFilter, PortUpdate, RouteTableEntry, Router, RouterApi, RuleDirection,
    RuleFilter, RuleSpec, SecurityGroup, SecurityGroupApi, SecurityGroupRule,
};
pub use error::{FabricError, FabricResult, FabricStatus};
pub use types::{
    FabricId, NetworkId, NetworkKind, PortId, PortKind, ResourceKind, RouterId, RouterKind,
    RuleId, RuleKind, SecurityGroupId, SecurityGroupKind,
};
