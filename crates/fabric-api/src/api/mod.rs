//! Interfaces to the external collaborators.
//!
//! Each submodule pairs the data model of one fabric resource with the
//! async trait through which it is read and mutated:
//!
//! - [`router`]: Router route table (whole-table and atomic updates)
//! - [`port`]: Port lookup and security-group / allowed-address-pair updates
//! - [`security_group`]: Security groups and their rules
//! - [`node`]: The orchestrator's locally cached node list
//!
//! Implementations own transport, authentication and timeouts. None of the
//! traits retry internally.

pub mod node;
pub mod port;
pub mod router;
pub mod security_group;

pub use node::{Node, NodeAddress, NodeAddressType, NodeCache, NodeSelector};
pub use port::{AllowedAddressPair, Port, PortApi, PortFilter, PortUpdate};
pub use router::{RouteTableEntry, Router, RouterApi};
pub use security_group::{
    RuleDirection, RuleFilter, RuleSpec, SecurityGroup, SecurityGroupApi, SecurityGroupRule,
};
