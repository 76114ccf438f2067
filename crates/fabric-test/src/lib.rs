//! Test infrastructure for the route synchronizer.
//!
//! Provides:
//! - An in-memory fabric with call accounting and fault injection
//! - A node cache tests can mutate
//! - Fixtures for a standard two-worker cluster

pub mod fixtures;
pub mod memory;
pub mod nodes;

pub use fixtures::*;
pub use memory::{FabricCall, FabricOptions, FabricSnapshot, MemoryFabric, PortState};
pub use nodes::StaticNodeCache;
