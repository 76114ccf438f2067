//! Router route-table API.
//!
//! A router owns an ordered list of static routes. Classical backends only
//! expose that list as a whole (`update_routes`); backends with the atomic
//! capability also accept single-entry `add_routes` / `remove_routes`.

use async_trait::async_trait;
use fabric_types::{IpAddress, IpPrefix};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FabricError, FabricResult};
use crate::types::{NetworkId, RouterId};

/// One entry of a router's route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteTableEntry {
    /// Destination CIDR.
    pub destination: IpPrefix,
    /// Next-hop address.
    #[serde(rename = "nexthop")]
    pub next_hop: IpAddress,
}

impl RouteTableEntry {
    /// Creates a new route table entry.
    pub fn new(destination: IpPrefix, next_hop: IpAddress) -> Self {
        Self {
            destination,
            next_hop,
        }
    }
}

impl fmt::Display for RouteTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.destination, self.next_hop)
    }
}

/// A fabric router as returned by `get_router`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: RouterId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub routes: Vec<RouteTableEntry>,
}

impl Router {
    /// Returns true if the table holds exactly this (destination, next-hop) pair.
    pub fn has_route(&self, entry: &RouteTableEntry) -> bool {
        self.routes.contains(entry)
    }

    /// Returns the entries whose destination is `destination`.
    pub fn routes_to<'a>(
        &'a self,
        destination: &'a IpPrefix,
    ) -> impl Iterator<Item = &'a RouteTableEntry> + 'a {
        self.routes
            .iter()
            .filter(move |entry| &entry.destination == destination)
    }
}

/// Router API consumed by the route synchronizer.
#[async_trait]
pub trait RouterApi: Send + Sync {
    /// Reads the router, including its full route table.
    async fn get_router(&self, id: &RouterId) -> FabricResult<Router>;

    /// Replaces the whole route table.
    async fn update_routes(
        &self,
        id: &RouterId,
        routes: Vec<RouteTableEntry>,
    ) -> FabricResult<Router>;

    /// Lists the networks the router has interfaces on.
    async fn list_attached_networks(&self, id: &RouterId) -> FabricResult<Vec<NetworkId>>;

    /// Reports whether the fabric accepts incremental route updates.
    async fn supports_atomic_routes(&self) -> FabricResult<bool> {
        Ok(false)
    }

    /// Adds entries without touching the rest of the table.
    ///
    /// Entries already present are left as they are.
    async fn add_routes(
        &self,
        _id: &RouterId,
        _routes: &[RouteTableEntry],
    ) -> FabricResult<Router> {
        Err(FabricError::not_supported("atomic route update"))
    }

    /// Removes entries without touching the rest of the table.
    ///
    /// Entries already absent are ignored.
    async fn remove_routes(
        &self,
        _id: &RouterId,
        _routes: &[RouteTableEntry],
    ) -> FabricResult<Router> {
        Err(FabricError::not_supported("atomic route update"))
    }
}
