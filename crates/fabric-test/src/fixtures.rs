//! Reusable cluster fixtures.
//!
//! The standard cluster is one router on `net-a` and two workers:
//!
//! | node     | internal IP | pod CIDR      | port          |
//! |----------|-------------|---------------|---------------|
//! | worker-1 | 192.168.1.5 | 10.244.1.0/24 | port-worker-1 |
//! | worker-2 | 192.168.1.6 | 10.244.2.0/24 | port-worker-2 |

use fabric_api::{NetworkId, Node, NodeAddress, Port, PortId, RouterId};
use fabric_types::{IpAddress, IpPrefix};
use std::collections::BTreeSet;
use tracing_subscriber::EnvFilter;

use crate::memory::{FabricOptions, MemoryFabric};
use crate::nodes::StaticNodeCache;

pub const ROUTER: &str = "router-1";
pub const NETWORK: &str = "net-a";
pub const CLUSTER: &str = "prod";
/// Node group name for [`CLUSTER`] under the default prefix.
pub const NODE_GROUP: &str = "routesync-prod-nodes";

/// Routes test logs through the test harness' captured output.
///
/// Honors `RUST_LOG`; defaults to debug for the synchronizer crates.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fabric_routesync=debug,fabric_test=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Parses a prefix literal.
pub fn prefix(s: &str) -> IpPrefix {
    s.parse()
        .unwrap_or_else(|e| panic!("bad prefix literal {:?}: {}", s, e))
}

/// Parses an address literal.
pub fn addr(s: &str) -> IpAddress {
    s.parse()
        .unwrap_or_else(|e| panic!("bad address literal {:?}: {}", s, e))
}

/// A node with one internal IP and one pod CIDR.
pub fn worker(name: &str, ip: &str, pod_cidr: &str) -> Node {
    Node::new(name)
        .with_address(NodeAddress::internal_ip(ip))
        .with_pod_cidr(prefix(pod_cidr))
}

/// A port with one fixed IP and port security on.
pub fn port(id: &str, network: &str, ip: &str) -> Port {
    Port {
        id: PortId::new(id),
        network_id: NetworkId::new(network),
        fixed_ips: vec![addr(ip)],
        security_groups: BTreeSet::new(),
        allowed_address_pairs: Vec::new(),
        port_security_enabled: true,
    }
}

/// Fabric and node cache of the standard two-worker cluster.
#[derive(Clone)]
pub struct Cluster {
    pub fabric: MemoryFabric,
    pub nodes: StaticNodeCache,
    pub router: RouterId,
}

impl Cluster {
    pub fn two_workers(options: FabricOptions) -> Self {
        let fabric = MemoryFabric::new(options);
        let router = fabric.add_router(ROUTER, &[NETWORK]);
        fabric.add_port(port("port-worker-1", NETWORK, "192.168.1.5"));
        fabric.add_port(port("port-worker-2", NETWORK, "192.168.1.6"));

        let nodes = StaticNodeCache::new(vec![
            worker("worker-1", "192.168.1.5", "10.244.1.0/24"),
            worker("worker-2", "192.168.1.6", "10.244.2.0/24"),
        ]);

        Self {
            fabric,
            nodes,
            router,
        }
    }

    pub fn worker_port(&self, n: usize) -> PortId {
        PortId::new(format!("port-worker-{}", n))
    }

    pub fn worker_port_state(&self, n: usize) -> Port {
        self.fabric
            .port(&self.worker_port(n))
            .unwrap_or_else(|| panic!("port-worker-{} missing", n))
    }

    /// Current route table as `(destination, next hop)` strings.
    pub fn table(&self) -> Vec<(String, String)> {
        self.fabric
            .router(&self.router)
            .map(|router| {
                router
                    .routes
                    .iter()
                    .map(|e| (e.destination.to_string(), e.next_hop.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}
