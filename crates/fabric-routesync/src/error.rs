//! Error types for route synchronization.

use fabric_api::{FabricError, NetworkId};
use fabric_types::{IpAddress, IpFamily};
use thiserror::Error;

/// Error type for route synchronization operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteSyncError {
    /// The node cache has not finished its initial sync.
    #[error("node cache has not synced yet")]
    NodeCacheNotSynced,

    /// The target node has no internal address of the route's family.
    #[error("no {family} internal address found for node {node}")]
    NoAddressFound { node: String, family: IpFamily },

    /// No port on any router-attached network owns the next hop.
    #[error("no port found for address {address}")]
    PortNotFound { address: IpAddress },

    /// More than one port on a network owns the next hop.
    #[error("{count} ports own address {address} on network {network}")]
    AmbiguousPort {
        address: IpAddress,
        network: NetworkId,
        count: usize,
    },

    /// The route request itself is unusable.
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {field}: {message}")]
    InvalidConfig { field: String, message: String },

    /// A fabric call failed.
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

impl RouteSyncError {
    /// Creates a NoAddressFound error.
    pub fn no_address(node: impl Into<String>, family: IpFamily) -> Self {
        RouteSyncError::NoAddressFound {
            node: node.into(),
            family,
        }
    }

    /// Creates an InvalidConfig error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        RouteSyncError::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error was raised before any fabric mutation.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RouteSyncError::NodeCacheNotSynced
                | RouteSyncError::NoAddressFound { .. }
                | RouteSyncError::InvalidRoute(_)
                | RouteSyncError::InvalidConfig { .. }
        )
    }

    /// Returns true if the error came from port lookup.
    pub fn is_port_lookup(&self) -> bool {
        matches!(
            self,
            RouteSyncError::PortNotFound { .. } | RouteSyncError::AmbiguousPort { .. }
        )
    }

    /// Returns true if the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RouteSyncError::Fabric(e) if e.is_cancelled())
    }

    /// Returns true if retrying the whole operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RouteSyncError::NodeCacheNotSynced => true,
            RouteSyncError::Fabric(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type for route synchronization operations.
pub type Result<T> = std::result::Result<T, RouteSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RouteSyncError::NodeCacheNotSynced.is_precondition());
        assert!(RouteSyncError::no_address("worker-1", IpFamily::V6).is_precondition());

        let lookup = RouteSyncError::PortNotFound {
            address: "192.168.1.5".parse().unwrap(),
        };
        assert!(lookup.is_port_lookup());
        assert!(!lookup.is_precondition());

        let cancelled = RouteSyncError::from(FabricError::Cancelled);
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_port_lookup());
    }

    #[test]
    fn test_fabric_errors_are_transparent() {
        let err = RouteSyncError::from(FabricError::not_found("router r1"));
        assert_eq!(err.to_string(), "resource not found: router r1");
    }

    #[test]
    fn test_no_address_message() {
        let err = RouteSyncError::no_address("worker-1", IpFamily::V4);
        assert_eq!(
            err.to_string(),
            "no IPv4 internal address found for node worker-1"
        );
    }
}
