//! Common value types for virtual-network fabric orchestration.
//!
//! This crate provides type-safe representations of the network primitives
//! exchanged between the route synchronizer and the fabric API:
//!
//! - [`IpAddress`]: IPv4 and IPv6 addresses
//! - [`IpPrefix`]: IP network prefixes (CIDR notation)
//! - [`IpFamily`]: Address family selector used for node address lookups

mod ip;

pub use ip::{IpAddress, IpFamily, IpPrefix};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid address family: {0} (expected IPv4 or IPv6)")]
    InvalidIpFamily(String),
}
