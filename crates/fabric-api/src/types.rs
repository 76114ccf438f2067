//! Type-safe fabric resource ID wrappers.
//!
//! Fabric resources are identified by opaque strings (usually UUIDs). This
//! module wraps them in distinct types so a port ID can never be passed
//! where a security group ID is expected.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Marker trait for fabric resource kinds.
pub trait ResourceKind: Send + Sync + 'static {
    /// Returns the resource type name for debugging.
    fn type_name() -> &'static str;
}

/// A type-safe fabric resource ID.
///
/// # Examples
///
/// ```
/// use fabric_api::{PortId, SecurityGroupId};
///
/// let port = PortId::new("0b3c2b7e-port");
/// let group = SecurityGroupId::new("5d1e9f00-group");
///
/// // This would fail to compile:
/// // fn takes_port(p: &PortId) {}
/// // takes_port(&group);
/// assert_eq!(port.as_str(), "0b3c2b7e-port");
/// assert_eq!(group.to_string(), "5d1e9f00-group");
/// ```
#[derive(Serialize, Deserialize)]
#[serde(transparent, bound = "")]
pub struct FabricId<T: ResourceKind> {
    raw: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: ResourceKind> FabricId<T> {
    /// Creates an ID from its raw string form.
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            _marker: PhantomData,
        }
    }

    /// Returns the raw ID.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if the ID is empty (never assigned by the fabric).
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl<T: ResourceKind> Clone for FabricId<T> {
    fn clone(&self) -> Self {
        Self::new(self.raw.clone())
    }
}

impl<T: ResourceKind> fmt::Debug for FabricId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", T::type_name(), self.raw)
    }
}

impl<T: ResourceKind> fmt::Display for FabricId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl<T: ResourceKind> PartialEq for FabricId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: ResourceKind> Eq for FabricId<T> {}

impl<T: ResourceKind> PartialOrd for FabricId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ResourceKind> Ord for FabricId<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T: ResourceKind> Hash for FabricId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: ResourceKind> Default for FabricId<T> {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl<T: ResourceKind> From<&str> for FabricId<T> {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl<T: ResourceKind> From<String> for FabricId<T> {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

// ============================================================================
// Resource Kind Markers
// ============================================================================

macro_rules! define_resource_kind {
    ($name:ident, $type_name:literal, $id_alias:ident) => {
        #[doc = concat!("Marker type for fabric ", $type_name, " resources.")]
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl ResourceKind for $name {
            fn type_name() -> &'static str {
                $type_name
            }
        }

        #[doc = concat!("Type-safe ID of a fabric ", $type_name, ".")]
        pub type $id_alias = FabricId<$name>;
    };
}

define_resource_kind!(RouterKind, "router", RouterId);
define_resource_kind!(NetworkKind, "network", NetworkId);
define_resource_kind!(PortKind, "port", PortId);
define_resource_kind!(SecurityGroupKind, "security_group", SecurityGroupId);
define_resource_kind!(RuleKind, "security_group_rule", RuleId);
