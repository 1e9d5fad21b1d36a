//! Typed ID definitions for every stored kind.

use crate::define_id;

// =============================================================================
// Game server hierarchy
// =============================================================================

define_id!(FleetId, "flt");
define_id!(GameServerSetId, "gss");
define_id!(GameServerId, "gs");

// =============================================================================
// Allocation and scaling
// =============================================================================

define_id!(AllocationId, "gsa");
define_id!(AllocationPolicyId, "gsap");
define_id!(FleetAutoscalerId, "fas");

// =============================================================================
// Orchestrator objects
// =============================================================================

define_id!(PodId, "pod");
define_id!(NodeId, "node");
define_id!(SecretId, "sec");
define_id!(LeaseId, "lease");
define_id!(EventId, "evt");

// =============================================================================
// Sessions and requests
// =============================================================================

define_id!(
    /// One connection from an in-pod SDK agent.
    SdkSessionId,
    "sdk"
);
define_id!(RequestId, "req");

// =============================================================================
// Resource version
// =============================================================================

/// Optimistic-concurrency token of a stored object.
///
/// Versions are drawn from a single counter per store process, so a larger
/// version is always a later write. `ResourceVersion::NONE` marks an object
/// that has not been persisted yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// Version of an object that has never been written.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

// Serialized as a string, the way orchestrator APIs expose it.
impl serde::Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) if s.is_empty() => Ok(Self::NONE),
            Raw::Text(s) => s.parse().map(Self).map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
