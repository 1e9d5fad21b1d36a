//! Multi-cluster allocation policy kind.

use fleetplane_id::AllocationPolicyId;
use serde::{Deserialize, Serialize};

use crate::meta::{impl_resource, ObjectMeta};

/// Where and how to reach one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConnectionInfo {
    pub cluster_name: String,

    /// Base URLs of the peer's allocation service, tried in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocation_endpoints: Vec<String>,

    /// Secret holding the client certificate (`tls.crt`, `tls.key`) and,
    /// optionally, the peer CA (`ca.crt`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_name: String,

    /// Namespace the request is forwarded into on the peer.
    pub namespace: String,

    /// PEM CA for the peer; overrides `ca.crt` from the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ca: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPolicySpec {
    /// Lower values are tried first.
    pub priority: u32,

    /// Relative chance of going first within a priority.
    pub weight: u32,

    pub connection_info: ClusterConnectionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPolicy {
    pub metadata: ObjectMeta,
    pub spec: AllocationPolicySpec,
}

impl_resource!(AllocationPolicy, "GameServerAllocationPolicy", AllocationPolicyId, spec);
