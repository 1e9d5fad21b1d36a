//! Orchestrator objects: pods, nodes, secrets and leases.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleetplane_id::{LeaseId, NodeId, PodId, SecretId};
use serde::{Deserialize, Serialize};

use crate::common::SchedulingStrategy;
use crate::gameserver::Protocol;
use crate::meta::{impl_resource, ObjectMeta};

// =============================================================================
// Pods
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Placement hint for the scheduler.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
}

impl PodSpec {
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.containers
            .iter()
            .flat_map(|c| c.ports.iter().filter_map(|p| p.host_port))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl_resource!(Pod, "Pod", PodId);

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeAddressType {
    ExternalDNS,
    ExternalIP,
    InternalDNS,
    InternalIP,
    Hostname,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub kind: NodeAddressType,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<NodeAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl_resource!(Node, "Node", NodeId);

impl Node {
    pub fn new(name: impl Into<String>, external_ip: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named("", name),
            spec: NodeSpec::default(),
            status: NodeStatus {
                addresses: vec![NodeAddress {
                    kind: NodeAddressType::ExternalIP,
                    address: external_ip.into(),
                }],
            },
        }
    }

    /// Address players connect to: external DNS, then external IP, then
    /// internal IP.
    pub fn public_address(&self) -> Option<&str> {
        [
            NodeAddressType::ExternalDNS,
            NodeAddressType::ExternalIP,
            NodeAddressType::InternalIP,
        ]
        .iter()
        .find_map(|kind| {
            self.status
                .addresses
                .iter()
                .find(|a| a.kind == *kind)
                .map(|a| a.address.as_str())
        })
    }
}

// =============================================================================
// Secrets and leases
// =============================================================================

/// String data keyed by file name (PEM material for peer TLS).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl_resource!(Secret, "Secret", SecretId);

impl Secret {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    pub lease_duration_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_transitions: u32,
}

/// Leader-election record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub metadata: ObjectMeta,
    pub spec: LeaseSpec,
}

impl_resource!(Lease, "Lease", LeaseId);

impl Lease {
    /// Whether the current holder's claim has run out at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.spec.renew_time {
            Some(renewed) => {
                now > renewed + chrono::Duration::seconds(i64::from(self.spec.lease_duration_seconds))
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_address_preference() {
        let mut node = Node::new("n1", "203.0.113.7");
        node.status.addresses.insert(
            0,
            NodeAddress {
                kind: NodeAddressType::InternalIP,
                address: "10.0.0.7".into(),
            },
        );
        assert_eq!(node.public_address(), Some("203.0.113.7"));
        node.status.addresses.retain(|a| a.kind == NodeAddressType::InternalIP);
        assert_eq!(node.public_address(), Some("10.0.0.7"));
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = Lease {
            metadata: ObjectMeta::named("ns", "leader"),
            spec: LeaseSpec {
                holder_identity: Some("a".into()),
                lease_duration_seconds: 15,
                renew_time: Some(now),
                ..Default::default()
            },
        };
        assert!(!lease.is_expired(now + chrono::Duration::seconds(10)));
        assert!(lease.is_expired(now + chrono::Duration::seconds(16)));
    }
}
