//! Process-wide index of advertised services
//!
//! A service is a remote (or sibling) node's declared intent to consume one
//! `(group, topic)` subject over a specific transport. The registry is shared
//! by every node in the process and refreshed by register/unregister/leave
//! system messages.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use log::debug;
use serde::{Deserialize, Serialize};

/// What kind of payloads the service consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    /// Regular framed messages on the main bus
    NormalMessage,
    /// Notices pointing into a large-data channel
    LargeData,
}

/// Transport a service is reachable over, in ascending priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    /// Same-process sibling, served by the router fast path
    InProcess,
    /// Datagram fallback (kept in the model; no socket transport in core)
    Udp,
    /// Shared-memory segment delivery
    SharedMemory,
}

/// One advertised `(node, group, topic)` consumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub node_id: String,
    pub group: String,
    pub topic: String,
    pub service_type: ServiceType,
    pub transport: TransportKind,
    /// Large-data channel the service reads, when applicable
    pub channel_name: Option<String>,
    /// Datagram endpoint, when the transport is UDP
    pub udp_endpoint: Option<SocketAddr>,
}

/// Payload of a SERVICE_REGISTER packet (bincode-encoded)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub service_type: ServiceType,
    pub transport: TransportKind,
    pub channel_name: Option<String>,
    pub udp_endpoint: Option<SocketAddr>,
}

/// Group-keyed service index shared by every node in the process
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Mutex<HashMap<String, Vec<ServiceDescriptor>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a descriptor
    ///
    /// Replacement is keyed on `(node_id, group, topic)`. When an entry
    /// already exists, a higher-priority transport replaces it, the same
    /// priority is a no-op and a lower priority is ignored.
    pub fn register(&self, descriptor: ServiceDescriptor) {
        let mut services = self.services.lock().unwrap();
        let entries = services.entry(descriptor.group.clone()).or_default();

        if let Some(existing) = entries
            .iter_mut()
            .find(|s| s.node_id == descriptor.node_id && s.topic == descriptor.topic)
        {
            if descriptor.transport > existing.transport {
                debug!(
                    "service ({}, {}, {}) upgraded {:?} -> {:?}",
                    descriptor.node_id,
                    descriptor.group,
                    descriptor.topic,
                    existing.transport,
                    descriptor.transport
                );
                *existing = descriptor;
            }
            return;
        }

        entries.push(descriptor);
    }

    /// Remove the descriptor matching `(node_id, group, topic)`
    pub fn unregister(&self, node_id: &str, group: &str, topic: &str) {
        let mut services = self.services.lock().unwrap();
        if let Some(entries) = services.get_mut(group) {
            entries.retain(|s| !(s.node_id == node_id && s.topic == topic));
            if entries.is_empty() {
                services.remove(group);
            }
        }
    }

    /// Remove every descriptor advertised by a node (leave or death)
    pub fn remove_node(&self, node_id: &str) {
        let mut services = self.services.lock().unwrap();
        services.retain(|_, entries| {
            entries.retain(|s| s.node_id != node_id);
            !entries.is_empty()
        });
    }

    /// Descriptors consuming `(group, topic)` with the given service type
    pub fn consumers(&self, group: &str, topic: &str, service_type: ServiceType) -> Vec<ServiceDescriptor> {
        let services = self.services.lock().unwrap();
        services
            .get(group)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|s| s.topic == topic && s.service_type == service_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every descriptor in a group, or in all groups for an empty filter
    pub fn find(&self, group: &str) -> Vec<ServiceDescriptor> {
        let services = self.services.lock().unwrap();
        if group.is_empty() {
            services.values().flatten().cloned().collect()
        } else {
            services.get(group).cloned().unwrap_or_default()
        }
    }

    /// Every descriptor advertised by one node
    pub fn by_node(&self, node_id: &str) -> Vec<ServiceDescriptor> {
        let services = self.services.lock().unwrap();
        services
            .values()
            .flatten()
            .filter(|s| s.node_id == node_id)
            .cloned()
            .collect()
    }

    /// Total descriptor count
    pub fn len(&self) -> usize {
        self.services.lock().unwrap().values().map(Vec::len).sum()
    }

    /// Whether the registry holds no descriptors
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every descriptor
    pub fn clear(&self) {
        self.services.lock().unwrap().clear();
    }
}
