//! In-process fast path: registry of live nodes in this process
//!
//! The router holds non-owning handles so a dropped node can never dangle;
//! lookups upgrade on demand and dead entries are purged opportunistically.

use std::collections::HashMap;
use std::sync::{RwLock, Weak};

/// Seam between the router and the node runtime
///
/// Publish-side fan-out only needs subject matching and the sibling's enqueue
/// path; going through the enqueue path (never the raw callback) keeps the
/// sibling's worker-queue ordering and overflow policies in force.
pub trait InProcessEndpoint: Send + Sync {
    /// Stable node identifier
    fn endpoint_id(&self) -> &str;
    /// Whether the node currently subscribes to `(group, topic)`
    fn matches_subscription(&self, group: &str, topic: &str) -> bool;
    /// Hand one message to the node's bounded work queue
    fn enqueue_delivery(&self, source_node_id: &str, group: &str, topic: &str, payload: &[u8]);
}

/// Process-local registry of live node handles keyed by node id
#[derive(Default)]
pub struct InProcessRouter {
    nodes: RwLock<HashMap<String, Weak<dyn InProcessEndpoint>>>,
}

impl InProcessRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node handle; replaces any dead entry under the same id
    pub fn register(&self, node_id: &str, endpoint: Weak<dyn InProcessEndpoint>) {
        let mut nodes = self.nodes.write().unwrap();
        nodes.insert(node_id.to_string(), endpoint);
    }

    /// Remove a node's entry
    pub fn unregister(&self, node_id: &str) {
        let mut nodes = self.nodes.write().unwrap();
        nodes.remove(node_id);
    }

    /// Whether a live node with this id exists in the process
    pub fn contains(&self, node_id: &str) -> bool {
        let nodes = self.nodes.read().unwrap();
        nodes
            .get(node_id)
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Upgrade a node handle by id
    pub fn find(&self, node_id: &str) -> Option<std::sync::Arc<dyn InProcessEndpoint>> {
        let nodes = self.nodes.read().unwrap();
        nodes.get(node_id).and_then(Weak::upgrade)
    }

    /// Snapshot every live node handle, purging dead entries
    pub fn live_nodes(&self) -> Vec<std::sync::Arc<dyn InProcessEndpoint>> {
        let mut stale = Vec::new();
        let live = {
            let nodes = self.nodes.read().unwrap();
            let mut live = Vec::with_capacity(nodes.len());
            for (id, weak) in nodes.iter() {
                match weak.upgrade() {
                    Some(node) => live.push(node),
                    None => stale.push(id.clone()),
                }
            }
            live
        };

        if !stale.is_empty() {
            let mut nodes = self.nodes.write().unwrap();
            for id in stale {
                // Re-check: the id may have been re-registered meanwhile
                if let Some(weak) = nodes.get(&id) {
                    if weak.strong_count() == 0 {
                        nodes.remove(&id);
                    }
                }
            }
        }

        live
    }

    /// Number of registered (possibly dead) entries
    pub fn len(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    /// Whether the router has no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
