//! Node and Endpoint (spec §3).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cluster membership identity. `capability` is the dynamic feature
/// bitmask (can change at runtime via `markAvailable(cap)`);
/// `persistent_capability` is the static feature bitmask declared at
/// registration and does not change for the node's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: u64,
    pub url: String,
    pub partition_ids: BTreeSet<u32>,
    pub capability: u64,
    pub persistent_capability: u64,
}

impl Node {
    pub fn new(id: u64, url: impl Into<String>, partition_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            id,
            url: url.into(),
            partition_ids: partition_ids.into_iter().collect(),
            capability: 0,
            persistent_capability: 0,
        }
    }

    pub fn with_capability(mut self, capability: u64) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_persistent_capability(mut self, persistent_capability: u64) -> Self {
        self.persistent_capability = persistent_capability;
        self
    }

    /// `true` if `(capability & mask) == mask`, i.e. `mask` is a subset of
    /// this node's dynamic capability bits.
    pub fn satisfies_capability(&self, mask: u64) -> bool {
        (self.capability & mask) == mask
    }

    pub fn satisfies_persistent_capability(&self, mask: u64) -> bool {
        (self.persistent_capability & mask) == mask
    }
}

/// A connectable handle to a `Node` with an independently-mutable health
/// bit. Created when the cluster reports a node, destroyed on node
/// departure; `can_serve_requests` mutates outside of cluster membership
/// changes (e.g. a client observing a connection failure).
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub node: Arc<Node>,
    can_serve_requests: Arc<AtomicBool>,
}

impl Endpoint {
    pub fn new(node: Node) -> Self {
        Self {
            node: Arc::new(node),
            can_serve_requests: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn can_serve_requests(&self) -> bool {
        self.can_serve_requests.load(Ordering::Acquire)
    }

    pub fn set_can_serve_requests(&self, value: bool) {
        self.can_serve_requests.store(value, Ordering::Release);
    }
}
