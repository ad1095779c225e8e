//! The cluster coordinator's consumed interface (spec §6) and the events it
//! delivers to a [`ClusterListener`]. The coordinator's own implementation
//! (e.g. a ZooKeeper-backed one) is an external collaborator; this module
//! only defines the trait seam, the way the teacher crate defines
//! `Transport` as a seam to its own external collaborator.

use crate::error::Error;
use crate::node::Node;
use std::sync::Arc;

/// Events the coordinator delivers to a registered listener.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    Connected(Vec<Arc<Node>>),
    NodesChanged(Vec<Arc<Node>>),
    Disconnected,
    Shutdown,
}

/// A listener callback registered with [`ClusterCoordinator::add_listener`].
/// Invoked on coordinator-callback threads/tasks; must be short-lived and
/// must not hold locks the I/O or worker pools acquire (spec §5).
pub type ListenerFn = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

/// An opaque handle returned by `add_listener`, passed back to
/// `remove_listener` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(pub u64);

/// The cluster coordinator interface this crate consumes (spec §6). Kept
/// as an async trait so real implementations can do network I/O in
/// `start`/`await_connection`/the mutation calls.
#[async_trait::async_trait]
pub trait ClusterCoordinator: Send + Sync {
    async fn start(&self) -> Result<(), Error>;
    async fn await_connection(&self) -> Result<(), Error>;

    async fn node_by_id(&self, id: u64) -> Option<Arc<Node>>;
    async fn node_by_url(&self, host: &str, port: u16) -> Option<Arc<Node>>;

    async fn mark_node_available(&self, id: u64, capability: u64) -> Result<(), Error>;
    async fn mark_node_unavailable(&self, id: u64) -> Result<(), Error>;
    async fn set_node_capability(&self, id: u64, capability: u64) -> Result<(), Error>;

    fn add_listener(&self, listener: ListenerFn) -> ListenerKey;
    fn remove_listener(&self, key: ListenerKey);
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    //! An in-memory `ClusterCoordinator` double for tests: tracks every
    //! `mark_node_available`/`mark_node_unavailable` call it receives and
    //! lets tests fire events synchronously.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    pub struct FakeCoordinator {
        nodes: Mutex<HashMap<u64, Arc<Node>>>,
        listeners: Mutex<HashMap<u64, ListenerFn>>,
        next_key: AtomicU64,
        pub available_calls: Mutex<Vec<(u64, u64)>>,
        pub unavailable_calls: Mutex<Vec<u64>>,
    }

    impl FakeCoordinator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_node(self, node: Node) -> Self {
            self.nodes.lock().insert(node.id, Arc::new(node));
            self
        }

        pub fn fire(&self, event: ClusterEvent) {
            for listener in self.listeners.lock().values() {
                listener(event.clone());
            }
        }
    }

    #[async_trait::async_trait]
    impl ClusterCoordinator for FakeCoordinator {
        async fn start(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn await_connection(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn node_by_id(&self, id: u64) -> Option<Arc<Node>> {
            self.nodes.lock().get(&id).cloned()
        }

        async fn node_by_url(&self, host: &str, port: u16) -> Option<Arc<Node>> {
            let url = format!("{host}:{port}");
            self.nodes.lock().values().find(|n| n.url == url).cloned()
        }

        async fn mark_node_available(&self, id: u64, capability: u64) -> Result<(), Error> {
            self.available_calls.lock().push((id, capability));
            Ok(())
        }

        async fn mark_node_unavailable(&self, id: u64) -> Result<(), Error> {
            self.unavailable_calls.lock().push(id);
            Ok(())
        }

        async fn set_node_capability(&self, _id: u64, _capability: u64) -> Result<(), Error> {
            Ok(())
        }

        fn add_listener(&self, listener: ListenerFn) -> ListenerKey {
            let key = self.next_key.fetch_add(1, Ordering::Relaxed);
            self.listeners.lock().insert(key, listener);
            ListenerKey(key)
        }

        fn remove_listener(&self, key: ListenerKey) {
            self.listeners.lock().remove(&key.0);
        }
    }
}
