//! NetworkServer lifecycle (spec §4.7): bind, register with the cluster,
//! mark available/unavailable, drain shutdown. The state machine mirrors
//! the teacher's pattern of confining all mutable lifecycle state behind
//! one lock rather than scattering flags across the struct (spec §9:
//! "model as a single mutable ServerState variant guarded by a mutex").

use crate::cluster::{ClusterCoordinator, ClusterEvent, ListenerKey};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{ExecutorConfig, MessageExecutor};
use crate::filter::FilterChain;
use crate::pipeline::ChannelPipeline;
use crate::registry::HandlerRegistry;
use crate::stats::RequestStatistics;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;

/// Lifecycle state (spec §3 `ServerState`). `Bound` carries the node the
/// server registered as and whether a coordinator reconnect should restore
/// availability.
enum ServerState {
    Unbound,
    Bound {
        node_id: u64,
        mark_when_connected: bool,
        listener_key: ListenerKey,
        acceptor: tokio::task::JoinHandle<()>,
    },
    ShuttingDown,
    ShutDown,
}

/// Bind/availability state machine wrapping a [`MessageExecutor`] and a
/// [`ClusterCoordinator`]. One `NetworkServer` corresponds to one node's
/// presence in the cluster.
pub struct NetworkServer {
    coordinator: Arc<dyn ClusterCoordinator>,
    executor: MessageExecutor,
    registry: HandlerRegistry,
    config: Config,
    state: Mutex<ServerState>,
    shutdown_started: AtomicBool,
    self_weak: Weak<NetworkServer>,
}

impl NetworkServer {
    /// Built via `Arc::new_cyclic` so lifecycle methods can hand a `'static`
    /// `Arc<Self>` to spawned tasks (the acceptor loop, the cluster listener
    /// closure) without requiring callers to hold an `Arc` themselves.
    pub fn new(config: Config, coordinator: Arc<dyn ClusterCoordinator>) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let registry = HandlerRegistry::new();
            let stats = Arc::new(RequestStatistics::new(config.request_statistics_window_ms));
            let executor = MessageExecutor::new(
                ExecutorConfig::from(&config),
                registry.clone(),
                FilterChain::new(vec![]),
                stats,
                config.request_timeout(),
            );
            Self {
                coordinator,
                executor,
                registry,
                config,
                state: Mutex::new(ServerState::Unbound),
                shutdown_started: AtomicBool::new(false),
                self_weak: weak.clone(),
            }
        })
    }

    /// Upgrades the server's own weak self-reference. Only fails if called
    /// during construction, which none of our code paths do.
    fn arc_self(&self) -> Arc<Self> {
        self.self_weak.upgrade().expect("NetworkServer dropped while still in use")
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &MessageExecutor {
        &self.executor
    }

    /// Binds to `node_id`: looks the node up in the coordinator, starts a
    /// TCP acceptor on its declared port, registers a cluster listener, and
    /// transitions `Unbound -> Bound`.
    pub async fn bind(&self, node_id: u64, mark_available: bool, initial_capability: u64) -> Result<()> {
        {
            let state = self.state.lock();
            match &*state {
                ServerState::Unbound => {}
                ServerState::Bound { .. } => return Err(Error::AlreadyBound),
                ServerState::ShuttingDown | ServerState::ShutDown => return Err(Error::NetworkShutdown),
            }
        }

        let node = self
            .coordinator
            .node_by_id(node_id)
            .await
            .ok_or_else(|| Error::InvalidNode(node_id.to_string()))?;

        let port = node
            .url
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| Error::InvalidNode(node.url.clone()))?;

        let listener = bind_wildcard(port).await?;

        let this = self.arc_self();
        let acceptor = tokio::spawn(async move { this.accept_loop(listener).await });

        let this = self.arc_self();
        let listener_key = self.coordinator.add_listener(Arc::new(move |event| this.on_cluster_event(event)));

        if mark_available {
            self.coordinator
                .mark_node_available(node_id, initial_capability)
                .await
                .map_err(|e| Error::ClusterUnavailable(e.to_string()))?;
        }

        *self.state.lock() = ServerState::Bound {
            node_id,
            mark_when_connected: mark_available,
            listener_key,
            acceptor,
        };
        tracing::info!(
            node_id,
            port,
            at = %humantime::format_rfc3339(std::time::SystemTime::now()),
            "server bound"
        );
        Ok(())
    }

    /// Resolves `host:port` against the current cluster snapshot, then
    /// binds as `bind` does.
    pub async fn bind_by_url(&self, host: &str, port: u16, mark_available: bool, initial_capability: u64) -> Result<()> {
        let node = self
            .coordinator
            .node_by_url(host, port)
            .await
            .ok_or_else(|| Error::InvalidNode(format!("{host}:{port}")))?;
        self.bind(node.id, mark_available, initial_capability).await
    }

    /// Resolves the local canonical hostname, then `bind_by_url`.
    pub async fn bind_by_port(&self, port: u16, mark_available: bool, initial_capability: u64) -> Result<()> {
        let host = local_canonical_hostname();
        self.bind_by_url(&host, port, mark_available, initial_capability).await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };
            if let Err(err) = socket.set_nodelay(true) {
                tracing::warn!(error = %err, "failed to set TCP_NODELAY");
            }
            tracing::debug!(%peer, "accepted connection");

            let request_timeout = self.config.request_timeout();
            let service_timeout = self.config.response_generation_timeout();
            let executor = self.executor.clone();

            tokio::spawn(async move {
                let (read_half, write_half) = socket.into_split();
                let reader = crate::codec::FrameReader::new(read_half);
                let pipeline = ChannelPipeline::new(executor, request_timeout, service_timeout);
                pipeline.run(reader, write_half).await;
                tracing::debug!(%peer, "connection closed");
            });
        }
    }

    /// Marks the bound node available with `capability`, and remembers the
    /// intent so a future `Connected` event restores it (spec §4.7).
    pub async fn mark_available(&self, capability: u64) -> Result<()> {
        let node_id = self.bound_node_id()?;
        self.coordinator
            .mark_node_available(node_id, capability)
            .await
            .map_err(|e| Error::ClusterUnavailable(e.to_string()))?;
        self.set_mark_when_connected(true);
        Ok(())
    }

    pub async fn mark_unavailable(&self) -> Result<()> {
        let node_id = self.bound_node_id()?;
        self.coordinator
            .mark_node_unavailable(node_id)
            .await
            .map_err(|e| Error::ClusterUnavailable(e.to_string()))?;
        self.set_mark_when_connected(false);
        Ok(())
    }

    fn bound_node_id(&self) -> Result<u64> {
        match &*self.state.lock() {
            ServerState::Bound { node_id, .. } => Ok(*node_id),
            ServerState::Unbound => Err(Error::NetworkShutdown),
            ServerState::ShuttingDown | ServerState::ShutDown => Err(Error::NetworkShutdown),
        }
    }

    fn set_mark_when_connected(&self, value: bool) {
        if let ServerState::Bound { mark_when_connected, .. } = &mut *self.state.lock() {
            *mark_when_connected = value;
        }
    }

    /// Cluster listener reaction (spec §4.7): on `Connected`, forces a
    /// brief unavailable/available transition so coordinator watchers
    /// observe a change, if `mark_when_connected` is set. On `Shutdown`,
    /// initiates a cluster-triggered shutdown.
    fn on_cluster_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::Connected(_) => {
                let (node_id, mark_when_connected) = match &*self.state.lock() {
                    ServerState::Bound { node_id, mark_when_connected, .. } => (*node_id, *mark_when_connected),
                    _ => return,
                };
                if mark_when_connected {
                    let this = self.arc_self();
                    tokio::spawn(async move {
                        if let Err(err) = this.coordinator.mark_node_unavailable(node_id).await {
                            tracing::error!(error = %err, "mark_node_unavailable failed during reconnect sequence");
                            return;
                        }
                        if let Err(err) = this.coordinator.mark_node_available(node_id, 0).await {
                            tracing::error!(error = %err, "mark_node_available failed during reconnect sequence");
                        }
                    });
                }
            }
            ClusterEvent::Shutdown => {
                let this = self.arc_self();
                tokio::spawn(async move {
                    this.do_shutdown(true).await;
                });
            }
            ClusterEvent::NodesChanged(_) | ClusterEvent::Disconnected => {}
        }
    }

    /// User-initiated shutdown (spec §4.7). Idempotent: a second call is a
    /// no-op (spec §8 invariant 6).
    pub async fn shutdown(&self) {
        self.do_shutdown(false).await;
    }

    async fn do_shutdown(&self, from_cluster: bool) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let (node_id, mark_when_connected, listener_key, acceptor) = {
            let mut state = self.state.lock();
            let taken = std::mem::replace(&mut *state, ServerState::ShuttingDown);
            match taken {
                ServerState::Bound { node_id, mark_when_connected, listener_key, acceptor } => {
                    (Some(node_id), mark_when_connected, Some(listener_key), Some(acceptor))
                }
                _ => (None, false, None, None),
            }
        };

        if !from_cluster {
            if let Some(node_id) = node_id {
                if self.config.shutdown_pause_multiplier > 0 && mark_when_connected {
                    if let Err(err) = self.coordinator.mark_node_unavailable(node_id).await {
                        tracing::error!(error = %err, "mark_node_unavailable failed during shutdown");
                    }
                    tokio::time::sleep(self.config.shutdown_pause()).await;
                }
            }
            if let Some(key) = listener_key {
                self.coordinator.remove_listener(key);
            }
        }

        if let Some(acceptor) = acceptor {
            acceptor.abort();
        }

        self.executor.shutdown();
        *self.state.lock() = ServerState::ShutDown;
        tracing::info!(from_cluster, "server shut down");
    }
}

/// Binds the wildcard address with `SO_REUSEADDR` set before `listen` (spec
/// §6 TCP options), via `std::net::TcpListener` + `set_reuse_address`
/// (stable even without a socket-options crate) handed off to tokio.
async fn bind_wildcard(port: u16) -> Result<TcpListener> {
    use socket2::{Domain, Socket, Type};
    let address = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(Error::NetworkBind)?;
    socket.set_reuse_address(true).map_err(Error::NetworkBind)?;
    socket.set_nonblocking(true).map_err(Error::NetworkBind)?;
    socket.bind(&address.into()).map_err(Error::NetworkBind)?;
    socket.listen(1024).map_err(Error::NetworkBind)?;
    TcpListener::from_std(socket.into()).map_err(Error::NetworkBind)
}

/// No canonical-hostname crate is pulled in for this one call site; `bind`
/// only needs *some* name the coordinator's node URLs were registered
/// under, and most deployments bind by node id or explicit host anyway.
fn local_canonical_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
