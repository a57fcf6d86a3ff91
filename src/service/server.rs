use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{PrefixActions, SERVER_SEPARATOR};
use crate::protocol::handshake::ServerHandshake;
use crate::protocol::identity::ServerCredentials;
use crate::protocol::multiplexer::{Inbound, Multiplexer};
use crate::protocol::registry::Registry;
use crate::service::login::LoginPolicy;
use crate::service::peer::Peer;
use crate::service::pool::{DispatchPool, PoolStats, WorkItem};
use crate::service::worker::Router;
use crate::transport::{Channel, SessionChannel};
use crate::utils::metrics::Metrics;

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Accepts connections, runs the server handshake on each and feeds
/// decoded messages to the dispatch pool.
pub struct Server {
    config: ServerConfig,
    registry: Registry,
    credentials: ServerCredentials,
    actions: Arc<PrefixActions<Arc<Peer>>>,
    pool: DispatchPool<WorkItem>,
    metrics: Arc<Metrics>,
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    // One permit per connection, held from accept until the connection ends.
    slots: Arc<Semaphore>,
    accepting: AtomicBool,
    next_peer: AtomicU64,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        registry: Registry,
        credentials: ServerCredentials,
        login: Arc<dyn LoginPolicy>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let actions = Arc::new(PrefixActions::new(SERVER_SEPARATOR));
        let router = Arc::new(Router::new(actions.clone(), login, metrics.clone()));
        let pool = DispatchPool::new(
            config.workers,
            config.backlog_capacity,
            router,
            metrics.clone(),
        );
        let slots = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));
        Self {
            config,
            registry,
            credentials,
            actions,
            pool,
            metrics,
            peers: Mutex::new(HashMap::new()),
            slots,
            accepting: AtomicBool::new(false),
            next_peer: AtomicU64::new(1),
        }
    }

    /// Handlers for requests from logged-in peers, keyed by request prefix.
    pub fn actions(&self) -> &Arc<PrefixActions<Arc<Peer>>> {
        &self.actions
    }

    /// Resize the dispatch pool. Rejected with `PoolRunning` while accepting.
    pub fn configure_pool(&self, workers: usize, capacity: usize) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            return Err(ProtocolError::PoolRunning);
        }
        self.pool.configure(workers, capacity)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Accept connections until `shutdown_rx` fires, then close every peer
    /// and stop the pool.
    #[instrument(skip(self, listener, shutdown_rx), fields(address = ?listener.local_addr().ok()))]
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        self.pool.start()?;
        self.accepting.store(true, Ordering::SeqCst);
        info!("Server accepting connections");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutting down server. Closing connections...");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let Ok(slot) = self.slots.clone().try_acquire_owned() else {
                                warn!(%addr, limit = self.config.max_connections, "Connection limit reached, refusing");
                                drop(stream);
                                continue;
                            };
                            let server = self.clone();
                            tokio::spawn(async move { server.handle_connection(stream, slot).await });
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }

        self.accepting.store(false, Ordering::SeqCst);
        for peer in self.peers() {
            peer.close().await;
        }

        let deadline = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("Shutdown timeout reached, forcing exit");
                    break;
                }
                _ = tokio::time::sleep(DRAIN_POLL) => {
                    if self.peers.lock().is_empty() {
                        debug!("All connections closed");
                        break;
                    }
                }
            }
        }

        self.pool.shutdown().await;
        self.metrics.log_metrics();
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, _slot: OwnedSemaphorePermit) {
        let channel: Arc<dyn Channel> = Arc::new(SessionChannel::from_tcp(stream));
        let addr = channel.peer();

        self.metrics.handshake_attempt();
        let mut handshake = ServerHandshake::new(
            &self.registry,
            &self.credentials,
            self.config.handshake_timeout,
        );
        let established = match handshake.run(channel).await {
            Ok(established) => established,
            Err(e) => {
                self.metrics.handshake_failed();
                debug!(%addr, error = %e, "Connection dropped during handshake");
                return;
            }
        };
        self.metrics.handshake_success();
        self.metrics.connection_established();

        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let mux = Arc::new(Multiplexer::new(
            established.channel,
            established.codec,
            self.metrics.clone(),
        ));
        let peer = Arc::new(Peer::new(id, mux.clone()));
        self.peers.lock().insert(id, peer.clone());
        info!(peer = id, %addr, codec = %mux.codec_name(), "Peer connected");

        mux.run(|inbound| {
            let item = match inbound {
                Inbound::Reply {
                    id,
                    continuation,
                    payload,
                } => WorkItem {
                    peer: peer.clone(),
                    id,
                    payload,
                    continuation: Some(continuation),
                },
                Inbound::Unsolicited { id, payload } => WorkItem {
                    peer: peer.clone(),
                    id,
                    payload,
                    continuation: None,
                },
            };
            if let Err(e) = self.pool.enqueue(item) {
                warn!(peer = peer.id(), error = %e, "Dropping inbound message");
            }
        })
        .await;

        self.peers.lock().remove(&id);
        self.metrics.connection_closed();
        info!(peer = id, %addr, "Peer disconnected");
    }
}
