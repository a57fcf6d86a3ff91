//! Name resolution channel.
//!
//! A resolution channel lives for exactly one exchange: the client sends a
//! name, the name service answers with the address registered for it (or an
//! empty frame when the name is unknown), and both sides close.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::{Channel, SessionChannel};
use crate::error::{constants, ProtocolError, Result};

/// Short-lived channel used to map a name to a connection address.
pub struct ResolutionChannel {
    inner: SessionChannel<TcpStream>,
}

impl ResolutionChannel {
    /// Connect to a name service.
    pub async fn open(resolver: &str) -> Result<Self> {
        Ok(Self {
            inner: SessionChannel::connect(resolver).await?,
        })
    }

    /// Perform the single request/response exchange and close the channel.
    #[instrument(skip(self))]
    pub async fn resolve(self, name: &str) -> Result<SocketAddr> {
        let outcome = self.exchange(name).await;
        self.inner.close().await;
        outcome
    }

    async fn exchange(&self, name: &str) -> Result<SocketAddr> {
        self.inner.send(name.as_bytes()).await?;
        let reply = self
            .inner
            .read()
            .await?
            .ok_or(ProtocolError::ConnectionClosed)?;

        if reply.is_empty() {
            return Err(ProtocolError::UnknownName(name.to_string()));
        }

        let text = String::from_utf8_lossy(&reply);
        let addr = text.parse::<SocketAddr>().map_err(|e| {
            ProtocolError::TransportError(format!("Resolver returned bad address '{text}': {e}"))
        })?;
        debug!(%name, %addr, "Name resolved");
        Ok(addr)
    }
}

#[async_trait]
impl Channel for ResolutionChannel {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        self.inner.send(frame).await
    }

    async fn read(&self) -> Result<Option<Vec<u8>>> {
        self.inner.read().await
    }

    async fn close(&self) {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn peer(&self) -> String {
        self.inner.peer()
    }
}

/// In-memory name → address table served over resolution channels.
#[derive(Clone, Default)]
pub struct NameService {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl NameService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, address: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.to_string()))?;
        entries.insert(name.to_string(), address.to_string());
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(name).cloned())
    }

    /// Answer resolution requests until `shutdown_rx` fires.
    #[instrument(skip(self, listener, shutdown_rx))]
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!(address = ?listener.local_addr().ok(), "Name service listening");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Name service shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let service = self.clone();
                            tokio::spawn(async move {
                                let channel = SessionChannel::from_tcp(stream);
                                if let Err(e) = service.answer(&channel).await {
                                    warn!(peer = %channel.peer(), error = %e, "Resolution request failed");
                                }
                                channel.close().await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting resolution connection");
                        }
                    }
                }
            }
        }
    }

    async fn answer(&self, channel: &SessionChannel<TcpStream>) -> Result<()> {
        let request = channel
            .read()
            .await?
            .ok_or(ProtocolError::ConnectionClosed)?;
        let name = String::from_utf8_lossy(&request);
        let reply = self.lookup(&name).unwrap_or_default();
        if reply.is_empty() {
            debug!(%name, "Unknown name requested");
        }
        channel.send(reply.as_bytes()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_known_and_unknown_names() {
        let service = NameService::new();
        service.register("home", "10.0.0.7:4000").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let resolver = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let server = {
            let service = service.clone();
            tokio::spawn(async move { service.serve(listener, shutdown_rx).await })
        };

        let addr = ResolutionChannel::open(&resolver)
            .await
            .unwrap()
            .resolve("home")
            .await
            .unwrap();
        assert_eq!(addr, "10.0.0.7:4000".parse::<SocketAddr>().unwrap());

        let missing = ResolutionChannel::open(&resolver)
            .await
            .unwrap()
            .resolve("nowhere")
            .await;
        assert!(matches!(missing, Err(ProtocolError::UnknownName(n)) if n == "nowhere"));

        shutdown_tx.send(()).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_is_transport_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = ResolutionChannel::open(&addr).await;
        assert!(matches!(result, Err(ProtocolError::TransportError(_))));
    }
}
