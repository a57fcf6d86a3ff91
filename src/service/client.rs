use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::ClientConfig;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{PrefixActions, CLIENT_SEPARATOR, SERVER_SEPARATOR};
use crate::protocol::form::FormSpec;
use crate::protocol::handshake::{ClientHandshake, CodecConfirm};
use crate::protocol::identity::{Identity, TrustAnchor};
use crate::protocol::multiplexer::Multiplexer;
use crate::protocol::registry::Registry;
use crate::service::worker::prefixes;
use crate::transport::ResolutionChannel;
use crate::utils::metrics::Metrics;

/// Client end of an established connection.
pub struct Client {
    config: ClientConfig,
    mux: Arc<Multiplexer>,
    actions: Arc<PrefixActions<Arc<Multiplexer>>>,
    server: Identity,
    reader: JoinHandle<()>,
    metrics: Arc<Metrics>,
}

impl Client {
    /// Open the configured channel to `config.address`, run the handshake
    /// and start the read loop.
    #[instrument(skip_all, fields(address = %config.address))]
    pub async fn connect(
        config: ClientConfig,
        registry: &Registry,
        trust: &TrustAnchor,
        confirm: &dyn CodecConfirm,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        metrics.handshake_attempt();
        let mut handshake = ClientHandshake::new(
            registry,
            trust,
            confirm,
            &config.preferred_codec,
            config.handshake_timeout,
        );
        let established = match handshake.connect(&config.channel, &config.address).await {
            Ok(established) => established,
            Err(e) => {
                metrics.handshake_failed();
                return Err(e);
            }
        };
        metrics.handshake_success();
        metrics.connection_established();

        let server = established
            .peer_identity
            .ok_or_else(|| ProtocolError::HandshakeError("server identity missing".into()))?;
        let mux = Arc::new(Multiplexer::new(
            established.channel,
            established.codec,
            metrics.clone(),
        ));
        let actions = Arc::new(PrefixActions::new(CLIENT_SEPARATOR));
        let reader = {
            let read_loop = mux.spawn_reader(actions.clone());
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let _ = read_loop.await;
                metrics.connection_closed();
            })
        };
        info!(server = %server.name, codec = %mux.codec_name(), "Connected");

        Ok(Self {
            config,
            mux,
            actions,
            server,
            reader,
            metrics,
        })
    }

    /// Resolve `name` through the configured name service, then connect.
    pub async fn connect_by_name(
        name: &str,
        mut config: ClientConfig,
        registry: &Registry,
        trust: &TrustAnchor,
        confirm: &dyn CodecConfirm,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let resolver = config.resolver_address.clone().ok_or_else(|| {
            ProtocolError::ConfigError("No resolver address configured".to_string())
        })?;
        let addr = ResolutionChannel::open(&resolver).await?.resolve(name).await?;
        debug!(%name, %addr, "Resolved server name");
        config.address = addr.to_string();
        Self::connect(config, registry, trust, confirm, metrics).await
    }

    /// Handlers for server-initiated messages, keyed by prefix.
    pub fn actions(&self) -> &Arc<PrefixActions<Arc<Multiplexer>>> {
        &self.actions
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// Identity the server proved during the handshake.
    pub fn server_identity(&self) -> &Identity {
        &self.server
    }

    pub fn codec_name(&self) -> String {
        self.mux.codec_name()
    }

    /// Send `prefix;body` on a fresh conversation and wait for the reply.
    pub async fn request(&self, prefix: &str, body: &[u8]) -> Result<Vec<u8>> {
        let mut payload = Vec::with_capacity(prefix.len() + 1 + body.len());
        payload.extend_from_slice(prefix.as_bytes());
        payload.push(SERVER_SEPARATOR);
        payload.extend_from_slice(body);
        self.mux
            .request(&payload, Some(self.config.response_timeout))
            .await
    }

    /// Ask the server which fields a login request needs.
    pub async fn login_form(&self) -> Result<FormSpec> {
        self.form(prefixes::LOGIN).await
    }

    pub async fn register_form(&self) -> Result<FormSpec> {
        self.form(prefixes::REGISTER).await
    }

    async fn form(&self, prefix: &str) -> Result<FormSpec> {
        let reply = String::from_utf8_lossy(&self.request(prefix, b"").await?).into_owned();
        reply
            .strip_prefix(prefixes::FORM)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(FormSpec::parse)
            .ok_or(ProtocolError::UnexpectedMessage)
    }

    /// Send the filled-in login fields; returns the server's reply text
    /// (`log:<identity>` on success, `err:<message>` otherwise).
    pub async fn login(&self, fields: &[&str]) -> Result<String> {
        let reply = self.request(prefixes::LOGIN, fields.join(";").as_bytes()).await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    pub async fn register(&self, fields: &[&str]) -> Result<String> {
        let reply = self
            .request(prefixes::REGISTER, fields.join(";").as_bytes())
            .await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    /// Close the connection; pending waits resume cancelled.
    pub async fn close(self) {
        self.mux.close().await;
        let _ = self.reader.await;
        info!(server = %self.server.name, "Disconnected");
    }
}
