//! Handshake state machine.
//!
//! Drives a freshly opened channel from nothing to an agreed, initialized
//! and self-tested codec:
//!
//! 1. **IdentityExchange**: the server sends its identity record and the
//!    issuer certificate over it; the client verifies against its trust anchor.
//! 2. **SessionKeyExchange**: the client sends a random session key and
//!    nonce, each RSA-encrypted to the server; both sides then prove they
//!    hold the same key by returning the other's probe byte-swapped.
//! 3. **CodecAgreement**: the client proposes a codec; the server accepts
//!    (`ok`) or lists what it supports (`ns`), after which the client picks
//!    from the intersection (`ack` + name), declines (`nop`) or reports an
//!    empty intersection (`EC`).
//! 4. **CodecInit**: both sides contribute random bytes; their XOR keys the codec.
//! 5. **CodecSelfTest**: each side sends a probe under the session key and
//!    checks the peer returns it through the new codec.
//!
//! Every control message after step 1 travels sealed under the session
//! key. Any failure closes the channel and leaves the handshake `Aborted`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use zeroize::Zeroize;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::codec::{Codec, Side};
use crate::protocol::identity::{Certificate, Identity, ServerCredentials, TrustAnchor};
use crate::protocol::registry::Registry;
use crate::transport::Channel;
use crate::utils::crypto::{random_array, random_vec, SessionArtifacts, KEY_LEN, NONCE_LEN};
use crate::utils::metrics::Timer;
use crate::utils::timeout::with_timeout_error;

/// Control tokens exchanged during codec agreement and self-test
pub mod tokens {
    pub const OK: &str = "ok";
    pub const NOT_SUPPORTED: &str = "ns";
    pub const ACK: &str = "ack";
    pub const ABORT: &str = "abt";
    pub const EMPTY_CHOICE: &str = "EC";
    pub const DECLINE: &str = "nop";
}

/// Size of the codec self-test probe
pub const SELF_TEST_PROBE_LEN: usize = 32;

const CODEC_LIST_SEPARATOR: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connect,
    IdentityExchange,
    SessionKeyExchange,
    CodecAgreement,
    CodecInit,
    CodecSelfTest,
    Ready,
    Aborted,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Connect => "Connect",
            HandshakeState::IdentityExchange => "IdentityExchange",
            HandshakeState::SessionKeyExchange => "SessionKeyExchange",
            HandshakeState::CodecAgreement => "CodecAgreement",
            HandshakeState::CodecInit => "CodecInit",
            HandshakeState::CodecSelfTest => "CodecSelfTest",
            HandshakeState::Ready => "Ready",
            HandshakeState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Decides whether to switch to another codec when the server rejects the
/// proposed one.
///
/// `candidates` are the codecs both sides support, in the server's order.
/// Returning `None` declines the switch.
pub trait CodecConfirm: Send + Sync {
    fn confirm(&self, proposed: &str, candidates: &[String]) -> Option<String>;
}

impl<F> CodecConfirm for F
where
    F: Fn(&str, &[String]) -> Option<String> + Send + Sync,
{
    fn confirm(&self, proposed: &str, candidates: &[String]) -> Option<String> {
        self(proposed, candidates)
    }
}

/// Switches to the first common codec without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptFirst;

impl CodecConfirm for AcceptFirst {
    fn confirm(&self, _proposed: &str, candidates: &[String]) -> Option<String> {
        candidates.first().cloned()
    }
}

/// Never switches codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;

impl CodecConfirm for Decline {
    fn confirm(&self, _proposed: &str, _candidates: &[String]) -> Option<String> {
        None
    }
}

/// A channel with an agreed and tested codec, ready for multiplexing.
pub struct Established {
    pub channel: Arc<dyn Channel>,
    pub codec: Box<dyn Codec>,
    /// Verified server identity (client side only).
    pub peer_identity: Option<Identity>,
    /// Whether the codec differs from the one the client first proposed.
    pub switched: bool,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("peer", &self.channel.peer())
            .field("codec", &self.codec.name())
            .field("peer_identity", &self.peer_identity)
            .field("switched", &self.switched)
            .finish()
    }
}

fn handshake_error(message: &str) -> ProtocolError {
    ProtocolError::HandshakeError(message.to_string())
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn xor_secret(mine: &[u8], theirs: &[u8]) -> Result<Vec<u8>> {
    if mine.len() != theirs.len() {
        return Err(handshake_error(constants::ERR_SECRET_LENGTH));
    }
    Ok(mine.iter().zip(theirs).map(|(a, b)| a ^ b).collect())
}

fn parse_probe(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| handshake_error(constants::ERR_PROBE_MISMATCH))?;
    Ok(u32::from_le_bytes(raw))
}

/// Raw frame I/O with a per-step deadline.
struct Wire<'a> {
    channel: &'a dyn Channel,
    step_timeout: Duration,
}

impl Wire<'_> {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        self.channel.send(frame).await
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        with_timeout_error(
            async {
                self.channel
                    .read()
                    .await?
                    .ok_or(ProtocolError::ConnectionClosed)
            },
            self.step_timeout,
        )
        .await
    }

    async fn send_sealed(&self, session: &SessionArtifacts, data: &[u8]) -> Result<()> {
        self.send(&session.seal(data)?).await
    }

    async fn recv_sealed(&self, session: &SessionArtifacts) -> Result<Vec<u8>> {
        session.open(&self.recv().await?)
    }

    async fn recv_token(&self, session: &SessionArtifacts) -> Result<String> {
        Ok(text(&self.recv_sealed(session).await?))
    }

    /// Wait for an `ack`/`abt` verdict.
    async fn expect_ack(&self, session: &SessionArtifacts, on_abort: &str) -> Result<()> {
        match self.recv_token(session).await?.as_str() {
            tokens::ACK => Ok(()),
            tokens::ABORT => Err(handshake_error(on_abort)),
            other => Err(ProtocolError::HandshakeError(format!(
                "{}: {other}",
                constants::ERR_UNEXPECTED_TOKEN
            ))),
        }
    }
}

/// Client end of the handshake.
pub struct ClientHandshake<'a> {
    registry: &'a Registry,
    trust: &'a TrustAnchor,
    confirm: &'a dyn CodecConfirm,
    preferred_codec: String,
    step_timeout: Duration,
    state: HandshakeState,
}

impl<'a> ClientHandshake<'a> {
    pub fn new(
        registry: &'a Registry,
        trust: &'a TrustAnchor,
        confirm: &'a dyn CodecConfirm,
        preferred_codec: &str,
        step_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            trust,
            confirm,
            preferred_codec: preferred_codec.to_string(),
            step_timeout,
            state: HandshakeState::Connect,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Open a channel of type `channel_name` and run the handshake over it.
    #[instrument(skip(self))]
    pub async fn connect(&mut self, channel_name: &str, address: &str) -> Result<Established> {
        self.state = HandshakeState::Connect;
        let channel = match self.registry.open_channel(channel_name, address).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(state = %self.state, error = %e, "Handshake aborted");
                self.state = HandshakeState::Aborted;
                return Err(e);
            }
        };
        self.run(channel).await
    }

    /// Run the handshake over an already open channel.
    #[instrument(skip(self, channel), fields(peer = %channel.peer()))]
    pub async fn run(&mut self, channel: Arc<dyn Channel>) -> Result<Established> {
        let _timer = Timer::start("client_handshake");
        match self.drive(channel.clone()).await {
            Ok(established) => {
                self.state = HandshakeState::Ready;
                info!(codec = %established.codec.name(), "Client handshake complete");
                Ok(established)
            }
            Err(e) => {
                warn!(state = %self.state, error = %e, "Handshake aborted");
                self.state = HandshakeState::Aborted;
                channel.close().await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self, channel: Arc<dyn Channel>) -> Result<Established> {
        let wire = Wire {
            channel: channel.as_ref(),
            step_timeout: self.step_timeout,
        };

        self.state = HandshakeState::IdentityExchange;
        let identity = self.identity_exchange(&wire).await?;

        self.state = HandshakeState::SessionKeyExchange;
        let session = self.session_key_exchange(&wire, &identity).await?;

        self.state = HandshakeState::CodecAgreement;
        let (codec_name, switched) = self.codec_agreement(&wire, &session).await?;

        self.state = HandshakeState::CodecInit;
        let mut codec = self.registry.create_codec(&codec_name)?;
        let mine = random_vec(codec.secret_len())?;
        wire.send_sealed(&session, &mine).await?;
        let theirs = wire.recv_sealed(&session).await?;
        let mut secret = xor_secret(&mine, &theirs)?;
        let initialized = codec.init(&secret, Side::Client);
        secret.zeroize();
        if !initialized {
            return Err(handshake_error(constants::ERR_CODEC_INIT_FAILED));
        }

        self.state = HandshakeState::CodecSelfTest;
        self.self_test(&wire, &session, &mut *codec).await?;

        drop(wire);
        Ok(Established {
            channel,
            codec,
            peer_identity: Some(identity),
            switched,
        })
    }

    async fn identity_exchange(&self, wire: &Wire<'_>) -> Result<Identity> {
        let record = text(&wire.recv().await?);
        let certificate = Certificate::from_bytes(wire.recv().await?);
        let identity = self.trust.verify(&record, &certificate)?;
        debug!(server = %identity.name, "Server identity verified");
        Ok(identity)
    }

    async fn session_key_exchange(
        &self,
        wire: &Wire<'_>,
        identity: &Identity,
    ) -> Result<SessionArtifacts> {
        let key: [u8; KEY_LEN] = random_array()?;
        let nonce: [u8; NONCE_LEN] = random_array()?;
        wire.send(&identity.seal_for(&key)?).await?;
        wire.send(&identity.seal_for(&nonce)?).await?;
        let session = SessionArtifacts::new(key, nonce);

        let probe = u32::from_le_bytes(random_array()?);
        wire.send_sealed(&session, &probe.to_le_bytes()).await?;
        let echoed = parse_probe(&wire.recv_sealed(&session).await?)?;
        if echoed != probe.swap_bytes() {
            return Err(handshake_error(constants::ERR_PROBE_MISMATCH));
        }

        let server_probe = parse_probe(&wire.recv_sealed(&session).await?)?;
        wire.send_sealed(&session, &server_probe.swap_bytes().to_le_bytes())
            .await?;
        wire.expect_ack(&session, constants::ERR_PROBE_MISMATCH)
            .await?;
        Ok(session)
    }

    async fn codec_agreement(
        &self,
        wire: &Wire<'_>,
        session: &SessionArtifacts,
    ) -> Result<(String, bool)> {
        wire.send_sealed(session, self.preferred_codec.as_bytes())
            .await?;

        let reply = wire.recv_token(session).await?;
        match reply.as_str() {
            tokens::OK => return Ok((self.preferred_codec.clone(), false)),
            tokens::NOT_SUPPORTED => {}
            other => {
                return Err(ProtocolError::HandshakeError(format!(
                    "{}: {other}",
                    constants::ERR_UNEXPECTED_TOKEN
                )))
            }
        }

        let offered = wire.recv_token(session).await?;
        let candidates: Vec<String> = offered
            .split(CODEC_LIST_SEPARATOR)
            .filter(|name| self.registry.has_codec(name))
            .map(str::to_string)
            .collect();
        debug!(%offered, ?candidates, "Server declined proposed codec");

        if candidates.is_empty() {
            wire.send_sealed(session, tokens::EMPTY_CHOICE.as_bytes())
                .await?;
            return Err(handshake_error(constants::ERR_NO_COMMON_CODEC));
        }

        let chosen = self
            .confirm
            .confirm(&self.preferred_codec, &candidates)
            .filter(|name| candidates.contains(name));
        let Some(chosen) = chosen else {
            wire.send_sealed(session, tokens::DECLINE.as_bytes()).await?;
            return Err(handshake_error(constants::ERR_CODEC_DECLINED));
        };

        wire.send_sealed(session, tokens::ACK.as_bytes()).await?;
        wire.send_sealed(session, chosen.as_bytes()).await?;
        match wire.recv_token(session).await?.as_str() {
            tokens::OK => Ok((chosen, true)),
            _ => Err(ProtocolError::UnknownCodec(chosen)),
        }
    }

    async fn self_test(
        &self,
        wire: &Wire<'_>,
        session: &SessionArtifacts,
        codec: &mut dyn Codec,
    ) -> Result<()> {
        let probe: [u8; SELF_TEST_PROBE_LEN] = random_array()?;
        wire.send_sealed(session, &probe).await?;
        let returned = codec.decode(&wire.recv().await?);
        if !matches!(&returned, Ok(bytes) if bytes[..] == probe[..]) {
            wire.send_sealed(session, tokens::ABORT.as_bytes()).await?;
            return Err(handshake_error(constants::ERR_SELF_TEST_FAILED));
        }
        wire.send_sealed(session, tokens::ACK.as_bytes()).await?;

        let server_probe = wire.recv_sealed(session).await?;
        wire.send(&codec.encode(&server_probe)?).await?;
        wire.expect_ack(session, constants::ERR_SELF_TEST_FAILED).await
    }
}

/// Server end of the handshake.
pub struct ServerHandshake<'a> {
    registry: &'a Registry,
    credentials: &'a ServerCredentials,
    step_timeout: Duration,
    state: HandshakeState,
}

impl<'a> ServerHandshake<'a> {
    pub fn new(
        registry: &'a Registry,
        credentials: &'a ServerCredentials,
        step_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            credentials,
            step_timeout,
            state: HandshakeState::Connect,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    #[instrument(skip(self, channel), fields(peer = %channel.peer()))]
    pub async fn run(&mut self, channel: Arc<dyn Channel>) -> Result<Established> {
        let _timer = Timer::start("server_handshake");
        match self.drive(channel.clone()).await {
            Ok(established) => {
                self.state = HandshakeState::Ready;
                info!(codec = %established.codec.name(), "Server handshake complete");
                Ok(established)
            }
            Err(e) => {
                warn!(state = %self.state, error = %e, "Handshake aborted");
                self.state = HandshakeState::Aborted;
                channel.close().await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self, channel: Arc<dyn Channel>) -> Result<Established> {
        let wire = Wire {
            channel: channel.as_ref(),
            step_timeout: self.step_timeout,
        };

        self.state = HandshakeState::IdentityExchange;
        let record = self.credentials.identity.to_record()?;
        wire.send(record.as_bytes()).await?;
        wire.send(self.credentials.certificate.as_bytes()).await?;

        self.state = HandshakeState::SessionKeyExchange;
        let session = self.session_key_exchange(&wire).await?;

        self.state = HandshakeState::CodecAgreement;
        let (codec_name, switched) = self.codec_agreement(&wire, &session).await?;

        self.state = HandshakeState::CodecInit;
        let mut codec = self.registry.create_codec(&codec_name)?;
        let theirs = wire.recv_sealed(&session).await?;
        let mine = random_vec(codec.secret_len())?;
        wire.send_sealed(&session, &mine).await?;
        let mut secret = xor_secret(&mine, &theirs)?;
        let initialized = codec.init(&secret, Side::Server);
        secret.zeroize();
        if !initialized {
            return Err(handshake_error(constants::ERR_CODEC_INIT_FAILED));
        }

        self.state = HandshakeState::CodecSelfTest;
        self.self_test(&wire, &session, &mut *codec).await?;

        drop(wire);
        Ok(Established {
            channel,
            codec,
            peer_identity: None,
            switched,
        })
    }

    async fn session_key_exchange(&self, wire: &Wire<'_>) -> Result<SessionArtifacts> {
        let mut key_bytes = self.credentials.unseal(&wire.recv().await?)?;
        let mut nonce_bytes = self.credentials.unseal(&wire.recv().await?)?;
        let key: Result<[u8; KEY_LEN]> = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| handshake_error(constants::ERR_KEY_TRANSPORT_FAILED));
        let nonce: Result<[u8; NONCE_LEN]> = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| handshake_error(constants::ERR_KEY_TRANSPORT_FAILED));
        key_bytes.zeroize();
        nonce_bytes.zeroize();
        let session = SessionArtifacts::new(key?, nonce?);

        let client_probe = parse_probe(&wire.recv_sealed(&session).await?)?;
        wire.send_sealed(&session, &client_probe.swap_bytes().to_le_bytes())
            .await?;

        let probe = u32::from_le_bytes(random_array()?);
        wire.send_sealed(&session, &probe.to_le_bytes()).await?;
        let echoed = parse_probe(&wire.recv_sealed(&session).await?)?;
        if echoed != probe.swap_bytes() {
            wire.send_sealed(&session, tokens::ABORT.as_bytes()).await?;
            return Err(handshake_error(constants::ERR_PROBE_MISMATCH));
        }
        wire.send_sealed(&session, tokens::ACK.as_bytes()).await?;
        Ok(session)
    }

    async fn codec_agreement(
        &self,
        wire: &Wire<'_>,
        session: &SessionArtifacts,
    ) -> Result<(String, bool)> {
        let proposed = wire.recv_token(session).await?;
        if self.registry.has_codec(&proposed) {
            wire.send_sealed(session, tokens::OK.as_bytes()).await?;
            return Ok((proposed, false));
        }

        let supported = self
            .registry
            .codec_names()
            .join(&CODEC_LIST_SEPARATOR.to_string());
        debug!(%proposed, %supported, "Proposed codec not supported");
        wire.send_sealed(session, tokens::NOT_SUPPORTED.as_bytes())
            .await?;
        wire.send_sealed(session, supported.as_bytes()).await?;

        match wire.recv_token(session).await?.as_str() {
            tokens::ACK => {}
            tokens::EMPTY_CHOICE => return Err(handshake_error(constants::ERR_NO_COMMON_CODEC)),
            tokens::DECLINE => return Err(handshake_error(constants::ERR_CODEC_DECLINED)),
            other => {
                return Err(ProtocolError::HandshakeError(format!(
                    "{}: {other}",
                    constants::ERR_UNEXPECTED_TOKEN
                )))
            }
        }

        let chosen = wire.recv_token(session).await?;
        if !self.registry.has_codec(&chosen) {
            wire.send_sealed(session, tokens::ABORT.as_bytes()).await?;
            return Err(ProtocolError::UnknownCodec(chosen));
        }
        wire.send_sealed(session, tokens::OK.as_bytes()).await?;
        Ok((chosen, true))
    }

    async fn self_test(
        &self,
        wire: &Wire<'_>,
        session: &SessionArtifacts,
        codec: &mut dyn Codec,
    ) -> Result<()> {
        let client_probe = wire.recv_sealed(session).await?;
        wire.send(&codec.encode(&client_probe)?).await?;
        wire.expect_ack(session, constants::ERR_SELF_TEST_FAILED).await?;

        let probe: [u8; SELF_TEST_PROBE_LEN] = random_array()?;
        wire.send_sealed(session, &probe).await?;
        let returned = codec.decode(&wire.recv().await?);
        if !matches!(&returned, Ok(bytes) if bytes[..] == probe[..]) {
            wire.send_sealed(session, tokens::ABORT.as_bytes()).await?;
            return Err(handshake_error(constants::ERR_SELF_TEST_FAILED));
        }
        wire.send_sealed(session, tokens::ACK.as_bytes()).await
    }
}
