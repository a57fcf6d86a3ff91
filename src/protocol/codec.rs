//! Pluggable symmetric codecs.
//!
//! A codec is negotiated by name during the handshake, initialized from a
//! shared secret both sides contributed to, and then encodes every outbound
//! frame and decodes every inbound one for the life of the connection.
//!
//! Codecs may keep per-message state (for example a nonce generator) as long
//! as that state advances purely from the sequence of `encode`/`decode`
//! calls. Nothing resynchronizes two codecs after they drift.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;
use zeroize::Zeroize;

use crate::config::DEFAULT_CODEC;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::crypto::{KEY_LEN, NONCE_LEN, TAG_LEN};

/// Which end of the connection a codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Symmetric frame encoder/decoder.
pub trait Codec: Send {
    /// Registry name. Both peers must use the same name.
    fn name(&self) -> &str;

    /// Number of shared-secret bytes `init` expects.
    fn secret_len(&self) -> usize;

    /// Key the codec. Deterministic for identical inputs; `false` on
    /// unusable secrets instead of an error.
    fn init(&mut self, shared_secret: &[u8], side: Side) -> bool;

    /// Bytes `encode` adds to a frame.
    fn overhead(&self) -> usize {
        0
    }

    /// Encode one complete frame.
    fn encode(&mut self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Decode one complete frame.
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>>;
}

/// Secret layout of [`StdCodec`]: 32 key bytes then an 8-byte generator seed.
pub const STD_SECRET_LEN: usize = KEY_LEN + 8;

const CLIENT_TO_SERVER_STREAM: u64 = 1;
const SERVER_TO_CLIENT_STREAM: u64 = 2;

struct StdState {
    cipher: XChaCha20Poly1305,
    outbound: ChaCha20Rng,
    inbound: ChaCha20Rng,
}

/// Reference codec: XChaCha20-Poly1305 with deterministically generated nonces.
///
/// The last eight secret bytes seed two ChaCha20 generators, one per
/// direction. Every `encode` draws the next nonce from the outbound
/// generator and every `decode` from the inbound one, so nonces never
/// travel on the wire and both ends stay in step as long as each frame is
/// decoded exactly once, in order.
pub struct StdCodec {
    name: String,
    state: Option<StdState>,
}

impl StdCodec {
    pub fn new() -> Self {
        Self::named(DEFAULT_CODEC)
    }

    /// Same algorithm registered under another name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: None,
        }
    }

    fn next_nonce(rng: &mut ChaCha20Rng) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        nonce
    }

    fn state(&mut self) -> Result<&mut StdState> {
        self.state.as_mut().ok_or_else(|| {
            ProtocolError::Custom(constants::ERR_CODEC_NOT_INITIALIZED.to_string())
        })
    }
}

impl Default for StdCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for StdCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn secret_len(&self) -> usize {
        STD_SECRET_LEN
    }

    fn init(&mut self, shared_secret: &[u8], side: Side) -> bool {
        if shared_secret.len() != STD_SECRET_LEN {
            debug!(
                codec = %self.name,
                expected = STD_SECRET_LEN,
                got = shared_secret.len(),
                "Rejecting shared secret"
            );
            return false;
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&shared_secret[..KEY_LEN]);
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&shared_secret[KEY_LEN..]);
        let seed = u64::from_le_bytes(seed_bytes);

        let mut client_to_server = ChaCha20Rng::seed_from_u64(seed);
        client_to_server.set_stream(CLIENT_TO_SERVER_STREAM);
        let mut server_to_client = ChaCha20Rng::seed_from_u64(seed);
        server_to_client.set_stream(SERVER_TO_CLIENT_STREAM);

        let (outbound, inbound) = match side {
            Side::Client => (client_to_server, server_to_client),
            Side::Server => (server_to_client, client_to_server),
        };

        self.state = Some(StdState {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
            outbound,
            inbound,
        });
        key.zeroize();
        seed_bytes.zeroize();
        true
    }

    fn overhead(&self) -> usize {
        TAG_LEN
    }

    fn encode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let state = self.state()?;
        let nonce = Self::next_nonce(&mut state.outbound);
        state
            .cipher
            .encrypt(XNonce::from_slice(&nonce), frame)
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let state = self.state()?;
        let nonce = Self::next_nonce(&mut state.inbound);
        state
            .cipher
            .decrypt(XNonce::from_slice(&nonce), frame)
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}
