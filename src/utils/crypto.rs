//! Session-key encryption.
//!
//! The handshake agrees on a 32-byte session key and a 24-byte session nonce
//! before any codec exists. Messages sealed under the session key carry their
//! own random per-message nonce in front of the ciphertext, and the session
//! nonce is bound as associated data so a sealed message cannot be replayed
//! into another session that happens to share the key.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use crate::error::{ProtocolError, Result};

/// Length of an XChaCha20-Poly1305 key
pub const KEY_LEN: usize = 32;

/// Length of an XChaCha20-Poly1305 nonce
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag appended to every ciphertext
pub const TAG_LEN: usize = 16;

/// Fill `buf` from the operating system RNG.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::fill(buf).map_err(|e| ProtocolError::Custom(format!("OS RNG failure: {e}")))
}

/// Produce `N` random bytes from the operating system RNG.
pub fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}

/// Produce `len` random bytes from the operating system RNG.
pub fn random_vec(len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    fill_random(&mut out)?;
    Ok(out)
}

/// XChaCha20-Poly1305 cipher keyed once per session.
pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Fresh random nonce for a single message
    pub fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        random_array::<NONCE_LEN>()
    }

    pub fn encrypt(&self, data: &[u8], nonce: &[u8; NONCE_LEN], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, data: &[u8], nonce: &[u8; NONCE_LEN], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

/// Session-key cipher plus the session nonce agreed during the handshake.
///
/// Exists only between key exchange and codec installation.
pub struct SessionArtifacts {
    crypto: Crypto,
    session_nonce: [u8; NONCE_LEN],
}

impl SessionArtifacts {
    /// Build from the exchanged key and nonce. The caller's copy of the key is zeroized.
    pub fn new(mut key: [u8; KEY_LEN], session_nonce: [u8; NONCE_LEN]) -> Self {
        let crypto = Crypto::new(&key);
        key.zeroize();
        Self {
            crypto,
            session_nonce,
        }
    }

    /// Encrypt `data`; output is `nonce || ciphertext`.
    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = Crypto::generate_nonce()?;
        let ciphertext = self.crypto.encrypt(data, &nonce, &self.session_nonce)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend(ciphertext);
        nonce.zeroize();
        Ok(sealed)
    }

    /// Reverse of [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::DecryptionFailure);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        let plaintext = self.crypto.decrypt(ciphertext, &nonce, &self.session_nonce);
        nonce.zeroize();
        plaintext
    }
}

impl Drop for SessionArtifacts {
    fn drop(&mut self) {
        self.session_nonce.zeroize();
    }
}
