//! Server identity records and issuer certificates.
//!
//! A server presents an identity record
//! `name;ip;link;base64(publicKey);mail` together with a certificate: the
//! issuer's RSA signature over the SHA3-256 digest of exactly that string.
//! Clients carry the issuer public key as their trust anchor, recompute the
//! digest, and compare it with what the certificate decrypts to.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use sha3::{Digest, Sha3_256};
use tracing::{debug, warn};

use crate::error::{constants, ProtocolError, Result};

const FIELD_SEPARATOR: char = ';';
const FIELD_COUNT: usize = 5;

/// Default RSA modulus size for generated keys
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Generate an RSA private key of `bits` size.
pub fn generate_key(bits: usize) -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| ProtocolError::Custom(format!("RSA key generation failed: {e}")))
}

/// Public identity of a server.
#[derive(Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    pub ip: String,
    pub link: String,
    pub public_key: RsaPublicKey,
    pub mail: String,
}

impl Identity {
    /// Serialize into the wire record that certificates sign.
    pub fn to_record(&self) -> Result<String> {
        for field in [&self.name, &self.ip, &self.link, &self.mail] {
            if field.contains(FIELD_SEPARATOR) {
                return Err(ProtocolError::Custom(format!(
                    "Identity field '{field}' contains '{FIELD_SEPARATOR}'"
                )));
            }
        }
        let der = self
            .public_key
            .to_public_key_der()
            .map_err(|e| ProtocolError::Custom(format!("Public key encoding failed: {e}")))?;

        Ok([
            self.name.as_str(),
            self.ip.as_str(),
            self.link.as_str(),
            &BASE64.encode(der.as_bytes()),
            self.mail.as_str(),
        ]
        .join(";"))
    }

    /// Parse a wire record.
    pub fn parse(record: &str) -> Result<Self> {
        let fields: Vec<&str> = record.split(FIELD_SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return Err(ProtocolError::CertificateRejected(format!(
                "{}: expected {FIELD_COUNT} fields, got {}",
                constants::ERR_MALFORMED_IDENTITY,
                fields.len()
            )));
        }

        let der = BASE64.decode(fields[3]).map_err(|e| {
            ProtocolError::CertificateRejected(format!("{}: {e}", constants::ERR_MALFORMED_IDENTITY))
        })?;
        let public_key = RsaPublicKey::from_public_key_der(&der).map_err(|e| {
            ProtocolError::CertificateRejected(format!("{}: {e}", constants::ERR_MALFORMED_IDENTITY))
        })?;

        Ok(Self {
            name: fields[0].to_string(),
            ip: fields[1].to_string(),
            link: fields[2].to_string(),
            public_key,
            mail: fields[4].to_string(),
        })
    }

    /// Encrypt a small secret so only the holder of this identity's private key can read it.
    pub fn seal_for(&self, secret: &[u8]) -> Result<Vec<u8>> {
        self.public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), secret)
            .map_err(|e| {
                ProtocolError::HandshakeError(format!(
                    "{}: {e}",
                    constants::ERR_KEY_TRANSPORT_FAILED
                ))
            })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("link", &self.link)
            .field("mail", &self.mail)
            .finish_non_exhaustive()
    }
}

fn record_digest(record: &str) -> [u8; 32] {
    Sha3_256::digest(record.as_bytes()).into()
}

/// Issuer signature over an identity record digest.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({} bytes)", self.0.len())
    }
}

/// Holder of the private key that certifies server identities.
pub struct Issuer {
    private_key: RsaPrivateKey,
}

impl Issuer {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    pub fn generate(bits: usize) -> Result<Self> {
        Ok(Self::new(generate_key(bits)?))
    }

    /// The trust anchor clients need to verify certificates from this issuer.
    pub fn trust_anchor(&self) -> TrustAnchor {
        TrustAnchor(RsaPublicKey::from(&self.private_key))
    }

    pub fn issue(&self, identity: &Identity) -> Result<Certificate> {
        let digest = record_digest(&identity.to_record()?);
        let signature = self
            .private_key
            .sign(Pkcs1v15Sign::new_unprefixed(), &digest)
            .map_err(|e| ProtocolError::Custom(format!("Certificate signing failed: {e}")))?;
        debug!(name = %identity.name, "Issued certificate");
        Ok(Certificate(signature))
    }
}

/// Issuer public key trusted by a client.
#[derive(Clone, Debug, PartialEq)]
pub struct TrustAnchor(RsaPublicKey);

impl TrustAnchor {
    pub fn new(issuer_key: RsaPublicKey) -> Self {
        Self(issuer_key)
    }

    /// Check `certificate` against the raw `record` text and parse it.
    ///
    /// The digest is computed over the record exactly as received, before
    /// any parsing.
    pub fn verify(&self, record: &str, certificate: &Certificate) -> Result<Identity> {
        let digest = record_digest(record);
        self.0
            .verify(Pkcs1v15Sign::new_unprefixed(), &digest, certificate.as_bytes())
            .map_err(|_| {
                warn!("Certificate does not match the presented identity record");
                ProtocolError::CertificateRejected(constants::ERR_CERTIFICATE_MISMATCH.to_string())
            })?;
        Identity::parse(record)
    }
}

/// Everything a server needs to prove who it is.
pub struct ServerCredentials {
    pub identity: Identity,
    pub certificate: Certificate,
    private_key: RsaPrivateKey,
}

impl ServerCredentials {
    pub fn new(identity: Identity, certificate: Certificate, private_key: RsaPrivateKey) -> Self {
        Self {
            identity,
            certificate,
            private_key,
        }
    }

    /// Generate a fresh server key and have `issuer` certify it.
    pub fn issue(
        issuer: &Issuer,
        name: &str,
        ip: &str,
        link: &str,
        mail: &str,
        bits: usize,
    ) -> Result<Self> {
        let private_key = generate_key(bits)?;
        let identity = Identity {
            name: name.to_string(),
            ip: ip.to_string(),
            link: link.to_string(),
            public_key: RsaPublicKey::from(&private_key),
            mail: mail.to_string(),
        };
        let certificate = issuer.issue(&identity)?;
        Ok(Self::new(identity, certificate, private_key))
    }

    /// Decrypt a secret sealed with [`Identity::seal_for`].
    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), sealed)
            .map_err(|_| {
                ProtocolError::HandshakeError(constants::ERR_KEY_TRANSPORT_FAILED.to_string())
            })
    }
}
