//! # Error Types
//!
//! Comprehensive error handling for the conversation protocol.
//!
//! This module defines all error variants that can occur during protocol operations,
//! from low-level I/O errors to handshake aborts and capacity exhaustion.
//!
//! ## Error Categories
//! - **Transport**: channel open/read/write failures, always fatal to the connection
//! - **Protocol**: out-of-order messages, failed certificate or codec checks
//! - **Capacity**: no free conversation id, full backlog; the operation is dropped
//! - **Application**: faults raised by registered handlers
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use secure_mux::error::{ErrorKind, ProtocolError, Result};
//!
//! fn reserve(free: bool) -> Result<()> {
//!     if free {
//!         Ok(())
//!     } else {
//!         Err(ProtocolError::NoConversationId)
//!     }
//! }
//!
//! let err = reserve(false).unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Capacity);
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Registry and dispatcher lock errors
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on prefix actions";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on prefix actions";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Connection errors
    pub const ERR_CHANNEL_OPEN_FAILED: &str = "Failed to open channel";

    /// Handshake errors
    pub const ERR_CERTIFICATE_MISMATCH: &str = "Certificate does not match identity record";
    pub const ERR_MALFORMED_IDENTITY: &str = "Malformed identity record";
    pub const ERR_KEY_TRANSPORT_FAILED: &str = "Session key transport failed";
    pub const ERR_PROBE_MISMATCH: &str = "Session key probe mismatch";
    pub const ERR_NO_COMMON_CODEC: &str = "No codec supported by both peers";
    pub const ERR_CODEC_DECLINED: &str = "Codec switch declined";
    pub const ERR_CODEC_INIT_FAILED: &str = "Codec initialization failed";
    pub const ERR_SECRET_LENGTH: &str = "Shared secret contribution has the wrong length";
    pub const ERR_SELF_TEST_FAILED: &str = "Codec self-test failed";
    pub const ERR_UNEXPECTED_TOKEN: &str = "Unexpected control token";

    /// Codec errors
    pub const ERR_CODEC_NOT_INITIALIZED: &str = "Codec used before initialization";
}

/// Coarse classification of an error, used to decide whether a failure ends
/// the connection or only drops the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel open/read/write failure. Ends the connection.
    Transport,
    /// Handshake or framing violation. Ends the connection.
    Protocol,
    /// Resource exhaustion. Only the current operation is dropped.
    Capacity,
    /// Fault raised by an application handler or a waiting caller.
    Application,
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("Unexpected message")]
    UnexpectedMessage,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    #[error("Unknown channel type: {0}")]
    UnknownChannel(String),

    #[error("No free conversation id")]
    NoConversationId,

    #[error("Conversation {0} already has a continuation attached")]
    AlreadyAttached(i8),

    #[error("Conversation {0} is not locked")]
    NotLocked(i8),

    #[error("Backlog full ({0} items)")]
    BacklogFull(usize),

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Unknown name: {0}")]
    UnknownName(String),

    #[error("Dispatch pool is running; stop accepting connections first")]
    PoolRunning,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Classify this error per the transport/protocol/capacity/application taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::TransportError(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::OversizedPacket(_)
            | ProtocolError::UnknownChannel(_)
            | ProtocolError::UnknownName(_) => ErrorKind::Transport,
            ProtocolError::HandshakeError(_)
            | ProtocolError::CertificateRejected(_)
            | ProtocolError::UnexpectedMessage
            | ProtocolError::DecryptionFailure
            | ProtocolError::EncryptionFailure
            | ProtocolError::UnknownCodec(_)
            | ProtocolError::Timeout => ErrorKind::Protocol,
            ProtocolError::NoConversationId
            | ProtocolError::AlreadyAttached(_)
            | ProtocolError::BacklogFull(_) => ErrorKind::Capacity,
            ProtocolError::NotLocked(_)
            | ProtocolError::Cancelled
            | ProtocolError::PoolRunning
            | ProtocolError::ConfigError(_)
            | ProtocolError::Custom(_) => ErrorKind::Application,
        }
    }

    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Protocol)
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
