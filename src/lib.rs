//! # secure-mux
//!
//! Secure conversation multiplexing over a single connection.
//!
//! A client and server establish an encrypted channel, negotiate a
//! pluggable symmetric codec, and then run many concurrent
//! request/response exchanges ("conversations") over it, each tagged with
//! a one-byte conversation id. On the server, decoded messages are drained
//! by a bounded worker pool that drops work instead of blocking when it is
//! saturated.
//!
//! ## Layers
//! - [`transport`]: length-prefixed channels (session and name resolution)
//! - [`protocol`]: identity, codecs, handshake, multiplexer, prefix actions
//! - [`service`]: client and server façades, dispatch pool, login gating
//! - [`config`], [`error`], [`utils`]: configuration, errors, crypto, logging, metrics
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use secure_mux::config::ClientConfig;
//! use secure_mux::protocol::handshake::AcceptFirst;
//! use secure_mux::protocol::identity::TrustAnchor;
//! use secure_mux::protocol::Registry;
//! use secure_mux::service::Client;
//! use secure_mux::utils::Metrics;
//!
//! # async fn demo(trust: TrustAnchor) -> secure_mux::error::Result<()> {
//! let registry = Registry::with_defaults();
//! let client = Client::connect(
//!     ClientConfig::default(),
//!     &registry,
//!     &trust,
//!     &AcceptFirst,
//!     Arc::new(Metrics::new()),
//! )
//! .await?;
//! let reply = client.login(&["alice", "secret"]).await?;
//! assert_eq!(reply, "log:alice");
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::frame::ConversationId;
pub use crate::error::{ErrorKind, ProtocolError, Result};
pub use crate::protocol::{Multiplexer, Registry};
pub use crate::service::{Client, Server};
