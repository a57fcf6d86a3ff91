//! # Transport Layer
//!
//! Byte-message channels underneath every connection.
//!
//! A [`Channel`] moves whole length-prefixed frames: `send` writes one,
//! `read` waits for the next one or reports end-of-stream, and `close`
//! ends the channel from any task, waking a pending `read`.
//!
//! ## Variants
//! - **Session**: long-lived channel carrying the handshake and then the
//!   multiplexed conversation traffic
//! - **Resolution**: short-lived channel mapping a human-readable name to a
//!   connection address with one request/response pair
//!
//! Opening a channel either succeeds or fails the connection attempt; no
//! retry happens at this layer.

pub mod resolution;
pub mod session;

use async_trait::async_trait;

use crate::error::Result;

pub use resolution::{NameService, ResolutionChannel};
pub use session::SessionChannel;

/// Bidirectional frame transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Write one frame.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Wait for the next frame. `Ok(None)` is end-of-stream, returned once
    /// the peer hangs up or `close` has been called on this channel.
    async fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Close the channel. A concurrently blocked `read` returns `Ok(None)`.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Human-readable peer description for logs
    fn peer(&self) -> String;
}
