//! # Core Wire Components
//!
//! Low-level framing shared by every channel and the conversation layer.
//!
//! ## Components
//! - **Codec**: Tokio codec for length-prefixed framing over byte streams
//! - **Frame**: Conversation id tagging of decoded payloads
//!
//! ## Wire Format
//! ```text
//! [Length(2, little-endian)] [Payload(N)]
//! ```
//! Once a payload has passed through the negotiated codec it reads:
//! ```text
//! [ConversationId(1)] [Application bytes(N-1)]
//! ```
//!
//! ## Security
//! - Maximum frame payload: 65 535 bytes (the length prefix is a u16)
//! - Length validation before allocation

pub mod codec;
pub mod frame;
