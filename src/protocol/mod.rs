//! # Protocol Layer
//!
//! Everything between an open channel and application messages.
//!
//! ## Components
//! - **Identity**: server identity records, issuer certificates, RSA key transport
//! - **Codec**: pluggable symmetric frame codecs and the `std` reference codec
//! - **Registry**: name-keyed codec and channel factories
//! - **Handshake**: state machine producing an agreed, self-tested codec
//! - **Conversation**: conversation id allocation and continuation bookkeeping
//! - **Multiplexer**: many request/response exchanges over one channel
//! - **Dispatcher**: prefix-keyed handlers for unsolicited messages
//! - **Form**: login/registration request forms
//!
//! ## Flow
//! ```text
//! Channel -> Handshake -> (Channel, Codec) -> Multiplexer -> PrefixActions
//! ```

pub mod codec;
pub mod conversation;
pub mod dispatcher;
pub mod form;
pub mod handshake;
pub mod identity;
pub mod multiplexer;
pub mod registry;


pub use codec::{Codec, Side, StdCodec};
pub use conversation::{Continuation, ConversationTable};
pub use dispatcher::PrefixActions;
pub use handshake::{ClientHandshake, CodecConfirm, Established, HandshakeState, ServerHandshake};
pub use multiplexer::Multiplexer;
pub use registry::Registry;
