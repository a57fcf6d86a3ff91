//! Conversation tagging of decoded payloads.

use std::fmt;

use crate::error::{ProtocolError, Result};

/// One-byte conversation identifier.
///
/// `0` is reserved: a message carrying it expects no response and is never
/// locked or attached to a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(i8);

impl ConversationId {
    /// The reserved "no response expected" id, also the allocation-failure sentinel
    pub const NONE: ConversationId = ConversationId(0);

    pub const fn new(raw: i8) -> Self {
        Self(raw)
    }

    pub const fn from_byte(byte: u8) -> Self {
        Self(byte as i8)
    }

    pub const fn get(self) -> i8 {
        self.0
    }

    pub const fn to_byte(self) -> u8 {
        self.0 as u8
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<i8> for ConversationId {
    fn from(raw: i8) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Build a plaintext frame: the conversation id byte followed by the payload.
pub fn prepend(id: ConversationId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(id.to_byte());
    frame.extend_from_slice(payload);
    frame
}

/// Split a decoded frame into its conversation id and payload.
pub fn split(mut frame: Vec<u8>) -> Result<(ConversationId, Vec<u8>)> {
    if frame.is_empty() {
        return Err(ProtocolError::UnexpectedMessage);
    }
    let id = ConversationId::from_byte(frame[0]);
    frame.remove(0);
    Ok((id, frame))
}

/// Split a textual message at the first `separator` into `(prefix, body)`.
///
/// A message without the separator is all prefix with an empty body.
pub fn split_prefix(payload: &[u8], separator: u8) -> (String, &[u8]) {
    match payload.iter().position(|b| *b == separator) {
        Some(pos) => (
            String::from_utf8_lossy(&payload[..pos]).into_owned(),
            &payload[pos + 1..],
        ),
        None => (
            String::from_utf8_lossy(payload).into_owned(),
            &payload[payload.len()..],
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_ids_survive_the_wire() {
        let id = ConversationId::new(-128);
        let frame = prepend(id, b"x");
        assert_eq!(frame[0], 0x80);
        let (back, payload) = split(frame).unwrap();
        assert_eq!(back, id);
        assert_eq!(payload, b"x");
    }

    #[test]
    fn test_split_empty_frame_is_error() {
        assert!(matches!(split(Vec::new()), Err(ProtocolError::UnexpectedMessage)));
    }

    #[test]
    fn test_split_prefix() {
        let (prefix, body) = split_prefix(b"log:alice:admin", b':');
        assert_eq!(prefix, "log");
        assert_eq!(body, b"alice:admin");

        let (prefix, body) = split_prefix(b"login", b';');
        assert_eq!(prefix, "login");
        assert!(body.is_empty());
    }
}
