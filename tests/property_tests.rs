//! Property-based tests using proptest
//!
//! These tests check framing, codec and bookkeeping invariants across a
//! wide range of randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use proptest::prelude::*;
use secure_mux::core::codec::FrameCodec;
use secure_mux::core::frame::{prepend, split, ConversationId};
use secure_mux::error::{ProtocolError, Result};
use secure_mux::protocol::codec::{Codec, Side, StdCodec, STD_SECRET_LEN};
use secure_mux::protocol::conversation::ConversationTable;
use secure_mux::service::{DispatchPool, WorkHandler};
use secure_mux::utils::Metrics;
use tokio_util::codec::{Decoder, Encoder};

fn keyed(secret: &[u8], side: Side) -> StdCodec {
    let mut codec = StdCodec::new();
    assert!(codec.init(secret, side));
    codec
}

struct Discard;

impl WorkHandler<u32> for Discard {
    fn handle(&self, _item: u32) -> BoxFuture<'_, Result<()>> {
        async { Ok(()) }.boxed()
    }
}

// Property: any payload that fits survives channel framing
proptest! {
    #[test]
    fn prop_frame_roundtrip(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from(payload.clone()), &mut buf).expect("encode should not fail");
        prop_assert_eq!(buf.len(), payload.len() + 2);

        let decoded = codec.decode(&mut buf).expect("decode should not fail").expect("complete frame");
        prop_assert_eq!(decoded.as_ref(), payload.as_slice());
        prop_assert!(buf.is_empty());
    }
}

// Property: a truncated frame is never yielded early
proptest! {
    #[test]
    fn prop_partial_frame_waits(payload in prop::collection::vec(any::<u8>(), 1..512), cut in 0usize..512) {
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec.encode(Bytes::from(payload.clone()), &mut full).unwrap();
        let cut = cut % full.len();

        let mut partial = BytesMut::from(&full[..cut]);
        prop_assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}

// Property: the conversation id survives prepend/split
proptest! {
    #[test]
    fn prop_prepend_split(raw in any::<i8>(), payload in prop::collection::vec(any::<u8>(), 0..256)) {
        let id = ConversationId::new(raw);
        let (back, body) = split(prepend(id, &payload)).unwrap();
        prop_assert_eq!(back, id);
        prop_assert_eq!(body, payload);
    }
}

// Property: decode(encode(frame)) == frame for peers keyed with the same secret,
// across a sequence of frames in both directions
proptest! {
    #[test]
    fn prop_std_codec_law(
        secret in prop::collection::vec(any::<u8>(), STD_SECRET_LEN),
        frames in prop::collection::vec(
            (any::<i8>(), prop::collection::vec(any::<u8>(), 0..512)),
            1..8,
        ),
    ) {
        let mut client = keyed(&secret, Side::Client);
        let mut server = keyed(&secret, Side::Server);

        for (raw, payload) in frames {
            let frame = prepend(ConversationId::new(raw), &payload);

            let wire = client.encode(&frame).unwrap();
            prop_assert_eq!(server.decode(&wire).unwrap(), frame.clone());

            let wire = server.encode(&frame).unwrap();
            prop_assert_eq!(client.decode(&wire).unwrap(), frame);
        }
    }
}

// Property: keying is deterministic; equal inputs give equal codecs
proptest! {
    #[test]
    fn prop_std_codec_init_deterministic(
        secret in prop::collection::vec(any::<u8>(), STD_SECRET_LEN),
        frame in prop::collection::vec(any::<u8>(), 1..256),
    ) {
        let mut a = keyed(&secret, Side::Client);
        let mut b = keyed(&secret, Side::Client);
        prop_assert_eq!(a.encode(&frame).unwrap(), b.encode(&frame).unwrap());
    }
}

// Property: secrets of the wrong length are refused without panicking
proptest! {
    #[test]
    fn prop_std_codec_rejects_wrong_secret(len in 0usize..128) {
        prop_assume!(len != STD_SECRET_LEN);
        let mut codec = StdCodec::new();
        prop_assert!(!codec.init(&vec![7u8; len], Side::Server));
    }
}

// Property: allocation never hands out an id that was already locked, nor 0
proptest! {
    #[test]
    fn prop_allocate_skips_locked(locked in prop::collection::hash_set(any::<i8>(), 0..250)) {
        let table = ConversationTable::new();
        for raw in &locked {
            table.lock(ConversationId::new(*raw));
        }
        let before: HashSet<i8> = locked
            .iter()
            .copied()
            .filter(|raw| table.is_locked(ConversationId::new(*raw)))
            .collect();

        let id = table.allocate_id();
        if !id.is_none() {
            prop_assert!(!before.contains(&id.get()));
            prop_assert!(table.is_locked(id));
        }
    }
}

// Property: the backlog never holds more than its capacity
proptest! {
    #[test]
    fn prop_backlog_bounded(capacity in 1usize..64, offered in 0usize..200) {
        let pool = DispatchPool::new(1, capacity, Arc::new(Discard), Arc::new(Metrics::new()));

        let mut accepted = 0usize;
        for n in 0..offered {
            match pool.enqueue(n as u32) {
                Ok(()) => accepted += 1,
                Err(ProtocolError::BacklogFull(c)) => prop_assert_eq!(c, capacity),
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
            prop_assert!(pool.stats().queued <= capacity);
        }

        let stats = pool.stats();
        prop_assert_eq!(accepted, offered.min(capacity));
        prop_assert_eq!(stats.dropped as usize, offered - accepted);
    }
}
