//! Length-prefixed frame codec.
//!
//! Every message on a session or resolution channel is a 2-byte little-endian
//! length followed by exactly that many payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX: usize = 2;

/// Largest payload a single frame can carry
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Tokio codec implementing the channel framing
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u16::from_le_bytes([src[0], src[1]]) as usize;
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        let len = u16::try_from(item.len())
            .map_err(|_| ProtocolError::OversizedPacket(item.len()))?;
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u16_le(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_writes_little_endian_prefix() {
        let mut buf = BytesMut::new();
        FrameCodec
            .encode(Bytes::from_static(&[9, 8, 7]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[3, 0, 9, 8, 7]);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[4u8, 0, 1, 2][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[3, 4, 0xAA]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[1, 2, 3, 4]);
        // Trailing byte belongs to the next frame
        assert_eq!(&buf[..], &[0xAA]);
    }

    #[test]
    fn test_empty_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        let result = FrameCodec.encode(Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]), &mut buf);
        assert!(matches!(result, Err(ProtocolError::OversizedPacket(n)) if n == MAX_FRAME_SIZE + 1));
        assert!(buf.is_empty());
    }
}
