//! Frame codec
//!
//! `MAGIC(4) | flags(1) | length(4, big-endian) | JSON envelope`
//!
//! Flag bit 0 marks a gzip-compressed payload. A codec built without
//! compression still decodes compressed frames unless it was told to
//! refuse them, and once the remote sends compressed frames the replies
//! are compressed too.

use crate::network::message::Envelope;
use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use tokio_util::codec::{Decoder, Encoder};

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x47, 0x4F, 0x53, 0x50]; // "GOSP"

/// Largest accepted (decompressed) payload
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// Frame header length
pub const HEADER_LEN: usize = 9;

/// Payload is gzip compressed
pub const FLAG_COMPRESSED: u8 = 0x01;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Message codec for length-prefixed framing
#[derive(Debug, Clone)]
pub struct MessageCodec {
    compress: bool,
    accept_compressed: bool,
    peer_compresses: bool,
}

impl MessageCodec {
    /// Codec that compresses outgoing frames when `compress` is set
    pub fn new(compress: bool) -> Self {
        Self {
            compress,
            accept_compressed: true,
            peer_compresses: false,
        }
    }

    /// Codec that treats compressed input as a protocol error
    pub fn uncompressed_only() -> Self {
        Self {
            compress: false,
            accept_compressed: false,
            peer_compresses: false,
        }
    }

    /// Whether outgoing frames are compressed
    pub fn is_compressing(&self) -> bool {
        self.compress || self.peer_compresses
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Encoder<Envelope> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = serde_json::to_vec(&item).map_err(|e| invalid(e.to_string()))?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(invalid(format!("message too large: {} bytes", data.len())));
        }

        let (flags, payload) = if self.is_compressing() {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(&data)?;
            (FLAG_COMPRESSED, encoder.finish()?)
        } else {
            (0, data)
        };

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u8(flags);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(invalid("Invalid magic bytes"));
        }

        let flags = src[4];
        let len = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(invalid(format!("frame too large: {} bytes", len)));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);

        let envelope = if flags & FLAG_COMPRESSED != 0 {
            if !self.accept_compressed {
                return Err(invalid("compressed frames not accepted"));
            }
            self.peer_compresses = true;

            let mut data = Vec::new();
            GzDecoder::new(&payload[..])
                .take(MAX_MESSAGE_SIZE as u64 + 1)
                .read_to_end(&mut data)?;
            if data.len() > MAX_MESSAGE_SIZE {
                return Err(invalid("decompressed frame too large"));
            }
            serde_json::from_slice(&data)
        } else {
            serde_json::from_slice(&payload)
        };

        envelope.map(Some).map_err(|e| invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Message;

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::request(1, Message::Ping(12345)), &mut buf)
            .unwrap();
        assert_eq!(buf[4], 0);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.message, Message::Ping(12345));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = MessageCodec::default();
        let mut full = BytesMut::new();
        codec
            .encode(Envelope::request(1, Message::GetAddr), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_compressed_frames() {
        let mut sender = MessageCodec::new(true);
        let mut receiver = MessageCodec::new(false);
        let mut buf = BytesMut::new();
        let addrs: Vec<String> = (0..100).map(|i| format!("10.0.0.{}:13802", i % 250)).collect();
        sender
            .encode(Envelope::request(3, Message::Addr(addrs.clone())), &mut buf)
            .unwrap();
        assert_eq!(buf[4], FLAG_COMPRESSED);

        assert!(!receiver.is_compressing());
        let decoded = receiver.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.message, Message::Addr(addrs));
        // Replies follow the remote's lead
        assert!(receiver.is_compressing());
    }

    #[test]
    fn test_compressed_refused() {
        let mut sender = MessageCodec::new(true);
        let mut receiver = MessageCodec::uncompressed_only();
        let mut buf = BytesMut::new();
        sender
            .encode(Envelope::request(1, Message::Ping(1)), &mut buf)
            .unwrap();
        assert!(receiver.decode(&mut buf).is_err());
    }

    #[test]
    fn test_bad_magic_and_oversize() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x00\x01{"[..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(0);
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
