//! Length-delimited JSON codec, one message per datagram.
//!
//! Wire format: 4-byte big-endian length prefix + serde JSON payload.
//! A datagram arrives whole or not at all, so a short buffer is an error
//! on the receive path rather than a reason to wait for more bytes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::Message;
use crate::{ProtocolError, MAX_DATAGRAM_SIZE};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest JSON body that still fits a datagram with its prefix.
const MAX_BODY_SIZE: usize = MAX_DATAGRAM_SIZE - LENGTH_PREFIX_SIZE;

/// Codec for framing Message values into datagrams.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    /// Encode a message into a fresh buffer ready for `send_to`.
    pub fn encode_datagram(&mut self, message: &Message) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf)
    }

    /// Decode exactly one message from a received datagram.
    pub fn decode_datagram(&mut self, datagram: &[u8]) -> Result<Message, ProtocolError> {
        let mut buf = BytesMut::from(datagram);
        match self.decode(&mut buf)? {
            Some(message) => Ok(message),
            None => {
                let claimed = if datagram.len() >= LENGTH_PREFIX_SIZE {
                    u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]])
                        as usize
                } else {
                    LENGTH_PREFIX_SIZE
                };
                Err(ProtocolError::Truncated {
                    claimed,
                    available: datagram.len(),
                })
            }
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_BODY_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: MAX_BODY_SIZE,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let msg_bytes = src.split_to(length);

        let message: Message = serde_json::from_slice(&msg_bytes)?;
        Ok(Some(message))
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(item)?;

        if payload.len() > MAX_BODY_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_BODY_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
