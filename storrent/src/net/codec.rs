use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::peer::handshake::{Handshake, HANDSHAKE_LENGTH};
use crate::peer::peer_message::Message;

/// Upper bound on a declared frame length. The largest legitimate frames
/// are Piece messages (one block plus headers) and bitfields of very large
/// torrents; anything bigger is treated as a framing violation.
pub const MAX_MESSAGE_LENGTH: usize = 1024 * 1024;

/// Codec for the fixed 68-byte handshake that opens every connection.
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> io::Result<()> {
        buf.extend_from_slice(&handshake.as_bytes());
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.len() < HANDSHAKE_LENGTH {
            return Ok(None);
        }
        let bytes = buf.split_to(HANDSHAKE_LENGTH);
        let handshake = Handshake::from_bytes(&bytes).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "Peer sent an invalid handshake")
        })?;
        Ok(Some(handshake))
    }
}

/// Codec for the length-prefixed messages that follow the handshake.
///
/// A declared length of zero decodes to `Message::KeepAlive`.
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> io::Result<()> {
        let payload = message.to_bytes();
        buf.reserve(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[0..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_MESSAGE_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Peer declared an oversized message of {} bytes", length),
            ));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let payload = buf.split_to(length);
        Message::from_bytes(&payload).map(Some).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Peer sent an unparseable message: {:?}", e),
            )
        })
    }
}
