use crate::byte_string::{InfoHash, PeerId};

#[derive(Debug, PartialEq)]
pub enum FromHandshakeError {
    InvalidHandshake,
}

pub const PSTR: &str = "BitTorrent protocol";

/// The handshake exchanged when a connection opens, before any framed
/// message. Exactly 68 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

/// Wire size: 1 pstrlen byte, 19 pstr bytes, 8 reserved, 20 info hash,
/// 20 peer id.
pub const HANDSHAKE_LENGTH: usize = 68;

impl Handshake {
    /// Creates a new `Handshake` with all reserved bits zero.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Converts a `Handshake` message to its 68 wire bytes.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_LENGTH);
        bytes.push(PSTR.len() as u8);
        bytes.extend(PSTR.as_bytes());
        bytes.extend(&self.reserved);
        bytes.extend(self.info_hash.as_bytes());
        bytes.extend(self.peer_id.as_bytes());
        bytes
    }

    /// Parses a byte array into a `Handshake` message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FromHandshakeError> {
        if bytes.len() != HANDSHAKE_LENGTH {
            return Err(FromHandshakeError::InvalidHandshake);
        }

        if bytes[0] as usize != PSTR.len() || &bytes[1..20] != PSTR.as_bytes() {
            return Err(FromHandshakeError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);

        let info_hash =
            InfoHash::try_from(&bytes[28..48]).map_err(|_| FromHandshakeError::InvalidHandshake)?;
        let peer_id =
            PeerId::try_from(&bytes[48..68]).map_err(|_| FromHandshakeError::InvalidHandshake)?;

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}
