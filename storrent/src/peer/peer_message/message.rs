// IDs of the messages defined in the protocol.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

/// A peer wire message, without its length prefix.
///
/// `KeepAlive` stands for the empty (length 0) frame and has no id byte.
/// The bitfield payload stays raw here; only the engine knows the torrent's
/// piece count needed to validate it.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: u32,
    },
    Bitfield(Vec<u8>),
    Request {
        piece_index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        piece_index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        piece_index: u32,
        begin: u32,
        length: u32,
    },
}

#[derive(Debug, PartialEq)]
pub enum MessageError {
    UnknownMessageId(u8),
    InvalidPayload(MessageId),
}

impl Message {
    /// Parses an unframed payload (id byte included) into a `Message`.
    ///
    /// An empty payload is a keep-alive.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, MessageError> {
        let (id_byte, rest) = match payload.split_first() {
            Some((id, rest)) => (*id, rest),
            None => return Ok(Message::KeepAlive),
        };

        let id = match id_byte {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            other => return Err(MessageError::UnknownMessageId(other)),
        };

        match id {
            MessageId::Choke => Self::expect_empty(id, rest, Message::Choke),
            MessageId::Unchoke => Self::expect_empty(id, rest, Message::Unchoke),
            MessageId::Interested => Self::expect_empty(id, rest, Message::Interested),
            MessageId::NotInterested => Self::expect_empty(id, rest, Message::NotInterested),
            MessageId::Have => {
                let piece_index = Self::read_u32(id, rest, 0)?;
                if rest.len() != 4 {
                    return Err(MessageError::InvalidPayload(id));
                }
                Ok(Message::Have { piece_index })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(rest.to_vec())),
            MessageId::Request => {
                if rest.len() != 12 {
                    return Err(MessageError::InvalidPayload(id));
                }
                Ok(Message::Request {
                    piece_index: Self::read_u32(id, rest, 0)?,
                    begin: Self::read_u32(id, rest, 4)?,
                    length: Self::read_u32(id, rest, 8)?,
                })
            }
            MessageId::Piece => {
                if rest.len() < 8 {
                    return Err(MessageError::InvalidPayload(id));
                }
                Ok(Message::Piece {
                    piece_index: Self::read_u32(id, rest, 0)?,
                    begin: Self::read_u32(id, rest, 4)?,
                    block: rest[8..].to_vec(),
                })
            }
            MessageId::Cancel => {
                if rest.len() != 12 {
                    return Err(MessageError::InvalidPayload(id));
                }
                Ok(Message::Cancel {
                    piece_index: Self::read_u32(id, rest, 0)?,
                    begin: Self::read_u32(id, rest, 4)?,
                    length: Self::read_u32(id, rest, 8)?,
                })
            }
        }
    }

    /// Serializes the message to its unframed form (id byte plus payload).
    ///
    /// A keep-alive serializes to no bytes at all.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => vec![],
            Message::Choke => vec![MessageId::Choke as u8],
            Message::Unchoke => vec![MessageId::Unchoke as u8],
            Message::Interested => vec![MessageId::Interested as u8],
            Message::NotInterested => vec![MessageId::NotInterested as u8],
            Message::Have { piece_index } => {
                let mut bytes = vec![MessageId::Have as u8];
                bytes.extend(piece_index.to_be_bytes());
                bytes
            }
            Message::Bitfield(data) => {
                let mut bytes = vec![MessageId::Bitfield as u8];
                bytes.extend(data);
                bytes
            }
            Message::Request {
                piece_index,
                begin,
                length,
            } => Self::block_info_bytes(MessageId::Request, *piece_index, *begin, *length),
            Message::Piece {
                piece_index,
                begin,
                block,
            } => {
                let mut bytes = vec![MessageId::Piece as u8];
                bytes.extend(piece_index.to_be_bytes());
                bytes.extend(begin.to_be_bytes());
                bytes.extend(block);
                bytes
            }
            Message::Cancel {
                piece_index,
                begin,
                length,
            } => Self::block_info_bytes(MessageId::Cancel, *piece_index, *begin, *length),
        }
    }

    /// Short human-readable name, used in log lines and close reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "KeepAlive",
            Message::Choke => "Choke",
            Message::Unchoke => "Unchoke",
            Message::Interested => "Interested",
            Message::NotInterested => "NotInterested",
            Message::Have { .. } => "Have",
            Message::Bitfield(_) => "Bitfield",
            Message::Request { .. } => "Request",
            Message::Piece { .. } => "Piece",
            Message::Cancel { .. } => "Cancel",
        }
    }

    fn block_info_bytes(id: MessageId, piece_index: u32, begin: u32, length: u32) -> Vec<u8> {
        let mut bytes = vec![id as u8];
        bytes.extend(piece_index.to_be_bytes());
        bytes.extend(begin.to_be_bytes());
        bytes.extend(length.to_be_bytes());
        bytes
    }

    fn expect_empty(
        id: MessageId,
        rest: &[u8],
        message: Message,
    ) -> Result<Message, MessageError> {
        if rest.is_empty() {
            Ok(message)
        } else {
            Err(MessageError::InvalidPayload(id))
        }
    }

    fn read_u32(id: MessageId, payload: &[u8], at: usize) -> Result<u32, MessageError> {
        let bytes = payload
            .get(at..at + 4)
            .ok_or(MessageError::InvalidPayload(id))?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(buf))
    }
}
