use std::collections::HashSet;
use std::net::SocketAddr;

use crate::byte_string::PeerId;
use crate::peer::peer_message::Bitfield;

/// Accumulator for the piece currently arriving from a peer, block by block.
///
/// Blocks are requested strictly serially, so `offset` is both the number of
/// bytes received and the expected offset of the next Piece message.
#[derive(Debug)]
pub struct IncomingPiece {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
    pub data: Vec<u8>,
}

impl IncomingPiece {
    pub fn new(index: u32, length: u32) -> Self {
        Self {
            index,
            offset: 0,
            length,
            data: vec![0; length as usize],
        }
    }
}

/// State of an active, handshake-completed connection to a peer.
///
/// Exists only between handshake acceptance and connection close.
#[derive(Debug)]
pub struct PeerSession {
    pub address: SocketAddr,
    pub remote_id: PeerId,

    /// True while a block request to this peer is outstanding.
    pub active: bool,

    // long names because the four directions get confusing easily
    pub peer_is_choking_us: bool,
    pub peer_is_interested_in_us: bool,
    pub we_are_choking_peer: bool,
    pub we_are_interested_in_peer: bool,

    /// The peer's advertised pieces, sized to the torrent's piece count.
    pub bitfield: Bitfield,
    /// Pieces we still miss that this peer advertises.
    pub interesting_pieces: HashSet<u32>,
    pub incoming_piece: Option<IncomingPiece>,
}

impl PeerSession {
    pub fn new(address: SocketAddr, remote_id: PeerId, piece_count: u64) -> Self {
        Self {
            address,
            remote_id,
            active: false,
            peer_is_choking_us: true,
            peer_is_interested_in_us: false,
            we_are_choking_peer: true,
            we_are_interested_in_peer: false,
            bitfield: Bitfield::new(piece_count),
            interesting_pieces: HashSet::new(),
            incoming_piece: None,
        }
    }
}
