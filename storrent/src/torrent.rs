use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::byte_string::{InfoHash, PeerId};
use crate::net::connection::ConnectionId;
use crate::peer::peer::Peer;
use crate::peer::peer_message::Bitfield;
use crate::peer::session::PeerSession;
use crate::piece_heap::{PieceHeap, PieceStatus};
use crate::storage::LocalFile;
use crate::torrent_parser::torrent::MetaInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Error,
    Stopped,
    Started,
    Seeding,
}

pub fn state_to_string(state: TorrentState) -> &'static str {
    match state {
        TorrentState::Error => "Error",
        TorrentState::Stopped => "Stopped",
        TorrentState::Started => "Started",
        TorrentState::Seeding => "Seeding",
    }
}

/// All state of one torrent, owned by the engine task.
///
/// Peers and sessions live in the torrent's own tables; sessions are keyed
/// by their connection id, and missing pieces carry the haver sets and heap
/// back-indices the scheduler works with.
#[derive(Debug)]
pub struct Torrent {
    pub display_name: String,
    pub data_path: PathBuf,
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
    pub piece_count: u64,
    pub nominal_piece_length: u64,
    pub total_length: u64,
    pub announce_urls: Vec<Vec<String>>,
    pub tracker_session_key: u64,
    pub local_files: Vec<LocalFile>,
    pub piece_hashes: Vec<u8>,

    pub state: TorrentState,
    pub local_bitfield: Bitfield,
    pub check_progress: f64,
    pub peers: HashMap<SocketAddr, Peer>,
    pub peer_sessions: HashMap<ConnectionId, PeerSession>,
    pub missing_pieces: HashMap<u32, PieceStatus>,
    pub piece_heap: PieceHeap,
}

impl Torrent {
    /// Builds the torrent record from its descriptor. Local file paths are
    /// `data_root`, then the torrent's root directory name when it has one,
    /// then each file's declared path. Nothing touches the disk here.
    pub fn new(meta_info: &MetaInfo, data_root: &Path) -> Torrent {
        let mut data_path = data_root.to_path_buf();
        if let Some(root_dir) = meta_info.root_dir_name() {
            data_path = data_path.join(root_dir);
        }

        let local_files = meta_info
            .files_in_torrent()
            .into_iter()
            .map(|file| LocalFile::new(data_path.join(&file.path), file.length))
            .collect();

        let piece_count = meta_info.piece_count();

        Torrent {
            display_name: meta_info.name(),
            data_path,
            info_hash: meta_info.info_hash,
            local_peer_id: PeerId::random(),
            piece_count,
            nominal_piece_length: meta_info.piece_length(),
            total_length: meta_info.total_length(),
            announce_urls: meta_info.announce_list.clone(),
            tracker_session_key: rand::thread_rng().gen(),
            local_files,
            piece_hashes: meta_info.info.pieces.clone(),
            state: TorrentState::Stopped,
            local_bitfield: Bitfield::new(piece_count),
            check_progress: 0.0,
            peers: HashMap::new(),
            peer_sessions: HashMap::new(),
            missing_pieces: HashMap::new(),
            piece_heap: PieceHeap::new(),
        }
    }

    /// Length of the piece at `index`; only the last piece may be shorter
    /// than the nominal length.
    pub fn piece_length(&self, index: u32) -> u64 {
        if index as u64 == self.piece_count - 1 && self.total_length % self.nominal_piece_length > 0
        {
            self.total_length % self.nominal_piece_length
        } else {
            self.nominal_piece_length
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, TorrentState::Started | TorrentState::Seeding)
    }
}
