use std::path::PathBuf;

use crate::byte_string::{InfoHash, PeerId};
use crate::peer::peer_message::Bitfield;
use crate::torrent::TorrentState;

/// Snapshot of one peer session for a UI, taken on the engine loop.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub peer_id: PeerId,
    pub ip: String,
    pub port: u16,
    /// How much of the torrent the peer advertises, 0.0 to 100.0.
    pub progress: f64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub we_choking_it: bool,
    pub it_choking_us: bool,
    pub we_interested: bool,
    pub it_interested: bool,
    pub connected: bool,
}

/// Snapshot of one torrent for a UI, taken on the engine loop.
#[derive(Debug, Clone)]
pub struct TorrentView {
    pub info_hash: InfoHash,
    pub display_name: String,
    pub size: u64,
    pub state: TorrentState,
    pub progress: f64,
    pub check_progress: f64,
    /// Sum of the sessions' speeds, bytes per second.
    pub download_speed: u64,
    pub upload_speed: u64,
    pub save_path: PathBuf,
    pub peers: Vec<PeerView>,
    pub bitfield: Bitfield,
}
