use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use logger::logger_sender::LoggerSender;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::byte_string::{InfoHash, PeerId};
use crate::config::cfg::Cfg;
use crate::net::connection::{ConnectionId, ConnectionStats};
use crate::net::connection_manager::{
    ConnectionEvent, ConnectionManager, ConnectionManagerHandle,
};
use crate::peer::handshake::Handshake;
use crate::peer::peer::{Peer, PeerStatus};
use crate::peer::peer_message::{Bitfield, Message};
use crate::peer::session::{IncomingPiece, PeerSession};
use crate::piece_heap::PieceStatus;
use crate::storage::allocator::ensure_local_files;
use crate::storage::piece_map::PieceDataMap;
use crate::torrent::{state_to_string, Torrent, TorrentState};
use crate::torrent_parser::torrent::MetaInfo;
use crate::tracker::announcer::{AnnounceStats, Announcer, AnnouncerHandle};
use crate::view::{PeerView, TorrentView};
use crate::BLOCK_LENGTH;

/// Commands the engine receives on its loop: the public API plus the
/// announcers' peer deliveries.
pub enum Command {
    AddTorrent {
        meta_info: Box<MetaInfo>,
        data_root: PathBuf,
    },
    /// Installs a verified bitfield (from the checker) before a start.
    SetLocalBitfield {
        info_hash: InfoHash,
        bitfield: Bitfield,
    },
    SetCheckProgress {
        info_hash: InfoHash,
        percent: f64,
    },
    StartTorrent {
        info_hash: InfoHash,
    },
    StopTorrent {
        info_hash: InfoHash,
    },
    PeersDiscovered {
        info_hash: InfoHash,
        addresses: Vec<SocketAddr>,
    },
    GetTorrentViews {
        reply_tx: oneshot::Sender<Vec<TorrentView>>,
    },
    Shutdown,
}

/// Handle for driving a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    listen_port: u16,
}

impl EngineHandle {
    /// Registers a torrent without touching the disk.
    pub fn add_torrent(&self, meta_info: MetaInfo, data_root: PathBuf) {
        self.cmd_tx
            .send(Command::AddTorrent {
                meta_info: Box::new(meta_info),
                data_root,
            })
            .ok();
    }

    /// Delivers a checker-produced bitfield; only meaningful before
    /// `start_torrent`.
    pub fn set_local_bitfield(&self, info_hash: InfoHash, bitfield: Bitfield) {
        self.cmd_tx
            .send(Command::SetLocalBitfield {
                info_hash,
                bitfield,
            })
            .ok();
    }

    pub fn set_check_progress(&self, info_hash: InfoHash, percent: f64) {
        self.cmd_tx
            .send(Command::SetCheckProgress { info_hash, percent })
            .ok();
    }

    pub fn start_torrent(&self, info_hash: InfoHash) {
        self.cmd_tx.send(Command::StartTorrent { info_hash }).ok();
    }

    pub fn stop_torrent(&self, info_hash: InfoHash) {
        self.cmd_tx.send(Command::StopTorrent { info_hash }).ok();
    }

    /// Snapshot of every torrent, for a UI.
    pub async fn torrent_views(&self) -> Vec<TorrentView> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetTorrentViews { reply_tx })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub fn shutdown(&self) {
        self.cmd_tx.send(Command::Shutdown).ok();
    }

    /// The port peers can reach us on; differs from the configured one when
    /// that was 0.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }
}

struct PendingPeer {
    info_hash: InfoHash,
    address: SocketAddr,
    remote_id: Option<PeerId>,
}

/// The central scheduler: owns every torrent's state and drives the
/// peer-session state machines.
///
/// Everything runs on one task; connection-manager events, announcer
/// deliveries and API commands are observed serially.
pub struct Engine {
    cfg: Cfg,
    listen_port: u16,
    connection_manager: ConnectionManagerHandle,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    torrents: HashMap<InfoHash, Torrent>,
    /// Dialed or accepted connections whose session does not exist yet.
    connecting: HashMap<ConnectionId, PendingPeer>,
    /// Established sessions, mapped back to their torrent.
    sessions: HashMap<ConnectionId, InfoHash>,
    announcers: HashMap<InfoHash, AnnouncerHandle>,
    announce_left: HashMap<InfoHash, Arc<AtomicU64>>,
    data_maps: HashMap<InfoHash, PieceDataMap>,
    connection_stats: HashMap<ConnectionId, ConnectionStats>,
    logger_sender: LoggerSender,
}

impl Engine {
    /// Binds the listening socket and spawns the engine task.
    pub async fn spawn(
        cfg: Cfg,
        logger_sender: LoggerSender,
    ) -> io::Result<(EngineHandle, JoinHandle<()>)> {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (connection_manager, listen_addr, _manager_join) =
            ConnectionManager::spawn(cfg.listen_port, conn_tx).await?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let mut engine = Engine {
            cfg,
            listen_port: listen_addr.port(),
            connection_manager,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            conn_rx,
            torrents: HashMap::new(),
            connecting: HashMap::new(),
            sessions: HashMap::new(),
            announcers: HashMap::new(),
            announce_left: HashMap::new(),
            data_maps: HashMap::new(),
            connection_stats: HashMap::new(),
            logger_sender,
        };
        let listen_port = engine.listen_port;

        let join_handle = tokio::spawn(async move { engine.run().await });
        Ok((
            EngineHandle {
                cmd_tx,
                listen_port,
            },
            join_handle,
        ))
    }

    async fn run(&mut self) {
        self.logger_sender.info("Engine started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        self.shutdown();
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                },
                event = self.conn_rx.recv() => match event {
                    Some(event) => self.handle_connection_event(event),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
            }
        }
        self.logger_sender.info("Engine stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddTorrent {
                meta_info,
                data_root,
            } => self.add_torrent(&meta_info, data_root),
            Command::SetLocalBitfield {
                info_hash,
                bitfield,
            } => self.set_local_bitfield(info_hash, bitfield),
            Command::SetCheckProgress { info_hash, percent } => {
                if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                    torrent.check_progress = percent;
                }
            }
            Command::StartTorrent { info_hash } => self.start_torrent(info_hash),
            Command::StopTorrent { info_hash } => self.stop_torrent(info_hash),
            Command::PeersDiscovered {
                info_hash,
                addresses,
            } => self.peers_discovered(info_hash, addresses),
            Command::GetTorrentViews { reply_tx } => {
                reply_tx.send(self.build_views()).ok();
            }
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::OutgoingHandshake {
                connection_id,
                handshake,
            } => self.on_outgoing_handshake(connection_id, handshake),
            ConnectionEvent::IncomingHandshake {
                connection_id,
                handshake,
                address,
            } => self.on_incoming_handshake(connection_id, handshake, address),
            ConnectionEvent::Established { connection_id } => {
                self.on_connection_established(connection_id)
            }
            ConnectionEvent::MessageReceived {
                connection_id,
                message,
            } => self.on_message(connection_id, message),
            ConnectionEvent::Disconnected {
                connection_id,
                reason,
            } => self.on_peer_disconnect(connection_id, &reason),
            ConnectionEvent::StatsUpdate(stats) => self.connection_stats = stats,
        }
    }

    fn shutdown(&mut self) {
        let active: Vec<InfoHash> = self
            .torrents
            .values()
            .filter(|torrent| torrent.is_active())
            .map(|torrent| torrent.info_hash)
            .collect();
        for info_hash in active {
            self.stop_torrent(info_hash);
        }
        self.connection_manager.shutdown();
    }

    // ------------------------------------------------------------------
    // Torrent lifecycle

    fn add_torrent(&mut self, meta_info: &MetaInfo, data_root: PathBuf) {
        let torrent = Torrent::new(meta_info, &data_root);
        self.logger_sender.info(&format!(
            "Added torrent {} ({})",
            torrent.display_name, torrent.info_hash
        ));
        self.torrents.insert(torrent.info_hash, torrent);
    }

    fn set_local_bitfield(&mut self, info_hash: InfoHash, bitfield: Bitfield) {
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            if torrent.state == TorrentState::Stopped
                && bitfield.size() == torrent.piece_count
            {
                torrent.local_bitfield = bitfield;
                torrent.check_progress = 100.0;
            }
        }
    }

    fn start_torrent(&mut self, info_hash: InfoHash) {
        let logger_sender = self.logger_sender.clone();
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            logger_sender.warn(&format!("Cannot start unknown torrent {}", info_hash));
            return;
        };
        if torrent.is_active() {
            return;
        }

        if let Err(e) = ensure_local_files(&torrent.local_files) {
            logger_sender.error(&format!(
                "Error creating files for torrent {}: {}",
                torrent.display_name, e
            ));
            torrent.state = TorrentState::Error;
            return;
        }

        let data_map = match PieceDataMap::open(
            torrent.nominal_piece_length,
            torrent.piece_hashes.clone(),
            &torrent.local_files,
        ) {
            Ok(data_map) => data_map,
            Err(e) => {
                logger_sender.error(&format!(
                    "Error opening the data map of torrent {}: {}",
                    torrent.display_name, e
                ));
                torrent.state = TorrentState::Error;
                return;
            }
        };

        if torrent.local_bitfield.progress() < 100.0 {
            for index in 0..torrent.piece_count {
                if !torrent.local_bitfield.get(index) {
                    torrent
                        .missing_pieces
                        .insert(index as u32, PieceStatus::new(index as u32));
                }
            }
            torrent.state = TorrentState::Started;
        } else {
            torrent.state = TorrentState::Seeding;
        }
        logger_sender.info(&format!(
            "Torrent {} started as {}",
            torrent.display_name,
            state_to_string(torrent.state)
        ));

        let left = torrent.local_bitfield.zeroes() * torrent.nominal_piece_length;
        let announce_urls = torrent.announce_urls.clone();
        let local_peer_id = torrent.local_peer_id;
        let tracker_session_key = torrent.tracker_session_key;

        self.data_maps.insert(info_hash, data_map);

        if announce_urls.iter().any(|tier| !tier.is_empty()) {
            let left_counter = Arc::new(AtomicU64::new(left));
            let stats_left = left_counter.clone();
            // Upload/download totals are not tracked yet, only `left` is
            // kept current.
            let get_stats = Box::new(move || AnnounceStats {
                downloaded: 0,
                uploaded: 0,
                left: stats_left.load(Ordering::Relaxed),
            });
            let (announcer, _join) = Announcer::spawn(
                info_hash,
                announce_urls,
                local_peer_id,
                self.listen_port,
                tracker_session_key,
                get_stats,
                self.cmd_tx.clone(),
                self.logger_sender.clone(),
            );
            self.announcers.insert(info_hash, announcer);
            self.announce_left.insert(info_hash, left_counter);
        }

        // We might already know peers; no need to wait for an announce.
        self.connect_more_peers(info_hash);
    }

    fn stop_torrent(&mut self, info_hash: InfoHash) {
        if let Some(announcer) = self.announcers.remove(&info_hash) {
            announcer.stopped();
        }
        self.announce_left.remove(&info_hash);

        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        torrent.state = TorrentState::Stopped;
        torrent.piece_heap.clear(&mut torrent.missing_pieces);
        torrent.missing_pieces.clear();
        for &session_id in torrent.peer_sessions.keys() {
            self.connection_manager
                .close_connection(session_id, "Stopping torrent");
        }
        self.data_maps.remove(&info_hash);
        self.logger_sender
            .info(&format!("Stopping torrent {}", info_hash));
    }

    // A storage failure takes the whole torrent down.
    fn fail_torrent(&mut self, info_hash: InfoHash, context: &str) {
        self.logger_sender
            .error(&format!("Torrent {} failed: {}", info_hash, context));
        if let Some(announcer) = self.announcers.remove(&info_hash) {
            announcer.stopped();
        }
        self.announce_left.remove(&info_hash);
        self.data_maps.remove(&info_hash);
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            torrent.state = TorrentState::Error;
            torrent.piece_heap.clear(&mut torrent.missing_pieces);
            torrent.missing_pieces.clear();
            for &session_id in torrent.peer_sessions.keys() {
                self.connection_manager
                    .close_connection(session_id, "Torrent storage error");
            }
        }
    }

    // ------------------------------------------------------------------
    // Peer acquisition

    fn peers_discovered(&mut self, info_hash: InfoHash, addresses: Vec<SocketAddr>) {
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        if torrent.state != TorrentState::Started {
            return;
        }
        for address in addresses {
            torrent
                .peers
                .entry(address)
                .or_insert_with(|| Peer::new(address));
        }
        self.connect_more_peers(info_hash);
    }

    /// Both established sessions and connections still in handshake count
    /// against the limits.
    fn available_slots_for_torrent(&self, info_hash: InfoHash) -> u64 {
        let Some(torrent) = self.torrents.get(&info_hash) else {
            return 0;
        };
        let mut for_torrent = torrent.peer_sessions.len() as u64;
        for pending in self.connecting.values() {
            if pending.info_hash == info_hash {
                for_torrent += 1;
            }
        }
        let total = (self.sessions.len() + self.connecting.len()) as u64;

        self.cfg
            .max_connections_per_torrent
            .saturating_sub(for_torrent)
            .min(self.cfg.max_total_connections.saturating_sub(total))
    }

    fn connect_more_peers(&mut self, info_hash: InfoHash) {
        let mut available_slots = self.available_slots_for_torrent(info_hash);
        debug!(
            "We have {} available slots for new connections",
            available_slots
        );

        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let local_peer_id = torrent.local_peer_id;

        let mut to_dial = Vec::new();
        for peer in torrent.peers.values_mut() {
            if available_slots == 0 {
                break;
            }
            debug!("Peer {} status: {}", peer.address, peer.status_str());
            if peer.status == PeerStatus::Available {
                peer.status = PeerStatus::InUse;
                to_dial.push(peer.address);
                available_slots -= 1;
            }
        }

        for address in to_dial {
            let connection_id = self
                .connection_manager
                .connect(address, Handshake::new(info_hash, local_peer_id));
            debug!(
                "Connecting to peer {} connection id: {}",
                address, connection_id
            );
            self.connecting.insert(
                connection_id,
                PendingPeer {
                    info_hash,
                    address,
                    remote_id: None,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Handshakes and session lifecycle

    fn on_outgoing_handshake(&mut self, connection_id: ConnectionId, handshake: Handshake) {
        let Some(pending) = self.connecting.get_mut(&connection_id) else {
            self.connection_manager.accept_outgoing(connection_id, false);
            return;
        };
        let Some(torrent) = self.torrents.get(&pending.info_hash) else {
            self.connection_manager.accept_outgoing(connection_id, false);
            return;
        };

        if torrent.info_hash != handshake.info_hash {
            debug!("Peer sent a handshake with the wrong torrent info hash, disconnecting.");
            self.connection_manager.accept_outgoing(connection_id, false);
            return;
        }
        if handshake.peer_id == torrent.local_peer_id {
            debug!("Refusing connection to ourselves.");
            self.connection_manager.accept_outgoing(connection_id, false);
            return;
        }

        pending.remote_id = Some(handshake.peer_id);
        self.connection_manager.accept_outgoing(connection_id, true);
    }

    fn on_incoming_handshake(
        &mut self,
        connection_id: ConnectionId,
        handshake: Handshake,
        address: SocketAddr,
    ) {
        let info_hash = handshake.info_hash;
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            debug!("Peer sent a handshake with an unknown torrent info hash, disconnecting.");
            self.connection_manager.accept_incoming(connection_id, None);
            return;
        };

        if !torrent.is_active() {
            debug!(
                "Refusing connection from {} because torrent {} is currently {}",
                address,
                info_hash,
                state_to_string(torrent.state)
            );
            self.connection_manager.accept_incoming(connection_id, None);
            return;
        }
        if handshake.peer_id == torrent.local_peer_id {
            debug!("Refusing connection from ourselves.");
            self.connection_manager.accept_incoming(connection_id, None);
            return;
        }
        let local_peer_id = torrent.local_peer_id;
        if self.available_slots_for_torrent(info_hash) == 0 {
            debug!(
                "Refusing connection from {} for torrent {} because we have no available slots.",
                address, info_hash
            );
            self.connection_manager.accept_incoming(connection_id, None);
            return;
        }

        let torrent = self
            .torrents
            .get_mut(&info_hash)
            .expect("torrent just looked up");
        let peer = torrent
            .peers
            .entry(address)
            .or_insert_with(|| Peer::new(address));
        peer.status = PeerStatus::InUse;

        self.connecting.insert(
            connection_id,
            PendingPeer {
                info_hash,
                address,
                remote_id: Some(handshake.peer_id),
            },
        );
        self.connection_manager
            .accept_incoming(connection_id, Some(Handshake::new(info_hash, local_peer_id)));
    }

    fn on_connection_established(&mut self, connection_id: ConnectionId) {
        let Some(pending) = self.connecting.remove(&connection_id) else {
            return;
        };
        let Some(torrent) = self.torrents.get_mut(&pending.info_hash) else {
            self.connection_manager
                .close_connection(connection_id, "Connection established after torrent stopped");
            return;
        };
        if !torrent.is_active() {
            self.connection_manager
                .close_connection(connection_id, "Connection established after torrent stopped");
            return;
        }

        let Some(remote_id) = pending.remote_id else {
            self.connection_manager
                .close_connection(connection_id, "Connection established without a peer id");
            return;
        };

        let session = PeerSession::new(pending.address, remote_id, torrent.piece_count);
        self.logger_sender.info(&format!(
            "Peer connected: {} ({})",
            pending.address, remote_id
        ));
        torrent.peer_sessions.insert(connection_id, session);
        self.sessions.insert(connection_id, pending.info_hash);

        self.connection_manager.send_message(
            connection_id,
            Message::Bitfield(torrent.local_bitfield.to_vec()),
        );
    }

    fn on_peer_disconnect(&mut self, connection_id: ConnectionId, reason: &str) {
        debug!("Disconnected {}: {}", connection_id, reason);

        let (info_hash, address) = if let Some(pending) = self.connecting.remove(&connection_id)
        {
            (pending.info_hash, pending.address)
        } else if let Some(info_hash) = self.sessions.remove(&connection_id) {
            let Some(torrent) = self.torrents.get_mut(&info_hash) else {
                return;
            };
            let Some(session) = torrent.peer_sessions.remove(&connection_id) else {
                return;
            };

            if torrent.state == TorrentState::Started {
                for piece_index in &session.interesting_pieces {
                    if let Some(status) = torrent.missing_pieces.get_mut(piece_index) {
                        status.havers.remove(&connection_id);
                    }
                }
                if let Some(piece) = &session.incoming_piece {
                    let piece_index = piece.index;
                    self.insert_piece_in_heap(info_hash, piece_index);
                }
            }
            (info_hash, session.address)
        } else {
            return;
        };

        self.logger_sender
            .info(&format!("Peer {} disconnected: {}", address, reason));

        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        if let Some(peer) = torrent.peers.get_mut(&address) {
            peer.status = if reason == "Stopping torrent" {
                PeerStatus::Available
            } else {
                PeerStatus::Errored
            };
        }

        if torrent.local_bitfield.progress() < 100.0 && torrent.state == TorrentState::Started {
            self.connect_more_peers(info_hash);
        }
    }

    // ------------------------------------------------------------------
    // Message handling

    fn on_message(&mut self, connection_id: ConnectionId, message: Message) {
        let Some(&info_hash) = self.sessions.get(&connection_id) else {
            return;
        };
        let active = self
            .torrents
            .get(&info_hash)
            .map(|torrent| torrent.is_active())
            .unwrap_or(false);
        if !active {
            debug!("Discarding message because torrent is not started anymore");
            return;
        }

        let result = match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => self.handle_choke(connection_id, info_hash),
            Message::Unchoke => self.handle_unchoke(connection_id, info_hash),
            Message::Interested => self.handle_interested(connection_id, info_hash),
            Message::NotInterested => self.handle_not_interested(connection_id, info_hash),
            Message::Have { piece_index } => {
                self.handle_have(connection_id, info_hash, piece_index)
            }
            Message::Bitfield(data) => self.handle_bitfield(connection_id, info_hash, data),
            Message::Request {
                piece_index,
                begin,
                length,
            } => self.handle_request(connection_id, info_hash, piece_index, begin, length),
            Message::Piece {
                piece_index,
                begin,
                block,
            } => self.handle_piece_message(connection_id, info_hash, piece_index, begin, block),
            Message::Cancel { .. } => {
                debug!("Ignoring unsupported Cancel message");
                Ok(())
            }
        };

        if let Err(reason) = result {
            self.connection_manager
                .close_connection(connection_id, &reason);
        }
    }

    fn handle_choke(
        &mut self,
        connection_id: ConnectionId,
        info_hash: InfoHash,
    ) -> Result<(), String> {
        let mut abandoned_piece = None;
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            if let Some(session) = torrent.peer_sessions.get_mut(&connection_id) {
                session.peer_is_choking_us = true;
                if let Some(piece) = session.incoming_piece.take() {
                    debug!(
                        "Choked while downloading piece {}, giving up on it",
                        piece.index
                    );
                    session.active = false;
                    abandoned_piece = Some(piece.index);
                }
            }
        }
        if let Some(piece_index) = abandoned_piece {
            self.insert_piece_in_heap(info_hash, piece_index);
        }
        self.piece_or_peer_availability_updated(info_hash);
        Ok(())
    }

    fn handle_unchoke(
        &mut self,
        connection_id: ConnectionId,
        info_hash: InfoHash,
    ) -> Result<(), String> {
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            if let Some(session) = torrent.peer_sessions.get_mut(&connection_id) {
                session.peer_is_choking_us = false;
            }
        }
        self.piece_or_peer_availability_updated(info_hash);
        Ok(())
    }

    // Trivial policy: anyone interested is unchoked immediately.
    fn handle_interested(
        &mut self,
        connection_id: ConnectionId,
        info_hash: InfoHash,
    ) -> Result<(), String> {
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            if let Some(session) = torrent.peer_sessions.get_mut(&connection_id) {
                session.peer_is_interested_in_us = true;
                session.we_are_choking_peer = false;
                self.connection_manager
                    .send_message(connection_id, Message::Unchoke);
            }
        }
        Ok(())
    }

    fn handle_not_interested(
        &mut self,
        connection_id: ConnectionId,
        info_hash: InfoHash,
    ) -> Result<(), String> {
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            if let Some(session) = torrent.peer_sessions.get_mut(&connection_id) {
                session.peer_is_interested_in_us = false;
            }
        }
        Ok(())
    }

    fn handle_have(
        &mut self,
        connection_id: ConnectionId,
        info_hash: InfoHash,
        piece_index: u32,
    ) -> Result<(), String> {
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return Ok(());
        };
        if piece_index as u64 >= torrent.piece_count {
            return Err(String::from(
                "Peer sent a Have with an out of range piece index",
            ));
        }
        let Some(session) = torrent.peer_sessions.get_mut(&connection_id) else {
            return Ok(());
        };
        session.bitfield.set(piece_index as u64, true);

        if torrent.missing_pieces.contains_key(&piece_index) {
            let was_interested = session.we_are_interested_in_peer;
            self.peer_has_piece(info_hash, piece_index, connection_id);
            if !was_interested {
                self.connection_manager
                    .send_message(connection_id, Message::Unchoke);
                self.connection_manager
                    .send_message(connection_id, Message::Interested);
                if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                    if let Some(session) = torrent.peer_sessions.get_mut(&connection_id) {
                        session.we_are_choking_peer = false;
                        session.we_are_interested_in_peer = true;
                    }
                }
            }
            self.piece_or_peer_availability_updated(info_hash);
        } else if session.bitfield.complete() && torrent.local_bitfield.complete() {
            self.connection_manager
                .close_connection(connection_id, "Peer and us have all pieces, disconnecting");
        }
        Ok(())
    }

    fn handle_bitfield(
        &mut self,
        connection_id: ConnectionId,
        info_hash: InfoHash,
        data: Vec<u8>,
    ) -> Result<(), String> {
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return Ok(());
        };
        let piece_count = torrent.piece_count;
        let bitfield = Bitfield::from_bytes(data, piece_count)
            .map_err(|_| String::from("Peer sent a bitfield of the wrong size"))?;

        let Some(session) = torrent.peer_sessions.get_mut(&connection_id) else {
            return Ok(());
        };
        session.bitfield = bitfield;

        let session_bitfield = &torrent.peer_sessions[&connection_id].bitfield;
        let advertised: Vec<u32> = torrent
            .missing_pieces
            .keys()
            .copied()
            .filter(|piece_index| session_bitfield.get(*piece_index as u64))
            .collect();

        if !advertised.is_empty() {
            for piece_index in &advertised {
                self.peer_has_piece(info_hash, *piece_index, connection_id);
            }
            self.connection_manager
                .send_message(connection_id, Message::Unchoke);
            self.connection_manager
                .send_message(connection_id, Message::Interested);
            if let Some(torrent) = self.torrents.get_mut(&info_hash) {
                if let Some(session) = torrent.peer_sessions.get_mut(&connection_id) {
                    session.we_are_choking_peer = false;
                    session.we_are_interested_in_peer = true;
                }
            }
            self.piece_or_peer_availability_updated(info_hash);
        } else {
            let available_peer_count = torrent
                .peers
                .values()
                .filter(|peer| peer.status == PeerStatus::Available)
                .count();
            if available_peer_count > 0 {
                self.connection_manager.close_connection(
                    connection_id,
                    "Peer has no interesting pieces, and other peers are out there, disconnecting.",
                );
            } else {
                debug!(
                    "Peer has no interesting pieces, but we have no other peers to connect to. \
                     Staying connected in the hope that it will get some interesting pieces."
                );
            }
        }
        Ok(())
    }

    fn handle_request(
        &mut self,
        connection_id: ConnectionId,
        info_hash: InfoHash,
        piece_index: u32,
        begin: u32,
        length: u32,
    ) -> Result<(), String> {
        let Some(torrent) = self.torrents.get(&info_hash) else {
            return Ok(());
        };
        if piece_index as u64 >= torrent.piece_count {
            return Err(String::from(
                "Peer sent a Request with an out of range piece index",
            ));
        }
        if length == 0 {
            return Err(String::from("Peer requested a zero length block"));
        }
        let piece_length = torrent.piece_length(piece_index);
        if begin as u64 + length as u64 > piece_length {
            return Err(String::from("Peer requested a block outside the piece"));
        }
        if !torrent.local_bitfield.get(piece_index as u64) {
            return Err(String::from("Peer requested a piece we do not have"));
        }

        let mut buffer = vec![0u8; piece_length as usize];
        match self.data_maps.get_mut(&info_hash) {
            Some(data_map) => {
                if let Err(e) = data_map.read_piece(piece_index, &mut buffer) {
                    self.fail_torrent(info_hash, &format!("reading piece {}: {}", piece_index, e));
                    return Ok(());
                }
            }
            None => return Ok(()),
        }

        let block = buffer[begin as usize..(begin + length) as usize].to_vec();
        self.connection_manager.send_message(
            connection_id,
            Message::Piece {
                piece_index,
                begin,
                block,
            },
        );
        Ok(())
    }

    fn handle_piece_message(
        &mut self,
        connection_id: ConnectionId,
        info_hash: InfoHash,
        piece_index: u32,
        begin: u32,
        block: Vec<u8>,
    ) -> Result<(), String> {
        if block.is_empty() {
            return Err(String::from("Peer sent an empty block"));
        }

        enum Next {
            Completed(Vec<u8>),
            Abandoned(u32),
            RequestMore { begin: u32, length: u32 },
        }

        let next = {
            let Some(torrent) = self.torrents.get_mut(&info_hash) else {
                return Ok(());
            };
            let Some(session) = torrent.peer_sessions.get_mut(&connection_id) else {
                return Ok(());
            };
            let Some(piece) = session.incoming_piece.as_mut() else {
                return Err(String::from("Peer sent a Piece message we did not request"));
            };
            if piece.index != piece_index || piece.offset != begin {
                return Err(String::from(
                    "Peer sent a block that does not match the requested one",
                ));
            }
            if begin as u64 + block.len() as u64 > piece.length as u64 {
                return Err(String::from("Peer sent a block past the end of the piece"));
            }

            piece.data[begin as usize..begin as usize + block.len()].copy_from_slice(&block);
            piece.offset = begin + block.len() as u32;

            if piece.offset == piece.length {
                let finished = session
                    .incoming_piece
                    .take()
                    .expect("accumulator just used");
                session.active = false;
                Next::Completed(finished.data)
            } else if session.peer_is_choking_us {
                // the choke was processed before the in-flight blocks
                session.incoming_piece = None;
                session.active = false;
                Next::Abandoned(piece_index)
            } else {
                let length = BLOCK_LENGTH.min(piece.length - piece.offset);
                Next::RequestMore {
                    begin: piece.offset,
                    length,
                }
            }
        };

        match next {
            Next::Completed(data) => self.piece_downloaded(info_hash, piece_index, data),
            Next::Abandoned(piece_index) => {
                debug!(
                    "Peer is choking us mid piece {}, giving up on it",
                    piece_index
                );
                self.insert_piece_in_heap(info_hash, piece_index);
                self.piece_or_peer_availability_updated(info_hash);
            }
            Next::RequestMore { begin, length } => {
                self.connection_manager.send_message(
                    connection_id,
                    Message::Request {
                        piece_index,
                        begin,
                        length,
                    },
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Piece bookkeeping and scheduling

    fn piece_downloaded(&mut self, info_hash: InfoHash, piece_index: u32, data: Vec<u8>) {
        let write_result = match self.data_maps.get_mut(&info_hash) {
            Some(data_map) => data_map.write_piece(piece_index, &data),
            None => return,
        };
        if let Err(e) = write_result {
            self.fail_torrent(info_hash, &format!("writing piece {}: {}", piece_index, e));
            return;
        }

        let logger_sender = self.logger_sender.clone();
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        torrent.local_bitfield.set(piece_index as u64, true);

        if let Some(status) = torrent.missing_pieces.remove(&piece_index) {
            for haver_id in status.havers {
                if let Some(haver) = torrent.peer_sessions.get_mut(&haver_id) {
                    haver.interesting_pieces.remove(&piece_index);
                    if haver.interesting_pieces.is_empty() && haver.we_are_interested_in_peer {
                        self.connection_manager
                            .send_message(haver_id, Message::NotInterested);
                        haver.we_are_interested_in_peer = false;
                    }
                }
            }
        }

        for &session_id in torrent.peer_sessions.keys() {
            self.connection_manager
                .send_message(session_id, Message::Have { piece_index });
        }

        logger_sender.info(&format!(
            "Torrent {}: downloaded piece {} ({}/{})",
            torrent.display_name,
            piece_index,
            torrent.local_bitfield.ones(),
            torrent.piece_count
        ));

        let left = torrent.local_bitfield.zeroes() * torrent.nominal_piece_length;
        if let Some(counter) = self.announce_left.get(&info_hash) {
            counter.store(left, Ordering::Relaxed);
        }

        if torrent.local_bitfield.complete() {
            torrent.state = TorrentState::Seeding;
            logger_sender.info(&format!(
                "Torrent download completed: {}",
                torrent.display_name
            ));

            let complete_peers: Vec<ConnectionId> = torrent
                .peer_sessions
                .iter()
                .filter(|(_, session)| session.bitfield.complete())
                .map(|(&session_id, _)| session_id)
                .collect();
            for session_id in complete_peers {
                self.connection_manager
                    .close_connection(session_id, "Torrent fully downloaded.");
            }

            if let Some(announcer) = self.announcers.get(&info_hash) {
                announcer.completed();
            }
        } else {
            self.piece_or_peer_availability_updated(info_hash);
        }
    }

    fn insert_piece_in_heap(&mut self, info_hash: InfoHash, piece_index: u32) {
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let should_insert = match torrent.missing_pieces.get_mut(&piece_index) {
            Some(status) => {
                status.currently_downloading = false;
                status.index_in_heap.is_none()
            }
            None => false,
        };
        if should_insert {
            torrent
                .piece_heap
                .insert(&mut torrent.missing_pieces, piece_index);
        }
    }

    fn peer_has_piece(
        &mut self,
        info_hash: InfoHash,
        piece_index: u32,
        connection_id: ConnectionId,
    ) {
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let (currently_downloading, in_heap) =
            match torrent.missing_pieces.get_mut(&piece_index) {
                Some(status) => {
                    status.havers.insert(connection_id);
                    (status.currently_downloading, status.index_in_heap.is_some())
                }
                None => return,
            };

        // A piece being downloaded is not in the heap.
        if !currently_downloading {
            if in_heap {
                torrent
                    .piece_heap
                    .update(&mut torrent.missing_pieces, piece_index);
            } else {
                torrent
                    .piece_heap
                    .insert(&mut torrent.missing_pieces, piece_index);
            }
        }

        if let Some(session) = torrent.peer_sessions.get_mut(&connection_id) {
            session.interesting_pieces.insert(piece_index);
        }
    }

    /// Rarest-first scheduling: every inactive session gets at most one
    /// piece, requested block by block.
    fn piece_or_peer_availability_updated(&mut self, info_hash: InfoHash) {
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };

        let inactive_sessions = torrent
            .peer_sessions
            .values()
            .filter(|session| !session.active)
            .count();

        for _ in 0..inactive_sessions {
            let Some(next_piece) = torrent.piece_heap.peek_min() else {
                return;
            };
            let haver_ids: Vec<ConnectionId> = match torrent.missing_pieces.get(&next_piece) {
                Some(status) => status.havers.iter().copied().collect(),
                None => return,
            };

            let chosen = haver_ids.into_iter().find(|haver_id| {
                torrent
                    .peer_sessions
                    .get(haver_id)
                    .map(|session| !session.peer_is_choking_us && !session.active)
                    .unwrap_or(false)
            });

            match chosen {
                Some(session_id) => {
                    let piece_length = torrent.piece_length(next_piece);
                    let session = torrent
                        .peer_sessions
                        .get_mut(&session_id)
                        .expect("chosen session exists");
                    session.active = true;
                    session.incoming_piece =
                        Some(IncomingPiece::new(next_piece, piece_length as u32));

                    let block_length = (BLOCK_LENGTH as u64).min(piece_length) as u32;
                    debug!("Requesting piece {} from connection {}", next_piece, session_id);
                    self.connection_manager.send_message(
                        session_id,
                        Message::Request {
                            piece_index: next_piece,
                            begin: 0,
                            length: block_length,
                        },
                    );

                    let popped = torrent.piece_heap.pop_min(&mut torrent.missing_pieces);
                    debug_assert_eq!(popped, Some(next_piece));
                    if let Some(status) = torrent.missing_pieces.get_mut(&next_piece) {
                        status.currently_downloading = true;
                    }
                }
                // no inactive unchoked haver for the rarest piece means no
                // further session can be satisfied either
                None => return,
            }
        }
    }

    // ------------------------------------------------------------------
    // Views

    fn build_views(&self) -> Vec<TorrentView> {
        self.torrents
            .values()
            .map(|torrent| {
                let mut download_speed = 0;
                let mut upload_speed = 0;
                let peers: Vec<PeerView> = torrent
                    .peer_sessions
                    .iter()
                    .map(|(session_id, session)| {
                        let stats = self
                            .connection_stats
                            .get(session_id)
                            .cloned()
                            .unwrap_or_default();
                        download_speed += stats.download_speed;
                        upload_speed += stats.upload_speed;
                        PeerView {
                            peer_id: session.remote_id,
                            ip: session.address.ip().to_string(),
                            port: session.address.port(),
                            progress: session.bitfield.progress(),
                            download_speed: stats.download_speed,
                            upload_speed: stats.upload_speed,
                            downloaded_bytes: stats.bytes_downloaded,
                            uploaded_bytes: stats.bytes_uploaded,
                            we_choking_it: session.we_are_choking_peer,
                            it_choking_us: session.peer_is_choking_us,
                            we_interested: session.we_are_interested_in_peer,
                            it_interested: session.peer_is_interested_in_us,
                            connected: true,
                        }
                    })
                    .collect();

                TorrentView {
                    info_hash: torrent.info_hash,
                    display_name: torrent.display_name.clone(),
                    size: torrent.total_length,
                    state: torrent.state,
                    progress: torrent.local_bitfield.progress(),
                    check_progress: torrent.check_progress,
                    download_speed,
                    upload_speed,
                    save_path: torrent.data_path.clone(),
                    peers,
                    bitfield: torrent.local_bitfield.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests;
