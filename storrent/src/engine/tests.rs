use std::path::Path;

use sha1::{Digest, Sha1};
use tempfile::{tempdir, TempDir};

use super::*;
use crate::net::connection_manager::Command as NetCommand;
use crate::torrent_parser::info::Info;

struct TestEngine {
    engine: Engine,
    net_rx: mpsc::UnboundedReceiver<NetCommand>,
    _conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    _logger_rx: std::sync::mpsc::Receiver<String>,
}

fn test_engine() -> TestEngine {
    let (net_tx, net_rx) = mpsc::unbounded_channel();
    let connection_manager =
        ConnectionManagerHandle::new(net_tx, Arc::new(AtomicU64::new(1000)));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();
    let (logger_tx, logger_rx) = std::sync::mpsc::channel();

    let engine = Engine {
        cfg: Cfg::default(),
        listen_port: 27007,
        connection_manager,
        cmd_tx,
        cmd_rx,
        conn_rx,
        torrents: HashMap::new(),
        connecting: HashMap::new(),
        sessions: HashMap::new(),
        announcers: HashMap::new(),
        announce_left: HashMap::new(),
        data_maps: HashMap::new(),
        connection_stats: HashMap::new(),
        logger_sender: LoggerSender::new(logger_tx),
    };

    TestEngine {
        engine,
        net_rx,
        _conn_tx: conn_tx,
        _logger_rx: logger_rx,
    }
}

fn deterministic_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// Builds a single-file descriptor with real piece hashes, so downloaded
// data verifies against the disk.
fn test_meta_info(name: &str, data: &[u8], piece_length: i64) -> MetaInfo {
    let mut pieces = Vec::new();
    for chunk in data.chunks(piece_length as usize) {
        pieces.extend(Sha1::digest(chunk));
    }
    let mut hash_seed = name.as_bytes().to_vec();
    hash_seed.resize(20, 7);
    MetaInfo {
        announce_list: vec![],
        info: Info {
            name: String::from(name),
            piece_length,
            pieces,
            length: Some(data.len() as i64),
            files: None,
        },
        info_hash: InfoHash::try_from(&hash_seed[..20]).unwrap(),
    }
}

fn add_and_start(harness: &mut TestEngine, meta_info: &MetaInfo, data_root: &Path) -> InfoHash {
    harness
        .engine
        .add_torrent(meta_info, data_root.to_path_buf());
    harness.engine.start_torrent(meta_info.info_hash);
    meta_info.info_hash
}

fn establish_session(
    harness: &mut TestEngine,
    info_hash: InfoHash,
    connection_id: ConnectionId,
) -> SocketAddr {
    let address: SocketAddr = format!("127.0.0.1:{}", 50000 + connection_id)
        .parse()
        .unwrap();
    let torrent = harness.engine.torrents.get_mut(&info_hash).unwrap();
    let mut peer = Peer::new(address);
    peer.status = PeerStatus::InUse;
    torrent.peers.insert(address, peer);

    harness.engine.connecting.insert(
        connection_id,
        PendingPeer {
            info_hash,
            address,
            remote_id: Some(PeerId::new([9; 20])),
        },
    );
    harness.engine.on_connection_established(connection_id);
    address
}

fn drain_net(harness: &mut TestEngine) -> Vec<NetCommand> {
    let mut commands = Vec::new();
    while let Ok(command) = harness.net_rx.try_recv() {
        commands.push(command);
    }
    commands
}

fn sent_messages(commands: &[NetCommand]) -> Vec<(ConnectionId, Message)> {
    commands
        .iter()
        .filter_map(|command| match command {
            NetCommand::SendMessage {
                connection_id,
                message,
            } => Some((*connection_id, message.clone())),
            _ => None,
        })
        .collect()
}

fn sent_requests(commands: &[NetCommand]) -> Vec<(ConnectionId, u32, u32, u32)> {
    sent_messages(commands)
        .into_iter()
        .filter_map(|(connection_id, message)| match message {
            Message::Request {
                piece_index,
                begin,
                length,
            } => Some((connection_id, piece_index, begin, length)),
            _ => None,
        })
        .collect()
}

fn close_reasons(commands: &[NetCommand]) -> Vec<(ConnectionId, String)> {
    commands
        .iter()
        .filter_map(|command| match command {
            NetCommand::Close {
                connection_id,
                reason,
            } => Some((*connection_id, reason.clone())),
            _ => None,
        })
        .collect()
}

fn full_bitfield_bytes(piece_count: u64) -> Vec<u8> {
    let mut bitfield = Bitfield::new(piece_count);
    for index in 0..piece_count {
        bitfield.set(index, true);
    }
    bitfield.to_vec()
}

fn seeded_torrent(harness: &mut TestEngine, data: &[u8], piece_length: i64) -> (TempDir, InfoHash) {
    let dir = tempdir().unwrap();
    let meta_info = test_meta_info("seeded.bin", data, piece_length);
    std::fs::write(dir.path().join("seeded.bin"), data).unwrap();
    harness
        .engine
        .add_torrent(&meta_info, dir.path().to_path_buf());

    let mut bitfield = Bitfield::new(meta_info.piece_count());
    for index in 0..meta_info.piece_count() {
        bitfield.set(index, true);
    }
    harness
        .engine
        .set_local_bitfield(meta_info.info_hash, bitfield);
    harness.engine.start_torrent(meta_info.info_hash);
    (dir, meta_info.info_hash)
}

#[test]
fn test_add_and_start_populates_missing_pieces() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("start.bin", &data, 32768);

    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.state, TorrentState::Started);
    assert_eq!(torrent.missing_pieces.len(), 3);
    assert!(harness.engine.data_maps.contains_key(&info_hash));

    // files were created at their full length
    let metadata = std::fs::metadata(dir.path().join("start.bin")).unwrap();
    assert_eq!(metadata.len(), 80000);
}

#[test]
fn test_start_on_unwritable_path_errors_torrent() {
    let mut harness = test_engine();
    let data = deterministic_data(100);
    let meta_info = test_meta_info("error.bin", &data, 64);

    let info_hash = add_and_start(
        &mut harness,
        &meta_info,
        Path::new("/proc/storrent-test/nope"),
    );

    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.state, TorrentState::Error);
    assert!(!harness.engine.data_maps.contains_key(&info_hash));
}

#[test]
fn test_established_session_gets_our_bitfield() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("bf.bin", &data, 32768);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    establish_session(&mut harness, info_hash, 1);

    let messages = sent_messages(&drain_net(&mut harness));
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, 1);
    assert_eq!(messages[0].1, Message::Bitfield(vec![0; 1]));
    assert!(harness.engine.sessions.contains_key(&1));
}

#[test]
fn test_bitfield_triggers_interest_and_unchoke_triggers_request() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("dl.bin", &data, 32768);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    establish_session(&mut harness, info_hash, 1);
    drain_net(&mut harness);

    harness
        .engine
        .on_message(1, Message::Bitfield(full_bitfield_bytes(3)));
    let messages = sent_messages(&drain_net(&mut harness));
    assert_eq!(
        messages,
        vec![(1, Message::Unchoke), (1, Message::Interested)]
    );

    // still choked: no request yet
    let torrent = &harness.engine.torrents[&info_hash];
    let session = &torrent.peer_sessions[&1];
    assert!(session.we_are_interested_in_peer);
    assert!(!session.we_are_choking_peer);
    assert!(!session.active);
    assert_eq!(session.interesting_pieces.len(), 3);
    assert_eq!(torrent.piece_heap.len(), 3);

    harness.engine.on_message(1, Message::Unchoke);
    let requests = sent_requests(&drain_net(&mut harness));
    assert_eq!(requests.len(), 1);
    let (connection_id, piece_index, begin, length) = requests[0];
    assert_eq!(connection_id, 1);
    assert_eq!(begin, 0);
    let expected_length = if piece_index == 2 { 14464 } else { 16384 };
    assert_eq!(length, expected_length);

    let torrent = &harness.engine.torrents[&info_hash];
    let session = &torrent.peer_sessions[&1];
    assert!(session.active);
    assert_eq!(session.incoming_piece.as_ref().unwrap().index, piece_index);
    assert!(torrent.missing_pieces[&piece_index].currently_downloading);
    assert_eq!(torrent.piece_heap.len(), 2);
}

#[test]
fn test_bitfield_of_wrong_size_closes_connection() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("badbf.bin", &data, 32768);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    establish_session(&mut harness, info_hash, 1);
    drain_net(&mut harness);

    harness.engine.on_message(1, Message::Bitfield(vec![0; 9]));
    let closes = close_reasons(&drain_net(&mut harness));
    assert_eq!(
        closes,
        vec![(1, String::from("Peer sent a bitfield of the wrong size"))]
    );
}

#[test]
fn test_choke_mid_piece_reinserts_and_discards() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("choke.bin", &data, 32768);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    establish_session(&mut harness, info_hash, 1);
    // the peer only advertises the two full-length pieces
    harness
        .engine
        .on_message(1, Message::Bitfield(vec![0b1100_0000]));
    harness.engine.on_message(1, Message::Unchoke);
    let (_, piece_index, _, length) = sent_requests(&drain_net(&mut harness))[0];
    assert!(piece_index < 2);
    assert_eq!(length, 16384);

    // first block arrives, a second one is requested
    let start = piece_index as usize * 32768;
    harness.engine.on_message(
        1,
        Message::Piece {
            piece_index,
            begin: 0,
            block: data[start..start + length as usize].to_vec(),
        },
    );
    assert_eq!(sent_requests(&drain_net(&mut harness)).len(), 1);

    // the choke arrives mid piece
    harness.engine.on_message(1, Message::Choke);

    let torrent = &harness.engine.torrents[&info_hash];
    let session = &torrent.peer_sessions[&1];
    assert!(!session.active);
    assert!(session.incoming_piece.is_none());
    let status = &torrent.missing_pieces[&piece_index];
    assert!(!status.currently_downloading);
    assert!(status.index_in_heap.is_some());
    assert_eq!(torrent.piece_heap.len(), 2);

    // nothing was written for the abandoned piece
    let on_disk = std::fs::read(dir.path().join("choke.bin")).unwrap();
    assert_eq!(&on_disk[start..start + 32768], vec![0u8; 32768].as_slice());
}

#[test]
fn test_download_until_seeding() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("transfer.bin", &data, 32768);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    establish_session(&mut harness, info_hash, 1);
    harness
        .engine
        .on_message(1, Message::Bitfield(full_bitfield_bytes(3)));
    harness.engine.on_message(1, Message::Unchoke);

    let mut outstanding = sent_requests(&drain_net(&mut harness));
    let mut guard = 0;
    while let Some((connection_id, piece_index, begin, length)) = outstanding.pop() {
        guard += 1;
        assert!(guard < 20, "request loop does not terminate");
        assert_eq!(connection_id, 1);

        let start = piece_index as usize * 32768 + begin as usize;
        harness.engine.on_message(
            1,
            Message::Piece {
                piece_index,
                begin,
                block: data[start..start + length as usize].to_vec(),
            },
        );
        outstanding.extend(sent_requests(&drain_net(&mut harness)));
    }

    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.state, TorrentState::Seeding);
    assert!(torrent.local_bitfield.complete());
    assert!(torrent.missing_pieces.is_empty());
    assert!(torrent.piece_heap.is_empty());

    let on_disk = std::fs::read(dir.path().join("transfer.bin")).unwrap();
    assert_eq!(on_disk, data);
}

#[test]
fn test_completion_closes_fully_complete_peers() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    // single piece so one block finishes the torrent
    let data = deterministic_data(10000);
    let meta_info = test_meta_info("last.bin", &data, 16384);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    establish_session(&mut harness, info_hash, 1);
    harness
        .engine
        .on_message(1, Message::Bitfield(full_bitfield_bytes(1)));
    harness.engine.on_message(1, Message::Unchoke);
    drain_net(&mut harness);

    harness.engine.on_message(
        1,
        Message::Piece {
            piece_index: 0,
            begin: 0,
            block: data.clone(),
        },
    );

    let commands = drain_net(&mut harness);
    let closes = close_reasons(&commands);
    assert_eq!(closes, vec![(1, String::from("Torrent fully downloaded."))]);
    // the Have broadcast still went out before the close
    assert!(sent_messages(&commands)
        .iter()
        .any(|(_, message)| *message == Message::Have { piece_index: 0 }));
}

#[test]
fn test_request_is_served_from_disk() {
    let mut harness = test_engine();
    let data = deterministic_data(20);
    let (_dir, info_hash) = seeded_torrent(&mut harness, &data, 8);

    assert_eq!(
        harness.engine.torrents[&info_hash].state,
        TorrentState::Seeding
    );

    establish_session(&mut harness, info_hash, 1);
    drain_net(&mut harness);

    harness.engine.on_message(
        1,
        Message::Request {
            piece_index: 1,
            begin: 2,
            length: 4,
        },
    );
    let messages = sent_messages(&drain_net(&mut harness));
    assert_eq!(
        messages,
        vec![(
            1,
            Message::Piece {
                piece_index: 1,
                begin: 2,
                block: data[10..14].to_vec(),
            }
        )]
    );
}

#[test]
fn test_out_of_range_requests_close_the_connection() {
    let mut harness = test_engine();
    let data = deterministic_data(20);
    let (_dir, info_hash) = seeded_torrent(&mut harness, &data, 8);
    establish_session(&mut harness, info_hash, 1);
    drain_net(&mut harness);

    harness.engine.on_message(
        1,
        Message::Request {
            piece_index: 9,
            begin: 0,
            length: 1,
        },
    );
    assert_eq!(
        close_reasons(&drain_net(&mut harness)),
        vec![(
            1,
            String::from("Peer sent a Request with an out of range piece index")
        )]
    );

    establish_session(&mut harness, info_hash, 2);
    drain_net(&mut harness);
    harness.engine.on_message(
        2,
        Message::Request {
            piece_index: 1,
            begin: 6,
            length: 4,
        },
    );
    assert_eq!(
        close_reasons(&drain_net(&mut harness)),
        vec![(2, String::from("Peer requested a block outside the piece"))]
    );

    establish_session(&mut harness, info_hash, 3);
    drain_net(&mut harness);
    harness.engine.on_message(
        3,
        Message::Request {
            piece_index: 1,
            begin: 0,
            length: 0,
        },
    );
    assert_eq!(
        close_reasons(&drain_net(&mut harness)),
        vec![(3, String::from("Peer requested a zero length block"))]
    );
}

#[test]
fn test_self_handshake_is_refused_and_peer_errored() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(100);
    let meta_info = test_meta_info("self.bin", &data, 64);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    let address: SocketAddr = "127.0.0.1:51000".parse().unwrap();
    let torrent = harness.engine.torrents.get_mut(&info_hash).unwrap();
    let local_peer_id = torrent.local_peer_id;
    let mut peer = Peer::new(address);
    peer.status = PeerStatus::InUse;
    torrent.peers.insert(address, peer);
    harness.engine.connecting.insert(
        7,
        PendingPeer {
            info_hash,
            address,
            remote_id: None,
        },
    );

    // the dialed peer answered with our own peer id
    harness
        .engine
        .on_outgoing_handshake(7, Handshake::new(info_hash, local_peer_id));

    let commands = drain_net(&mut harness);
    assert!(matches!(
        commands.as_slice(),
        [NetCommand::AcceptOutgoing {
            connection_id: 7,
            accepted: false
        }]
    ));

    harness
        .engine
        .on_peer_disconnect(7, "Disconnecting based on received handshake");
    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.peers[&address].status, PeerStatus::Errored);
    assert!(!harness.engine.connecting.contains_key(&7));
}

#[test]
fn test_outgoing_handshake_with_wrong_info_hash_is_refused() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(100);
    let meta_info = test_meta_info("wrong.bin", &data, 64);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    let address: SocketAddr = "127.0.0.1:51001".parse().unwrap();
    harness.engine.connecting.insert(
        8,
        PendingPeer {
            info_hash,
            address,
            remote_id: None,
        },
    );

    harness
        .engine
        .on_outgoing_handshake(8, Handshake::new(InfoHash::new([0xee; 20]), PeerId::random()));
    let commands = drain_net(&mut harness);
    assert!(matches!(
        commands.as_slice(),
        [NetCommand::AcceptOutgoing {
            connection_id: 8,
            accepted: false
        }]
    ));
}

#[test]
fn test_incoming_handshake_for_unknown_torrent_is_rejected() {
    let mut harness = test_engine();

    harness.engine.on_incoming_handshake(
        3,
        Handshake::new(InfoHash::new([0xab; 20]), PeerId::random()),
        "127.0.0.1:51002".parse().unwrap(),
    );
    let commands = drain_net(&mut harness);
    assert!(matches!(
        commands.as_slice(),
        [NetCommand::AcceptIncoming {
            connection_id: 3,
            reply: None
        }]
    ));
}

#[test]
fn test_incoming_handshake_is_answered_with_ours() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(100);
    let meta_info = test_meta_info("inbound.bin", &data, 64);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());
    let local_peer_id = harness.engine.torrents[&info_hash].local_peer_id;

    let address: SocketAddr = "127.0.0.1:51003".parse().unwrap();
    harness
        .engine
        .on_incoming_handshake(4, Handshake::new(info_hash, PeerId::new([0x44; 20])), address);

    let commands = drain_net(&mut harness);
    match commands.as_slice() {
        [NetCommand::AcceptIncoming {
            connection_id: 4,
            reply: Some(handshake),
        }] => {
            assert_eq!(handshake.info_hash, info_hash);
            assert_eq!(handshake.peer_id, local_peer_id);
        }
        other => panic!("unexpected commands: {:?}", other),
    }

    assert!(harness.engine.connecting.contains_key(&4));
    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.peers[&address].status, PeerStatus::InUse);
}

#[test]
fn test_incoming_handshake_without_slots_is_rejected() {
    let mut harness = test_engine();
    harness.engine.cfg.max_connections_per_torrent = 0;
    let dir = tempdir().unwrap();
    let data = deterministic_data(100);
    let meta_info = test_meta_info("full.bin", &data, 64);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    harness.engine.on_incoming_handshake(
        5,
        Handshake::new(info_hash, PeerId::new([0x55; 20])),
        "127.0.0.1:51004".parse().unwrap(),
    );
    let commands = drain_net(&mut harness);
    assert!(matches!(
        commands.as_slice(),
        [NetCommand::AcceptIncoming {
            connection_id: 5,
            reply: None
        }]
    ));
}

#[test]
fn test_peers_discovered_dials_with_our_handshake() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(100);
    let meta_info = test_meta_info("dial.bin", &data, 64);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());
    let local_peer_id = harness.engine.torrents[&info_hash].local_peer_id;

    let address: SocketAddr = "127.0.0.1:27039".parse().unwrap();
    harness
        .engine
        .peers_discovered(info_hash, vec![address]);

    let commands = drain_net(&mut harness);
    match commands.as_slice() {
        [NetCommand::Connect {
            address: dialed,
            handshake,
            ..
        }] => {
            assert_eq!(*dialed, address);
            assert_eq!(handshake.info_hash, info_hash);
            assert_eq!(handshake.peer_id, local_peer_id);
        }
        other => panic!("unexpected commands: {:?}", other),
    }

    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.peers[&address].status, PeerStatus::InUse);
    assert_eq!(harness.engine.connecting.len(), 1);
}

#[test]
fn test_connect_more_peers_respects_slots() {
    let mut harness = test_engine();
    harness.engine.cfg.max_connections_per_torrent = 2;
    let dir = tempdir().unwrap();
    let data = deterministic_data(100);
    let meta_info = test_meta_info("slots.bin", &data, 64);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    let addresses: Vec<SocketAddr> = (0..5)
        .map(|i| format!("127.0.0.1:{}", 52000 + i).parse().unwrap())
        .collect();
    harness.engine.peers_discovered(info_hash, addresses);

    let commands = drain_net(&mut harness);
    let dials = commands
        .iter()
        .filter(|command| matches!(command, NetCommand::Connect { .. }))
        .count();
    assert_eq!(dials, 2);
    assert_eq!(harness.engine.available_slots_for_torrent(info_hash), 0);
}

#[test]
fn test_stop_torrent_tears_down() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("stop.bin", &data, 32768);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    let address = establish_session(&mut harness, info_hash, 1);
    harness
        .engine
        .on_message(1, Message::Bitfield(full_bitfield_bytes(3)));
    harness.engine.on_message(1, Message::Unchoke);
    drain_net(&mut harness);

    harness.engine.stop_torrent(info_hash);

    let closes = close_reasons(&drain_net(&mut harness));
    assert_eq!(closes, vec![(1, String::from("Stopping torrent"))]);

    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.state, TorrentState::Stopped);
    assert!(torrent.missing_pieces.is_empty());
    assert!(torrent.piece_heap.is_empty());
    assert!(!harness.engine.data_maps.contains_key(&info_hash));

    // the close round-trips through the manager before the peer is released
    harness.engine.on_peer_disconnect(1, "Stopping torrent");
    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.peers[&address].status, PeerStatus::Available);
    assert!(torrent.peer_sessions.is_empty());
}

#[test]
fn test_disconnect_mid_download_cleans_up() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("dc.bin", &data, 32768);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    let address = establish_session(&mut harness, info_hash, 1);
    harness
        .engine
        .on_message(1, Message::Bitfield(full_bitfield_bytes(3)));
    harness.engine.on_message(1, Message::Unchoke);
    let (_, in_flight, _, _) = sent_requests(&drain_net(&mut harness))[0];

    harness
        .engine
        .on_peer_disconnect(1, "Error reading from socket: reset");

    let torrent = &harness.engine.torrents[&info_hash];
    assert_eq!(torrent.peers[&address].status, PeerStatus::Errored);
    assert!(torrent.peer_sessions.is_empty());
    assert!(!harness.engine.sessions.contains_key(&1));

    // the in-flight piece went back into the heap, havers were dropped
    let status = &torrent.missing_pieces[&in_flight];
    assert!(!status.currently_downloading);
    assert!(status.index_in_heap.is_some());
    for status in torrent.missing_pieces.values() {
        assert!(status.havers.is_empty());
    }
    assert_eq!(torrent.piece_heap.len(), 3);
}

#[test]
fn test_have_when_both_sides_complete_disconnects() {
    let mut harness = test_engine();
    let data = deterministic_data(20);
    let (_dir, info_hash) = seeded_torrent(&mut harness, &data, 8);
    establish_session(&mut harness, info_hash, 1);
    drain_net(&mut harness);

    for piece_index in 0..2 {
        harness.engine.on_message(1, Message::Have { piece_index });
        assert!(close_reasons(&drain_net(&mut harness)).is_empty());
    }
    harness.engine.on_message(1, Message::Have { piece_index: 2 });
    assert_eq!(
        close_reasons(&drain_net(&mut harness)),
        vec![(
            1,
            String::from("Peer and us have all pieces, disconnecting")
        )]
    );
}

#[test]
fn test_uninteresting_bitfield_disconnects_when_other_peers_exist() {
    let mut harness = test_engine();
    let dir = tempdir().unwrap();
    let data = deterministic_data(80000);
    let meta_info = test_meta_info("boring.bin", &data, 32768);
    let info_hash = add_and_start(&mut harness, &meta_info, dir.path());

    establish_session(&mut harness, info_hash, 1);
    drain_net(&mut harness);

    // no other peers: the empty bitfield keeps the connection
    harness.engine.on_message(1, Message::Bitfield(vec![0; 1]));
    assert!(close_reasons(&drain_net(&mut harness)).is_empty());

    // with an untried peer on the list, the same bitfield disconnects
    let torrent = harness.engine.torrents.get_mut(&info_hash).unwrap();
    let other: SocketAddr = "127.0.0.1:53000".parse().unwrap();
    torrent.peers.insert(other, Peer::new(other));
    harness.engine.on_message(1, Message::Bitfield(vec![0; 1]));
    assert_eq!(
        close_reasons(&drain_net(&mut harness)),
        vec![(
            1,
            String::from(
                "Peer has no interesting pieces, and other peers are out there, disconnecting."
            )
        )]
    );
}

#[test]
fn test_views_reflect_state() {
    let mut harness = test_engine();
    let data = deterministic_data(20);
    let (_dir, info_hash) = seeded_torrent(&mut harness, &data, 8);
    establish_session(&mut harness, info_hash, 1);

    let views = harness.engine.build_views();
    assert_eq!(views.len(), 1);
    let view = &views[0];
    assert_eq!(view.info_hash, info_hash);
    assert_eq!(view.size, 20);
    assert_eq!(view.state, TorrentState::Seeding);
    assert_eq!(view.progress, 100.0);
    assert_eq!(view.peers.len(), 1);
    assert!(view.peers[0].connected);
    assert!(view.peers[0].it_choking_us);
    assert!(view.peers[0].we_choking_it);
}
