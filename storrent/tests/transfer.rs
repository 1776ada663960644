//! Two engines on localhost moving a small multi-file torrent from a seed
//! to an empty node discovered through a fake tracker.

use std::path::Path;
use std::time::Duration;

use logger::logger_receiver::Logger;
use sha1::{Digest, Sha1};
use tempfile::TempDir;

use storrent::byte_string::InfoHash;
use storrent::checker::Checker;
use storrent::config::cfg::Cfg;
use storrent::engine::{Engine, EngineHandle};
use storrent::storage::piece_map::PieceDataMap;
use storrent::storage::LocalFile;
use storrent::torrent::TorrentState;
use storrent::torrent_parser::info::{FileEntry, Info};
use storrent::torrent_parser::torrent::MetaInfo;

const PIECE_LENGTH: usize = 32768;
const TOTAL_LENGTH: usize = 80000;
const FIRST_FILE_LENGTH: usize = 50000;

fn torrent_data() -> Vec<u8> {
    (0..TOTAL_LENGTH).map(|i| (i % 251) as u8).collect()
}

// 3 pieces: 32768, 32768 and 14464 bytes, split over two files.
fn build_meta_info(announce_list: Vec<Vec<String>>) -> MetaInfo {
    let data = torrent_data();
    let mut pieces = Vec::new();
    for chunk in data.chunks(PIECE_LENGTH) {
        pieces.extend(Sha1::digest(chunk));
    }

    MetaInfo {
        announce_list,
        info: Info {
            name: String::from("swarm-test"),
            piece_length: PIECE_LENGTH as i64,
            pieces,
            length: None,
            files: Some(vec![
                FileEntry {
                    length: FIRST_FILE_LENGTH as i64,
                    path: vec![String::from("a.bin")],
                },
                FileEntry {
                    length: (TOTAL_LENGTH - FIRST_FILE_LENGTH) as i64,
                    path: vec![String::from("sub"), String::from("b.bin")],
                },
            ]),
        },
        info_hash: InfoHash::new([0x21; 20]),
    }
}

fn local_files(data_root: &Path) -> Vec<LocalFile> {
    let torrent_dir = data_root.join("swarm-test");
    vec![
        LocalFile::new(torrent_dir.join("a.bin"), FIRST_FILE_LENGTH as u64),
        LocalFile::new(
            torrent_dir.join("sub").join("b.bin"),
            (TOTAL_LENGTH - FIRST_FILE_LENGTH) as u64,
        ),
    ]
}

fn write_seed_data(data_root: &Path) {
    let data = torrent_data();
    let torrent_dir = data_root.join("swarm-test");
    std::fs::create_dir_all(torrent_dir.join("sub")).unwrap();
    std::fs::write(torrent_dir.join("a.bin"), &data[..FIRST_FILE_LENGTH]).unwrap();
    std::fs::write(torrent_dir.join("sub").join("b.bin"), &data[FIRST_FILE_LENGTH..]).unwrap();
}

async fn spawn_engine(dir: &TempDir) -> (EngineHandle, Logger) {
    let cfg = Cfg {
        listen_port: 0,
        log_directory: dir.path().join("log").to_string_lossy().to_string(),
        download_directory: dir.path().to_string_lossy().to_string(),
        ..Cfg::default()
    };
    let logger = Logger::new(&cfg.log_directory, cfg.max_log_file_kb_size).unwrap();
    let (engine, _join) = Engine::spawn(cfg, logger.new_sender()).await.unwrap();
    (engine, logger)
}

async fn wait_for_state(engine: &EngineHandle, info_hash: InfoHash, state: TorrentState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let views = engine.torrent_views().await;
        if views
            .iter()
            .any(|view| view.info_hash == info_hash && view.state == state)
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "torrent never reached {:?}",
            state
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_transfer() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    // Node A: full data, verified through the checker, no tracker.
    write_seed_data(dir_a.path());
    let meta_a = build_meta_info(vec![]);
    let info_hash = meta_a.info_hash;
    let (engine_a, _logger_a) = spawn_engine(&dir_a).await;
    engine_a.add_torrent(meta_a.clone(), dir_a.path().to_path_buf());

    let seed_map = PieceDataMap::open(
        PIECE_LENGTH as u64,
        meta_a.info.pieces.clone(),
        &local_files(dir_a.path()),
    )
    .unwrap();
    let checker = Checker::new(None);
    let (result_tx, result_rx) = std::sync::mpsc::channel();
    checker.check(
        info_hash,
        seed_map,
        3,
        Box::new(move |result| {
            result_tx.send(result).ok();
        }),
    );
    let bitfield = result_rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .unwrap();
    assert!(bitfield.complete(), "seed data failed verification");
    engine_a.set_local_bitfield(info_hash, bitfield);
    engine_a.start_torrent(info_hash);
    wait_for_state(&engine_a, info_hash, TorrentState::Seeding).await;

    // Fake tracker pointing node B at node A.
    let mut tracker = mockito::Server::new_async().await;
    let port_a = engine_a.listen_port();
    let mut body = b"d8:intervali1800e5:peers6:".to_vec();
    body.extend([127, 0, 0, 1]);
    body.extend(port_a.to_be_bytes());
    body.push(b'e');
    let announce_mock = tracker
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::Any)
        .with_body(body)
        .expect_at_least(1)
        .create_async()
        .await;

    // Node B: empty, discovers A through the tracker.
    let meta_b = build_meta_info(vec![vec![format!("{}/announce", tracker.url())]]);
    let (engine_b, _logger_b) = spawn_engine(&dir_b).await;
    engine_b.add_torrent(meta_b, dir_b.path().to_path_buf());
    engine_b.start_torrent(info_hash);

    wait_for_state(&engine_b, info_hash, TorrentState::Seeding).await;
    announce_mock.assert_async().await;

    // B's files hold exactly the seeded bytes.
    let data = torrent_data();
    let torrent_dir = dir_b.path().join("swarm-test");
    let mut downloaded = std::fs::read(torrent_dir.join("a.bin")).unwrap();
    downloaded.extend(std::fs::read(torrent_dir.join("sub").join("b.bin")).unwrap());
    assert_eq!(downloaded, data);

    // every piece hashes to its declared value
    for (index, chunk) in downloaded.chunks(PIECE_LENGTH).enumerate() {
        let expected = &build_meta_info(vec![]).info.pieces[index * 20..index * 20 + 20];
        assert_eq!(Sha1::digest(chunk).as_slice(), expected);
    }

    let views = engine_b.torrent_views().await;
    let view = views
        .iter()
        .find(|view| view.info_hash == info_hash)
        .unwrap();
    assert_eq!(view.progress, 100.0);
    assert!(view.bitfield.complete());

    engine_b.stop_torrent(info_hash);
    engine_a.stop_torrent(info_hash);
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine_a.shutdown();
    engine_b.shutdown();
}
