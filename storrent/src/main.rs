use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use logger::logger_receiver::Logger;
use storrent::checker::Checker;
use storrent::config::cfg::Cfg;
use storrent::engine::Engine;
use storrent::storage::allocator::ensure_local_files;
use storrent::storage::piece_map::PieceDataMap;
use storrent::torrent::{state_to_string, Torrent};
use storrent::torrent_parser::parser::TorrentParser;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the .torrent file
    #[arg(short, long)]
    file: String,
    /// Path to the config file
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = Cfg::new(args.config.trim()).expect("Config file not found or invalid");
    let logger = Logger::new(&config.log_directory, config.max_log_file_kb_size)
        .expect("logger could not be created");

    let meta_info = TorrentParser::parse(Path::new(args.file.trim()))
        .expect("could not parse the torrent file");
    let info_hash = meta_info.info_hash;
    let piece_count = meta_info.piece_count();

    let data_root = PathBuf::from(&config.download_directory);
    let (engine, engine_join) = Engine::spawn(config, logger.new_sender())
        .await
        .expect("failed to start the engine");
    engine.add_torrent(meta_info.clone(), data_root.clone());

    // Hash whatever is already on disk so a restarted download resumes
    // instead of starting over.
    let progress_engine = engine.clone();
    let mut checker = Checker::new(Some(Box::new(move |stats| {
        for (info_hash, percent) in stats {
            progress_engine.set_check_progress(info_hash, percent);
        }
    })));
    let local_files = Torrent::new(&meta_info, &data_root).local_files;
    if ensure_local_files(&local_files).is_ok() {
        if let Ok(data_map) = PieceDataMap::open(
            meta_info.piece_length(),
            meta_info.info.pieces.clone(),
            &local_files,
        ) {
            let (result_tx, result_rx) = std::sync::mpsc::channel();
            checker.check(
                info_hash,
                data_map,
                piece_count,
                Box::new(move |result| {
                    result_tx.send(result).ok();
                }),
            );
            if let Ok(Ok(bitfield)) = result_rx.recv() {
                engine.set_local_bitfield(info_hash, bitfield);
            }
        }
    }

    engine.start_torrent(info_hash);

    let status_logger = logger.new_sender();
    let status_engine = engine.clone();
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            for view in status_engine.torrent_views().await {
                status_logger.info(&format!(
                    "{}: {} {:.1}% (checked {:.1}%) down {} B/s up {} B/s peers {}",
                    view.display_name,
                    state_to_string(view.state),
                    view.progress,
                    view.check_progress,
                    view.download_speed,
                    view.upload_speed,
                    view.peers.len()
                ));
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
    println!("Shutting down ...");

    status_task.abort();
    engine.stop_torrent(info_hash);
    // give the final announce and the connection closes a moment
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.shutdown();
    engine_join.await.ok();
    checker.shutdown();
}
