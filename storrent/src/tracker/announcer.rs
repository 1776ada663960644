use std::time::Duration;

use logger::logger_sender::LoggerSender;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::byte_string::{InfoHash, PeerId};
use crate::engine;

use super::response::TrackerResponse;
use super::url::AnnounceUrl;

/// Transfer totals reported to the tracker, read through a caller-supplied
/// getter at send time.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

pub type AnnounceStatsFn = Box<dyn Fn() -> AnnounceStats + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum EventType {
    Started,
    Completed,
    Stopped,
    None,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Started => "started",
            EventType::Completed => "completed",
            EventType::Stopped => "stopped",
            EventType::None => "",
        }
    }
}

enum AnnouncerCommand {
    Completed,
    Stopped,
}

/// Handle to a torrent's announcer task.
pub struct AnnouncerHandle {
    cmd_tx: mpsc::UnboundedSender<AnnouncerCommand>,
}

impl AnnouncerHandle {
    /// Reports 100% completion to the tracker right away.
    pub fn completed(&self) {
        self.cmd_tx.send(AnnouncerCommand::Completed).ok();
    }

    /// Sends the final `stopped` announce; no further announce is scheduled
    /// afterwards.
    pub fn stopped(&self) {
        self.cmd_tx.send(AnnouncerCommand::Stopped).ok();
    }
}

/// Periodically announces one torrent to its trackers and feeds discovered
/// peer addresses back to the engine.
///
/// Announce URL tiers are flattened and round-robined: a failed or
/// non-HTTP(S) URL advances to the next immediately, and a fully failed
/// pass waits one interval before retrying. A tracker `failure reason`
/// stops announcing altogether.
pub struct Announcer {
    info_hash: InfoHash,
    announce_urls: Vec<String>,
    local_peer_id: PeerId,
    listen_port: u16,
    tracker_session_key: u64,
    get_stats: AnnounceStatsFn,
    engine_tx: mpsc::UnboundedSender<engine::Command>,
    cmd_rx: mpsc::UnboundedReceiver<AnnouncerCommand>,
    logger_sender: LoggerSender,
    client: reqwest::Client,
    current_announce_index: usize,
    interval: Duration,
}

impl Announcer {
    /// Spawns the announcer task; the `started` event goes out immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        info_hash: InfoHash,
        announce_urls: Vec<Vec<String>>,
        local_peer_id: PeerId,
        listen_port: u16,
        tracker_session_key: u64,
        get_stats: AnnounceStatsFn,
        engine_tx: mpsc::UnboundedSender<engine::Command>,
        logger_sender: LoggerSender,
    ) -> (AnnouncerHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let mut announcer = Announcer {
            info_hash,
            announce_urls: announce_urls.into_iter().flatten().collect(),
            local_peer_id,
            listen_port,
            tracker_session_key,
            get_stats,
            engine_tx,
            cmd_rx,
            logger_sender,
            client: reqwest::Client::new(),
            current_announce_index: 0,
            interval: Duration::from_secs(60),
        };

        let join_handle = tokio::spawn(async move { announcer.run().await });
        (AnnouncerHandle { cmd_tx }, join_handle)
    }

    async fn run(&mut self) {
        if self.announce_pass(EventType::Started).await {
            return;
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(AnnouncerCommand::Completed) => {
                        if self.announce_pass(EventType::Completed).await {
                            return;
                        }
                    }
                    Some(AnnouncerCommand::Stopped) => {
                        self.announce_pass(EventType::Stopped).await;
                        return;
                    }
                    None => return,
                },
                _ = tokio::time::sleep(self.interval) => {
                    if self.announce_pass(EventType::None).await {
                        return;
                    }
                }
            }
        }
    }

    /// Tries URLs round-robin until one succeeds; a full pass without a
    /// response means trying again next interval. Returns true when
    /// announcing should stop for good.
    async fn announce_pass(&mut self, event: EventType) -> bool {
        if self.announce_urls.is_empty() {
            return true;
        }

        for _ in 0..self.announce_urls.len() {
            let url = self.announce_urls[self.current_announce_index % self.announce_urls.len()]
                .clone();

            let announce_url = match AnnounceUrl::parse(&url) {
                Ok(announce_url) => announce_url,
                Err(e) => {
                    debug!("Skipping unusable tracker url {}: {:?}", url, e);
                    self.current_announce_index += 1;
                    continue;
                }
            };

            match self.announce_to(&announce_url, event).await {
                Ok(response) => {
                    if let Some(reason) = response.failure_reason {
                        self.logger_sender.error(&format!(
                            "Tracker returned failure for {}: {}",
                            self.info_hash, reason
                        ));
                        return true;
                    }
                    if response.interval > 0 {
                        self.interval = Duration::from_secs(response.interval as u64);
                    }
                    if event != EventType::Stopped {
                        self.engine_tx
                            .send(engine::Command::PeersDiscovered {
                                info_hash: self.info_hash,
                                addresses: response.peers,
                            })
                            .ok();
                    }
                    return false;
                }
                Err(e) => {
                    self.logger_sender.warn(&format!(
                        "Announce failed with url {}: {}. Retrying with the next one in the list.",
                        url, e
                    ));
                    self.current_announce_index += 1;
                }
            }
        }
        false
    }

    async fn announce_to(
        &self,
        url: &AnnounceUrl,
        event: EventType,
    ) -> Result<TrackerResponse, String> {
        let stats = (self.get_stats)();
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&key={}&event={}",
            url_encoder::url_encoder::encode_bytes(self.info_hash.as_bytes()),
            url_encoder::url_encoder::encode_bytes(self.local_peer_id.as_bytes()),
            self.listen_port,
            stats.uploaded,
            stats.downloaded,
            stats.left,
            self.tracker_session_key,
            event.as_str(),
        );
        let announce_url = url.with_query(&query);

        debug!("Announcing: {}", announce_url);

        let body = self
            .client
            .get(&announce_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| e.to_string())?
            .bytes()
            .await
            .map_err(|e| e.to_string())?;

        TrackerResponse::from_bytes(&body).map_err(|e| format!("{:?}", e))
    }
}
