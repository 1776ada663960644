use std::net::SocketAddr;

/// Lifecycle of a known remote endpoint.
///
/// At most one in-flight connection exists per peer: `InUse` covers both a
/// dial in progress and an established session. `Errored` peers are not
/// redialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Available,
    InUse,
    Errored,
}

/// A remote endpoint known to participate in a torrent's swarm.
///
/// Peers are created on discovery from the tracker or on an accepted inbound
/// connection and live as long as their torrent.
#[derive(Debug, Clone)]
pub struct Peer {
    pub address: SocketAddr,
    pub status: PeerStatus,
}

impl Peer {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            status: PeerStatus::Available,
        }
    }

    pub fn status_str(&self) -> &'static str {
        match self.status {
            PeerStatus::Available => "Available",
            PeerStatus::InUse => "InUse",
            PeerStatus::Errored => "Errored",
        }
    }
}
