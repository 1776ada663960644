pub mod handshake;
pub mod peer;
pub mod peer_message;
pub mod session;
