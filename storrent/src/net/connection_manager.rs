use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, trace, warn};

use crate::peer::handshake::Handshake;
use crate::peer::peer_message::Message;

use super::codec::{HandshakeCodec, MessageCodec};
use super::connection::{ConnectionId, ConnectionShared, ConnectionStats, CountingStream};

/// A connection is closed when nothing was received for this long.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(130);
/// A keep-alive is enqueued when nothing was sent for this long.
const KEEP_ALIVE_AFTER: Duration = Duration::from_secs(110);
/// Outbound messages queued per connection before further sends are
/// dropped.
const OUTGOING_QUEUE_LIMIT: usize = 64;

/// What the manager reports to its consumer. The engine observes these
/// serially on its own loop.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The remote side of a connection we dialed sent its handshake.
    /// Answer with [`ConnectionManagerHandle::accept_outgoing`].
    OutgoingHandshake {
        connection_id: ConnectionId,
        handshake: Handshake,
    },
    /// An accepted connection sent its handshake; no reply has been sent
    /// yet. Answer with [`ConnectionManagerHandle::accept_incoming`].
    IncomingHandshake {
        connection_id: ConnectionId,
        handshake: Handshake,
        address: SocketAddr,
    },
    /// The handshake exchange completed in both directions.
    Established { connection_id: ConnectionId },
    MessageReceived {
        connection_id: ConnectionId,
        message: Message,
    },
    /// Fired for every close except the silent rejection of an inbound
    /// connection that never reached session state.
    Disconnected {
        connection_id: ConnectionId,
        reason: String,
    },
    StatsUpdate(HashMap<ConnectionId, ConnectionStats>),
}

#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        connection_id: ConnectionId,
        address: SocketAddr,
        handshake: Handshake,
    },
    SendMessage {
        connection_id: ConnectionId,
        message: Message,
    },
    Close {
        connection_id: ConnectionId,
        reason: String,
    },
    AcceptOutgoing {
        connection_id: ConnectionId,
        accepted: bool,
    },
    AcceptIncoming {
        connection_id: ConnectionId,
        reply: Option<Handshake>,
    },
    Shutdown,
}

/// Cloneable handle for talking to the connection manager task.
///
/// Every operation is posted onto the manager's loop; none of them block.
#[derive(Clone)]
pub struct ConnectionManagerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    next_connection_id: Arc<AtomicU64>,
}

impl ConnectionManagerHandle {
    pub(crate) fn new(
        cmd_tx: mpsc::UnboundedSender<Command>,
        next_connection_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            cmd_tx,
            next_connection_id,
        }
    }

    /// Dials a peer. `handshake` is sent as soon as the socket connects.
    /// The returned id is valid immediately.
    pub fn connect(&self, address: SocketAddr, handshake: Handshake) -> ConnectionId {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.cmd_tx
            .send(Command::Connect {
                connection_id,
                address,
                handshake,
            })
            .ok();
        connection_id
    }

    pub fn send_message(&self, connection_id: ConnectionId, message: Message) {
        self.cmd_tx
            .send(Command::SendMessage {
                connection_id,
                message,
            })
            .ok();
    }

    pub fn close_connection(&self, connection_id: ConnectionId, reason: &str) {
        self.cmd_tx
            .send(Command::Close {
                connection_id,
                reason: reason.to_string(),
            })
            .ok();
    }

    /// Answers an [`ConnectionEvent::OutgoingHandshake`]: `true` completes
    /// the session, `false` closes the connection.
    pub fn accept_outgoing(&self, connection_id: ConnectionId, accepted: bool) {
        self.cmd_tx
            .send(Command::AcceptOutgoing {
                connection_id,
                accepted,
            })
            .ok();
    }

    /// Answers an [`ConnectionEvent::IncomingHandshake`]: a reply handshake
    /// completes the session, `None` closes the connection silently.
    pub fn accept_incoming(&self, connection_id: ConnectionId, reply: Option<Handshake>) {
        self.cmd_tx
            .send(Command::AcceptIncoming {
                connection_id,
                reply,
            })
            .ok();
    }

    pub fn shutdown(&self) {
        self.cmd_tx.send(Command::Shutdown).ok();
    }
}

// How a connection task proceeds once the engine has judged the remote
// handshake.
enum GateDecision {
    Proceed,
    ReplyAndProceed(Handshake),
    Reject(String),
}

enum TaskEvent {
    HandshakeSent {
        connection_id: ConnectionId,
    },
    HandshakeReceived {
        connection_id: ConnectionId,
        handshake: Handshake,
        gate_tx: oneshot::Sender<GateDecision>,
    },
    Ready {
        connection_id: ConnectionId,
    },
    MessageReceived {
        connection_id: ConnectionId,
        message: Message,
    },
    Ended {
        connection_id: ConnectionId,
        reason: String,
    },
}

struct ConnectionEntry {
    address: SocketAddr,
    outgoing: bool,
    handshake_sent: bool,
    handshake_received: bool,
    session_established: bool,
    rejected: bool,
    gate_tx: Option<oneshot::Sender<GateDecision>>,
    out_tx: mpsc::Sender<Message>,
    close_tx: mpsc::UnboundedSender<String>,
    shared: Arc<ConnectionShared>,
}

/// Owns the listening socket and every peer connection.
///
/// Each connection gets an io task; the manager task tracks lifecycle flags,
/// relays engine decisions through per-connection gates, ticks once per
/// second for stats and keep-alives, and translates task endings into
/// `Disconnected` events.
pub struct ConnectionManager {
    listener: TcpListener,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    task_tx: mpsc::UnboundedSender<TaskEvent>,
    task_rx: mpsc::UnboundedReceiver<TaskEvent>,
    next_connection_id: Arc<AtomicU64>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    connection_stats: HashMap<ConnectionId, ConnectionStats>,
    epoch: Instant,
    last_tick: Instant,
}

impl ConnectionManager {
    /// Binds 0.0.0.0 at `listen_port` and spawns the manager task. Returns
    /// the handle, the actually bound address and the task's join handle.
    pub async fn spawn(
        listen_port: u16,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> io::Result<(ConnectionManagerHandle, SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let next_connection_id = Arc::new(AtomicU64::new(0));
        let epoch = Instant::now();

        let mut manager = ConnectionManager {
            listener,
            event_tx,
            cmd_rx,
            task_tx,
            task_rx,
            next_connection_id: next_connection_id.clone(),
            connections: HashMap::new(),
            connection_stats: HashMap::new(),
            epoch,
            last_tick: epoch,
        };

        let join_handle = tokio::spawn(async move { manager.run().await });
        Ok((
            ConnectionManagerHandle::new(cmd_tx, next_connection_id),
            local_addr,
            join_handle,
        ))
    }

    async fn run(&mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, address)) => self.handle_accept(stream, address),
                    Err(e) => debug!("Failed to accept a connection: {}", e),
                },
                Some(event) = self.task_rx.recv() => self.handle_task_event(event),
                _ = tick.tick() => self.handle_tick(),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect {
                connection_id,
                address,
                handshake,
            } => {
                trace!("Connecting to peer {} connection id: {}", address, connection_id);
                self.spawn_connection(
                    connection_id,
                    address,
                    ConnectionKind::Outgoing { handshake },
                );
            }
            Command::SendMessage {
                connection_id,
                message,
            } => match self.connections.get(&connection_id) {
                Some(entry) => match entry.out_tx.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(message)) => {
                        // Degradation point: the peer is not draining its
                        // socket and the queue is at capacity.
                        warn!(
                            "Outgoing queue of connection {} is full, dropping {} message",
                            connection_id,
                            message.name()
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                },
                None => {
                    debug!("Connection {} does not exist, dropping message", connection_id);
                }
            },
            Command::Close {
                connection_id,
                reason,
            } => {
                if let Some(entry) = self.connections.get(&connection_id) {
                    entry.close_tx.send(reason).ok();
                }
                // a missing connection was already closed by the remote end
            }
            Command::AcceptOutgoing {
                connection_id,
                accepted,
            } => match self.connections.get_mut(&connection_id) {
                Some(entry) => {
                    if let Some(gate_tx) = entry.gate_tx.take() {
                        if accepted {
                            gate_tx.send(GateDecision::Proceed).ok();
                        } else {
                            entry.rejected = true;
                            gate_tx
                                .send(GateDecision::Reject(String::from(
                                    "Disconnecting based on received handshake",
                                )))
                                .ok();
                        }
                    }
                }
                None => self.notify_decision_too_late(connection_id),
            },
            Command::AcceptIncoming {
                connection_id,
                reply,
            } => match self.connections.get_mut(&connection_id) {
                Some(entry) => {
                    if let Some(gate_tx) = entry.gate_tx.take() {
                        match reply {
                            Some(handshake) => {
                                entry.handshake_sent = true;
                                gate_tx.send(GateDecision::ReplyAndProceed(handshake)).ok();
                            }
                            None => {
                                entry.rejected = true;
                                gate_tx
                                    .send(GateDecision::Reject(String::from(
                                        "Connection request rejected based on received handshake",
                                    )))
                                    .ok();
                            }
                        }
                    }
                }
                None => self.notify_decision_too_late(connection_id),
            },
            Command::Shutdown => {
                for entry in self.connections.values() {
                    entry.close_tx.send(String::from("Shutting down")).ok();
                }
                return true;
            }
        }
        false
    }

    // The engine decided about a connection that is already gone; tell it,
    // so it can drop whatever bookkeeping it created for the handshake.
    fn notify_decision_too_late(&self, connection_id: ConnectionId) {
        self.event_tx
            .send(ConnectionEvent::Disconnected {
                connection_id,
                reason: String::from("Connection closed before the handshake decision"),
            })
            .ok();
    }

    fn handle_accept(&mut self, stream: TcpStream, address: SocketAddr) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        trace!("Accepted connection from {} id: {}", address, connection_id);
        self.spawn_connection(connection_id, address, ConnectionKind::Incoming { stream });
    }

    fn spawn_connection(
        &mut self,
        connection_id: ConnectionId,
        address: SocketAddr,
        kind: ConnectionKind,
    ) {
        let outgoing = matches!(kind, ConnectionKind::Outgoing { .. });
        let shared = Arc::new(ConnectionShared::new(self.epoch));
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_QUEUE_LIMIT);
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        self.connections.insert(
            connection_id,
            ConnectionEntry {
                address,
                outgoing,
                handshake_sent: false,
                handshake_received: false,
                session_established: false,
                rejected: false,
                gate_tx: None,
                out_tx,
                close_tx,
                shared: shared.clone(),
            },
        );
        self.connection_stats
            .insert(connection_id, ConnectionStats::default());

        let task_tx = self.task_tx.clone();
        tokio::spawn(async move {
            let reason =
                drive_connection(connection_id, address, kind, shared, &task_tx, out_rx, close_rx)
                    .await;
            task_tx
                .send(TaskEvent::Ended {
                    connection_id,
                    reason,
                })
                .ok();
        });
    }

    fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::HandshakeSent { connection_id } => {
                if let Some(entry) = self.connections.get_mut(&connection_id) {
                    entry.handshake_sent = true;
                }
            }
            TaskEvent::HandshakeReceived {
                connection_id,
                handshake,
                gate_tx,
            } => {
                if let Some(entry) = self.connections.get_mut(&connection_id) {
                    entry.handshake_received = true;
                    entry.gate_tx = Some(gate_tx);
                    let event = if entry.handshake_sent {
                        ConnectionEvent::OutgoingHandshake {
                            connection_id,
                            handshake,
                        }
                    } else {
                        ConnectionEvent::IncomingHandshake {
                            connection_id,
                            handshake,
                            address: entry.address,
                        }
                    };
                    self.event_tx.send(event).ok();
                }
            }
            TaskEvent::Ready { connection_id } => {
                if let Some(entry) = self.connections.get_mut(&connection_id) {
                    entry.session_established = true;
                    self.event_tx
                        .send(ConnectionEvent::Established { connection_id })
                        .ok();
                }
            }
            TaskEvent::MessageReceived {
                connection_id,
                message,
            } => {
                self.event_tx
                    .send(ConnectionEvent::MessageReceived {
                        connection_id,
                        message,
                    })
                    .ok();
            }
            TaskEvent::Ended {
                connection_id,
                reason,
            } => {
                let entry = match self.connections.remove(&connection_id) {
                    Some(entry) => entry,
                    None => return,
                };
                self.connection_stats.remove(&connection_id);

                // Inbound connections that never reached session state were
                // either rejected by the engine or died before it ever heard
                // of them; both close silently.
                let silent = !entry.outgoing
                    && !entry.session_established
                    && (entry.rejected || !entry.handshake_received);
                if silent {
                    debug!("Closing a remote-initiated connection: {}", reason);
                } else {
                    self.event_tx
                        .send(ConnectionEvent::Disconnected {
                            connection_id,
                            reason,
                        })
                        .ok();
                }
            }
        }
    }

    fn handle_tick(&mut self) {
        let elapsed_millis = (self.last_tick.elapsed().as_millis() as u64).max(1);
        self.last_tick = Instant::now();

        for (connection_id, entry) in &self.connections {
            let stats = self
                .connection_stats
                .entry(*connection_id)
                .or_default();
            let downloaded = entry.shared.take_downloaded();
            let uploaded = entry.shared.take_uploaded();
            stats.bytes_downloaded += downloaded;
            stats.bytes_uploaded += uploaded;
            stats.download_speed = downloaded * 1000 / elapsed_millis;
            stats.upload_speed = uploaded * 1000 / elapsed_millis;
        }
        self.event_tx
            .send(ConnectionEvent::StatsUpdate(self.connection_stats.clone()))
            .ok();

        for entry in self.connections.values() {
            if entry.shared.millis_since_received() > RECEIVE_TIMEOUT.as_millis() as u64 {
                entry.close_tx.send(String::from("Peer timed out")).ok();
            } else if entry.shared.millis_since_sent() > KEEP_ALIVE_AFTER.as_millis() as u64 {
                trace!("Sending keepalive");
                entry.out_tx.try_send(Message::KeepAlive).ok();
            }
        }
    }
}

enum ConnectionKind {
    Outgoing { handshake: Handshake },
    Incoming { stream: TcpStream },
}

// Runs one connection's io from dial/accept to close. The returned string
// is the close reason reported to the manager.
async fn drive_connection(
    connection_id: ConnectionId,
    address: SocketAddr,
    kind: ConnectionKind,
    shared: Arc<ConnectionShared>,
    task_tx: &mpsc::UnboundedSender<TaskEvent>,
    mut out_rx: mpsc::Receiver<Message>,
    mut close_rx: mpsc::UnboundedReceiver<String>,
) -> String {
    let (stream, local_handshake) = match kind {
        ConnectionKind::Outgoing { handshake } => match TcpStream::connect(address).await {
            Ok(stream) => (stream, Some(handshake)),
            Err(e) => return format!("Error connecting: {}", e),
        },
        ConnectionKind::Incoming { stream } => (stream, None),
    };

    let mut framed = Framed::new(CountingStream::new(stream, shared), HandshakeCodec);

    if let Some(handshake) = local_handshake {
        if let Err(e) = framed.send(handshake).await {
            return format!("Error sending handshake: {}", e);
        }
        task_tx
            .send(TaskEvent::HandshakeSent { connection_id })
            .ok();
    }

    let remote_handshake = tokio::select! {
        frame = framed.next() => match frame {
            Some(Ok(handshake)) => handshake,
            Some(Err(e)) => return format!("Error reading handshake: {}", e),
            None => return String::from("Peer disconnected before completing the handshake"),
        },
        Some(reason) = close_rx.recv() => return reason,
    };

    // No further reads until the engine has judged the handshake.
    let (gate_tx, gate_rx) = oneshot::channel();
    if task_tx
        .send(TaskEvent::HandshakeReceived {
            connection_id,
            handshake: remote_handshake,
            gate_tx,
        })
        .is_err()
    {
        return String::from("Connection manager stopped");
    }

    let decision = tokio::select! {
        decision = gate_rx => match decision {
            Ok(decision) => decision,
            Err(_) => return String::from("Connection manager stopped"),
        },
        Some(reason) = close_rx.recv() => return reason,
    };

    match decision {
        GateDecision::Proceed => {}
        GateDecision::ReplyAndProceed(handshake) => {
            if let Err(e) = framed.send(handshake).await {
                return format!("Error sending handshake: {}", e);
            }
        }
        GateDecision::Reject(reason) => return reason,
    }
    task_tx.send(TaskEvent::Ready { connection_id }).ok();

    // Same socket, new framing: from here on everything is
    // length-prefixed. Bytes already buffered are carried over.
    let parts = framed.into_parts();
    let mut message_parts = FramedParts::new::<Message>(parts.io, MessageCodec);
    message_parts.read_buf = parts.read_buf;
    message_parts.write_buf = parts.write_buf;
    let mut framed = Framed::from_parts(message_parts);

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = framed.send(message).await {
                        return format!("Error writing to socket: {}", e);
                    }
                }
                None => return String::from("Connection manager stopped"),
            },
            Some(reason) = close_rx.recv() => {
                // best effort flush of whatever is already queued
                let _ = SinkExt::<Message>::flush(&mut framed).await;
                return reason;
            }
            frame = framed.next() => match frame {
                Some(Ok(Message::KeepAlive)) => {
                    // refreshes the receive timestamp, nothing else
                    trace!("Received keep-alive from connection {}", connection_id);
                }
                Some(Ok(message)) => {
                    if task_tx
                        .send(TaskEvent::MessageReceived { connection_id, message })
                        .is_err()
                    {
                        return String::from("Connection manager stopped");
                    }
                }
                Some(Err(e)) => return format!("Error reading from socket: {}", e),
                None => return String::from("Peer disconnected"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_string::{InfoHash, PeerId};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv_event(
        rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Option<ConnectionEvent> {
        // stats ticks interleave with the interesting events
        loop {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(ConnectionEvent::StatsUpdate(_))) => continue,
                Ok(event) => return event,
                Err(_) => return None,
            }
        }
    }

    async fn spawn_pair() -> (
        ConnectionManagerHandle,
        mpsc::UnboundedReceiver<ConnectionEvent>,
        SocketAddr,
        ConnectionManagerHandle,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (a, a_addr, _) = ConnectionManager::spawn(0, a_tx).await.unwrap();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let (b, _, _) = ConnectionManager::spawn(0, b_tx).await.unwrap();
        (a, a_rx, a_addr, b, b_rx)
    }

    #[tokio::test]
    async fn test_handshake_exchange_and_messaging() {
        let (a, mut a_rx, a_addr, b, mut b_rx) = spawn_pair().await;

        let info_hash = InfoHash::new([1; 20]);
        let id_a = PeerId::new([0xaa; 20]);
        let id_b = PeerId::new([0xbb; 20]);

        let dial_address = SocketAddr::from(([127, 0, 0, 1], a_addr.port()));
        let b_conn = b.connect(dial_address, Handshake::new(info_hash, id_b));

        // A sees the inbound handshake and accepts with its own
        let (a_conn, received) = match recv_event(&mut a_rx).await {
            Some(ConnectionEvent::IncomingHandshake {
                connection_id,
                handshake,
                ..
            }) => (connection_id, handshake),
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(received.info_hash, info_hash);
        assert_eq!(received.peer_id, id_b);
        a.accept_incoming(a_conn, Some(Handshake::new(info_hash, id_a)));

        match recv_event(&mut a_rx).await {
            Some(ConnectionEvent::Established { connection_id }) => {
                assert_eq!(connection_id, a_conn)
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // B sees A's reply and accepts
        match recv_event(&mut b_rx).await {
            Some(ConnectionEvent::OutgoingHandshake {
                connection_id,
                handshake,
            }) => {
                assert_eq!(connection_id, b_conn);
                assert_eq!(handshake.peer_id, id_a);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        b.accept_outgoing(b_conn, true);
        match recv_event(&mut b_rx).await {
            Some(ConnectionEvent::Established { connection_id }) => {
                assert_eq!(connection_id, b_conn)
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // keep-alives refresh timestamps without surfacing an event, so the
        // next thing A observes must be the Have
        b.send_message(b_conn, Message::KeepAlive);
        b.send_message(b_conn, Message::Have { piece_index: 3 });
        match recv_event(&mut a_rx).await {
            Some(ConnectionEvent::MessageReceived {
                connection_id,
                message,
            }) => {
                assert_eq!(connection_id, a_conn);
                assert_eq!(message, Message::Have { piece_index: 3 });
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // closing reports the reason locally and an EOF remotely
        a.close_connection(a_conn, "done testing");
        match recv_event(&mut a_rx).await {
            Some(ConnectionEvent::Disconnected {
                connection_id,
                reason,
            }) => {
                assert_eq!(connection_id, a_conn);
                assert_eq!(reason, "done testing");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match recv_event(&mut b_rx).await {
            Some(ConnectionEvent::Disconnected { connection_id, .. }) => {
                assert_eq!(connection_id, b_conn)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_rejection_is_silent() {
        let (a, mut a_rx, a_addr, b, mut b_rx) = spawn_pair().await;

        let info_hash = InfoHash::new([2; 20]);
        let dial_address = SocketAddr::from(([127, 0, 0, 1], a_addr.port()));
        b.connect(dial_address, Handshake::new(info_hash, PeerId::new([7; 20])));

        let a_conn = match recv_event(&mut a_rx).await {
            Some(ConnectionEvent::IncomingHandshake { connection_id, .. }) => connection_id,
            other => panic!("unexpected event: {:?}", other),
        };
        a.accept_incoming(a_conn, None);

        // B's dial dies without ever seeing a reply handshake
        match recv_event(&mut b_rx).await {
            Some(ConnectionEvent::Disconnected { .. }) => {}
            other => panic!("unexpected event: {:?}", other),
        }

        // and A stays silent: no Disconnected for the rejected connection
        match timeout(Duration::from_millis(1500), a_rx.recv()).await {
            Ok(Some(ConnectionEvent::StatsUpdate(_))) | Err(_) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outgoing_rejection_reports_disconnect() {
        let (a, mut a_rx, a_addr, b, mut b_rx) = spawn_pair().await;

        let info_hash = InfoHash::new([3; 20]);
        let dial_address = SocketAddr::from(([127, 0, 0, 1], a_addr.port()));
        let b_conn = b.connect(dial_address, Handshake::new(info_hash, PeerId::new([8; 20])));

        let a_conn = match recv_event(&mut a_rx).await {
            Some(ConnectionEvent::IncomingHandshake { connection_id, .. }) => connection_id,
            other => panic!("unexpected event: {:?}", other),
        };
        a.accept_incoming(a_conn, Some(Handshake::new(info_hash, PeerId::new([9; 20]))));

        match recv_event(&mut b_rx).await {
            Some(ConnectionEvent::OutgoingHandshake { .. }) => {}
            other => panic!("unexpected event: {:?}", other),
        }
        b.accept_outgoing(b_conn, false);

        match recv_event(&mut b_rx).await {
            Some(ConnectionEvent::Disconnected {
                connection_id,
                reason,
            }) => {
                assert_eq!(connection_id, b_conn);
                assert_eq!(reason, "Disconnecting based on received handshake");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dial_failure_reports_disconnect() {
        let (_a, _a_rx, _a_addr, b, mut b_rx) = spawn_pair().await;

        // a port nothing listens on
        let dial_address = SocketAddr::from(([127, 0, 0, 1], 1));
        let b_conn = b.connect(
            dial_address,
            Handshake::new(InfoHash::new([4; 20]), PeerId::new([4; 20])),
        );

        match recv_event(&mut b_rx).await {
            Some(ConnectionEvent::Disconnected { connection_id, reason }) => {
                assert_eq!(connection_id, b_conn);
                assert!(reason.starts_with("Error connecting"), "reason: {}", reason);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
