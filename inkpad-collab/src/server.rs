//! WebSocket relay server with room-based document routing.
//!
//! ```text
//! Client A ──┐
//!            ├── Room (doc_id) ── ReplicatedDocument ── BroadcastGroup
//! Client B ──┘                                             │
//!                                             ┌────────────┼────────────┐
//!                                             ▼            ▼            ▼
//!                                          Client A     Client B     Client C
//! ```
//!
//! Each room keeps an authoritative replica in memory. Joining clients get
//! the room state as `load-document`; `send-changes` is merged into the room
//! and relayed to every other connection as `receive-changes`. Rooms outlive
//! connections and survive [`RelayServer::shutdown`], so a server can be
//! stopped and served again with the same state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use inkpad_core::{DocumentId, Participant, ReplicatedDocument};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::{AbortHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::protocol::Frame;

pub const RELAY_ADDR_ENV: &str = "INKPAD_RELAY_ADDR";

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
    /// Frames buffered per connection before the writer applies backpressure.
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            broadcast_capacity: 256,
            outbound_buffer: 256,
        }
    }
}

impl RelayConfig {
    /// Defaults with `INKPAD_RELAY_ADDR` applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(addr) = lookup(RELAY_ADDR_ENV).filter(|v| !v.is_empty()) {
            self.bind_addr = addr;
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub deltas_applied: u64,
    pub deltas_rejected: u64,
    pub active_rooms: usize,
}

/// One document: authoritative replica plus fan-out.
struct Room {
    doc: Mutex<ReplicatedDocument>,
    broadcast: Arc<BroadcastGroup>,
}

impl Room {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: Mutex::new(ReplicatedDocument::new()),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    fn with_doc<R>(&self, f: impl FnOnce(&mut ReplicatedDocument) -> R) -> R {
        let mut doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut doc)
    }
}

type Rooms = Arc<RwLock<HashMap<DocumentId, Arc<Room>>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown. Open connections are
    /// dropped on the way out; room state is kept.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        self.shutdown.send_replace(false);
        let mut stop = self.shutdown.subscribe();
        let local = listener.local_addr()?;
        log::info!("relay listening on {local}");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let connection = Connection {
                        id: Uuid::new_v4(),
                        addr,
                        rooms: self.rooms.clone(),
                        stats: self.stats.clone(),
                        config: self.config.clone(),
                    };
                    connections.spawn(async move {
                        if let Err(e) = connection.run(stream).await {
                            log::warn!("connection {addr} ended with error: {e}");
                        }
                    });
                }
                _ = stop.wait_for(|stopped| *stopped) => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let open = connections.len();
        connections.shutdown().await;
        // Aborted connections never ran their own cleanup.
        for room in self.rooms.read().await.values() {
            room.broadcast.clear_members().await;
        }
        self.stats.write().await.active_connections = 0;
        log::info!("relay on {local} stopped, dropped {open} connections");
        Ok(())
    }

    /// Stop every running [`serve`](Self::serve) loop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Current content of a room, if it exists.
    pub async fn room_content(&self, doc_id: &DocumentId) -> Option<inkpad_core::Node> {
        let room = self.rooms.read().await.get(doc_id).cloned()?;
        Some(room.with_doc(|doc| doc.content()))
    }

    /// Number of connections currently joined to a room.
    pub async fn room_members(&self, doc_id: &DocumentId) -> usize {
        let room = self.rooms.read().await.get(doc_id).cloned();
        match room {
            Some(room) => room.broadcast.member_count().await,
            None => 0,
        }
    }
}

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

struct Connection {
    id: Uuid,
    addr: SocketAddr,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
}

impl Connection {
    async fn run(self, stream: TcpStream) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("connection {} established from {}", self.id, self.addr);
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(self.config.outbound_buffer.max(1));
        // Writer and forwarders are aborted when this set drops.
        let mut tasks = JoinSet::new();
        tasks.spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });
        let mut joined: HashMap<DocumentId, (Arc<Room>, AbortHandle)> = HashMap::new();

        let result: ConnectionResult = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.stats.write().await.frames_received += 1;
                    match Frame::decode(&data) {
                        Ok(frame) => {
                            log::trace!("{} <- {}", self.id, frame.event_name());
                            self.handle_frame(frame, &out_tx, &mut tasks, &mut joined).await;
                        }
                        Err(e) => log::warn!("undecodable frame from {}: {e}", self.addr),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = out_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("connection {} closed by {}", self.id, self.addr);
                    break Ok(());
                }
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(_)) => {}
            }
        };

        for (_, (room, handle)) in joined.drain() {
            handle.abort();
            room.broadcast.remove_member(&self.id).await;
        }
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        result
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        out: &mpsc::Sender<Message>,
        tasks: &mut JoinSet<()>,
        joined: &mut HashMap<DocumentId, (Arc<Room>, AbortHandle)>,
    ) {
        match frame {
            Frame::JoinDocument { doc_id, user } => {
                if let Some((room, handle)) = joined.remove(&doc_id) {
                    handle.abort();
                    room.broadcast.remove_member(&self.id).await;
                }
                let (room, handle) = self.join(&doc_id, user, out, tasks).await;
                joined.insert(doc_id, (room, handle));
            }

            Frame::SendChanges { doc_id, update } => {
                let Some((room, _)) = joined.get(&doc_id) else {
                    log::warn!("{} sent changes for {doc_id} without joining", self.id);
                    return;
                };
                match room.with_doc(|doc| doc.apply_remote_update(&update)) {
                    Ok(_) => {
                        self.stats.write().await.deltas_applied += 1;
                        let relay = Frame::ReceiveChanges { doc_id, update };
                        if let Err(e) = room.broadcast.broadcast(self.id, &relay) {
                            log::warn!("broadcast failed: {e}");
                        }
                    }
                    Err(e) => {
                        self.stats.write().await.deltas_rejected += 1;
                        log::warn!("dropping delta for {doc_id} from {}: {e}", self.id);
                    }
                }
            }

            Frame::LeaveDocument { doc_id } => {
                if let Some((room, handle)) = joined.remove(&doc_id) {
                    handle.abort();
                    room.broadcast.remove_member(&self.id).await;
                    log::info!("{} left {doc_id}", self.id);
                }
            }

            Frame::Ping => send_frame(out, &Frame::Pong).await,

            Frame::Pong => {}

            other @ (Frame::LoadDocument { .. } | Frame::ReceiveChanges { .. }) => {
                log::debug!("ignoring server-bound {} from {}", other.event_name(), self.id);
            }
        }
    }

    async fn join(
        &self,
        doc_id: &DocumentId,
        user: Participant,
        out: &mpsc::Sender<Message>,
        tasks: &mut JoinSet<()>,
    ) -> (Arc<Room>, AbortHandle) {
        let room = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(doc_id.clone())
                .or_insert_with(|| Arc::new(Room::new(self.config.broadcast_capacity)))
                .clone();
            self.stats.write().await.active_rooms = rooms.len();
            room
        };

        log::info!("{} ({}, {}) joined {doc_id}", user.name, user.id, user.role);
        // Subscribe before reading the state so no delta falls in between.
        let rx = room.broadcast.add_member(self.id, user).await;
        let state = room.with_doc(|doc| (!doc.is_fresh()).then(|| doc.encode_full_state()));
        if let Some(update) = state {
            send_frame(
                out,
                &Frame::LoadDocument {
                    doc_id: doc_id.clone(),
                    update,
                },
            )
            .await;
        }

        let handle = tasks.spawn(forward(self.id, doc_id.clone(), rx, out.clone(), room.clone()));
        (room, handle)
    }
}

async fn send_frame(out: &mpsc::Sender<Message>, frame: &Frame) {
    match frame.encode() {
        Ok(bytes) => {
            let _ = out.send(Message::Binary(bytes.into())).await;
        }
        Err(e) => log::error!("cannot encode {}: {e}", frame.event_name()),
    }
}

/// Copy room traffic from other connections into this connection's writer.
/// A receiver that lags behind the broadcast buffer is reseeded with the
/// room's full state, since the skipped deltas are gone.
async fn forward(
    conn: Uuid,
    doc_id: DocumentId,
    mut rx: broadcast::Receiver<Arc<Envelope>>,
    out: mpsc::Sender<Message>,
    room: Arc<Room>,
) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if envelope.origin == conn {
                    continue;
                }
                if out.send(Message::Binary(envelope.bytes.clone().into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                room.broadcast.record_dropped(n);
                log::warn!("connection {conn} lagged by {n} frames on {doc_id}, resending state");
                let update = room.with_doc(|doc| doc.encode_full_state());
                if out.is_closed() {
                    break;
                }
                send_frame(
                    &out,
                    &Frame::LoadDocument {
                        doc_id: doc_id.clone(),
                        update,
                    },
                )
                .await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
