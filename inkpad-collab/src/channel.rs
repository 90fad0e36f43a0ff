//! Sync Channel: one persistent WebSocket link multiplexing per-document
//! update streams.
//!
//! ```text
//!                        ┌───────────── driver task ─────────────┐
//!  SyncChannel ─Command─►│ routes: doc_id → feed sender           │◄─ frames ─ server
//!  (cloneable)           │ OfflineQueue (while link is down)      │── frames ─►
//!  watch<ChannelState> ◄─│ heartbeat, ReconnectPolicy backoff     │
//!                        └──────────────┬─────────────────────────┘
//!                                       ▼
//!                         DocumentFeed (bounded, in order)
//! ```
//!
//! State machine:
//! `Disconnected → Connecting → Connected → Joined → Active ⇄ Degraded → Closed`.
//! While degraded, local deltas are queued and flushed after every route has
//! been re-announced. Inbound frames are delivered in arrival order.
//!
//! The driver never waits on a feed. An event for a full feed is dropped and
//! the route is marked stale; once the feed has drained, the document is
//! joined again and the server's full state takes the place of what was lost.
//!
//! Sent deltas stay unconfirmed until the pong for a later ping arrives. The
//! relay answers pings in order, so a pong means every delta before its ping
//! was read. Unconfirmed deltas are queued again when the link is lost.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use inkpad_core::{merge_deltas, DocumentId, Participant};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::auth::AuthSession;
use crate::config::ClientConfig;
use crate::error::ConnectionError;
use crate::protocol::Frame;
use crate::reconnect::ReconnectPolicy;

/// Silent heartbeat periods before the link is considered lost.
const MISSED_HEARTBEATS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    /// Link open, no document joined.
    Connected,
    /// At least one document announced, none reported active yet.
    Joined,
    Active,
    /// Link lost; reconnect attempt `attempt` pending.
    Degraded { attempt: u32 },
    Closed,
}

impl ChannelState {
    /// Whether frames can currently reach the server.
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            ChannelState::Connected | ChannelState::Joined | ChannelState::Active
        )
    }
}

/// Inbound event for one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    /// Full server state (`load-document`).
    InitialState(Vec<u8>),
    /// A peer's delta (`receive-changes`).
    RemoteDelta(Vec<u8>),
    /// The route was re-announced on a new link.
    Rejoined,
}

enum Command {
    Join {
        doc_id: DocumentId,
        participant: Participant,
        events: mpsc::Sender<DocumentEvent>,
        route: u64,
    },
    Leave {
        doc_id: DocumentId,
        route: Option<u64>,
    },
    MarkActive(DocumentId),
    Send {
        doc_id: DocumentId,
        update: Vec<u8>,
    },
    Close,
}

/// Receiver of inbound events for one joined document. Dropping it leaves
/// the document.
pub struct DocumentFeed {
    doc_id: DocumentId,
    route: u64,
    events: mpsc::Receiver<DocumentEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

impl DocumentFeed {
    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Next event; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<DocumentEvent> {
        self.events.recv().await
    }

    /// Next already-buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<DocumentEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for DocumentFeed {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Leave {
            doc_id: self.doc_id.clone(),
            route: Some(self.route),
        });
    }
}

/// Cloneable handle that forwards local deltas for one document.
#[derive(Clone)]
pub struct DeltaSink {
    doc_id: DocumentId,
    commands: mpsc::UnboundedSender<Command>,
}

impl DeltaSink {
    /// Non-blocking. Returns `false` once the channel is gone.
    pub fn send(&self, update: Vec<u8>) -> bool {
        self.commands
            .send(Command::Send {
                doc_id: self.doc_id.clone(),
                update,
            })
            .is_ok()
    }
}

/// Handle to the sync channel. Cheap to clone; all clones drive one link.
#[derive(Clone)]
pub struct SyncChannel {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    pending: Arc<AtomicUsize>,
    next_route: Arc<AtomicU64>,
    event_buffer: usize,
}

impl SyncChannel {
    /// Start the connection driver for `config.collab_url`. Must be called
    /// inside a tokio runtime. Returns immediately in `Connecting`.
    pub fn connect(config: &ClientConfig, session: &AuthSession) -> Result<Self, ConnectionError> {
        let target = LinkTarget {
            url: config.collab_url.clone(),
            bearer: session.bearer(),
        };
        // Fail fast on an unusable URL or token instead of retrying forever.
        target.request()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let pending = Arc::new(AtomicUsize::new(0));

        let driver = Driver {
            target,
            policy: config.reconnect.clone(),
            heartbeat: config.heartbeat_interval(),
            connect_timeout: config.request_timeout(),
            commands: commands_rx,
            state: state_tx,
            routes: HashMap::new(),
            queue: OfflineQueue::new(config.offline_queue_limit),
            pending: pending.clone(),
            links: 0,
            unconfirmed: VecDeque::new(),
            sent: 0,
            pings: VecDeque::new(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            pending,
            next_route: Arc::new(AtomicU64::new(1)),
            event_buffer: config.event_buffer.max(1),
        })
    }

    /// Route `doc_id` to a new feed and announce `join-document`. A
    /// previous feed for the same document stops receiving.
    pub fn join_document(
        &self,
        doc_id: DocumentId,
        participant: Participant,
    ) -> Result<DocumentFeed, ConnectionError> {
        let route = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(self.event_buffer);
        self.command(Command::Join {
            doc_id: doc_id.clone(),
            participant,
            events: events_tx,
            route,
        })?;
        Ok(DocumentFeed {
            doc_id,
            route,
            events: events_rx,
            commands: self.commands.clone(),
        })
    }

    /// Report that the document's store is initialized.
    pub fn mark_active(&self, doc_id: &DocumentId) -> Result<(), ConnectionError> {
        self.command(Command::MarkActive(doc_id.clone()))
    }

    /// Forward a local delta. Never blocks; while the link is down the
    /// delta waits in the offline queue.
    pub fn send_local_delta(&self, doc_id: &DocumentId, update: Vec<u8>) -> Result<(), ConnectionError> {
        self.command(Command::Send {
            doc_id: doc_id.clone(),
            update,
        })
    }

    pub fn delta_sink(&self, doc_id: DocumentId) -> DeltaSink {
        DeltaSink {
            doc_id,
            commands: self.commands.clone(),
        }
    }

    /// Stop routing `doc_id`. Local state is untouched.
    pub fn leave(&self, doc_id: &DocumentId) {
        let _ = self.commands.send(Command::Leave {
            doc_id: doc_id.clone(),
            route: None,
        });
    }

    /// Tear the link down for every clone of this handle.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&ChannelState) -> bool,
    ) -> Result<ChannelState, ConnectionError> {
        let mut state = self.state.clone();
        let found = state.wait_for(predicate).await.map_err(|_| ConnectionError::Closed)?;
        Ok(*found)
    }

    /// Deltas waiting in the offline queue.
    pub fn pending_outbound(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    fn command(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands.send(command).map_err(|_| ConnectionError::Closed)
    }
}

/// Local deltas held while the link is down.
///
/// When the queue grows past its limit, queued deltas are merged per
/// document, so memory is bounded by the number of documents rather than
/// the number of edits.
pub struct OfflineQueue {
    entries: VecDeque<QueuedDelta>,
    limit: usize,
}

struct QueuedDelta {
    doc_id: DocumentId,
    update: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, doc_id: DocumentId, update: Vec<u8>) {
        self.entries.push_back(QueuedDelta {
            doc_id,
            update,
            queued_at: Instant::now(),
        });
        if self.entries.len() > self.limit {
            self.compact();
        }
    }

    /// Merge queued deltas per document, keeping first-queued order.
    pub fn compact(&mut self) {
        let before = self.entries.len();
        let mut order: Vec<DocumentId> = Vec::new();
        let mut grouped: HashMap<DocumentId, (Instant, Vec<Vec<u8>>)> = HashMap::new();
        for entry in self.entries.drain(..) {
            let slot = grouped.entry(entry.doc_id.clone()).or_insert_with(|| {
                order.push(entry.doc_id.clone());
                (entry.queued_at, Vec::new())
            });
            slot.1.push(entry.update);
        }

        for doc_id in order {
            let Some((queued_at, updates)) = grouped.remove(&doc_id) else {
                continue;
            };
            match merge_deltas(&updates) {
                Ok(update) => self.entries.push_back(QueuedDelta {
                    doc_id,
                    update,
                    queued_at,
                }),
                Err(e) => {
                    log::warn!("cannot compact queued deltas for {doc_id}: {e}");
                    self.entries.extend(updates.into_iter().map(|update| QueuedDelta {
                        doc_id: doc_id.clone(),
                        update,
                        queued_at,
                    }));
                }
            }
        }
        log::debug!("offline queue compacted from {before} to {} deltas", self.entries.len());
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<(DocumentId, Vec<u8>)> {
        self.entries
            .drain(..)
            .map(|entry| (entry.doc_id, entry.update))
            .collect()
    }

    /// Put deltas back at the front, in order.
    fn requeue(&mut self, items: Vec<(DocumentId, Vec<u8>)>) {
        for (doc_id, update) in items.into_iter().rev() {
            self.entries.push_front(QueuedDelta {
                doc_id,
                update,
                queued_at: Instant::now(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|entry| entry.update.len()).sum()
    }

    /// How long the oldest delta has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.entries.front().map(|entry| entry.queued_at.elapsed())
    }
}

struct LinkTarget {
    url: String,
    bearer: String,
}

impl LinkTarget {
    fn request(&self) -> Result<Request, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidUrl {
            url: self.url.clone(),
            reason,
        };
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| invalid(e.to_string()))?;
        let bearer = HeaderValue::from_str(&self.bearer).map_err(|e| invalid(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        Ok(request)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

struct Route {
    id: u64,
    participant: Participant,
    events: mpsc::Sender<DocumentEvent>,
    active: bool,
    /// Events were dropped on a full feed; rejoin once it drains.
    stale: bool,
}

impl Route {
    fn new(id: u64, participant: Participant, events: mpsc::Sender<DocumentEvent>) -> Self {
        Self {
            id,
            participant,
            events,
            active: false,
            stale: false,
        }
    }
}

/// How a linked session ended.
enum LinkEnd {
    Lost(String),
    Closed,
}

struct Driver {
    target: LinkTarget,
    policy: ReconnectPolicy,
    heartbeat: Duration,
    connect_timeout: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ChannelState>,
    routes: HashMap<DocumentId, Route>,
    queue: OfflineQueue,
    pending: Arc<AtomicUsize>,
    /// Links established so far.
    links: u64,
    /// Sent deltas not yet covered by a pong, tagged with their send number.
    unconfirmed: VecDeque<(u64, DocumentId, Vec<u8>)>,
    sent: u64,
    /// Send number at each outstanding ping.
    pings: VecDeque<u64>,
}

impl Driver {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        self.set_state(ChannelState::Connecting);
        loop {
            match self.open_link().await {
                Ok(ws) => {
                    attempt = 0;
                    match self.drive(ws).await {
                        LinkEnd::Closed => break,
                        LinkEnd::Lost(reason) => {
                            log::warn!("{}", ConnectionError::LinkLost(reason));
                            self.requeue_unconfirmed();
                        }
                    }
                }
                Err(e) => log::warn!("{e}"),
            }

            attempt = attempt.saturating_add(1);
            if self.policy.exhausted(attempt) {
                log::error!("{}", ConnectionError::RetriesExhausted(attempt - 1));
                break;
            }
            self.set_state(ChannelState::Degraded { attempt });
            let delay = self.policy.delay_for(attempt);
            log::info!("reconnecting in {delay:?} (attempt {attempt})");
            if !self.wait_offline(delay).await {
                break;
            }
        }

        // Feeds see end-of-stream once their routes are gone.
        self.routes.clear();
        let undelivered = self.queue.len() + self.unconfirmed.len();
        if undelivered > 0 {
            log::warn!("closing with {undelivered} undelivered deltas");
        }
        self.set_state(ChannelState::Closed);
    }

    async fn open_link(&self) -> Result<WsStream, ConnectionError> {
        let request = self.target.request()?;
        let failed = |reason: String| ConnectionError::Connect {
            url: self.target.url.clone(),
            reason,
        };
        match tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request)).await {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed("timed out".into())),
        }
    }

    /// Handle commands while the link is down. Returns `false` on close.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return false,
                    Some(command) => self.handle_offline(command),
                },
            }
        }
    }

    fn handle_offline(&mut self, command: Command) {
        match command {
            Command::Join { doc_id, participant, events, route } => {
                self.routes.insert(doc_id, Route::new(route, participant, events));
            }
            Command::Leave { doc_id, route } => {
                self.remove_route(&doc_id, route);
            }
            Command::MarkActive(doc_id) => {
                if let Some(route) = self.routes.get_mut(&doc_id) {
                    route.active = true;
                }
            }
            Command::Send { doc_id, update } => {
                self.queue.push(doc_id, update);
                self.sync_pending();
            }
            Command::Close => {}
        }
    }

    async fn drive(&mut self, ws: WsStream) -> LinkEnd {
        let (mut sink, mut stream) = ws.split();
        self.links += 1;
        self.pings.clear();
        let rejoining = self.links > 1;
        log::info!("collaboration link {} open to {}", self.links, self.target.url);
        self.set_state(ChannelState::Connected);

        // Every route is joined afresh, so nothing stays stale.
        let joins: Vec<Frame> = self
            .routes
            .iter_mut()
            .map(|(doc_id, route)| {
                route.stale = false;
                Frame::JoinDocument {
                    doc_id: doc_id.clone(),
                    user: route.participant.clone(),
                }
            })
            .collect();
        for frame in &joins {
            if let Err(reason) = send(&mut sink, frame).await {
                return LinkEnd::Lost(reason);
            }
        }
        if rejoining {
            let doc_ids: Vec<DocumentId> = self.routes.keys().cloned().collect();
            for doc_id in &doc_ids {
                self.deliver(doc_id, DocumentEvent::Rejoined);
            }
        }
        self.set_state(self.linked_state());

        let queued = self.queue.drain();
        self.sync_pending();
        if !queued.is_empty() {
            log::info!("replaying {} queued deltas", queued.len());
        }
        let mut queued = queued.into_iter();
        while let Some((doc_id, update)) = queued.next() {
            if let Err(reason) = self.send_delta(&mut sink, doc_id, update).await {
                self.queue.requeue(queued.collect());
                self.sync_pending();
                return LinkEnd::Lost(reason);
            }
        }

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = sink.close().await;
                        return LinkEnd::Closed;
                    };
                    if let Some(end) = self.handle_linked(command, &mut sink).await {
                        return end;
                    }
                }
                msg = stream.next() => {
                    last_heard = Instant::now();
                    if let Some(end) = self.handle_inbound(msg, &mut sink).await {
                        return end;
                    }
                    if let Err(reason) = self.resync_stale(&mut sink).await {
                        return LinkEnd::Lost(reason);
                    }
                }
                _ = ticker.tick() => {
                    if last_heard.elapsed() >= self.heartbeat * MISSED_HEARTBEATS {
                        return LinkEnd::Lost("heartbeat timed out".into());
                    }
                    if let Err(reason) = self.ping(&mut sink).await {
                        return LinkEnd::Lost(reason);
                    }
                    if let Err(reason) = self.resync_stale(&mut sink).await {
                        return LinkEnd::Lost(reason);
                    }
                }
            }
        }
    }

    async fn handle_linked(&mut self, command: Command, sink: &mut WsSink) -> Option<LinkEnd> {
        match command {
            Command::Join { doc_id, participant, events, route } => {
                let frame = Frame::JoinDocument {
                    doc_id: doc_id.clone(),
                    user: participant.clone(),
                };
                self.routes.insert(doc_id, Route::new(route, participant, events));
                self.set_state(self.linked_state());
                send(sink, &frame).await.err().map(LinkEnd::Lost)
            }
            Command::Leave { doc_id, route } => {
                if self.remove_route(&doc_id, route) {
                    self.set_state(self.linked_state());
                    return send(sink, &Frame::LeaveDocument { doc_id }).await.err().map(LinkEnd::Lost);
                }
                None
            }
            Command::MarkActive(doc_id) => {
                if let Some(route) = self.routes.get_mut(&doc_id) {
                    route.active = true;
                }
                self.set_state(self.linked_state());
                None
            }
            Command::Send { doc_id, update } => {
                self.send_delta(sink, doc_id, update).await.err().map(LinkEnd::Lost)
            }
            Command::Close => {
                let _ = sink.close().await;
                Some(LinkEnd::Closed)
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        sink: &mut WsSink,
    ) -> Option<LinkEnd> {
        let data = match msg {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => return Some(LinkEnd::Lost("closed by server".into())),
            Some(Err(e)) => return Some(LinkEnd::Lost(e.to_string())),
            Some(Ok(_)) => return None,
        };
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("discarding inbound frame: {e}");
                return None;
            }
        };
        log::trace!("<- {}", frame.event_name());

        let (doc_id, event) = match frame {
            Frame::LoadDocument { doc_id, update } => (doc_id, DocumentEvent::InitialState(update)),
            Frame::ReceiveChanges { doc_id, update } => (doc_id, DocumentEvent::RemoteDelta(update)),
            Frame::Ping => return send(sink, &Frame::Pong).await.err().map(LinkEnd::Lost),
            Frame::Pong => return self.confirm(sink).await.err().map(LinkEnd::Lost),
            other => {
                log::debug!("ignoring client-bound {}", other.event_name());
                return None;
            }
        };
        self.deliver(&doc_id, event);
        None
    }

    /// Hand an event to its feed without waiting.
    fn deliver(&mut self, doc_id: &DocumentId, event: DocumentEvent) {
        let Some(route) = self.routes.get_mut(doc_id) else {
            log::debug!("no route for {doc_id}, dropping event");
            return;
        };
        if route.stale {
            log::trace!("feed for {doc_id} is stale, dropping event");
            return;
        }
        match route.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("feed for {doc_id} is full, rejoining once it drains");
                route.stale = true;
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("feed for {doc_id} is gone");
                self.routes.remove(doc_id);
            }
        }
    }

    /// Rejoin stale routes whose feeds are empty again. The server answers
    /// with its full state.
    async fn resync_stale(&mut self, sink: &mut WsSink) -> Result<(), String> {
        let mut joins = Vec::new();
        for (doc_id, route) in self.routes.iter_mut() {
            if route.stale && route.events.capacity() == route.events.max_capacity() {
                route.stale = false;
                joins.push(Frame::JoinDocument {
                    doc_id: doc_id.clone(),
                    user: route.participant.clone(),
                });
            }
        }
        for frame in &joins {
            if let Frame::JoinDocument { doc_id, .. } = frame {
                log::info!("resyncing {doc_id} after dropped events");
            }
            send(sink, frame).await?;
        }
        Ok(())
    }

    /// Send a local delta and hold it until a pong confirms it. A delta
    /// whose send fails is held too, so link loss queues it again.
    async fn send_delta(&mut self, sink: &mut WsSink, doc_id: DocumentId, update: Vec<u8>) -> Result<(), String> {
        let frame = Frame::SendChanges { doc_id, update };
        let sent = send(sink, &frame).await;
        if let Frame::SendChanges { doc_id, update } = frame {
            self.sent += 1;
            self.unconfirmed.push_back((self.sent, doc_id, update));
        }
        sent?;
        if self.pings.is_empty() {
            self.ping(sink).await?;
        }
        Ok(())
    }

    async fn ping(&mut self, sink: &mut WsSink) -> Result<(), String> {
        send(sink, &Frame::Ping).await?;
        self.pings.push_back(self.sent);
        Ok(())
    }

    /// A pong answers the oldest outstanding ping.
    async fn confirm(&mut self, sink: &mut WsSink) -> Result<(), String> {
        let Some(mark) = self.pings.pop_front() else {
            return Ok(());
        };
        while self.unconfirmed.front().is_some_and(|(seq, _, _)| *seq <= mark) {
            self.unconfirmed.pop_front();
        }
        if !self.unconfirmed.is_empty() && self.pings.is_empty() {
            self.ping(sink).await?;
        }
        Ok(())
    }

    fn requeue_unconfirmed(&mut self) {
        self.pings.clear();
        if self.unconfirmed.is_empty() {
            return;
        }
        log::info!("queueing {} unconfirmed deltas again", self.unconfirmed.len());
        let items = self.unconfirmed.drain(..).map(|(_, doc_id, update)| (doc_id, update)).collect();
        self.queue.requeue(items);
        self.sync_pending();
    }

    /// Remove a route; with `Some(id)` only if it is still that route.
    fn remove_route(&mut self, doc_id: &DocumentId, route: Option<u64>) -> bool {
        let matches = self
            .routes
            .get(doc_id)
            .is_some_and(|current| route.is_none_or(|id| id == current.id));
        if matches {
            self.routes.remove(doc_id);
        }
        matches
    }

    fn linked_state(&self) -> ChannelState {
        if self.routes.is_empty() {
            ChannelState::Connected
        } else if self.routes.values().any(|route| route.active) {
            ChannelState::Active
        } else {
            ChannelState::Joined
        }
    }

    fn set_state(&self, next: ChannelState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            log::info!("sync channel {current:?} -> {next:?}");
            *current = next;
            true
        });
    }

    fn sync_pending(&self) {
        self.pending.store(self.queue.len(), Ordering::Relaxed);
    }
}

async fn send(sink: &mut WsSink, frame: &Frame) -> Result<(), String> {
    let bytes = frame.encode().map_err(|e| e.to_string())?;
    log::trace!("-> {}", frame.event_name());
    sink.send(Message::Binary(bytes.into())).await.map_err(|e| e.to_string())
}
