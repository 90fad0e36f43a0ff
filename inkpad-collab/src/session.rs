//! Document Session: one open document bound to the sync channel and the
//! snapshot manager.
//!
//! The session owns the store. Local and restore deltas leave through a
//! store listener; remote deltas come in through the document feed and are
//! never echoed back. All store mutation goes through `&mut self`, so the
//! session is driven from one task.

use std::future::Future;

use inkpad_core::{
    DecodeError, DocumentId, EditOp, Node, NodePath, Participant, ReplicatedDocument, Role,
    Subscription,
};

use crate::api::{CollaboratorApi, DocumentRecord};
use crate::channel::{DocumentEvent, DocumentFeed, SyncChannel};
use crate::error::{PermissionError, PersistenceError, SessionError};
use crate::snapshot::{RestoredContent, SnapshotManager, VersionSnapshot};

/// Outcome of one inbound feed event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Server state merged.
    Loaded,
    /// A peer's delta changed the document.
    Changed,
    /// The event carried nothing new.
    Unchanged,
    /// The channel re-announced this document on a new link.
    Rejoined,
    /// A malformed delta was discarded; the store is untouched.
    Discarded(DecodeError),
}

pub struct DocumentSession {
    doc_id: DocumentId,
    participant: Participant,
    store: ReplicatedDocument,
    feed: DocumentFeed,
    channel: SyncChannel,
    api: CollaboratorApi,
    snapshots: SnapshotManager,
    record: Option<DocumentRecord>,
    resync_on_rejoin: bool,
    _forwarding: Subscription,
}

impl DocumentSession {
    /// Fetch the document, seed the store from its content and join it.
    /// An empty document gets its initial state persisted first.
    pub async fn open(
        api: CollaboratorApi,
        channel: &SyncChannel,
        doc_id: DocumentId,
        participant: Participant,
    ) -> Result<Self, SessionError> {
        let record = api.fetch_document(&doc_id).await?;
        let store = ReplicatedDocument::initialize(record.content.as_slice())?;
        if store.is_fresh() {
            log::info!("document {doc_id} has no content, persisting initial state");
            api.persist_content(&doc_id, &store.encode_full_state()).await?;
        }
        let mut session = Self::attach(api, channel, store, doc_id, participant)?;
        session.record = Some(record);
        Ok(session)
    }

    /// Bind an already-built store without fetching anything.
    pub fn attach(
        api: CollaboratorApi,
        channel: &SyncChannel,
        store: ReplicatedDocument,
        doc_id: DocumentId,
        participant: Participant,
    ) -> Result<Self, SessionError> {
        let sink = channel.delta_sink(doc_id.clone());
        let forwarding = store.on_update(move |event| {
            if event.origin.should_forward() && !sink.send(event.update.to_vec()) {
                log::debug!("sync channel closed, delta kept locally");
            }
        });
        let feed = channel.join_document(doc_id.clone(), participant.clone())?;
        channel.mark_active(&doc_id)?;
        log::info!(
            "{} joined document {doc_id} as {}",
            participant.name,
            participant.role
        );

        Ok(Self {
            resync_on_rejoin: api.config().resync_on_rejoin,
            snapshots: SnapshotManager::new(api.clone()),
            doc_id,
            participant,
            store,
            feed,
            channel: channel.clone(),
            api,
            record: None,
            _forwarding: forwarding,
        })
    }

    /// Resend the full state whenever the channel rejoins. Defaults to
    /// `ClientConfig::resync_on_rejoin`.
    pub fn set_resync_on_rejoin(&mut self, enabled: bool) {
        self.resync_on_rejoin = enabled;
    }

    fn require_editor(&self, action: &'static str) -> Result<(), PermissionError> {
        if self.participant.can_edit() {
            Ok(())
        } else {
            Err(PermissionError {
                role: self.participant.role,
                action,
            })
        }
    }

    /// Apply a local edit. The delta is forwarded to peers by the store
    /// listener and also returned.
    pub fn apply_edit(&mut self, op: &EditOp) -> Result<Vec<u8>, SessionError> {
        self.require_editor("edit this document")?;
        Ok(self.store.apply_local_edit(op)?)
    }

    /// Wait for the next feed event and apply it. `None` once the channel
    /// is closed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = self.feed.recv().await?;
        Some(self.handle(event))
    }

    /// Apply every event already buffered. Returns how many were handled.
    pub fn drain_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.feed.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    fn handle(&mut self, event: DocumentEvent) -> SessionEvent {
        match event {
            DocumentEvent::InitialState(update) => match self.store.apply_remote_update(&update) {
                Ok(_) => SessionEvent::Loaded,
                Err(e) => SessionEvent::Discarded(e),
            },
            DocumentEvent::RemoteDelta(update) => match self.store.apply_remote_update(&update) {
                Ok(Some(_)) => SessionEvent::Changed,
                Ok(None) => SessionEvent::Unchanged,
                Err(e) => SessionEvent::Discarded(e),
            },
            DocumentEvent::Rejoined => {
                if self.resync_on_rejoin && self.participant.can_edit() {
                    let state = self.store.encode_full_state();
                    log::debug!("resending {} state bytes for {} after rejoin", state.len(), self.doc_id);
                    if let Err(e) = self.channel.send_local_delta(&self.doc_id, state) {
                        log::warn!("cannot resync {}: {e}", self.doc_id);
                    }
                }
                SessionEvent::Rejoined
            }
        }
    }

    /// Capture the current content as a version. The content is taken now;
    /// the returned future owns everything it needs, so remote deltas keep
    /// applying while the save is in flight.
    pub fn save_snapshot(
        &self,
    ) -> Result<impl Future<Output = Result<VersionSnapshot, PersistenceError>> + Send + 'static, PermissionError>
    {
        self.require_editor("save versions")?;
        let snapshots = self.snapshots.clone();
        let doc_id = self.doc_id.clone();
        let content = self.store.content();
        Ok(async move { snapshots.save_snapshot(&doc_id, &content).await })
    }

    pub async fn list_snapshots(&self) -> Result<Vec<VersionSnapshot>, PersistenceError> {
        self.snapshots.list_snapshots(&self.doc_id).await
    }

    /// Restore `version_id` on the server, then rewrite the store. Peers
    /// receive the rewrite as an ordinary delta.
    pub async fn rollback(&mut self, version_id: &str) -> Result<RestoredContent, SessionError> {
        self.require_editor("roll back versions")?;
        let restored = self.snapshots.rollback(&self.doc_id, version_id).await?;
        self.store_restored(&restored)?;
        Ok(restored)
    }

    /// Apply restored content obtained elsewhere.
    pub fn apply_restored(&mut self, restored: &RestoredContent) -> Result<Vec<u8>, SessionError> {
        self.require_editor("roll back versions")?;
        self.store_restored(restored)
    }

    fn store_restored(&mut self, restored: &RestoredContent) -> Result<Vec<u8>, SessionError> {
        Ok(restored.apply_to(&mut self.store)?)
    }

    /// Upload an image, resolve its URL and insert it as a block at `index`
    /// (appended when `None`).
    pub async fn insert_uploaded_image(
        &mut self,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
        index: Option<u32>,
    ) -> Result<Vec<u8>, SessionError> {
        self.require_editor("insert images")?;
        let key = self.api.upload_file(file_name, mime, bytes).await?;
        let url = self.api.signed_url(&key).await?;
        let index = index.unwrap_or_else(|| self.store.block_count());
        let op = EditOp::InsertBlock {
            parent: NodePath::root(),
            index,
            node: Node::image(url),
        };
        Ok(self.store.apply_local_edit(&op)?)
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn role(&self) -> Role {
        self.participant.role
    }

    pub fn can_edit(&self) -> bool {
        self.participant.can_edit()
    }

    pub fn store(&self) -> &ReplicatedDocument {
        &self.store
    }

    pub fn content(&self) -> Node {
        self.store.content()
    }

    /// Metadata from `open`; `None` for attached sessions.
    pub fn record(&self) -> Option<&DocumentRecord> {
        self.record.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthSession, UserProfile};
    use crate::config::ClientConfig;
    use crate::reconnect::ReconnectPolicy;

    fn offline() -> (CollaboratorApi, SyncChannel) {
        let config = ClientConfig {
            api_base_url: "http://127.0.0.1:9".into(),
            collab_url: "ws://127.0.0.1:9".into(),
            reconnect: ReconnectPolicy {
                initial_delay_ms: 10,
                max_delay_ms: 20,
                max_attempts: None,
            },
            ..ClientConfig::default()
        };
        let auth = AuthSession::new(
            "tok",
            UserProfile {
                id: "u1".into(),
                name: "Me".into(),
                email: String::new(),
            },
        );
        let api = CollaboratorApi::new(&config, auth.clone()).unwrap();
        let channel = SyncChannel::connect(&config, &auth).unwrap();
        (api, channel)
    }

    #[tokio::test]
    async fn test_viewer_cannot_edit() {
        let (api, channel) = offline();
        let mut session = DocumentSession::attach(
            api,
            &channel,
            ReplicatedDocument::new(),
            "doc".into(),
            Participant::ephemeral("V", Role::Viewer),
        )
        .unwrap();

        let op = EditOp::insert_block(0, Node::paragraph(vec![Node::text("x")]));
        assert!(matches!(session.apply_edit(&op), Err(SessionError::Permission(_))));
        assert!(session.save_snapshot().is_err());
        assert!(matches!(session.rollback("1").await, Err(SessionError::Permission(_))));
        assert_eq!(session.store().block_count(), 0);
        channel.close();
    }

    #[tokio::test]
    async fn test_local_edits_queue_while_offline() {
        let (api, channel) = offline();
        let mut session = DocumentSession::attach(
            api,
            &channel,
            ReplicatedDocument::new(),
            "doc".into(),
            Participant::ephemeral("E", Role::Editor),
        )
        .unwrap();
        session
            .apply_edit(&EditOp::insert_block(0, Node::paragraph(vec![Node::text("hi")])))
            .unwrap();
        assert_eq!(session.content().plain_text(), "hi");

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while channel.pending_outbound() == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        channel.close();
    }

    #[tokio::test]
    async fn test_malformed_feed_event_is_discarded() {
        let (api, channel) = offline();
        let mut session = DocumentSession::attach(
            api,
            &channel,
            ReplicatedDocument::new(),
            "doc".into(),
            Participant::ephemeral("E", Role::Editor),
        )
        .unwrap();
        let before = session.store().encode_full_state();
        let event = session.handle(DocumentEvent::RemoteDelta(vec![0xff, 0x01, 0x02]));
        assert!(matches!(event, SessionEvent::Discarded(_)));
        assert_eq!(session.store().encode_full_state(), before);
        channel.close();
    }
}
