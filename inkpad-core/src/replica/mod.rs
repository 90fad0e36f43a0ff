//! Replicated Document Store
//!
//! Authoritative in-memory CRDT state for one open document, built on
//! `yrs`. Content lives in the XML fragment `default`, the layout the
//! ProseMirror bindings use, so peers running the web editor see the same
//! tree.
//!
//! ```text
//!  EditOp ──► apply_local_edit ──┐
//!                                ├──► yrs Doc ──► UpdateEvent ──► listeners
//!  delta  ──► apply_remote_update┘        │
//!                                         └──► content() / encode_full_state()
//! ```
//!
//! All mutation goes through `&mut self`; a store is owned by exactly one
//! session task.

mod edit;
mod listeners;
mod render;

pub use edit::{EditError, EditOp, NodePath};
pub use listeners::{Subscription, UpdateEvent, UpdateOrigin};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, OffsetKind, Options, ReadTxn, StateVector, Transact, TransactionMut, Update,
    XmlFragment, XmlFragmentRef,
};

use crate::content::Node;
use listeners::ListenerRegistry;

/// Name of the XML fragment holding document content.
pub const CONTENT_ROOT: &str = "default";

/// Encoding of an update that carries no changes.
pub const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// An inbound delta or seed that could not be merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed update: {0}")]
    Malformed(String),
    #[error("update rejected by replica: {0}")]
    Rejected(String),
}

/// Whether `update` is the encoding of "no change".
pub fn is_empty_update(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE
}

/// Merge several deltas into one equivalent delta.
pub fn merge_deltas(deltas: &[Vec<u8>]) -> Result<Vec<u8>, DecodeError> {
    let parts: Vec<&[u8]> = deltas.iter().map(Vec::as_slice).collect();
    yrs::merge_updates_v1(parts.as_slice()).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn decode(update: &[u8]) -> Result<Update, DecodeError> {
    Update::decode_v1(update).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// CRDT replica of one document.
pub struct ReplicatedDocument {
    doc: Doc,
    root: XmlFragmentRef,
    listeners: ListenerRegistry,
    fresh: bool,
}

impl ReplicatedDocument {
    /// Create an empty replica.
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let root = doc.get_or_insert_xml_fragment(CONTENT_ROOT);
        Self {
            doc,
            root,
            listeners: ListenerRegistry::default(),
            fresh: true,
        }
    }

    /// Create a replica from a persisted full state.
    ///
    /// An empty seed yields an empty document that reports [`is_fresh`];
    /// its caller is expected to persist [`encode_full_state`] back.
    ///
    /// [`is_fresh`]: Self::is_fresh
    /// [`encode_full_state`]: Self::encode_full_state
    pub fn initialize(seed: &[u8]) -> Result<Self, DecodeError> {
        let mut replica = Self::new();
        if is_empty_update(seed) {
            return Ok(replica);
        }
        let update = decode(seed)?;
        {
            let mut txn = replica.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DecodeError::Rejected(e.to_string()))?;
        }
        replica.fresh = false;
        Ok(replica)
    }

    /// Merge a delta from a peer or the server.
    ///
    /// Returns the delta that was actually applied, or `None` when it
    /// changed nothing (a replay). Malformed input leaves the replica
    /// untouched.
    pub fn apply_remote_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
        let decoded = decode(update).inspect_err(|e| {
            log::warn!("discarding remote delta ({} bytes): {e}", update.len());
        })?;
        let applied = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded).map_err(|e| {
                log::warn!("remote delta rejected: {e}");
                DecodeError::Rejected(e.to_string())
            })?;
            txn.encode_update_v1()
        };
        if is_empty_update(&applied) {
            return Ok(None);
        }
        self.fresh = false;
        self.emit(UpdateOrigin::Remote, &applied);
        Ok(Some(applied))
    }

    /// Apply one local edit in a single transaction and return its delta.
    pub fn apply_local_edit(&mut self, op: &EditOp) -> Result<Vec<u8>, EditError> {
        let delta = {
            let mut txn = self.doc.transact_mut();
            edit::apply(&mut txn, &self.root, op)?;
            txn.encode_update_v1()
        };
        if !is_empty_update(&delta) {
            self.fresh = false;
            self.emit(UpdateOrigin::Local, &delta);
        }
        Ok(delta)
    }

    /// Register an observer for every applied delta.
    pub fn on_update<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&UpdateEvent<'_>) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Full state as a single v1 update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that a peer at `remote` lacks.
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(remote)
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Encoded state vector, for exchanging with peers.
    pub fn encoded_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Decoded content tree.
    pub fn content(&self) -> Node {
        let txn = self.doc.transact();
        render::render_fragment(&txn, &self.root)
    }

    /// Rewrite content to match the document encoded in `full_state`.
    ///
    /// The rewrite is a normal delta on top of the current history, so
    /// peers converge on it; it is emitted with [`UpdateOrigin::Restore`].
    pub fn replace_with_full_state(&mut self, full_state: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let scratch = ReplicatedDocument::initialize(full_state)?;
        Ok(self.replace_with_content(&scratch.content()))
    }

    /// Rewrite content to `content`. A `doc` node replaces the whole body;
    /// any other node becomes the only block.
    pub fn replace_with_content(&mut self, content: &Node) -> Vec<u8> {
        let blocks = match content.kind {
            crate::content::NodeKind::Doc => content.content.as_slice(),
            _ => std::slice::from_ref(content),
        };
        let delta = {
            let mut txn = self.doc.transact_mut();
            clear(&mut txn, &self.root);
            edit::write_children(&mut txn, &self.root, 0, blocks);
            txn.encode_update_v1()
        };
        if !is_empty_update(&delta) {
            self.fresh = false;
            self.emit(UpdateOrigin::Restore, &delta);
        }
        delta
    }

    /// True until the replica holds any state (seeded, edited or merged).
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of top-level blocks.
    pub fn block_count(&self) -> u32 {
        self.root.len(&self.doc.transact())
    }

    /// Inline length of the element at `path`, in the offsets text edits
    /// use: UTF-16 units of text plus one per inline node.
    pub fn text_len(&self, path: &NodePath) -> Result<u32, EditError> {
        let txn = self.doc.transact();
        let element = edit::resolve_element(&txn, &self.root, path)?;
        Ok(edit::inline_len(&edit::inline_children(&txn, &element)))
    }

    fn emit(&self, origin: UpdateOrigin, update: &[u8]) {
        self.listeners.emit(&UpdateEvent { origin, update });
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("client_id", &self.client_id())
            .field("fresh", &self.fresh)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

fn clear(txn: &mut TransactionMut, root: &XmlFragmentRef) {
    let len = root.len(&*txn);
    if len > 0 {
        root.remove_range(txn, 0, len);
    }
}
