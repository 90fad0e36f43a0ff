//! Version Snapshot Manager
//!
//! Snapshots are named points in a document's history kept by the
//! collaborator API. Saving captures the decoded content tree; rollback asks
//! the server to restore a version and hands back content that the caller
//! feeds into its store, where it becomes a normal delta for peers.
//!
//! The store is never touched here until the server has confirmed the
//! restored content.

use chrono::{DateTime, Utc};
use inkpad_core::{DecodeError, DocumentId, Node, ReplicatedDocument};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::api::CollaboratorApi;
use crate::error::PersistenceError;

/// Accept ids the server sends as strings or as numbers.
pub(crate) fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(id) => id,
        Id::Number(id) => id.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub document_id: Option<String>,
    /// Captured content, exactly as the server stored it.
    #[serde(default)]
    pub content: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl VersionSnapshot {
    /// Captured content as a content tree, when it is one.
    pub fn content_tree(&self) -> Option<Node> {
        serde_json::from_value(self.content.clone()).ok()
    }
}

/// Restored content as returned by a rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RestoredPayload {
    /// Encoded full state as an integer array.
    Binary(Vec<u8>),
    /// Encoded full state as a Node `Buffer` object.
    Buffer {
        #[serde(rename = "type")]
        kind: String,
        data: Vec<u8>,
    },
    Tree(Node),
    /// Anything else; cannot be applied.
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoredContent {
    #[serde(default)]
    pub message: String,
    pub content: RestoredPayload,
}

impl RestoredContent {
    /// Rewrite `store` to the restored content. Returns the delta, which is
    /// emitted to the store's listeners as a restore.
    pub fn apply_to(&self, store: &mut ReplicatedDocument) -> Result<Vec<u8>, DecodeError> {
        match &self.content {
            RestoredPayload::Binary(bytes) | RestoredPayload::Buffer { data: bytes, .. } => {
                store.replace_with_full_state(bytes)
            }
            RestoredPayload::Tree(node) => Ok(store.replace_with_content(node)),
            RestoredPayload::Other(value) => Err(DecodeError::Malformed(format!(
                "unsupported restored content: {}",
                kind_of(value)
            ))),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Save, list and restore document versions.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    api: CollaboratorApi,
}

impl SnapshotManager {
    pub fn new(api: CollaboratorApi) -> Self {
        Self { api }
    }

    /// Capture `content` as a new version. Any serializable value is
    /// accepted; sessions pass their [`Node`] tree.
    pub async fn save_snapshot<T>(&self, doc_id: &DocumentId, content: &T) -> Result<VersionSnapshot, PersistenceError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(content)
            .map_err(|e| PersistenceError::InvalidResponse(e.to_string()))?;
        let snapshot = self.api.create_version(doc_id, &value).await?;
        log::info!("saved version {} of document {doc_id}", snapshot.id);
        Ok(snapshot)
    }

    /// Version history, most recent first.
    pub async fn list_snapshots(&self, doc_id: &DocumentId) -> Result<Vec<VersionSnapshot>, PersistenceError> {
        let mut versions = self.api.list_versions(doc_id).await?;
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }

    /// Ask the server to restore `snapshot_id`. The caller applies the
    /// result with [`RestoredContent::apply_to`].
    pub async fn rollback(
        &self,
        doc_id: &DocumentId,
        snapshot_id: &str,
    ) -> Result<RestoredContent, PersistenceError> {
        let restored = self.api.rollback(doc_id, snapshot_id).await?;
        log::info!("document {doc_id} rolled back to {snapshot_id}: {}", restored.message);
        Ok(restored)
    }
}
