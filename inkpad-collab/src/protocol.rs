//! Binary protocol for the collaboration transport.
//!
//! One bincode-encoded [`Frame`] per WebSocket binary message:
//! ```text
//!  client                              relay
//!    │ ── join-document {doc, user} ──► │
//!    │ ◄── load-document {doc, state} ─ │   (room not empty)
//!    │ ── send-changes {doc, delta} ──► │ ── receive-changes ──► other peers
//!    │ ── ping ───────────────────────► │
//!    │ ◄───────────────────────── pong ─ │
//! ```
//!
//! Updates are raw yrs v1 bytes; the frame never interprets them.

use inkpad_core::{DocumentId, Participant};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client announces interest in a document.
    JoinDocument { doc_id: DocumentId, user: Participant },
    /// Server sends the room's full state to a joining client.
    LoadDocument { doc_id: DocumentId, update: Vec<u8> },
    /// Client forwards a local delta.
    SendChanges { doc_id: DocumentId, update: Vec<u8> },
    /// Server relays a delta from another participant.
    ReceiveChanges { doc_id: DocumentId, update: Vec<u8> },
    LeaveDocument { doc_id: DocumentId },
    Ping,
    Pong,
}

impl Frame {
    /// Event name, for logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            Frame::JoinDocument { .. } => "join-document",
            Frame::LoadDocument { .. } => "load-document",
            Frame::SendChanges { .. } => "send-changes",
            Frame::ReceiveChanges { .. } => "receive-changes",
            Frame::LeaveDocument { .. } => "leave-document",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
        }
    }

    /// Document the frame is routed by, if any.
    pub fn doc_id(&self) -> Option<&DocumentId> {
        match self {
            Frame::JoinDocument { doc_id, .. }
            | Frame::LoadDocument { doc_id, .. }
            | Frame::SendChanges { doc_id, .. }
            | Frame::ReceiveChanges { doc_id, .. }
            | Frame::LeaveDocument { doc_id } => Some(doc_id),
            Frame::Ping | Frame::Pong => None,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkpad_core::Role;

    #[test]
    fn test_join_roundtrip() {
        let frame = Frame::JoinDocument {
            doc_id: DocumentId::from("doc-1"),
            user: Participant::new("user-1", "Me", Role::Viewer),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.event_name(), "join-document");
    }

    #[test]
    fn test_update_payload_untouched() {
        let update = vec![1, 0, 0xFF, 7];
        let frame = Frame::SendChanges {
            doc_id: DocumentId::from("doc-1"),
            update: update.clone(),
        };
        match Frame::decode(&frame.encode().unwrap()).unwrap() {
            Frame::SendChanges { update: got, .. } => assert_eq!(got, update),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_doc_id_routing() {
        let doc = DocumentId::from("d");
        assert_eq!(Frame::LeaveDocument { doc_id: doc.clone() }.doc_id(), Some(&doc));
        assert_eq!(Frame::Ping.doc_id(), None);
    }

    #[test]
    fn test_frame_size_efficient() {
        let frame = Frame::ReceiveChanges {
            doc_id: DocumentId::from("6650b7a1c2"),
            update: vec![0u8; 50],
        };
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 80, "encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(Frame::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(Frame::Ping.event_name(), "ping");
        assert_eq!(Frame::Pong.event_name(), "pong");
        let doc_id = DocumentId::from("d");
        let update = Vec::new();
        assert_eq!(
            Frame::LoadDocument { doc_id: doc_id.clone(), update: update.clone() }.event_name(),
            "load-document"
        );
        assert_eq!(
            Frame::ReceiveChanges { doc_id, update }.event_name(),
            "receive-changes"
        );
    }
}
