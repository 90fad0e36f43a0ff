//! # inkpad-core: Replicated document model for Inkpad
//!
//! The collaborative editing core: a conflict-free replicated document
//! (on `yrs`) whose content decodes to a ProseMirror-style node tree.
//!
//! ```text
//!  ┌──────────────┐  EditOp   ┌────────────────────┐  delta   ┌──────────┐
//!  │ Editing      │ ────────► │ ReplicatedDocument │ ───────► │ listener │
//!  │ surface      │ ◄──────── │ (yrs Doc)          │ ◄─────── │ (channel)│
//!  └──────────────┘  Node     └────────────────────┘  remote  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`content`]: decoded content tree (`Node`, `NodeKind`, `Mark`)
//! - [`replica`]: the Replicated Document Store, edits and update listeners
//! - [`participant`]: document ids, participants and roles

pub mod content;
pub mod participant;
pub mod replica;

pub use content::{Mark, Node, NodeKind};
pub use participant::{DocumentId, Participant, Role, UnknownRole};
pub use replica::{
    is_empty_update, merge_deltas, DecodeError, EditError, EditOp, NodePath, ReplicatedDocument,
    Subscription, UpdateEvent, UpdateOrigin, CONTENT_ROOT, EMPTY_UPDATE,
};
