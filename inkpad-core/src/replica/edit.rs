//! Local edit operations and the writer that turns content trees into
//! replicated XML.
//!
//! Every operation is validated against the current tree before anything is
//! written, so a rejected edit leaves the document untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use yrs::types::Attrs;
use yrs::{
    Any, ReadTxn, Text, TransactionMut, Xml, XmlElementPrelim, XmlElementRef, XmlFragment,
    XmlFragmentRef, XmlOut, XmlTextPrelim, XmlTextRef,
};

use crate::content::{Mark, Node, NodeKind};

/// Child-index path from the document root to an element.
///
/// `[]` is the root itself, `[2]` the third top-level block, `[0, 1]` the
/// second child of the first block (e.g. a list item).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(pub Vec<u32>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path of a top-level block.
    pub fn block(index: u32) -> Self {
        Self(vec![index])
    }

    pub fn child(&self, index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parent path and index within it. `None` for the root.
    pub fn split_last(&self) -> Option<(NodePath, u32)> {
        let (last, parent) = self.0.split_last()?;
        Some((NodePath(parent.to_vec()), *last))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for index in &self.0 {
            write!(f, "/{index}")?;
        }
        Ok(())
    }
}

/// A single local mutation of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum EditOp {
    /// Insert `node` (and its subtree) as child `index` of `parent`.
    InsertBlock { parent: NodePath, index: u32, node: Node },
    /// Remove the element at `path` with its subtree.
    RemoveBlock { path: NodePath },
    /// Insert inline text into a textual block.
    InsertText {
        path: NodePath,
        offset: u32,
        text: String,
        marks: Vec<Mark>,
    },
    DeleteText { path: NodePath, offset: u32, len: u32 },
    /// Add or remove one mark over a text range.
    Format {
        path: NodePath,
        offset: u32,
        len: u32,
        mark: Mark,
        enabled: bool,
    },
    SetAttribute {
        path: NodePath,
        key: String,
        value: Value,
    },
}

impl EditOp {
    /// Append-style helper: insert a top-level block at `index`.
    pub fn insert_block(index: u32, node: Node) -> Self {
        EditOp::InsertBlock {
            parent: NodePath::root(),
            index,
            node,
        }
    }

    pub fn insert_text(path: NodePath, offset: u32, text: impl Into<String>) -> Self {
        EditOp::InsertText {
            path,
            offset,
            text,
            marks,
        } => {
            let element = textual_element(&*txn, root, path)?;
            let children = inline_children(&*txn, &element);
            check_range(path, *offset, 0, inline_len(&children))?;
            if text.is_empty() {
                return Ok(());
            }
            let attrs = mark_attrs(marks);
            let existing = children.iter().find_map(|child| match &child.text {
                Some(target) if child.start <= *offset && *offset <= child.end() => {
                    Some((target.clone(), *offset - child.start))
                }
                _ => None,
            });
            match existing {
                Some((target, at)) => target.insert_with_attributes(txn, at, text, attrs),
                None => {
                    // Only inline nodes around the offset: open a new text node there.
                    let index = children
                        .iter()
                        .find(|child| child.start >= *offset)
                        .map_or_else(|| element.len(&*txn), |child| child.index);
                    let target = element.insert(txn, index, XmlTextPrelim::new(""));
                    target.insert_with_attributes(txn, 0, text, attrs);
                }
            }
            Ok(())
        }

        EditOp::DeleteText { path, offset, len } => {
            let element = textual_element(&*txn, root, path)?;
            let children = inline_children(&*txn, &element);
            check_range(path, *offset, *len, inline_len(&children))?;
            let end = *offset + *len;
            // Back to front so removing an inline node keeps earlier indices valid.
            for child in children.iter().rev() {
                let from = child.start.max(*offset);
                let to = child.end().min(end);
                if from >= to {
                    continue;
                }
                match &child.text {
                    Some(target) => target.remove_range(txn, from - child.start, to - from),
                    None => element.remove_range(txn, child.index, 1),
                }
            }
            Ok(())
        }

        EditOp::Format {
            path,
            offset,
            len,
            mark,
            enabled,
        } => {
            let element = textual_element(&*txn, root, path)?;
            let children = inline_children(&*txn, &element);
            check_range(path, *offset, *len, inline_len(&children))?;
            let end = *offset + *len;
            let value = if *enabled { Any::Bool(true) } else { Any::Null };
            for child in &children {
                let Some(target) = &child.text else { continue };
                let from = child.start.max(*offset);
                let to = child.end().min(end);
                if from < to {
                    let attrs: Attrs = [(Arc::<str>::from(mark.name()), value.clone())].into_iter().collect();
                    target.format(txn, from - child.start, to - from, attrs);
                }
            }
            Ok(())
        }

        EditOp::SetAttribute { path, key, value } => {
            let element = resolve_element(&*txn, root, path)?;
            element.insert_attribute(txn, key.as_str(), json_to_any(value));
            Ok(())
        }
    }
}

fn insert_block<P: XmlFragment>(
    txn: &mut TransactionMut,
    parent: &P,
    parent_path: &NodePath,
    index: u32,
    node: &Node,
) -> Result<(), EditError> {
    let len = parent.len(&*txn);
    if index > len {
        return Err(EditError::OutOfRange {
            path: parent_path.clone(),
            index,
            len,
        });
    }
    write_children(txn, parent, index, std::slice::from_ref(node));
    Ok(())
}

fn check_range(path: &NodePath, offset: u32, len: u32, available: u32) -> Result<(), EditError> {
    match offset.checked_add(len) {
        Some(end) if end <= available => Ok(()),
        _ => Err(EditError::OutOfRange {
            path: path.clone(),
            index: offset.saturating_add(len),
            len: available,
        }),
    }
}

pub(crate) fn resolve_element<T: ReadTxn>(
    txn: &T,
    root: &XmlFragmentRef,
    path: &NodePath,
) -> Result<XmlElementRef, EditError> {
    let missing = || EditError::NoSuchNode(path.clone());
    let (first, rest) = path.0.split_first().ok_or_else(missing)?;
    let mut current = match root.get(txn, *first) {
        Some(XmlOut::Element(element)) => element,
        _ => return Err(missing()),
    };
    for index in rest {
        current = match current.get(txn, *index) {
            Some(XmlOut::Element(element)) => element,
            _ => return Err(missing()),
        };
    }
    Ok(current)
}

fn textual_element<T: ReadTxn>(
    txn: &T,
    root: &XmlFragmentRef,
    path: &NodePath,
) -> Result<XmlElementRef, EditError> {
    let element = resolve_element(txn, root, path)?;
    match NodeKind::from_tag(element.tag()) {
        Some(NodeKind::Paragraph | NodeKind::Heading | NodeKind::CodeBlock) => Ok(element),
        _ => Err(EditError::NotTextual {
            path: path.clone(),
            tag: element.tag().to_string(),
        }),
    }
}

/// One child of a textual element placed in the element's flat offset
/// space: text counts its UTF-16 length, any inline node (a hard break, an
/// inline image) counts one.
pub(crate) struct InlineChild {
    index: u32,
    start: u32,
    width: u32,
    text: Option<XmlTextRef>,
}

impl InlineChild {
    fn end(&self) -> u32 {
        self.start + self.width
    }
}

pub(crate) fn inline_children<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> Vec<InlineChild> {
    let mut start = 0;
    (0..element.len(txn))
        .filter_map(|index| {
            let text = match element.get(txn, index)? {
                XmlOut::Text(text) => Some(text),
                _ => None,
            };
            let width = text.as_ref().map_or(1, |text| text.len(txn));
            let child = InlineChild {
                index,
                start,
                width,
                text,
            };
            start += width;
            Some(child)
        })
        .collect()
}

pub(crate) fn inline_len(children: &[InlineChild]) -> u32 {
    children.last().map_or(0, InlineChild::end)
}

/// Formatting attributes for inserted text: requested marks on, every
/// other known mark explicitly off so nothing is inherited from neighbours.
pub(crate) fn mark_attrs(marks: &[Mark]) -> Attrs {
    Mark::ALL
        .iter()
        .map(|mark| {
            let value = if marks.contains(mark) {
                Any::Bool(true)
            } else {
                Any::Null
            };
            (Arc::<str>::from(mark.name()), value)
        })
        .collect()
}

/// Write `nodes` as children of `parent`, starting at `index`.
///
/// Adjacent text runs share one XML text node, matching how ProseMirror
/// bindings lay out inline content. Returns the index after the last
/// inserted child.
pub(crate) fn write_children<P: XmlFragment>(
    txn: &mut TransactionMut,
    parent: &P,
    mut index: u32,
    nodes: &[Node],
) -> u32 {
    let mut open_text: Option<XmlTextRef> = None;
    for node in nodes {
        if node.is_text() {
            let chunk = node.text.as_deref().unwrap_or_default();
            if chunk.is_empty() {
                continue;
            }
            let target = match &open_text {
                Some(target) => target.clone(),
                None => {
                    let target = parent.insert(txn, index, XmlTextPrelim::new(""));
                    index += 1;
                    open_text = Some(target.clone());
                    target
                }
            };
            let at = target.len(&*txn);
            target.insert_with_attributes(txn, at, chunk, mark_attrs(&node.marks));
        } else {
            open_text = None;
            let element = parent.insert(txn, index, XmlElementPrelim::empty(node.kind.tag()));
            index += 1;
            write_attributes(txn, &element, &node.attrs);
            write_children(txn, &element, 0, &node.content);
        }
    }
    index
}

fn write_attributes(txn: &mut TransactionMut, element: &XmlElementRef, attrs: &BTreeMap<String, Value>) {
    for (key, value) in attrs {
        element.insert_attribute(txn, key.as_str(), json_to_any(value));
    }
}

/// JSON attribute value to its replicated form. Numbers are stored as
/// doubles, the way JavaScript peers write them.
pub(crate) fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => Any::Number(n.as_f64().unwrap_or_default()),
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect(),
        )),
    }
}
