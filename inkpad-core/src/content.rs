//! Decoded document content: a ProseMirror-style tree of typed nodes.
//!
//! This is the human-readable form of the replicated state. It is what the
//! editing surface renders and what version snapshots capture:
//!
//! ```text
//! {"type":"doc","content":[
//!   {"type":"heading","attrs":{"level":1},"content":[
//!     {"type":"text","text":"Title","marks":[{"type":"bold"}]}]},
//!   {"type":"paragraph","content":[{"type":"text","text":"Body"}]}]}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node types understood by the editor schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Doc,
    Paragraph,
    Heading,
    BulletList,
    OrderedList,
    ListItem,
    Blockquote,
    CodeBlock,
    HorizontalRule,
    HardBreak,
    Image,
    Text,
}

impl NodeKind {
    /// Element tag used in the replicated XML tree.
    pub fn tag(self) -> &'static str {
        match self {
            NodeKind::Doc => "doc",
            NodeKind::Paragraph => "paragraph",
            NodeKind::Heading => "heading",
            NodeKind::BulletList => "bulletList",
            NodeKind::OrderedList => "orderedList",
            NodeKind::ListItem => "listItem",
            NodeKind::Blockquote => "blockquote",
            NodeKind::CodeBlock => "codeBlock",
            NodeKind::HorizontalRule => "horizontalRule",
            NodeKind::HardBreak => "hardBreak",
            NodeKind::Image => "image",
            NodeKind::Text => "text",
        }
    }

    /// Inverse of [`NodeKind::tag`]. `doc` and `text` never appear as
    /// element tags, so they are not accepted here.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "paragraph" => NodeKind::Paragraph,
            "heading" => NodeKind::Heading,
            "bulletList" => NodeKind::BulletList,
            "orderedList" => NodeKind::OrderedList,
            "listItem" => NodeKind::ListItem,
            "blockquote" => NodeKind::Blockquote,
            "codeBlock" => NodeKind::CodeBlock,
            "horizontalRule" => NodeKind::HorizontalRule,
            "hardBreak" => NodeKind::HardBreak,
            "image" => NodeKind::Image,
            _ => return None,
        };
        Some(kind)
    }
}

/// Inline formatting mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Mark {
    Bold,
    Italic,
    Strike,
    Code,
}

impl Mark {
    /// Every mark the schema knows, in canonical order.
    pub const ALL: [Mark; 4] = [Mark::Bold, Mark::Italic, Mark::Strike, Mark::Code];

    /// Formatting attribute name on replicated text.
    pub fn name(self) -> &'static str {
        match self {
            Mark::Bold => "bold",
            Mark::Italic => "italic",
            Mark::Strike => "strike",
            Mark::Code => "code",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bold" => Some(Mark::Bold),
            "italic" => Some(Mark::Italic),
            "strike" => Some(Mark::Strike),
            "code" => Some(Mark::Code),
            _ => None,
        }
    }
}

/// One node of the content tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Node>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
}

impl Node {
    /// Element node with children and no attributes.
    pub fn element(kind: NodeKind, content: Vec<Node>) -> Self {
        Self {
            kind,
            attrs: BTreeMap::new(),
            content,
            text: None,
            marks: Vec::new(),
        }
    }

    /// The root node.
    pub fn doc(content: Vec<Node>) -> Self {
        Self::element(NodeKind::Doc, content)
    }

    pub fn paragraph(content: Vec<Node>) -> Self {
        Self::element(NodeKind::Paragraph, content)
    }

    pub fn heading(level: u8, content: Vec<Node>) -> Self {
        Self::element(NodeKind::Heading, content).with_attr("level", level)
    }

    pub fn bullet_list(items: Vec<Node>) -> Self {
        Self::element(NodeKind::BulletList, items)
    }

    pub fn ordered_list(items: Vec<Node>) -> Self {
        Self::element(NodeKind::OrderedList, items)
    }

    pub fn list_item(content: Vec<Node>) -> Self {
        Self::element(NodeKind::ListItem, content)
    }

    /// Image node. Width and height default to the editor's image defaults.
    pub fn image(src: impl Into<String>) -> Self {
        Self::element(NodeKind::Image, Vec::new())
            .with_attr("src", src.into())
            .with_attr("width", "300px")
            .with_attr("height", "auto")
    }

    /// Plain text run.
    pub fn text(text: impl Into<String>) -> Self {
        Self::marked_text(text, Vec::new())
    }

    /// Text run carrying formatting marks.
    pub fn marked_text(text: impl Into<String>, mut marks: Vec<Mark>) -> Self {
        marks.sort();
        marks.dedup();
        Self {
            kind: NodeKind::Text,
            attrs: BTreeMap::new(),
            content: Vec::new(),
            text: Some(text.into()),
            marks,
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn is_text(&self) -> bool {
        self.kind == NodeKind::Text
    }

    /// Concatenated text of this subtree, blocks separated by newlines.
    pub fn plain_text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        let inline = self.content.iter().all(Node::is_text);
        let parts: Vec<String> = self.content.iter().map(Node::plain_text).collect();
        if inline {
            parts.concat()
        } else {
            parts.join("\n")
        }
    }

    /// Depth-first search for the first text run containing `needle`.
    pub fn find_text(&self, needle: &str) -> Option<&Node> {
        if self.text.as_deref().is_some_and(|t| t.contains(needle)) {
            return Some(self);
        }
        self.content.iter().find_map(|child| child.find_text(needle))
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::doc(Vec::new())
    }
}
