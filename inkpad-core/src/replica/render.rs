//! Replicated XML to content tree.

use std::collections::BTreeMap;

use serde_json::Value;
use yrs::types::text::Diff;
use yrs::{Any, Out, ReadTxn, Text, Xml, XmlElementRef, XmlFragment, XmlFragmentRef, XmlOut, XmlTextRef};

use crate::content::{Mark, Node, NodeKind};

pub(crate) fn render_fragment<T: ReadTxn>(txn: &T, root: &XmlFragmentRef) -> Node {
    Node::doc(render_children(txn, root))
}

fn render_children<T: ReadTxn, P: XmlFragment>(txn: &T, parent: &P) -> Vec<Node> {
    let mut nodes = Vec::new();
    for index in 0..parent.len(txn) {
        match parent.get(txn, index) {
            Some(XmlOut::Element(element)) => {
                if let Some(node) = render_element(txn, &element) {
                    nodes.push(node);
                }
            }
            Some(XmlOut::Text(text)) => render_text(txn, &text, &mut nodes),
            Some(XmlOut::Fragment(fragment)) => nodes.extend(render_children(txn, &fragment)),
            None => {}
        }
    }
    nodes
}

fn render_element<T: ReadTxn>(txn: &T, element: &XmlElementRef) -> Option<Node> {
    let tag = element.tag();
    let Some(kind) = NodeKind::from_tag(tag) else {
        log::warn!("skipping element with unknown tag <{tag}>");
        return None;
    };
    let attrs: BTreeMap<String, Value> = element
        .attributes(txn)
        .map(|(key, value)| (key.to_string(), out_to_json(&value)))
        .collect();
    Some(Node {
        kind,
        attrs,
        content: render_children(txn, element),
        text: None,
        marks: Vec::new(),
    })
}

/// Push the text runs of `text`, merging neighbours with identical marks.
fn render_text<T: ReadTxn>(txn: &T, text: &XmlTextRef, out: &mut Vec<Node>) {
    let diffs: Vec<Diff<()>> = text.diff(txn, |_| ());
    for diff in diffs {
        let chunk = match &diff.insert {
            Out::Any(Any::String(s)) => s.to_string(),
            _ => continue,
        };
        if chunk.is_empty() {
            continue;
        }
        let mut marks: Vec<Mark> = diff
            .attributes
            .iter()
            .flat_map(|attrs| attrs.iter())
            .filter(|(_, value)| !matches!(value, Any::Null | Any::Undefined | Any::Bool(false)))
            .filter_map(|(name, _)| Mark::from_name(name))
            .collect();
        marks.sort();
        marks.dedup();

        match out.last_mut() {
            Some(prev) if prev.is_text() && prev.marks == marks => {
                prev.text.get_or_insert_with(String::new).push_str(&chunk);
            }
            _ => out.push(Node::marked_text(chunk, marks)),
        }
    }
}

fn out_to_json(value: &Out) -> Value {
    match value {
        Out::Any(any) => any_to_json(any),
        _ => Value::Null,
    }
}

/// Replicated scalar to JSON. Integral doubles come back as integers.
pub(crate) fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Value::from(*n as i64),
        Any::Number(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
        Any::BigInt(n) => Value::from(*n),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), any_to_json(value)))
                .collect(),
        ),
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}
