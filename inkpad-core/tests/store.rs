//! End-to-end properties of the replicated document store.

use std::sync::{Arc, Mutex};

use inkpad_core::{
    is_empty_update, DecodeError, EditOp, Mark, Node, NodeKind, NodePath, ReplicatedDocument, UpdateOrigin,
};

fn sample() -> ReplicatedDocument {
    let mut replica = ReplicatedDocument::new();
    replica
        .apply_local_edit(&EditOp::insert_block(0, Node::heading(1, vec![Node::text("Notes")])))
        .unwrap();
    replica
        .apply_local_edit(&EditOp::insert_block(
            1,
            Node::paragraph(vec![
                Node::text("plain "),
                Node::marked_text("strong", vec![Mark::Bold, Mark::Italic]),
            ]),
        ))
        .unwrap();
    replica
        .apply_local_edit(&EditOp::insert_block(2, Node::image("https://cdn.example/cat.png")))
        .unwrap();
    replica
}

#[test]
fn test_round_trip_preserves_content() {
    let replica = sample();
    let copy = ReplicatedDocument::initialize(&replica.encode_full_state()).unwrap();
    assert_eq!(copy.content(), replica.content());
    assert_eq!(copy.encode_full_state(), replica.encode_full_state());
    assert_eq!(copy.content().content[2], Node::image("https://cdn.example/cat.png"));
}

#[test]
fn test_content_json_matches_editor_shape() {
    let json = serde_json::to_value(sample().content()).unwrap();
    assert_eq!(json["type"], "doc");
    assert_eq!(json["content"][0]["attrs"]["level"], 1);
    assert_eq!(
        json["content"][1]["content"][1]["marks"],
        serde_json::json!([{"type": "bold"}, {"type": "italic"}])
    );
    assert_eq!(json["content"][2]["attrs"]["width"], "300px");
}

#[test]
fn test_remote_update_idempotent() {
    let source = sample();
    let state = source.encode_full_state();

    let mut target = ReplicatedDocument::new();
    target.apply_remote_update(&state).unwrap();
    let once = target.encode_full_state();
    assert_eq!(target.apply_remote_update(&state).unwrap(), None);
    assert_eq!(target.encode_full_state(), once);
    assert_eq!(target.content(), source.content());
}

#[test]
fn test_replace_then_encode_equivalent() {
    let restored = sample();
    let mut current = ReplicatedDocument::new();
    current
        .apply_local_edit(&EditOp::insert_block(0, Node::paragraph(vec![Node::text("draft")])))
        .unwrap();

    current
        .replace_with_full_state(&restored.encode_full_state())
        .unwrap();
    let reloaded = ReplicatedDocument::initialize(&current.encode_full_state()).unwrap();
    assert_eq!(reloaded.content(), restored.content());
}

#[test]
fn test_restore_delta_converges_peers() {
    let mut alice = sample();
    let mut bob = ReplicatedDocument::initialize(&alice.encode_full_state()).unwrap();

    let target = Node::doc(vec![Node::paragraph(vec![Node::text("v1")])]);
    let delta = alice.replace_with_content(&target);
    bob.apply_remote_update(&delta).unwrap();

    assert_eq!(bob.content(), target);
    assert_eq!(alice.content(), target);
}

#[test]
fn test_empty_seed() {
    let replica = ReplicatedDocument::initialize(&[]).unwrap();
    assert!(replica.is_fresh());
    assert_eq!(replica.content(), Node::doc(vec![]));

    let state = replica.encode_full_state();
    let copy = ReplicatedDocument::initialize(&state).unwrap();
    assert_eq!(copy.content(), Node::doc(vec![]));
}

#[test]
fn test_seeded_replica_is_not_fresh() {
    let replica = ReplicatedDocument::initialize(&sample().encode_full_state()).unwrap();
    assert!(!replica.is_fresh());
}

#[test]
fn test_malformed_delta_leaves_state_and_later_deltas_apply() {
    let mut source = ReplicatedDocument::new();
    let first = source
        .apply_local_edit(&EditOp::insert_block(0, Node::paragraph(vec![Node::text("a")])))
        .unwrap();

    let mut target = ReplicatedDocument::new();
    target.apply_remote_update(&first).unwrap();
    let before = target.encode_full_state();

    let err = target.apply_remote_update(&[0xFF, 0xFF, 0xFF]).unwrap_err();
    assert!(matches!(err, DecodeError::Malformed(_)));
    assert_eq!(target.encode_full_state(), before);

    let second = source
        .apply_local_edit(&EditOp::insert_text(NodePath::block(0), 1, "b"))
        .unwrap();
    target.apply_remote_update(&second).unwrap();
    assert_eq!(target.content(), source.content());
}

#[test]
fn test_utf16_offsets() {
    let mut replica = ReplicatedDocument::new();
    replica
        .apply_local_edit(&EditOp::insert_block(0, Node::paragraph(vec![Node::text("😀b")])))
        .unwrap();
    assert_eq!(replica.text_len(&NodePath::block(0)).unwrap(), 3);
    replica
        .apply_local_edit(&EditOp::insert_text(NodePath::block(0), 2, "a"))
        .unwrap();
    assert_eq!(replica.content().plain_text(), "😀ab");
}

fn hard_break() -> Node {
    Node::element(NodeKind::HardBreak, Vec::new())
}

#[test]
fn test_text_after_hard_break_is_editable() {
    let mut replica = ReplicatedDocument::new();
    replica
        .apply_local_edit(&EditOp::insert_block(
            0,
            Node::paragraph(vec![Node::text("ab"), hard_break(), Node::text("cd")]),
        ))
        .unwrap();
    let path = NodePath::block(0);
    // "ab" spans 0..2, the break 2..3, "cd" 3..5.
    assert_eq!(replica.text_len(&path).unwrap(), 5);

    replica.apply_local_edit(&EditOp::insert_text(path.clone(), 4, "X")).unwrap();
    replica
        .apply_local_edit(&EditOp::format(path.clone(), 3, 3, Mark::Italic, true))
        .unwrap();
    let content = replica.content();
    let block = &content.content[0];
    assert_eq!(block.content[1], hard_break());
    assert_eq!(block.content[2], Node::marked_text("cXd", vec![Mark::Italic]));
    assert_eq!(replica.text_len(&path).unwrap(), 6);

    // Across the break: "b", the break and "c".
    replica
        .apply_local_edit(&EditOp::DeleteText {
            path: path.clone(),
            offset: 1,
            len: 3,
        })
        .unwrap();
    assert_eq!(replica.text_len(&path).unwrap(), 3);
    assert_eq!(replica.content().plain_text(), "aXd");
    assert!(replica.content().content[0].content.iter().all(Node::is_text));

    let copy = ReplicatedDocument::initialize(&replica.encode_full_state()).unwrap();
    assert_eq!(copy.content(), replica.content());
}

#[test]
fn test_text_around_lone_inline_node() {
    let mut replica = ReplicatedDocument::new();
    replica
        .apply_local_edit(&EditOp::insert_block(0, Node::paragraph(vec![hard_break()])))
        .unwrap();
    let path = NodePath::block(0);
    replica.apply_local_edit(&EditOp::insert_text(path.clone(), 1, "after")).unwrap();
    replica.apply_local_edit(&EditOp::insert_text(path.clone(), 0, "before")).unwrap();

    let content = replica.content();
    assert_eq!(
        content.content[0].content,
        vec![Node::text("before"), hard_break(), Node::text("after")]
    );
    assert!(replica
        .apply_local_edit(&EditOp::insert_text(path, 13, "x"))
        .is_err());
}

#[test]
fn test_listener_sees_every_origin() {
    let mut replica = ReplicatedDocument::new();
    let origins: Arc<Mutex<Vec<UpdateOrigin>>> = Arc::default();
    let sink = origins.clone();
    let sub = replica.on_update(move |event| {
        assert!(!is_empty_update(event.update));
        sink.lock().unwrap().push(event.origin);
    });

    let peer = sample();
    replica.apply_remote_update(&peer.encode_full_state()).unwrap();
    replica
        .apply_local_edit(&EditOp::insert_text(NodePath::block(0), 0, "My "))
        .unwrap();
    replica.replace_with_content(&Node::doc(vec![]));
    assert_eq!(
        *origins.lock().unwrap(),
        vec![UpdateOrigin::Remote, UpdateOrigin::Local, UpdateOrigin::Restore]
    );

    drop(sub);
    assert_eq!(replica.listener_count(), 0);
}
