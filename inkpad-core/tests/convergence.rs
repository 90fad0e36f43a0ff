//! Convergence of replicas under arbitrary delivery order.
//!
//! Two writers edit concurrently; their deltas reach several receivers in
//! shuffled order. Every replica must end with the same content and the
//! same state vector.

use inkpad_core::{EditOp, Mark, Node, NodePath, ReplicatedDocument};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Action {
    NewParagraph(String),
    Type { block: usize, offset: usize, text: String },
    Bold { block: usize, offset: usize, len: usize },
    Delete { block: usize, offset: usize, len: usize },
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        "[a-z ]{1,6}".prop_map(Action::NewParagraph),
        (any::<usize>(), any::<usize>(), "[a-z]{1,4}")
            .prop_map(|(block, offset, text)| Action::Type { block, offset, text }),
        (any::<usize>(), any::<usize>(), 1usize..4)
            .prop_map(|(block, offset, len)| Action::Bold { block, offset, len }),
        (any::<usize>(), any::<usize>(), 1usize..3)
            .prop_map(|(block, offset, len)| Action::Delete { block, offset, len }),
    ]
}

/// Turn an abstract action into a valid edit against `replica`'s current
/// state, or `None` when there is nothing to target yet.
fn resolve(replica: &ReplicatedDocument, action: &Action) -> Option<EditOp> {
    let blocks = replica.block_count() as usize;
    if let Action::NewParagraph(text) = action {
        return Some(EditOp::insert_block(
            blocks as u32,
            Node::paragraph(vec![Node::text(text.clone())]),
        ));
    }
    if blocks == 0 {
        return None;
    }
    let pick = |block: usize| NodePath::block((block % blocks) as u32);
    match action {
        Action::NewParagraph(_) => None,
        Action::Type { block, offset, text } => {
            let path = pick(*block);
            let len = replica.text_len(&path).ok()? as usize;
            let offset = (offset % (len + 1)) as u32;
            Some(EditOp::insert_text(path, offset, text.clone()))
        }
        Action::Bold { block, offset, len } => {
            let path = pick(*block);
            let available = replica.text_len(&path).ok()? as usize;
            if available == 0 {
                return None;
            }
            let offset = offset % available;
            let len = (*len).min(available - offset);
            Some(EditOp::format(path, offset as u32, len as u32, Mark::Bold, true))
        }
        Action::Delete { block, offset, len } => {
            let path = pick(*block);
            let available = replica.text_len(&path).ok()? as usize;
            if available == 0 {
                return None;
            }
            let offset = offset % available;
            let len = (*len).min(available - offset);
            Some(EditOp::DeleteText {
                path,
                offset: offset as u32,
                len: len as u32,
            })
        }
    }
}

fn run(actions: &[Action]) -> (ReplicatedDocument, Vec<Vec<u8>>) {
    let mut replica = ReplicatedDocument::new();
    let mut deltas = Vec::new();
    for action in actions {
        if let Some(op) = resolve(&replica, action) {
            deltas.push(replica.apply_local_edit(&op).unwrap());
        }
    }
    (replica, deltas)
}

fn receive(deltas: &[Vec<u8>]) -> ReplicatedDocument {
    let mut replica = ReplicatedDocument::new();
    for delta in deltas {
        replica.apply_remote_update(delta).unwrap();
    }
    replica
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_replicas_converge_under_permutation(
        (ops_a, ops_b, order_1, order_2) in (
            prop::collection::vec(action(), 1..12),
            prop::collection::vec(action(), 1..12),
        ).prop_flat_map(|(a, b)| {
            let total = a.len() + b.len();
            let indices: Vec<usize> = (0..total).collect();
            (
                Just(a),
                Just(b),
                Just(indices.clone()).prop_shuffle(),
                Just(indices).prop_shuffle(),
            )
        })
    ) {
        let (mut writer_a, deltas_a) = run(&ops_a);
        let (mut writer_b, deltas_b) = run(&ops_b);
        let all: Vec<Vec<u8>> = deltas_a.iter().chain(deltas_b.iter()).cloned().collect();

        for delta in &deltas_b {
            writer_a.apply_remote_update(delta).unwrap();
        }
        for delta in &deltas_a {
            writer_b.apply_remote_update(delta).unwrap();
        }

        let pick = |order: &[usize]| -> Vec<Vec<u8>> {
            order.iter().filter_map(|i| all.get(*i).cloned()).collect()
        };
        let receiver_1 = receive(&pick(&order_1));
        let receiver_2 = receive(&pick(&order_2));

        let expected = writer_a.content();
        prop_assert_eq!(&writer_b.content(), &expected);
        prop_assert_eq!(&receiver_1.content(), &expected);
        prop_assert_eq!(&receiver_2.content(), &expected);
        prop_assert_eq!(receiver_1.state_vector(), writer_a.state_vector());
        prop_assert_eq!(receiver_2.state_vector(), writer_b.state_vector());
    }

    #[test]
    fn test_full_state_roundtrip(ops in prop::collection::vec(action(), 0..16)) {
        let (replica, _) = run(&ops);
        let copy = ReplicatedDocument::initialize(&replica.encode_full_state()).unwrap();
        prop_assert_eq!(copy.content(), replica.content());
        prop_assert_eq!(copy.state_vector(), replica.state_vector());
    }
}
