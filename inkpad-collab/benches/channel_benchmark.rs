use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use inkpad_collab::{BroadcastGroup, Frame, OfflineQueue};
use inkpad_core::{DocumentId, EditOp, Node, NodePath, Participant, ReplicatedDocument, Role};
use uuid::Uuid;

fn bench_frame_codec(c: &mut Criterion) {
    let frame = Frame::SendChanges {
        doc_id: DocumentId::from("doc"),
        update: vec![0u8; 64], // Typical small delta
    };
    let encoded = frame.encode().unwrap();

    c.bench_function("send_changes_encode_64B", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
    c.bench_function("send_changes_decode_64B", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_offline_compaction(c: &mut Criterion) {
    let mut source = ReplicatedDocument::new();
    let mut deltas = vec![source
        .apply_local_edit(&EditOp::insert_block(0, Node::paragraph(vec![Node::text("x")])))
        .unwrap()];
    for i in 1..1000u32 {
        deltas.push(
            source
                .apply_local_edit(&EditOp::insert_text(NodePath::block(0), i, "y"))
                .unwrap(),
        );
    }

    c.bench_function("offline_queue_compact_1K", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(usize::MAX);
            for delta in &deltas {
                queue.push(DocumentId::from("doc"), delta.clone());
            }
            queue.compact();
            black_box(queue.total_bytes());
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1K_frames_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = Arc::new(BroadcastGroup::new(2048));
                let mut receivers = Vec::with_capacity(100);
                for i in 0..100 {
                    let member = Participant::ephemeral(format!("peer-{i}"), Role::Editor);
                    receivers.push(group.add_member(Uuid::new_v4(), member).await);
                }
                let frame = Frame::ReceiveChanges {
                    doc_id: DocumentId::from("doc"),
                    update: vec![0u8; 64],
                };
                for _ in 0..1000 {
                    group.broadcast(Uuid::nil(), &frame).unwrap();
                }
                black_box(receivers.len());
            })
        })
    });
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_offline_compaction,
    bench_broadcast_fanout,
);
criterion_main!(benches);
