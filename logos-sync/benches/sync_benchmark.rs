use criterion::{criterion_group, criterion_main, Criterion};
use logos_sync::awareness::{Awareness, AwarenessUpdate, PresenceState, PresenceUser};
use logos_sync::encoding::{Decoder, Encoder};
use logos_sync::protocol::{Message, SyncMessage};
use logos_sync::{sync, DocRegistry};
use std::hint::black_box;
use std::time::Instant;
use uuid::Uuid;
use yrs::{Doc, Text, Transact};

fn typing_updates(count: u32) -> Vec<Vec<u8>> {
    let doc = Doc::with_client_id(1);
    let text = doc.get_or_insert_text("content");
    (0..count)
        .map(|i| {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, i, "x");
            txn.encode_update_v1()
        })
        .collect()
}

fn bench_varint(c: &mut Criterion) {
    c.bench_function("varint_encode_decode_1K", |b| {
        b.iter(|| {
            let mut enc = Encoder::with_capacity(4096);
            for i in 0..1000u64 {
                enc.write_var_u64(black_box(i * 7919));
            }
            let bytes = enc.into_vec();
            let mut dec = Decoder::new(&bytes);
            while dec.has_remaining() {
                black_box(dec.read_var_u64().unwrap());
            }
        })
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let frame = Message::Sync(SyncMessage::Update(vec![0u8; 64])).encode();

    c.bench_function("update_frame_decode_64B", |b| {
        b.iter(|| black_box(Message::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_apply_typing(c: &mut Criterion) {
    let updates = typing_updates(500);

    c.bench_function("apply_500_keystrokes", |b| {
        b.iter(|| {
            let doc = Doc::new();
            for update in &updates {
                black_box(sync::apply_update(&doc, update).unwrap());
            }
        })
    });
}

fn bench_step2_diff(c: &mut Criterion) {
    let doc = Doc::new();
    for update in typing_updates(2000) {
        sync::apply_update(&doc, &update).unwrap();
    }
    let empty_sv = sync::state_vector(&Doc::new());

    c.bench_function("step2_diff_2K_chars", |b| {
        b.iter(|| black_box(sync::encode_diff(&doc, black_box(&empty_sv)).unwrap()))
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let mut update = AwarenessUpdate::new();
    for id in 0..100 {
        update.push(
            id,
            1,
            Some(PresenceState::with_user(PresenceUser::new(format!("Peer{id}"), "#30bced"))),
        );
    }
    let blob = update.encode();

    c.bench_function("awareness_apply_100_clients", |b| {
        b.iter(|| {
            let mut awareness = Awareness::new();
            let decoded = AwarenessUpdate::decode(black_box(&blob)).unwrap();
            black_box(awareness.apply_update(&decoded, Instant::now()));
        })
    });
}

fn bench_room_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let updates = typing_updates(100);

    c.bench_function("room_relay_100_updates_50_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                // Fresh room each round so every update is new.
                let registry = DocRegistry::default();
                let sender = Uuid::new_v4();
                let (room, _joined) = registry.join("bench", sender).await.unwrap();
                let mut receivers = Vec::with_capacity(50);
                for _ in 0..50 {
                    let (_, joined) = registry.join("bench", Uuid::new_v4()).await.unwrap();
                    receivers.push(joined.events);
                }
                for update in &updates {
                    let msg = SyncMessage::Update(update.clone());
                    black_box(room.handle_sync(sender, &msg).await.unwrap());
                }
                black_box(receivers.len());
            })
        })
    });
}

criterion_group!(
    benches,
    bench_varint,
    bench_message_decode,
    bench_apply_typing,
    bench_step2_diff,
    bench_awareness_apply,
    bench_room_fan_out,
);
criterion_main!(benches);
