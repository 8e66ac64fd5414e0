use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use pairpad_collab::autocomplete::suggest;
use pairpad_collab::protocol::{Envelope, RoomId};
use pairpad_collab::registry::{Channel, SessionRegistry};
use pairpad_collab::router::BroadcastRouter;
use pairpad_collab::storage::{RocksRoomStore, RoomStore, StoreConfig};

fn bench_code_update_encode(c: &mut Criterion) {
    let code = "def main():\n    print('hello')\n".repeat(64); // ~2KB buffer

    c.bench_function("code_update_encode_2KB", |b| {
        b.iter(|| {
            let envelope = Envelope::code_update(black_box(code.as_str()), 17);
            black_box(envelope.encode().unwrap());
        })
    });
}

fn bench_parse_inbound(c: &mut Criterion) {
    let text = Envelope::code_update("x = 1\n".repeat(300), 5)
        .encode()
        .unwrap()
        .to_string();

    c.bench_function("parse_inbound_code_update", |b| {
        b.iter(|| {
            black_box(Envelope::parse_inbound(black_box(&text)));
        })
    });
}

fn bench_fan_out_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    let router = BroadcastRouter::new(registry.clone());
    let room = RoomId::from("bench001");

    let mut receivers = rt.block_on(async {
        let mut receivers = Vec::new();
        for _ in 0..100 {
            let (channel, rx) = Channel::new(1024);
            registry.admit(room.clone(), channel).await;
            receivers.push(rx);
        }
        receivers
    });
    let envelope = Envelope::cursor_move(12);

    c.bench_function("broadcast_all_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                router.broadcast_all(black_box(&room), black_box(&envelope)).await;
            });
            // Drain so no queue fills up and gets evicted.
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_rocks_set_code(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksRoomStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let room = store.create("python").unwrap();
    let code = "for i in range(10):\n    print(i)\n".repeat(32);

    c.bench_function("rocks_set_code_1KB", |b| {
        b.iter(|| {
            store.set_code(black_box(&room.room_id), black_box(&code)).unwrap();
        })
    });
}

fn bench_suggest(c: &mut Criterion) {
    let code = "import numpy as np\n\nfor item in ";

    c.bench_function("suggest_python", |b| {
        b.iter(|| {
            black_box(suggest(black_box(code), code.len(), "python"));
        })
    });
}

criterion_group!(
    benches,
    bench_code_update_encode,
    bench_parse_inbound,
    bench_fan_out_100_members,
    bench_rocks_set_code,
    bench_suggest,
);
criterion_main!(benches);
