use criterion::{criterion_group, criterion_main, Criterion};
use logos_realtime::event_bus::{Event, EventBus};
use logos_realtime::message::Message;
use logos_realtime::presence::{PresenceConfig, PresenceRecord, PresenceStatus, PresenceTracker};
use logos_realtime::protocol::SyncMessage;
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Tick,
}

struct Tick(u64);

impl Event for Tick {
    type Kind = Kind;

    fn kind(&self) -> Kind {
        Kind::Tick
    }
}

fn bench_bus_fanout(c: &mut Criterion) {
    let bus = EventBus::<Tick>::new();
    let total = Arc::new(AtomicU64::new(0));
    for _ in 0..10 {
        let total = total.clone();
        bus.on(Kind::Tick, move |tick| {
            total.fetch_add(tick.0, Ordering::Relaxed);
        });
    }

    c.bench_function("bus_emit_10_listeners", |b| {
        b.iter(|| black_box(bus.emit(black_box(&Tick(1)))))
    });
}

fn bench_message_encode(c: &mut Criterion) {
    let msg = Message::chat("The quick brown fox jumps over the lazy dog")
        .with_room("general")
        .prepared();

    c.bench_function("message_encode_chat", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let record = PresenceRecord::new("user-1", PresenceStatus::Online, "ws-1");
    let text = Message::presence(record).prepared().encode().unwrap();

    c.bench_function("message_decode_presence", |b| {
        b.iter(|| black_box(Message::decode(black_box(&text)).unwrap()))
    });
}

fn bench_presence_sweep(c: &mut Criterion) {
    let tracker = PresenceTracker::new("local", "ws-1", PresenceConfig::default());
    for i in 0..1_000 {
        let mut record = PresenceRecord::new(format!("user-{i}"), PresenceStatus::Online, "ws-1");
        // Half of the table is long stale.
        if i % 2 == 0 {
            record.last_seen = 0;
        }
        tracker.update_presence(&record.user_id.clone(), record);
    }

    c.bench_function("presence_sweep_1k", |b| {
        b.iter(|| black_box(tracker.sweep_inactive()))
    });
}

fn bench_sync_frame(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let delta = vec![0u8; 64];

    c.bench_function("sync_delta_roundtrip_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(peer, "doc-bench", 1, black_box(delta.clone()));
            let encoded = msg.encode().unwrap();
            black_box(SyncMessage::decode(&encoded).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_bus_fanout,
    bench_message_encode,
    bench_message_decode,
    bench_presence_sweep,
    bench_sync_frame,
);
criterion_main!(benches);
