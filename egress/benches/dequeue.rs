#[macro_use]
extern crate criterion;
extern crate egress;

use criterion::black_box;
use criterion::Criterion;
use egress::{Category, ClientEgress, EgressConfig, InlineExecutor, ManualClock, OutgoingPacket, SendSink};
use rand::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;

struct NullSink;

impl SendSink for NullSink {
    fn send_packet_final(&self, packet: OutgoingPacket) {
        black_box(packet);
    }
}

fn endpoint() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

const CATEGORIES: [Category; 10] = [
    Category::Wind,
    Category::Cloud,
    Category::Land,
    Category::Texture,
    Category::Asset,
    Category::Task,
    Category::Transfer,
    Category::State,
    Category::AvatarInfo,
    Category::Resend,
];

fn dequeue_mixed_priorities(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new(0));
    let mut egress = ClientEgress::new(1, endpoint(), 42, EgressConfig::default(), Arc::clone(&clock), InlineExecutor, NullSink, None);

    // Fund every bucket generously so the bench measures queue/dispatch overhead rather than
    // perpetual back-pressure.
    let mut bytes = [0u8; 28];
    for chunk in bytes.chunks_mut(4) {
        chunk.copy_from_slice(&(1_000_000.0f32).to_le_bytes());
    }
    egress.set_throttles(bytes);
    clock.advance(10_000);

    let mut rng = thread_rng();

    c.bench_function("dequeue_outgoing mixed categories", move |b| {
        b.iter(|| {
            for _ in 0..100 {
                let category = CATEGORIES[rng.gen_range(0, CATEGORIES.len())];
                egress.enqueue_outgoing(OutgoingPacket::new(category, vec![0u8; 64])).unwrap();
            }
            clock.advance(100);
            black_box(egress.dequeue_outgoing(100));
        })
    });
}

fn dequeue_outband_only(c: &mut Criterion) {
    let clock = Arc::new(ManualClock::new(0));
    let mut egress = ClientEgress::new(1, endpoint(), 42, EgressConfig::default(), clock, InlineExecutor, NullSink, None);

    c.bench_function("dequeue_outgoing outband only", move |b| {
        b.iter(|| {
            for _ in 0..100 {
                egress.enqueue_outgoing(OutgoingPacket::new(Category::OutBand, vec![0u8; 64])).unwrap();
            }
            black_box(egress.dequeue_outgoing(100));
        })
    });
}

criterion_group!(benches, dequeue_mixed_priorities, dequeue_outband_only);
criterion_main!(benches);
