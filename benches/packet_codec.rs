//! Performance benchmarks for the per-packet hot path.
//!
//! Run with: `cargo bench`
//!
//! Performance targets:
//! - Header view parse: <50ns
//! - Client pool lookup: <100ns
//! - Static route lookup: <200ns with 256 prefixes

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ipnet::Ipv4Net;
use overlay_router::nexthop::{ClientPool, NextHopTable};
use overlay_router::packet::{Field, Ipv4View, LegacyFrame, Packet};

// ============================================================================
// Helper Functions
// ============================================================================

fn udp_packet(payload_len: usize) -> Vec<u8> {
    Packet::udp(
        Ipv4Addr::new(7, 0, 0, 2),
        Ipv4Addr::new(10, 0, 0, 5),
        40000,
        8080,
        vec![0xAB; payload_len],
    )
    .serialize()
    .expect("valid packet")
}

fn endpoint(i: u32) -> SocketAddr {
    SocketAddr::from(([203, 0, 113, (i % 250) as u8 + 1], 32000))
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_view(c: &mut Criterion) {
    let mut group = c.benchmark_group("ipv4_view");
    for size in [64usize, 512, 1372] {
        let packet = udp_packet(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &packet, |b, packet| {
            b.iter(|| {
                let view = Ipv4View::new(black_box(packet)).expect("valid packet");
                black_box((view.source(), view.destination()))
            });
        });
    }
    group.finish();
}

fn bench_rewrite(c: &mut Criterion) {
    let packet = udp_packet(512);
    c.bench_function("packet_rewrite_destination", |b| {
        b.iter(|| {
            let mut parsed = Packet::parse(black_box(&packet)).expect("valid packet");
            parsed
                .mutate(Field::Destination(Ipv4Addr::new(10, 0, 0, 6)))
                .expect("valid field");
            black_box(parsed.serialize().expect("valid packet"))
        });
    });
}

fn bench_legacy(c: &mut Criterion) {
    let frame = LegacyFrame {
        version: 1,
        ip_version: 0,
        kind: 0,
        source: SocketAddrV4::new(Ipv4Addr::new(7, 0, 0, 2), 40000),
        destination: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 8080),
        data: vec![0xCD; 512],
    };
    let encoded = frame.encode().expect("valid frame");
    c.bench_function("legacy_decode", |b| {
        b.iter(|| black_box(LegacyFrame::decode(black_box(&encoded)).expect("valid frame")));
    });
}

fn bench_next_hop(c: &mut Criterion) {
    let pool = ClientPool::new(4096);
    for i in 0..4096u32 {
        pool.learn(Ipv4Addr::from(0x0700_0000 + i), endpoint(i));
    }
    c.bench_function("client_pool_get", |b| {
        b.iter(|| black_box(pool.get(black_box(Ipv4Addr::new(7, 0, 8, 1)))));
    });

    let table = NextHopTable::new();
    for i in 0..256u32 {
        let net = Ipv4Net::new(Ipv4Addr::from(0x0A00_0000 + (i << 8)), 24).expect("valid prefix");
        table.set_route(net, endpoint(i));
    }
    c.bench_function("route_table_lookup", |b| {
        b.iter(|| black_box(table.lookup(black_box(Ipv4Addr::new(10, 0, 200, 9)))));
    });
}

criterion_group!(benches, bench_view, bench_rewrite, bench_legacy, bench_next_hop);
criterion_main!(benches);
