//! Packet codec benchmarks.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use tether_core::{DeviceId, Packet, frag};

fn sample(len: usize) -> Packet {
    let mut p = Packet::with_device(0x2F, DeviceId::from_bytes([0xAB; 16]));
    p.job = 0x0102;
    p.tags = vec![1, 2, 3];
    p.data = vec![0x5A; len];
    p
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode");
    for len in [64usize, 1024, 16 * 1024] {
        let p = sample(len);
        group.bench_function(format!("{len}b"), |b| {
            b.iter(|| black_box(p.encode().unwrap()));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");
    for len in [64usize, 1024, 16 * 1024] {
        let wire = sample(len).encode().unwrap();
        group.bench_function(format!("{len}b"), |b| {
            b.iter(|| black_box(Packet::decode(&wire).unwrap()));
        });
    }
    group.finish();
}

fn bench_fragment(c: &mut Criterion) {
    c.bench_function("fragment_64k_by_4k", |b| {
        b.iter(|| {
            let parts = frag::split(sample(64 * 1024), 4096).unwrap();
            black_box(parts.len())
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_fragment);
criterion_main!(benches);
