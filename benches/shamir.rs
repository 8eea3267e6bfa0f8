use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use sigmp::shamir;

fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("shamir split");
    for &(threshold, parts) in &[(2usize, 3usize), (3, 5)] {
        let frame = vec![0x5Au8; 1400];
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{threshold}-of-{parts}")),
            &frame,
            |b, frame| b.iter(|| shamir::split(black_box(frame), parts, threshold)),
        );
    }
    group.finish();
}

fn bench_combine(c: &mut Criterion) {
    let mut group = c.benchmark_group("shamir combine");
    for &(threshold, parts) in &[(2usize, 3usize), (3, 5)] {
        let frame = vec![0xA5u8; 1400];
        let shares = shamir::split(&frame, parts, threshold).unwrap();
        let subset: Vec<&[u8]> = shares[..threshold].iter().map(Vec::as_slice).collect();
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{threshold}-of-{parts}")),
            &subset,
            |b, subset| {
                let mut out = Vec::with_capacity(frame.len());
                b.iter(|| {
                    out.clear();
                    shamir::combine_into(black_box(subset), &mut out)
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_split, bench_combine);
criterion_main!(benches);
