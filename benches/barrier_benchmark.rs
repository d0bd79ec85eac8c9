use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sealvault::barrier::Barrier;
use sealvault::generate_root_key;
use sealvault::storage::InmemBackend;

fn benchmark_barrier(c: &mut Criterion) {
    let mut group = c.benchmark_group("barrier");

    // Setup an unsealed barrier once
    let root = generate_root_key().unwrap();
    let barrier = Barrier::new(Arc::new(InmemBackend::new()));
    barrier.initialize(&root, Vec::new(), Vec::new()).unwrap();
    barrier.unseal(root).unwrap();

    let sizes = [("100B", 100), ("1KB", 1024), ("64KB", 64 * 1024)];

    for (name, size) in sizes {
        let payload = vec![0xABu8; size];
        let path = format!("bench/{}", name);
        barrier.put(&path, &payload).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("put", name), &payload, |b, payload| {
            b.iter(|| barrier.put(black_box(&path), black_box(payload)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("get", name), &path, |b, path| {
            b.iter(|| barrier.get(black_box(path)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_barrier);
criterion_main!(benches);
