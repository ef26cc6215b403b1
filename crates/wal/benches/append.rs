use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use wal::{OpKind, WalWriter};

fn bench_append(c: &mut Criterion) {
    c.bench_function("wal_append_64b", |b| {
        b.iter_batched(
            || WalWriter::new(Box::new(Vec::<u8>::new())),
            |mut w| {
                for i in 0..256u64 {
                    let _ = w.append(i, i * 10, OpKind::Put, 0, b"bench-key", &[0x5a; 64]);
                }
                let _ = w.flush();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
