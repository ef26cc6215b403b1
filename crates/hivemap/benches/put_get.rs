use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use hivemap::BucketMap;
use hivemap_core::config::MapConfig;
use hivemap_core::value::ValueKind;

fn bench_put(c: &mut Criterion) {
    c.bench_function("map_put_64b", |b| {
        b.iter_batched(
            || BucketMap::new(&MapConfig { initial_bucket_capacity: 4096, ..MapConfig::default() }),
            |mut map| {
                for i in 0..256u32 {
                    let key = format!("bench-key-{i}");
                    map.put(key.as_bytes(), &[0x5a; 64], ValueKind::Opaque).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_get(c: &mut Criterion) {
    c.bench_function("map_get_64b", |b| {
        b.iter_batched(
            || {
                let mut map = BucketMap::new(&MapConfig {
                    initial_bucket_capacity: 4096,
                    ..MapConfig::default()
                });
                for i in 0..256u32 {
                    let key = format!("bench-key-{i}");
                    map.put(key.as_bytes(), &[0x5a; 64], ValueKind::Opaque).unwrap();
                }
                map
            },
            |mut map| {
                for i in 0..256u32 {
                    let key = format!("bench-key-{i}");
                    let _ = map.get(key.as_bytes()).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
