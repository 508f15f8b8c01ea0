// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use understory_cloud::{Bounds, Index, MemoryStorage, Point, PointBuffer, Schema, Structure};
use understory_cloud_build::{BuildConfig, Builder, OuterScope};

#[derive(Clone)]
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
    fn next_f64(&mut self) -> f64 {
        let v = self.next_u64() >> 11;
        (v as f64) / ((1u64 << 53) as f64)
    }
}

const EXTENT: f64 = 1000.0;
const HEIGHT: f64 = 50.0;

fn bounds() -> Bounds {
    Bounds::new(Point::new(0.0, 0.0, 0.0), Point::new(EXTENT, EXTENT, HEIGHT))
}

fn gen_points(schema: &Arc<Schema>, count: usize, seed: u64) -> PointBuffer {
    let mut rng = Rng::new(seed);
    let mut buf = PointBuffer::new(schema.clone());
    for _ in 0..count {
        buf.push(&[
            rng.next_f64() * EXTENT,
            rng.next_f64() * EXTENT,
            rng.next_f64() * HEIGHT,
        ]);
    }
    buf
}

fn new_index(schema: &Arc<Schema>) -> Index {
    Index::create(
        Arc::new(MemoryStorage::new()),
        "bench",
        bounds(),
        schema.clone(),
        Structure::new(4, 8, 16).unwrap(),
        None,
    )
    .unwrap()
}

fn bench_insert(c: &mut Criterion) {
    let schema = Arc::new(Schema::xyz([]));
    let mut group = c.benchmark_group("insert");
    for &n in &[10_000usize, 100_000] {
        let points = gen_points(&schema, n, 0xCAFE_F00D_DEAD_BEEF);
        group.throughput(Throughput::Elements(n as u64));

        group.bench_function(format!("index_n{}", n), |b| {
            b.iter_batched(
                || (new_index(&schema), points.clone()),
                |(index, mut points)| {
                    let stats = index.insert(&mut points, 0).unwrap();
                    black_box(stats);
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_function(format!("builder_4_threads_n{}", n), |b| {
            b.iter_batched(
                || {
                    let builder = Builder::from_index(
                        new_index(&schema),
                        BuildConfig {
                            threads: 4,
                            batch_size: 4096,
                            max_live_chunks: None,
                        },
                    )
                    .unwrap();
                    (builder, points.clone())
                },
                |(builder, mut points)| {
                    let stats = builder.insert(&mut points, 0).unwrap();
                    black_box(stats);
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let schema = Arc::new(Schema::xyz([]));
    let index = new_index(&schema);
    index
        .insert(&mut gen_points(&schema, 100_000, 0xBADC_F00D_1234_5678), 0)
        .unwrap();
    let window = Bounds::new_2d(200.0, 300.0, 450.0, 700.0);

    let mut group = c.benchmark_group("query");
    group.bench_function("depth_0_8_live", |b| {
        b.iter(|| black_box(index.query(0, 8).unwrap().len()));
    });
    group.bench_function("window_all_depths_live", |b| {
        b.iter(|| black_box(index.query_bounds(&window, 0, 17).unwrap().len()));
    });

    let scope = OuterScope::new(Arc::new(MemoryStorage::new()));
    let paged = Builder::new(
        &scope,
        "bench",
        bounds(),
        schema.clone(),
        Structure::new(4, 8, 16).unwrap(),
        None,
        BuildConfig {
            threads: 4,
            batch_size: 4096,
            max_live_chunks: Some(0),
        },
    )
    .unwrap();
    paged
        .insert(&mut gen_points(&schema, 100_000, 0xBADC_F00D_1234_5678), 0)
        .unwrap();
    group.bench_function("window_all_depths_paged", |b| {
        b.iter(|| {
            black_box(
                paged
                    .index()
                    .query_bounds(&window, 0, 17)
                    .unwrap()
                    .len(),
            )
        });
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_query);
criterion_main!(benches);
