//! Benchmarks for Den ingestion and traversal.
//!
//! Run with: cargo bench --package alopex-den
//!
//! ## Benchmark Categories
//!
//! - **Ingestion**: memory-only and archived frame acceptance
//! - **Traversal**: full, windowed and newest-sample queries
//! - **Registration**: aggregate registration after ingestion

use alopex_den::{
    ArchiveMode, ChannelSample, Frame, PartitionRouter, Request, RouterConfig, TierLimits,
    TimeSelector,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

const CHANNELS: [&str; 4] = [
    "plant/boiler/temp",
    "plant/boiler/flow",
    "plant/pump/rpm",
    "plant/pump/current",
];

/// Generate a frame carrying every channel at `time`.
fn generate_frame(time: f64) -> Frame {
    Frame::new(
        CHANNELS
            .iter()
            .map(|c| ChannelSample::float64(*c, time, (time * 0.1).sin()))
            .collect(),
    )
}

fn filled_router(frames: usize) -> PartitionRouter {
    let router =
        PartitionRouter::open(RouterConfig::default().with_cache(TierLimits::frames(frames)))
            .unwrap();
    for i in 0..frames {
        router.accept_frame(generate_frame(i as f64)).unwrap();
    }
    router
}

fn bench_ingest_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_memory");
    for size in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let router = PartitionRouter::open(
                    RouterConfig::default().with_cache(TierLimits::frames(1000)),
                )
                .unwrap();
                for i in 0..size {
                    router.accept_frame(black_box(generate_frame(i as f64))).unwrap();
                }
            })
        });
    }
    group.finish();
}

fn bench_ingest_archived(c: &mut Criterion) {
    c.bench_function("ingest_archived_5k", |b| {
        b.iter(|| {
            let temp_dir = TempDir::new().unwrap();
            let router = PartitionRouter::open(
                RouterConfig::default()
                    .with_archive_root(temp_dir.path().join("den"), ArchiveMode::Create)
                    .with_cache(TierLimits::frames(500))
                    .with_archive(TierLimits::frames(50_000)),
            )
            .unwrap();
            for i in 0..5_000 {
                router.accept_frame(generate_frame(i as f64)).unwrap();
            }
            router.close().unwrap();
        })
    });
}

fn bench_traverse(c: &mut Criterion) {
    let router = filled_router(10_000);

    c.bench_function("traverse_all_10k", |b| {
        b.iter(|| router.traverse(black_box(&Request::all("plant/..."))).unwrap())
    });

    let windowed = Request::new(
        "plant/boiler/*",
        TimeSelector::Absolute {
            start: 4_000.0,
            duration: 500.0,
        },
    );
    c.bench_function("traverse_window_10k", |b| {
        b.iter(|| router.traverse(black_box(&windowed)).unwrap())
    });

    let newest = Request::new("plant/...", TimeSelector::Newest { duration: 0.0 });
    c.bench_function("traverse_newest_10k", |b| {
        b.iter(|| router.traverse(black_box(&newest)).unwrap())
    });
}

fn bench_registration(c: &mut Criterion) {
    let router = filled_router(10_000);
    let mut time = 10_000.0;

    c.bench_function("registration_after_frame", |b| {
        b.iter(|| {
            router.accept_frame(generate_frame(time)).unwrap();
            time += 1.0;
            router.registration(black_box("plant/...")).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_ingest_memory,
    bench_ingest_archived,
    bench_traverse,
    bench_registration
);
criterion_main!(benches);
