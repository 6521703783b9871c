//! Performance benchmarks for shelf-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use shelf_engine::{
    diff, ConflictDetector, DiffOptions, Record, RecordSet, ResolutionContext, ResolutionEngine,
    ReconcileConfig, StrategyStats,
};
use std::sync::atomic::AtomicBool;

/// Build a source/target pair where a quarter of the records is added or
/// deleted and half of the shared ones disagree on progress or title.
fn create_library_pair(size: usize) -> (RecordSet, RecordSet) {
    let source = (0..size)
        .map(|i| {
            Record::new(format!("book_{}", i), format!("Title {}", i))
                .with_progress((i % 100) as f64)
                .with_last_updated(1_700_000_000_000 + i as u64)
                .with_authors([format!("Author {}", i % 17)])
        })
        .collect();

    let target = (size / 4..size + size / 4)
        .map(|i| {
            let title = if i % 3 == 0 {
                format!("Renamed Book {}", i)
            } else {
                format!("Title {}", i)
            };
            let progress = if i % 2 == 0 { (i % 100) as f64 } else { ((i + 40) % 100) as f64 };
            Record::new(format!("book_{}", i), title)
                .with_progress(progress)
                .with_last_updated(1_700_000_000_000 + i as u64 + 30_000)
                .with_authors([format!("Author {}", i % 17)])
        })
        .collect();

    (source, target)
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    let options = DiffOptions::default();

    for size in [100, 1000, 10_000].iter() {
        let (source, target) = create_library_pair(*size);
        group.bench_with_input(BenchmarkId::new("diff_sets", size), size, |b, _| {
            b.iter(|| diff(black_box(&source), black_box(&target), &options))
        });
    }

    group.bench_function("case_insensitive_diff_1000", |b| {
        let (source, target) = create_library_pair(1000);
        let options = DiffOptions {
            case_sensitive: false,
            ..Default::default()
        };
        b.iter(|| diff(black_box(&source), black_box(&target), &options))
    });

    group.finish();
}

fn bench_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("detection");
    let detector = ConflictDetector::default();

    for size in [100, 1000, 5000].iter() {
        let (source, target) = create_library_pair(*size);
        let result = diff(&source, &target, &DiffOptions::default());
        group.bench_with_input(BenchmarkId::new("detect_all", size), size, |b, _| {
            b.iter(|| detector.detect_all(black_box(&result)))
        });
    }

    group.finish();
}

fn bench_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolution");
    let config = ReconcileConfig::default();
    let engine = ResolutionEngine::new(&config, StrategyStats::new_shared());
    let context = ResolutionContext::new("kindle", "kobo");
    let cancelled = AtomicBool::new(false);

    for size in [100, 1000].iter() {
        let (source, target) = create_library_pair(*size);
        let result = diff(&source, &target, &DiffOptions::default());
        let conflicts = ConflictDetector::from_config(&config).detect_all(&result);
        group.bench_with_input(BenchmarkId::new("batch_auto_resolve", size), size, |b, _| {
            b.iter(|| {
                engine.execute_batch_resolution(black_box(&conflicts), None, &context, &cancelled)
            })
        });
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    let raw: Vec<_> = (0..1000)
        .map(|i| json!({"id": format!("book_{}", i), "title": format!("Title {}", i), "progress": i % 100}))
        .collect();

    group.bench_function("parse_capture_1000", |b| {
        b.iter(|| RecordSet::from_json_values(black_box(raw.clone())))
    });

    let (source, target) = create_library_pair(1000);
    let result = diff(&source, &target, &DiffOptions::default());
    group.bench_function("serialize_diff_1000", |b| {
        b.iter(|| serde_json::to_string(black_box(&result)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_diff,
    bench_detection,
    bench_resolution,
    bench_serialization,
);
criterion_main!(benches);
