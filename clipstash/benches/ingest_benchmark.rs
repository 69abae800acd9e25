use clipstash::{ClipboardEngine, EngineConfig, ListFilters, MemoryKeystore, Selection};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

fn setup_engine(rt: &tokio::runtime::Runtime) -> (Arc<ClipboardEngine>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let engine = {
        let _guard = rt.enter();
        ClipboardEngine::open(EngineConfig::new(temp_dir.path()), Arc::new(MemoryKeystore::new()))
            .expect("Failed to open engine")
    };
    rt.block_on(engine.wait_until_ready());
    (engine, temp_dir)
}

fn bench_ingest(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (engine, _dir) = setup_engine(&rt);

    let mut group = c.benchmark_group("ingest");
    group.sample_size(50);

    let mut counter = 0u64;
    group.bench_function("new_text", |b| {
        b.iter_batched(
            || {
                counter += 1;
                Selection::text(format!("benchmark entry number {}", counter))
            },
            |selection| engine.ingest(selection).unwrap(),
            BatchSize::SmallInput,
        );
    });

    engine.ingest(Selection::text("hot duplicate")).unwrap();
    group.bench_function("bubble_up", |b| {
        b.iter(|| engine.ingest(Selection::text("hot duplicate")).unwrap());
    });

    let large = "lorem ipsum dolor sit amet ".repeat(40_000);
    group.bench_function("large_text_1mb", |b| {
        b.iter_batched(
            || {
                counter += 1;
                Selection::text(format!("{}{}", large, counter))
            },
            |selection| engine.ingest(selection).unwrap(),
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

fn bench_list(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (engine, _dir) = setup_engine(&rt);
    for i in 0..2_000 {
        engine.ingest(Selection::text(format!("history item {} about rust", i))).unwrap();
    }

    let mut group = c.benchmark_group("list");
    group.bench_function("first_page", |b| {
        b.iter(|| rt.block_on(engine.list_all(50, 0, ListFilters::default())).unwrap());
    });
    group.bench_function("query_page", |b| {
        b.iter(|| rt.block_on(engine.list_all(50, 0, ListFilters::query("rust 19"))).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_ingest, bench_list);
criterion_main!(benches);
