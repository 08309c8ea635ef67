#![forbid(unsafe_code)]

use std::sync::Arc;

use aqueduct::query::expr::{CompareOp, Expression};
use aqueduct::query::metadata::{CollectionInfo, IndexDescriptor, IndexKind, MetadataSnapshot};
use aqueduct::query::optimizer::Optimizer;
use aqueduct::storage::InMemoryStorage;
use aqueduct::{EngineConfig, Executor, Plan, PlanBuilder, QueryOptions};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;

const DOC_COUNT: usize = 20_000;
const VALUE_DOMAIN: i64 = 5_000;

fn collection(shards: u32) -> CollectionInfo {
    CollectionInfo::new("docs", DOC_COUNT as u64)
        .with_shards(shards, &[])
        .with_index(IndexDescriptor::new("by_value", IndexKind::Sorted, &["value"]))
        .with_index(IndexDescriptor::new("by_group", IndexKind::Hash, &["group"]))
}

fn storage(shards: u32) -> InMemoryStorage {
    let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);
    let docs = (0..DOC_COUNT)
        .map(|i| {
            json!({
                "_key": format!("d{i:06}"),
                "value": rng.gen_range(0..VALUE_DOMAIN),
                "group": rng.gen_range(0..64),
                "payload": "x".repeat(32),
            })
        })
        .collect();
    InMemoryStorage::builder()
        .collection(collection(shards), docs)
        .build()
        .expect("storage")
}

/// Filter on two attributes, sort by one of them and take a page.
fn page_query(offset: u64) -> Plan {
    let mut b = PlanBuilder::new();
    let d = b.for_collection("docs", "d");
    b.filter_expr(Expression::and(
        Expression::compare(
            CompareOp::Eq,
            Expression::attribute(d, "group"),
            Expression::value(json!(7)),
        ),
        Expression::compare(
            CompareOp::Gt,
            Expression::attribute(d, "value"),
            Expression::value(json!(1000)),
        ),
    ));
    b.sort_by(Expression::attribute(d, "value"), true);
    b.limit(offset, 20);
    b.return_var(d);
    b.build().expect("plan")
}

fn optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer");
    let config = EngineConfig::default();
    let snapshot = MetadataSnapshot::from_collections([collection(1)]);
    let plan = page_query(40);
    group.throughput(Throughput::Elements(1));
    group.bench_function("page_query", |b| {
        let optimizer = Optimizer::new(&config, &snapshot);
        b.iter(|| black_box(optimizer.optimize(&plan).expect("optimize")));
    });

    let mut cluster = EngineConfig::default();
    cluster.optimizer.cluster = true;
    let sharded = MetadataSnapshot::from_collections([collection(4)]);
    group.bench_function("page_query_cluster", |b| {
        let optimizer = Optimizer::new(&cluster, &sharded);
        b.iter(|| black_box(optimizer.optimize(&plan).expect("optimize")));
    });
    group.finish();
}

fn execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute");
    group.sample_size(30);
    let plan = page_query(100);
    group.throughput(Throughput::Elements(20));

    let local = Executor::new(Arc::new(storage(1)), EngineConfig::default());
    group.bench_function("page_query", |b| {
        b.iter(|| black_box(local.execute(&plan, QueryOptions::default()).expect("run")));
    });
    group.bench_function("page_query_unoptimized", |b| {
        let options = QueryOptions::default().with_optimize(false);
        b.iter(|| black_box(local.execute(&plan, options.clone()).expect("run")));
    });

    let mut config = EngineConfig::default();
    config.optimizer.cluster = true;
    let cluster = Executor::new(Arc::new(storage(4)), config);
    group.bench_function("page_query_cluster", |b| {
        b.iter(|| black_box(cluster.execute(&plan, QueryOptions::default()).expect("run")));
    });
    group.finish();
}

criterion_group!(benches, optimize, execute);
criterion_main!(benches);
