//! Change detection benchmarks
//!
//! Measures the write-path cost the engine adds to a field update:
//! - precheck/commit on a node holding no watching markers (fast path)
//! - precheck/commit with filtered field markers placed on the node
//! - a full write through `WriteTxn` including the flush
//!
//! Run with: cargo bench --bench change_detection

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};

use canopy_core::expression::Filter;
use canopy_core::graph::{Direction, MemoryGraph, NodeId};
use canopy_core::subscriptions::{
    EventSink, FieldList, MarkerEvent, MarkerFlags, MarkerId, MarkerSpec, SubscriptionEngine,
    SubscriptionId,
};
use canopy_core::write::WriteTxn;

/// Sink that drops every event.
struct NullSink;

impl EventSink for NullSink {
    fn publish(&mut self, _event: &MarkerEvent, _payload: Vec<u8>) {}
}

fn setup(markers: u64) -> (MemoryGraph, SubscriptionEngine, NodeId) {
    let mut graph = MemoryGraph::new();
    let node = NodeId::from("bench");
    graph.create_node(node);
    graph.set_field(&node, "score", json!(0)).unwrap();

    let mut engine = SubscriptionEngine::with_sink(NullSink);
    for i in 0..markers {
        let threshold = i as i64;
        let filter = Filter::from_fn(move |ctx| {
            Ok(ctx
                .node
                .field("score")
                .and_then(Value::as_i64)
                .map_or(false, |score| score > threshold))
        });
        let spec = MarkerSpec::new(MarkerId(i + 1), Direction::Node, [node])
            .flags(MarkerFlags::CH_HIERARCHY)
            .filter(filter)
            .fields(FieldList::new(["score"]));
        engine.upsert_marker(SubscriptionId(1), spec).unwrap();
        engine.refresh_marker(&mut graph, MarkerId(i + 1)).unwrap();
    }
    (graph, engine, node)
}

fn bench_fast_path(c: &mut Criterion) {
    let (mut graph, mut engine, node) = setup(0);

    c.bench_function("precheck_commit_unwatched", |b| {
        let mut score = 0i64;
        b.iter(|| {
            score += 1;
            let precheck = engine.field_change_precheck(&graph, &node);
            graph.set_field(&node, "score", json!(score)).unwrap();
            engine.defer_field_change_events(&graph, precheck, &["score"]);
            black_box(engine.send_deferred_events())
        });
    });
}

fn bench_filtered_markers(c: &mut Criterion) {
    let mut group = c.benchmark_group("precheck_commit_filtered");
    for markers in [1u64, 16, 128] {
        let (mut graph, mut engine, node) = setup(markers);
        group.bench_with_input(BenchmarkId::from_parameter(markers), &markers, |b, &markers| {
            let mut score = 0i64;
            b.iter(|| {
                score = (score + 7) % (markers as i64 * 2);
                let precheck = engine.field_change_precheck(&graph, &node);
                graph.set_field(&node, "score", json!(score)).unwrap();
                engine.defer_field_change_events(&graph, precheck, &["score"]);
                black_box(engine.send_deferred_events())
            });
        });
    }
    group.finish();
}

fn bench_write_txn(c: &mut Criterion) {
    let (mut graph, mut engine, node) = setup(16);

    c.bench_function("write_txn_set_field", |b| {
        let mut score = 0i64;
        b.iter(|| {
            score = (score + 1) % 32;
            let mut txn = WriteTxn::new(&mut graph, &mut engine);
            txn.set_field(&node, "score", json!(score)).unwrap();
            black_box(txn.commit())
        });
    });
}

criterion_group!(
    benches,
    bench_fast_path,
    bench_filtered_markers,
    bench_write_txn,
);
criterion_main!(benches);
