//! Benchmark: turn propagation throughput
//!
//! One input fans out to `n` derived nodes that all join into a single
//! effect. Graph construction happens once per size; each iteration measures
//! one full turn. Throughput elements are pulsed nodes (`n + 2`).
//!
//! The same graph is measured on the caller thread and on the rayon pool so
//! scheduling overhead can be compared against parallel speedup.
use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ripple_core::graph::{Node, NodeKind};
use ripple_core::propagation::{logic_fn, BasicEngine, Tick, TurnFlags};
use ripple_core::EngineConfig;

fn build_fanout(engine: &BasicEngine, width: usize) -> Arc<Node> {
    let input = engine.create_input();
    let sink = engine.create_node(NodeKind::Effect, logic_fn(|_| Ok(Tick::Changed)));
    for _ in 0..width {
        let mid = engine.create_node(
            NodeKind::Derived,
            logic_fn(|_| {
                // A little work so the pool has something to parallelize.
                black_box((0..64u64).fold(0u64, |acc, x| acc.wrapping_mul(31).wrapping_add(x)));
                Ok(Tick::Changed)
            }),
        );
        engine
            .on_node_attach(&mid, &input)
            .expect("fan-out edge is acyclic");
        engine
            .on_node_attach(&sink, &mid)
            .expect("join edge is acyclic");
    }
    input
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_turn");
    for &width in &[10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(width as u64 + 2));

        for (label, config) in [
            ("sequential", EngineConfig::default().sequential()),
            ("parallel", EngineConfig::default()),
        ] {
            let engine = BasicEngine::with_config(config).expect("engine builds");
            let input = build_fanout(&engine, width);
            group.bench_with_input(BenchmarkId::new(label, width), &width, |b, _| {
                b.iter(|| {
                    let stats = engine
                        .run_turn(TurnFlags::NONE, &[&input])
                        .expect("turn propagates");
                    black_box(stats)
                })
            });
        }
    }
    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_turn");
    for &depth in &[10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(depth as u64 + 1));

        let engine =
            BasicEngine::with_config(EngineConfig::default().sequential()).expect("engine builds");
        let input = engine.create_input();
        let mut tail = Arc::clone(&input);
        for _ in 0..depth {
            let next = engine.create_node(NodeKind::Derived, logic_fn(|_| Ok(Tick::Changed)));
            engine
                .on_node_attach(&next, &tail)
                .expect("chain edge is acyclic");
            tail = next;
        }

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                black_box(
                    engine
                        .run_turn(TurnFlags::NONE, &[&input])
                        .expect("turn propagates"),
                )
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fanout, bench_chain);
criterion_main!(benches);
