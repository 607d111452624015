//! Optimizer pipeline benchmark suite.
//!
//! Exercises the full optimize path (parse, analyze, rewrite to fixed
//! point) over three program shapes:
//! - a counting loop that collapses to a literal return
//! - an attribute-heavy loop that hoists its method lookup and groups
//! - a wide module of independent foldable assignments
//!
//! Run with:
//!   cargo bench --bench pipeline

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use itertools::Itertools;
use treeopt::{optimize, parse_program, run_program, Config};

/// Counting loop over `range(n)`.
fn sum_loop(n: usize) -> String {
    format!(
        "(block (assign s 0) (for i (call range {}) (block (assign s (binop + s i)))) (return s))",
        n
    )
}

/// Loop calling through one attribute lookup per iteration.
fn attribute_loop(n: usize) -> String {
    format!(
        r#"(block (defn work () (block (assign t 1))) (assign obj (call object)) (call setattr obj "cleanup" work) (for i (call range {}) (block (call (attr obj cleanup)))))"#,
        n
    )
}

/// Independent foldable assignments, most of them dead.
fn wide_module(k: usize) -> String {
    let stmts = (0..k)
        .map(|j| format!("(assign x{} (binop * {} {}))", j, j, j))
        .join(" ");
    format!("(block {} (call print x0))", stmts)
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.measurement_time(Duration::from_secs(5));

    let src = wide_module(200);
    group.bench_function("wide_module_200", |b| {
        b.iter(|| black_box(parse_program(&src).unwrap()));
    });

    group.finish();
}

fn bench_optimize(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimize");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(60);

    let config = Config::default();
    for (name, src) in [
        ("sum_loop_10", sum_loop(10)),
        ("sum_loop_1000", sum_loop(1000)),
        ("attribute_loop_100", attribute_loop(100)),
        ("wide_module_200", wide_module(200)),
    ] {
        let tree = parse_program(&src).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| black_box(optimize(tree.clone(), &config).unwrap()));
        });
    }

    group.finish();
}

/// Source tree against its optimized form under the reference
/// interpreter, the comparison `--check` mode runs once per file.
fn bench_interpret(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpret");
    group.measurement_time(Duration::from_secs(10));

    let source = parse_program(&sum_loop(1000)).unwrap();
    let optimized = optimize(source.clone(), &Config::default()).unwrap().tree;

    group.bench_function("sum_loop_1000_source", |b| {
        b.iter(|| black_box(run_program(&source, 1_000_000).unwrap()));
    });
    group.bench_function("sum_loop_1000_optimized", |b| {
        b.iter(|| black_box(run_program(&optimized, 1_000_000).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_optimize, bench_interpret);
criterion_main!(benches);
