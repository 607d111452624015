//! End-to-end pipeline runs over whole programs.
//!
//! Each test drives `optimize` through the public API and checks the
//! final tree together with the trajectory the stats and the rewrite
//! log report: which passes fired, how many iterations the driver
//! needed, and which rewrites were declined on the way.

mod common;

use treeopt::{optimize, Config, RewriteLog, Value};

use common::{run, tree};

fn has_skip(log: &RewriteLog, needle: &str) -> bool {
    log.records()
        .iter()
        .map(|r| r.to_string())
        .any(|line| line.contains("skip") && line.contains(needle))
}

#[test]
fn test_counting_loop_collapses_to_literal_return() {
    let source =
        "(block (assign s 0) (for i (call range 2 8) (block (assign s (binop + s i)))) (return s))";
    let result = optimize(tree(source), &Config::default()).unwrap();

    assert_eq!(result.tree.to_string(), "(block (return 27))");
    assert!(!result.budget_exceeded);

    // The loop is grouped first, then the grouped residue expands fully,
    // and folding plus elimination erase everything but the answer.
    assert_eq!(result.stats.loops_unrolled, 2);
    assert_eq!(result.stats.hoisted, 0);
    assert!(result.stats.folded > 0, "folding drives the collapse");
    assert!(result.stats.eliminated > 0, "literal assigns become dead");
    assert_eq!(result.stats.iterations, 4);
}

#[test]
fn test_single_return_call_inlines_and_folds() {
    let source = r#"(block (defn is_py (s) (block (return (call (attr s startswith) "python")))) (return (call is_py "python2.7")))"#;
    let result = optimize(tree(source), &Config::default()).unwrap();

    // The definition itself stays: elimination only removes assignments.
    assert_eq!(
        result.tree.to_string(),
        r#"(block (defn is_py (s) (block (return (call (attr s startswith) "python")))) (return true))"#
    );
    assert_eq!(result.stats.inlined, 1);
    assert_eq!(result.stats.folded, 1);
    assert_eq!(result.stats.iterations, 3);

    // The spliced call carries fresh nodes the current fact base knows
    // nothing about, so folding has to wait for the next iteration.
    assert!(has_skip(&result.log, "purity of the expression cannot be proven"));
}

#[test]
fn test_conflicting_definitions_block_inlining() {
    let source = "(block (defn f () (block (return 1))) (defn f () (block (return 2))) (call print (call f)))";
    let result = optimize(tree(source), &Config::default()).unwrap();

    assert_eq!(result.tree.to_string(), source);
    assert_eq!(result.stats.applied(), 0);
    assert_eq!(result.stats.iterations, 1);
    assert!(has_skip(&result.log, "'f' has multiple reaching definitions"));
}

#[test]
fn test_method_lookup_hoisted_out_of_cleanup_loop() {
    let source = r#"(block (defn work () (block (call print "tick"))) (assign obj (call object)) (call setattr obj "cleanup" work) (for i (call range 100) (block (call (attr obj cleanup)))))"#;
    let result = optimize(tree(source), &Config::default()).unwrap();

    // One attribute lookup survives, in front of the grouped loop; the
    // call through the hoisted binding stays opaque and uneliminated.
    assert_eq!(
        result.tree.to_string(),
        r#"(block (defn work () (block (call print "tick"))) (assign obj (call object)) (call setattr obj "cleanup" work) (assign __h0 (attr obj cleanup)) (for __u0 (call range 0 100 4) (block (assign i __u0) (call __h0) (assign i (binop + __u0 1)) (call __h0) (assign i (binop + __u0 2)) (call __h0) (assign i (binop + __u0 3)) (call __h0))))"#
    );
    assert_eq!(result.stats.hoisted, 1);
    assert_eq!(result.stats.loops_unrolled, 1);
    assert_eq!(result.stats.iterations, 2);
    assert!(has_skip(&result.log, "the loop already carries grouped copies"));
}

#[test]
fn test_zero_trip_loop_folds_through_print() {
    let source =
        "(block (assign total 0) (for i (call range 0) (block (assign total 1))) (call print total))";
    let result = optimize(tree(source), &Config::default()).unwrap();

    assert_eq!(result.tree.to_string(), "(block (call print 0))");
    assert_eq!(result.stats.loops_unrolled, 1);
    assert_eq!(result.stats.folded, 1);
    assert_eq!(result.stats.eliminated, 1);
    assert_eq!(result.stats.iterations, 3);
}

#[test]
fn test_iteration_budget_stops_midway() {
    let source =
        "(block (assign s 0) (for i (call range 2 8) (block (assign s (binop + s i)))) (return s))";
    let mut config = Config::default();
    config.max_iterations = 1;
    let result = optimize(tree(source), &config).unwrap();

    assert!(result.budget_exceeded);
    assert_eq!(result.stats.iterations, 1);

    // One round of grouping happened, nothing more.
    let text = result.tree.to_string();
    assert!(text.contains("(for __u0 (call range 2 6 4)"), "tree was: {}", text);
    assert!(text.contains("(binop + s 7)"), "tree was: {}", text);
    assert!(text.contains("(return s)"), "tree was: {}", text);

    // The partial tree is still the same program.
    let original = run(&tree(source));
    let partial = run(&result.tree);
    assert_eq!(original.value, Value::Int(27));
    assert_eq!(partial.value, original.value);
    assert_eq!(partial.output, original.output);
}
