//! Differential tests: the optimized tree must be indistinguishable
//! from the source program under the reference interpreter.
//!
//! Every case runs both trees to completion and compares the resulting
//! value, the printed output line by line, and the observable effect
//! count. Programs that raise must keep raising the same error.

mod common;

use treeopt::{optimize, run_program, Config, Optimized, Value};

use common::{run, tree, FUEL};

fn assert_equivalent(src: &str) -> Optimized {
    let result = optimize(tree(src), &Config::default()).unwrap();
    let original = run(&tree(src));
    let optimized = run(&result.tree);
    assert_eq!(optimized.value, original.value, "value diverged for {}", src);
    assert_eq!(optimized.output, original.output, "output diverged for {}", src);
    assert_eq!(
        optimized.stats.side_effects, original.stats.side_effects,
        "effect count diverged for {}",
        src
    );
    result
}

fn assert_same_raise(src: &str) {
    let result = optimize(tree(src), &Config::default()).unwrap();
    let original = run_program(&tree(src), FUEL).unwrap_err();
    let optimized = run_program(&result.tree, FUEL).unwrap_err();
    assert_eq!(optimized, original, "raise diverged for {}", src);
}

#[test]
fn test_optimized_programs_match_the_interpreter() {
    let cases = [
        // Counting loop collapsed to a literal return.
        "(block (assign s 0) (for i (call range 1 10) (block (assign s (binop + s i)))) (return s))",
        // Single-return function inlined and folded away.
        r#"(block (defn is_py (s) (block (return (call (attr s startswith) "python")))) (return (call is_py "python2.7")))"#,
        // Constant condition resolved to the live branch.
        r#"(block (if (binop < 1 2) (block (call print "yes")) (block (call print "no"))))"#,
        // Module constant folded through a function body via rebinding.
        "(block (assign lim 100) (defn check (v) (block (return (binop < v lim)))) (call print (call check 5)))",
        // List literal expanded in place.
        "(block (for x (list 1 2 3) (block (call print x))))",
        // Pure builtins folded with their literal arguments.
        r#"(block (call print (call min 3 7)) (call print (call abs (binop - 2 9))) (call print (call len "abcde")))"#,
        // Grouping must keep every print in its original order.
        "(block (for i (call range 7) (block (call print i))))",
        // Statement inlining with a computed argument.
        "(block (defn twice (a) (block (call print a) (call print a))) (call twice (binop + 20 1)))",
    ];
    for src in cases {
        assert_equivalent(src);
    }
}

#[test]
fn test_raising_programs_keep_their_raise() {
    // Division by zero survives folding even when its operands fold.
    assert_same_raise("(block (assign a (binop + 1 2)) (assign x (binop / a 0)) (call print x))");
    // Integer overflow is never folded into a wrapped literal.
    assert_same_raise("(block (assign big 9223372036854775807) (call print (binop * big 2)))");
    // A zero-trip loop that is the only binder of a later read stays,
    // so the unbound-name raise is identical on both sides.
    assert_same_raise("(block (for i (call range 0) (block (assign x 1))) (call print x))");
    // Attribute misses are not the optimizer's to fix.
    assert_same_raise("(block (assign o (call object)) (call print (attr o missing)))");
}

#[test]
fn test_hoisting_cuts_attribute_lookups() {
    let src = r#"(block (defn work () (block (call print "tick"))) (assign obj (call object)) (call setattr obj "cleanup" work) (for i (call range 100) (block (call (attr obj cleanup)))))"#;
    let result = assert_equivalent(src);

    let original = run(&tree(src));
    let optimized = run(&result.tree);
    assert_eq!(original.stats.attr_lookups, 100);
    assert_eq!(optimized.stats.attr_lookups, 1);
    assert_eq!(optimized.stats.calls, original.stats.calls);
}

#[test]
fn test_collapse_does_strictly_less_work() {
    let src =
        "(block (assign s 0) (for i (call range 1 10) (block (assign s (binop + s i)))) (return s))";
    let result = assert_equivalent(src);

    let original = run(&tree(src));
    let optimized = run(&result.tree);
    assert_eq!(original.value, Value::Int(45));
    assert!(
        optimized.stats.steps < original.stats.steps,
        "optimized tree re-does the loop: {} >= {}",
        optimized.stats.steps,
        original.stats.steps
    );
}
