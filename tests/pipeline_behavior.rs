//! Driver-level properties: fixed points, structural validity, pass
//! toggling and the configuration surface.

mod common;

use std::fs;
use std::str::FromStr;

use strum::IntoEnumIterator;
use treeopt::{optimize, validate, Config, PassKind};

use common::{run, tree};

const PROGRAMS: [&str; 4] = [
    "(block (assign s 0) (for i (call range 1 10) (block (assign s (binop + s i)))) (return s))",
    r#"(block (defn is_py (s) (block (return (call (attr s startswith) "python")))) (return (call is_py "python2.7")))"#,
    r#"(block (defn work () (block (call print "tick"))) (assign obj (call object)) (call setattr obj "cleanup" work) (for i (call range 100) (block (call (attr obj cleanup)))))"#,
    "(block (assign total 0) (for i (call range 0) (block (assign total 1))) (call print total))",
];

#[test]
fn test_optimizing_twice_changes_nothing() {
    for src in PROGRAMS {
        let first = optimize(tree(src), &Config::default()).unwrap();
        let second = optimize(first.tree.clone(), &Config::default()).unwrap();
        assert_eq!(second.stats.applied(), 0, "second run rewrote {}", src);
        assert_eq!(second.stats.iterations, 1);
        assert_eq!(second.tree.to_string(), first.tree.to_string());
    }
}

#[test]
fn test_optimized_trees_stay_structurally_valid() {
    for src in PROGRAMS {
        let result = optimize(tree(src), &Config::default()).unwrap();
        validate::structure(&result.tree).unwrap();

        // No rewrite may introduce a name the source never bound.
        let free_before = validate::free_names(&tree(src));
        let free_after = validate::free_names(&result.tree);
        let introduced: Vec<_> = free_after.difference(&free_before).collect();
        assert!(introduced.is_empty(), "{} introduced {:?}", src, introduced);
    }
}

#[test]
fn test_equivalence_holds_with_any_single_pass_disabled() {
    for pass in PassKind::iter() {
        let mut config = Config::default();
        config.disable_pass(pass);
        for src in PROGRAMS {
            let result = optimize(tree(src), &config).unwrap();
            let original = run(&tree(src));
            let optimized = run(&result.tree);
            assert_eq!(
                optimized.value, original.value,
                "value diverged for {} without {}",
                src, pass
            );
            assert_eq!(
                optimized.output, original.output,
                "output diverged for {} without {}",
                src, pass
            );
        }
    }
}

#[test]
fn test_disabled_unrolling_leaves_the_loop() {
    let src =
        "(block (assign s 0) (for i (call range 1 10) (block (assign s (binop + s i)))) (return s))";
    let mut config = Config::default();
    config.disable_pass(PassKind::LoopUnrolling);
    let result = optimize(tree(src), &config).unwrap();

    assert_eq!(result.stats.loops_unrolled, 0);
    assert!(result.tree.to_string().contains("(for i "));
    assert_eq!(run(&result.tree).value, run(&tree(src)).value);
}

#[test]
fn test_config_load_round_trips_kebab_names() {
    let path = std::env::temp_dir().join(format!("treeopt-config-{}.toml", std::process::id()));
    fs::write(
        &path,
        "max-iterations = 3\n\
         unroll-factor = 2\n\
         inline-size-budget = 16\n\
         enabled-passes = [\"constant-folding\", \"dead-code-elimination\"]\n",
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(config.max_iterations, 3);
    assert_eq!(config.unroll_factor, 2);
    assert_eq!(config.inline_size_budget, 16);
    assert!(config.pass_enabled(PassKind::ConstantFolding));
    assert!(config.pass_enabled(PassKind::DeadCodeElimination));
    assert!(!config.pass_enabled(PassKind::Inlining));
    assert!(!config.pass_enabled(PassKind::LoopUnrolling));
}

#[test]
fn test_pass_names_round_trip() {
    for pass in PassKind::iter() {
        let name = pass.to_string();
        assert_eq!(PassKind::from_str(&name).unwrap(), pass);
    }
    assert_eq!(PassKind::LoopUnrolling.to_string(), "loop-unrolling");
    assert_eq!(
        PassKind::from_str("invariant-hoisting").unwrap(),
        PassKind::InvariantHoisting
    );
}
