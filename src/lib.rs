//! treeopt - AST-level optimizer for a small dynamic language
//!
//! This library rewrites program trees for a dynamically-scoped
//! language with first-class functions, objects, and introspection.
//! Every rewrite is justified by facts inferred from the tree and
//! re-checked by a gatekeeper at commit time; anything that cannot be
//! proven safe is skipped and logged, never guessed.
//!
//! # Architecture
//!
//! The pipeline consists of four stages:
//!
//! 1. **Parsing** (`sexpr`, `tree` modules)
//!    - Tokenizes the s-expression text format
//!    - Lowers s-expressions into `Node` trees with stable ids
//!    - `(block ...)`, `(assign x e)`, `(if c t e)`, `(for v iter b)`,
//!      `(defn f (p) b)`, `(return e)`, `(call f a)`, `(attr o n)`,
//!      `(binop + a b)`, literals
//!
//! 2. **Analysis** (`analysis` module)
//!    - Builds the scope map: bindings, reads, definition positions
//!    - Infers constant, purity, and range facts into the fact base
//!    - Absent facts mean unknown; no pass may assume otherwise
//!
//! 3. **Rewriting** (`passes` module)
//!    - Inlining, invariant hoisting, loop unrolling, constant
//!      folding, dead-code elimination, global-to-local rebinding
//!    - Each pass names its preconditions; the gatekeeper re-validates
//!      them against the fact base and records every applied and
//!      skipped rewrite
//!
//! 4. **Driving** (`pipeline` module)
//!    - Iterates the passes to a fixed point under an iteration bound
//!    - Refreshes the analysis at the start of every iteration
//!    - Rejects any replacement tree that fails the whole-tree check
//!
//! The `eval` module holds the reference interpreter used by the
//! equivalence tests and the CLI `--check` mode.
//!
//! # Example
//!
//! ```rust
//! use treeopt::{optimize, parse_program, Config};
//!
//! let tree = parse_program("(block (assign x (binop + 1 2)) (call print x))").unwrap();
//! let result = optimize(tree, &Config::default()).unwrap();
//! assert_eq!(result.tree.to_string(), "(block (call print 3))");
//! ```

pub mod analysis;
pub mod builtins;
pub mod config;
pub mod eval;
pub mod passes;
pub mod pipeline;
pub mod sexpr;
pub mod tree;
pub mod validate;

pub use config::{Config, ConfigError};
pub use eval::{run_program, EvalError, EvalStats, Outcome};
pub use passes::{PassKind, RewriteLog, RewriteRecord};
pub use pipeline::{Optimized, OptimizeError, Pipeline, PipelineStats};
pub use tree::{parse_program, Node, NodeId, NodeKind, Value};

/// Optimize one tree with the given configuration.
pub fn optimize(tree: Node, config: &Config) -> Result<Optimized, OptimizeError> {
    Pipeline::new(config.clone()).optimize(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimize_simple() {
        let tree = parse_program("(block (assign x (binop + 1 2)) (call print x))").unwrap();
        let result = optimize(tree, &Config::default()).unwrap();
        assert_eq!(result.tree.to_string(), "(block (call print 3))");
        assert!(!result.budget_exceeded);
    }

    #[test]
    fn test_optimize_sum_loop_to_literal_return() {
        let tree = parse_program(
            "(block (assign s 0) (for i (call range 10) (block (assign s (binop + s i)))) (return s))",
        )
        .unwrap();
        let result = optimize(tree, &Config::default()).unwrap();
        assert_eq!(result.tree.to_string(), "(block (return 45))");
    }

    #[test]
    fn test_optimize_folds_string_predicate() {
        let tree = parse_program(
            r#"(block (return (call (attr "python2.7" startswith) "python")))"#,
        )
        .unwrap();
        let result = optimize(tree, &Config::default()).unwrap();
        assert_eq!(result.tree.to_string(), "(block (return true))");
    }

    #[test]
    fn test_invalid_syntax() {
        assert!(parse_program("(assign x").is_err());
    }
}
