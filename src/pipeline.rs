//! Pipeline driver.
//!
//! Runs the enabled passes over one tree until an iteration applies no
//! rewrite or the iteration bound is reached. Every iteration starts
//! from a fresh analysis; facts never survive into the next iteration.
//! A pass's replacement tree is committed only after the whole-tree
//! post-rewrite check, so a misbehaving pass can never smuggle a bad
//! tree into the output.

use std::fmt;

use tracing::{debug, warn};

use crate::analysis::Analysis;
use crate::config::Config;
use crate::passes::{
    all_passes, post_check, Gatekeeper, GateViolation, Pass, PassCtx, PassKind, RewriteLog,
};
use crate::tree::{IdGen, Node};
use crate::validate::{self, StructureError};

/// Fatal failure of one optimization run.
#[derive(Debug)]
pub enum OptimizeError {
    /// The input tree failed the structural check; no pass ran.
    MalformedTree(StructureError),
    /// A pass produced a tree that failed the post-rewrite check. The
    /// carried tree is the last good one, from just before that pass.
    InvariantViolation {
        violation: GateViolation,
        tree: Box<Node>,
    },
}

impl fmt::Display for OptimizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizeError::MalformedTree(err) => write!(f, "{}", err),
            OptimizeError::InvariantViolation { violation, .. } => write!(f, "{}", violation),
        }
    }
}

impl std::error::Error for OptimizeError {}

/// Aggregate counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Iterations run, counting the final all-quiet one.
    pub iterations: u32,
    /// Calls replaced by callee bodies.
    pub inlined: usize,
    /// Loops expanded or grouped.
    pub loops_unrolled: usize,
    /// Invariant expressions moved out of loops.
    pub hoisted: usize,
    /// Expressions replaced by their value.
    pub folded: usize,
    /// Statements removed.
    pub eliminated: usize,
    /// Module reads aliased into locals.
    pub rebound: usize,
    /// Rewrites declined with a skip record.
    pub skipped: usize,
}

impl PipelineStats {
    /// Total rewrites applied across all passes.
    pub fn applied(&self) -> usize {
        self.inlined
            + self.loops_unrolled
            + self.hoisted
            + self.folded
            + self.eliminated
            + self.rebound
    }

    fn collect(log: &RewriteLog, iterations: u32) -> PipelineStats {
        PipelineStats {
            iterations,
            inlined: log.count_for(PassKind::Inlining),
            loops_unrolled: log.count_for(PassKind::LoopUnrolling),
            hoisted: log.count_for(PassKind::InvariantHoisting),
            folded: log.count_for(PassKind::ConstantFolding),
            eliminated: log.count_for(PassKind::DeadCodeElimination),
            rebound: log.count_for(PassKind::GlobalRebinding),
            skipped: log.skipped_count(),
        }
    }
}

/// A finished optimization run.
#[derive(Debug)]
pub struct Optimized {
    pub tree: Node,
    pub log: RewriteLog,
    pub stats: PipelineStats,
    /// The run hit the iteration bound while passes were still applying
    /// changes. The tree is valid output but may not be a fixed point.
    pub budget_exceeded: bool,
}

pub struct Pipeline {
    config: Config,
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    pub fn new(config: Config) -> Pipeline {
        Pipeline {
            config,
            passes: all_passes(),
        }
    }

    /// A driver over a caller-supplied pass list. The loop, the gate
    /// checks, and the log work exactly as in `new`; tests use this to
    /// watch the driver contain a misbehaving pass.
    pub fn with_passes(config: Config, passes: Vec<Box<dyn Pass>>) -> Pipeline {
        Pipeline { config, passes }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Optimize one tree to a fixed point or the iteration bound.
    pub fn optimize(&self, tree: Node) -> Result<Optimized, OptimizeError> {
        if let Err(err) = validate::structure(&tree) {
            return Err(OptimizeError::MalformedTree(err));
        }

        let mut tree = tree;
        let mut ids = IdGen::after(&tree);
        let mut log = RewriteLog::new();
        let mut iterations = 0;
        let mut budget_exceeded = false;

        loop {
            if iterations == self.config.max_iterations {
                budget_exceeded = true;
                warn!(
                    target: "treeopt::pipeline",
                    iterations,
                    "stopping before a fixed point"
                );
                break;
            }
            iterations += 1;
            log.begin_iteration(iterations);

            let analysis = Analysis::run(&tree);
            let mut changed = false;
            for pass in &self.passes {
                if !self.config.pass_enabled(pass.kind()) {
                    continue;
                }
                let before = log.applied_count();
                let next = {
                    let mut ctx = PassCtx {
                        analysis: &analysis,
                        gate: Gatekeeper::new(&analysis),
                        config: &self.config,
                        ids: &mut ids,
                        log: &mut log,
                    };
                    pass.run(&tree, &mut ctx)
                };
                let Some(next) = next else { continue };
                if let Err(violation) = post_check(pass.kind(), &tree, &next) {
                    warn!(
                        target: "treeopt::pipeline",
                        pass = %pass.kind(),
                        "discarding rewrite: {}", violation
                    );
                    return Err(OptimizeError::InvariantViolation {
                        violation,
                        tree: Box::new(tree),
                    });
                }
                debug!(
                    target: "treeopt::pipeline",
                    iteration = iterations,
                    pass = %pass.kind(),
                    applied = log.applied_count() - before,
                    "pass committed"
                );
                tree = next;
                changed = true;
            }
            if !changed {
                break;
            }
        }

        let stats = PipelineStats::collect(&log, iterations);
        debug!(
            target: "treeopt::pipeline",
            iterations,
            applied = stats.applied(),
            skipped = stats.skipped,
            budget_exceeded,
            "run finished"
        );
        Ok(Optimized {
            tree,
            log,
            stats,
            budget_exceeded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{parse_program, NodeId, NodeKind, Value};

    fn optimize(src: &str) -> Optimized {
        let tree = parse_program(src).unwrap();
        Pipeline::new(Config::default()).optimize(tree).unwrap()
    }

    #[test]
    fn test_reaches_fixed_point() {
        let result = optimize("(block (assign x (binop + 1 2)) (call print x))");
        assert_eq!(result.tree.to_string(), "(block (call print 3))");
        assert!(!result.budget_exceeded);
        // Folding lands in iteration one, the dead assign goes in
        // iteration two once the refreshed analysis sees zero reads,
        // and iteration three is the quiet one.
        assert_eq!(result.stats.iterations, 3);
        assert_eq!(result.stats.folded, 2);
        assert_eq!(result.stats.eliminated, 1);
        assert_eq!(result.stats.applied(), 3);
    }

    #[test]
    fn test_malformed_input_is_rejected_before_any_pass() {
        let id = NodeId(0);
        let tree = Node::new(
            id,
            NodeKind::Block(vec![Node::new(id, NodeKind::Literal(Value::Int(1)))]),
        );
        let err = Pipeline::new(Config::default()).optimize(tree).unwrap_err();
        assert!(matches!(err, OptimizeError::MalformedTree(_)));
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn test_budget_stop_keeps_partial_result() {
        let mut config = Config::default();
        config.max_iterations = 1;
        let tree = parse_program("(block (assign x (binop + 1 2)) (call print x))").unwrap();
        let result = Pipeline::new(config).optimize(tree).unwrap();
        assert!(result.budget_exceeded);
        assert_eq!(result.stats.iterations, 1);
        assert_eq!(result.tree.to_string(), "(block (assign x 3) (call print 3))");
    }

    #[test]
    fn test_disabled_pass_never_runs() {
        let mut config = Config::default();
        config.disable_pass(PassKind::ConstantFolding);
        let tree = parse_program("(block (assign x (binop + 1 2)) (call print x))").unwrap();
        let result = Pipeline::new(config).optimize(tree).unwrap();
        assert_eq!(
            result.tree.to_string(),
            "(block (assign x (binop + 1 2)) (call print x))"
        );
        assert_eq!(result.stats.folded, 0);
        assert!(result.log.records().is_empty());
    }

    struct FreeNamePass;

    impl Pass for FreeNamePass {
        fn kind(&self) -> PassKind {
            PassKind::ConstantFolding
        }

        fn run(&self, _tree: &Node, _ctx: &mut PassCtx<'_>) -> Option<Node> {
            Some(parse_program("(block (assign x zzz))").unwrap())
        }
    }

    #[test]
    fn test_bad_rewrite_is_discarded_with_the_pre_pass_tree() {
        let pipeline = Pipeline::with_passes(Config::default(), vec![Box::new(FreeNamePass)]);
        let tree = parse_program("(block (assign x 1))").unwrap();
        let err = pipeline.optimize(tree).unwrap_err();
        let OptimizeError::InvariantViolation { violation, tree } = err else {
            panic!("expected an invariant violation");
        };
        assert!(violation.to_string().contains("free name 'zzz'"));
        assert_eq!(tree.to_string(), "(block (assign x 1))");
    }
}
