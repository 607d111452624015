//! Rewrite passes.
//!
//! Each pass is a tree-to-tree transformation that consults the fresh
//! analysis through the gatekeeper and records every applied and
//! skipped rewrite. Passes never mutate in place: they either return a
//! replacement tree or nothing.

mod dce;
mod fold;
mod gatekeeper;
mod hoist;
mod inline;
mod rebind;
mod unroll;


pub use dce::DeadCodeElimination;
pub use fold::ConstantFolding;
pub use gatekeeper::{post_check, Gatekeeper, GateViolation, Precondition};
pub use hoist::InvariantHoisting;
pub use inline::Inlining;
pub use rebind::GlobalRebinding;
pub use unroll::LoopUnrolling;

use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use smallvec::SmallVec;
use strum::{Display, EnumIter, EnumString};

use crate::analysis::{Analysis, FactId, ScopeId};
use crate::config::Config;
use crate::tree::{IdGen, Node, NodeId, NodeKind};
use crate::validate::scope_bindings;

/// The rewrite passes, named as they appear in configuration and
/// diagnostics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PassKind {
    Inlining,
    LoopUnrolling,
    InvariantHoisting,
    ConstantFolding,
    DeadCodeElimination,
    GlobalRebinding,
}

impl PassKind {
    /// Application order within one pipeline iteration. Hoisting runs
    /// before unrolling so an invariant expression is lifted out of the
    /// compact loop once instead of reappearing in every unrolled copy;
    /// folding then sees the straight-line code unrolling exposed, and
    /// elimination and rebinding run on the folded result.
    pub const ORDERED: [PassKind; 6] = [
        PassKind::Inlining,
        PassKind::InvariantHoisting,
        PassKind::LoopUnrolling,
        PassKind::ConstantFolding,
        PassKind::DeadCodeElimination,
        PassKind::GlobalRebinding,
    ];
}

/// Outcome of one attempted rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordDetail {
    Applied,
    Skipped { precondition: String },
}

/// One entry of the diagnostic rewrite log.
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteRecord {
    pub pass: PassKind,
    /// Pipeline iteration the rewrite ran in, 1-based.
    pub iteration: u32,
    /// Source node the rewrite targeted.
    pub before: NodeId,
    /// Root of the replacement subtree; `None` when the rewrite removed
    /// the node or was skipped.
    pub after: Option<NodeId>,
    /// Facts consulted to justify the rewrite.
    pub facts: SmallVec<[FactId; 4]>,
    pub detail: RecordDetail,
}

impl fmt::Display for RewriteRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[iter {}] {}: ", self.iteration, self.pass)?;
        match &self.detail {
            RecordDetail::Applied => {
                match self.after {
                    Some(after) => write!(f, "{} -> {}", self.before, after)?,
                    None => write!(f, "{} removed", self.before)?,
                }
            }
            RecordDetail::Skipped { precondition } => {
                write!(f, "skip {} ({})", self.before, precondition)?;
            }
        }
        if !self.facts.is_empty() {
            write!(f, " [")?;
            for (i, id) in self.facts.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", id)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RewriteLog {
    records: Vec<RewriteRecord>,
    iteration: u32,
}

impl RewriteLog {
    pub fn new() -> RewriteLog {
        RewriteLog::default()
    }

    pub fn begin_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    pub fn applied(
        &mut self,
        pass: PassKind,
        before: NodeId,
        after: Option<NodeId>,
        facts: SmallVec<[FactId; 4]>,
    ) {
        self.records.push(RewriteRecord {
            pass,
            iteration: self.iteration,
            before,
            after,
            facts,
            detail: RecordDetail::Applied,
        });
    }

    pub fn skipped(
        &mut self,
        pass: PassKind,
        before: NodeId,
        precondition: impl Into<String>,
        facts: SmallVec<[FactId; 4]>,
    ) {
        self.records.push(RewriteRecord {
            pass,
            iteration: self.iteration,
            before,
            after: None,
            facts,
            detail: RecordDetail::Skipped {
                precondition: precondition.into(),
            },
        });
    }

    pub fn records(&self) -> &[RewriteRecord] {
        &self.records
    }

    pub fn applied_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.detail == RecordDetail::Applied)
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.records.len() - self.applied_count()
    }

    pub fn count_for(&self, pass: PassKind) -> usize {
        self.records
            .iter()
            .filter(|r| r.pass == pass && r.detail == RecordDetail::Applied)
            .count()
    }
}

/// Shared state handed to a pass for one run over one tree.
pub struct PassCtx<'a> {
    pub analysis: &'a Analysis,
    pub gate: Gatekeeper<'a>,
    pub config: &'a Config,
    pub ids: &'a mut IdGen,
    pub log: &'a mut RewriteLog,
}

pub trait Pass {
    fn kind(&self) -> PassKind;

    /// Rewrite `tree`, returning the replacement when anything changed.
    fn run(&self, tree: &Node, ctx: &mut PassCtx<'_>) -> Option<Node>;
}

/// All passes in application order.
pub fn all_passes() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(Inlining),
        Box::new(InvariantHoisting),
        Box::new(LoopUnrolling),
        Box::new(ConstantFolding),
        Box::new(DeadCodeElimination),
        Box::new(GlobalRebinding),
    ]
}

/// First unused index for synthesized names with the given reserved
/// prefix, scanning every name the tree mentions so repeated pipeline
/// iterations never collide with their own earlier output.
pub(crate) fn next_temp_index(tree: &Node, prefix: &str) -> u32 {
    let mut max: Option<u32> = None;
    let mut consider = |name: &str| {
        if let Some(rest) = name.strip_prefix(prefix) {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse::<u32>() {
                max = Some(max.map_or(n, |m| m.max(n)));
            }
        }
    };
    tree.visit(&mut |node| match &node.kind {
        NodeKind::Name(n) => consider(n),
        NodeKind::Assign { target, .. } => consider(target),
        NodeKind::For { var, .. } => consider(var),
        NodeKind::FunctionDef { name, params, .. } => {
            consider(name);
            for p in params {
                consider(p);
            }
        }
        _ => {}
    });
    max.map_or(0, |m| m + 1)
}

/// A name whose every binder sits inside `doomed` while reads of it
/// survive outside, meaning removal would leave those reads free.
/// Reads wholly inside `doomed` vanish with it and do not count.
pub(crate) fn orphaned_binding(
    analysis: &Analysis,
    root: &Node,
    doomed: &Node,
    scope: ScopeId,
) -> Option<String> {
    let mut bound = HashSet::new();
    scope_bindings(doomed, &mut bound);
    let mut names: Vec<String> = bound.into_iter().collect();
    names.sort_unstable();
    for name in names {
        let Some(info) = analysis.scopes.binding(scope, &name) else {
            continue;
        };
        if root.reads_of(&name) <= doomed.reads_of(&name) {
            continue;
        }
        if count_binders(doomed, &name) >= info.assigns {
            return Some(name);
        }
    }
    None
}

/// Binders of `name` in this subtree that land in the enclosing scope.
/// Nested function bodies bind their own scope and are not counted.
fn count_binders(node: &Node, name: &str) -> u32 {
    let mut n = 0;
    match &node.kind {
        NodeKind::Assign { target, .. } if target == name => n += 1,
        NodeKind::For { var, body, .. } => {
            if var == name {
                n += 1;
            }
            n += count_binders(body, name);
        }
        NodeKind::FunctionDef { name: fn_name, .. } => {
            if fn_name == name {
                n += 1;
            }
        }
        NodeKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            n += count_binders(then_branch, name);
            if let Some(e) = else_branch {
                n += count_binders(e, name);
            }
        }
        NodeKind::Block(items) => {
            for item in items {
                n += count_binders(item, name);
            }
        }
        _ => {}
    }
    n
}
