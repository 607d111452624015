//! Analyzer: scope map plus fact base.
//!
//! `Analysis::run` produces everything a rewrite pass may consult. The
//! pipeline discards and rebuilds the analysis at the start of every
//! iteration, so no fact ever describes a tree from an earlier round.

mod bindings;
mod constants;
mod facts;
mod purity;
mod ranges;

#[cfg(test)]
mod tests;

pub use bindings::{BindingInfo, BindingKind, Resolution, ScopeInfo, ScopeMap};
pub use facts::{Fact, FactBase, FactId, FactKind, FactSubject, ScopeId, MODULE_SCOPE};

use smallvec::SmallVec;
use tracing::debug;

use crate::tree::{Node, NodeKind, Value};

#[derive(Debug)]
pub struct Analysis {
    pub scopes: ScopeMap,
    pub facts: FactBase,
}

impl Analysis {
    pub fn run(tree: &Node) -> Analysis {
        let scopes = ScopeMap::build(tree);
        let mut facts = FactBase::new();
        constants::infer(tree, &scopes, &mut facts);
        purity::infer(tree, &scopes, &mut facts);
        ranges::infer(tree, &scopes, &mut facts);
        debug!(
            target: "treeopt::analysis",
            scopes = scopes.scopes().count(),
            facts = facts.len(),
            introspection = scopes.uses_introspection,
            "analysis complete"
        );
        Analysis { scopes, facts }
    }

    /// Purity evidence for a whole expression: the `Pure` facts of every
    /// call and attribute lookup inside it. `None` when any of them
    /// lacks one, meaning the expression may have effects.
    pub fn expr_purity(&self, expr: &Node) -> Option<SmallVec<[FactId; 4]>> {
        let mut evidence: SmallVec<[FactId; 4]> = SmallVec::new();
        let mut all_pure = true;
        expr.visit(&mut |n| {
            if matches!(n.kind, NodeKind::Call { .. } | NodeKind::Attribute { .. }) {
                match self.facts.pure_fact(n.id) {
                    Some(id) => evidence.push(id),
                    None => all_pure = false,
                }
            }
        });
        all_pure.then_some(evidence)
    }

    /// True when evaluating the expression cannot raise at the given
    /// point: literals, reads provably bound by then, and the operators
    /// that accept every operand type.
    pub fn expr_is_total(&self, expr: &Node, scope: ScopeId, use_stmt: usize) -> bool {
        match &expr.kind {
            NodeKind::Literal(_) => true,
            NodeKind::Name(name) => self.name_is_bound_at(scope, name, use_stmt),
            NodeKind::BinOp { op, lhs, rhs } => {
                use crate::tree::BinOpKind::*;
                matches!(op, Eq | Ne | And | Or)
                    && self.expr_is_total(lhs, scope, use_stmt)
                    && self.expr_is_total(rhs, scope, use_stmt)
            }
            _ => false,
        }
    }

    /// True when a read of the name at the given statement is certain
    /// to find a binding at runtime.
    pub fn name_is_bound_at(&self, scope: ScopeId, name: &str, use_stmt: usize) -> bool {
        match self.scopes.resolve(scope, name) {
            Resolution::Local(info) => match info.kind {
                BindingKind::Param => true,
                _ => info.def_stmt.map_or(false, |def| def < use_stmt),
            },
            Resolution::Module(info) => {
                let boundary = self.scopes.module_effect_boundary.unwrap_or(usize::MAX);
                info.def_stmt.map_or(false, |def| def < boundary)
            }
            Resolution::Builtin(_) => true,
            Resolution::Unbound => false,
        }
    }

    /// Constant value of a binding at a direct statement of the same
    /// scope, with the definition proved to execute first.
    pub fn constant_at(&self, scope: ScopeId, name: &str, use_stmt: usize) -> Option<(FactId, &Value)> {
        let info = self.scopes.binding(scope, name)?;
        let def = info.def_stmt?;
        if def >= use_stmt {
            return None;
        }
        self.facts.constant_of(scope, name)
    }

    /// Constant value of a module binding as seen from inside a function
    /// body. Valid only when the definition precedes every module
    /// statement that could call user code.
    pub fn module_constant_for_fn_use(&self, name: &str) -> Option<(FactId, &Value)> {
        let info = self.scopes.module().binding(name)?;
        let def = info.def_stmt?;
        let boundary = self.scopes.module_effect_boundary.unwrap_or(usize::MAX);
        if def >= boundary {
            return None;
        }
        self.facts.constant_of(MODULE_SCOPE, name)
    }
}
