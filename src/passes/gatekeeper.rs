//! Commit-time safety checks.
//!
//! A pass does not judge its own preconditions: it names them and the
//! gatekeeper re-validates each against the current analysis. Failure
//! yields the unmet precondition text for the skip record. After a pass
//! returns a replacement tree, `post_check` enforces the whole-tree
//! invariants that make the swap safe to commit.

use std::fmt;

use smallvec::SmallVec;

use crate::analysis::{Analysis, BindingKind, FactId, ScopeId};
use crate::tree::{Node, NodeId};
use crate::validate;

use super::PassKind;

/// A claim a rewrite depends on, checkable against the fact base.
#[derive(Debug, Clone, Copy)]
pub enum Precondition<'t> {
    /// Every call and attribute lookup in the expression is pure.
    PureExpr(&'t Node),
    /// Evaluating the expression at this statement cannot raise.
    TotalExpr {
        expr: &'t Node,
        scope: ScopeId,
        stmt: usize,
    },
    /// Nothing in the unit reads the binding.
    NoReads { scope: ScopeId, name: &'t str },
    /// The unit never calls an introspection builtin.
    NoIntrospection,
    /// The name has exactly one definition, a module-level function.
    SingleModuleFunction { name: &'t str },
    /// The module binding is assigned once, before any statement that
    /// could run user code.
    StableModuleBinding { name: &'t str },
    /// The loop variable has inferred bounds, which also proves the
    /// loop runs at least once.
    LoopBounds { scope: ScopeId, var: &'t str },
}

impl Precondition<'_> {
    fn check(&self, a: &Analysis) -> Result<SmallVec<[FactId; 4]>, String> {
        match self {
            Precondition::PureExpr(expr) => a
                .expr_purity(expr)
                .ok_or_else(|| "purity of the expression cannot be proven".to_string()),
            Precondition::TotalExpr { expr, scope, stmt } => {
                if a.expr_is_total(expr, *scope, *stmt) {
                    Ok(SmallVec::new())
                } else {
                    Err("the expression may raise when evaluated".to_string())
                }
            }
            Precondition::NoReads { scope, name } => {
                if a.scopes.uses_introspection {
                    return Err(format!("reads of '{}' are not enumerable under introspection", name));
                }
                match a.scopes.binding(*scope, name) {
                    Some(info) if info.reads == 0 => Ok(SmallVec::new()),
                    Some(_) => Err(format!("'{}' is read later", name)),
                    None => Err(format!("'{}' has no binding in the scope", name)),
                }
            }
            Precondition::NoIntrospection => {
                if a.scopes.uses_introspection {
                    Err("the unit uses dynamic introspection".to_string())
                } else {
                    Ok(SmallVec::new())
                }
            }
            Precondition::SingleModuleFunction { name } => {
                match a.scopes.module().binding(name) {
                    Some(info)
                        if info.kind == BindingKind::Function && info.assigns == 1 =>
                    {
                        Ok(SmallVec::new())
                    }
                    Some(_) => Err(format!("'{}' has multiple reaching definitions", name)),
                    None => Err(format!("'{}' is not a module-level function", name)),
                }
            }
            Precondition::StableModuleBinding { name } => {
                let info = a
                    .scopes
                    .module()
                    .binding(name)
                    .ok_or_else(|| format!("'{}' is not bound at module level", name))?;
                if info.kind == BindingKind::Function {
                    return Err(format!("'{}' is a function definition", name));
                }
                if info.assigns != 1 {
                    return Err(format!("'{}' is rebound at module level", name));
                }
                let def = info
                    .def_stmt
                    .ok_or_else(|| format!("definition of '{}' is conditional", name))?;
                let boundary = a.scopes.module_effect_boundary.unwrap_or(usize::MAX);
                if def >= boundary {
                    return Err(format!(
                        "'{}' may be unbound when user code first runs",
                        name
                    ));
                }
                let mut evidence = SmallVec::new();
                if let Some((id, _)) = a.facts.constant_of(crate::analysis::MODULE_SCOPE, name) {
                    evidence.push(id);
                }
                Ok(evidence)
            }
            Precondition::LoopBounds { scope, var } => a
                .facts
                .range_of(*scope, var)
                .map(|(id, _, _)| {
                    let mut ev = SmallVec::new();
                    ev.push(id);
                    ev
                })
                .ok_or_else(|| format!("bounds of '{}' are unknown", var)),
        }
    }
}

/// Validates rewrite preconditions against the current analysis.
#[derive(Clone, Copy)]
pub struct Gatekeeper<'a> {
    analysis: &'a Analysis,
}

impl<'a> Gatekeeper<'a> {
    pub fn new(analysis: &'a Analysis) -> Gatekeeper<'a> {
        Gatekeeper { analysis }
    }

    /// Check every precondition, collecting the supporting facts. The
    /// first unmet precondition aborts the rewrite.
    pub fn validate(
        &self,
        preconditions: &[Precondition<'_>],
    ) -> Result<SmallVec<[FactId; 4]>, String> {
        let mut evidence = SmallVec::new();
        for pre in preconditions {
            evidence.extend(pre.check(self.analysis)?);
        }
        Ok(evidence)
    }
}

/// Invariant breach detected after a pass ran. The pipeline treats this
/// as fatal for the run and hands back the pre-pass tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateViolation {
    pub pass: PassKind,
    pub node: NodeId,
    pub detail: String,
}

impl fmt::Display for GateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invariant violation after {} at {}: {}",
            self.pass, self.node, self.detail
        )
    }
}

impl std::error::Error for GateViolation {}

/// Whole-tree commit check: the replacement is structurally valid and
/// introduces no free name the source tree did not already have.
pub fn post_check(pass: PassKind, before: &Node, after: &Node) -> Result<(), GateViolation> {
    if let Err(e) = validate::structure(after) {
        return Err(GateViolation {
            pass,
            node: e.node,
            detail: e.detail,
        });
    }
    let free_before = validate::free_names(before);
    let free_after = validate::free_names(after);
    if let Some(introduced) = free_after.difference(&free_before).next() {
        return Err(GateViolation {
            pass,
            node: after.id,
            detail: format!("rewrite introduced free name '{}'", introduced),
        });
    }
    Ok(())
}
