//! Range inference.
//!
//! A `for` over a range with known endpoints and at least one element
//! bounds its variable for the whole scope: inside the body and after
//! the loop, where the variable keeps its final value. The fact is only
//! recorded when the loop is the variable's sole binder. Bounds then
//! propagate through `+`: a single-assignment binding whose value is a
//! sum of bounded operands is itself bounded by the sum of the bounds.

use tracing::trace;

use crate::builtins::range_len;
use crate::tree::{BinOpKind, Node, NodeKind, Value};

use super::bindings::{BindingKind, Resolution, ScopeMap};
use super::facts::{FactBase, FactKind, FactSubject, ScopeId, MODULE_SCOPE};

pub(super) fn infer(tree: &Node, scopes: &ScopeMap, facts: &mut FactBase) {
    walk(tree, MODULE_SCOPE, None, scopes, facts);
}

fn walk(
    node: &Node,
    scope: ScopeId,
    direct_idx: Option<usize>,
    scopes: &ScopeMap,
    facts: &mut FactBase,
) {
    match &node.kind {
        NodeKind::Block(items) => {
            // Direct indices exist only for the items of a scope body.
            let is_scope_body = direct_idx.is_none();
            for (i, item) in items.iter().enumerate() {
                let idx = if is_scope_body { Some(i) } else { None };
                if let (Some(idx), NodeKind::Assign { target, value }) = (idx, &item.kind) {
                    record_sum_bounds(target, value, scope, idx, scopes, facts);
                }
                walk(item, scope, idx, scopes, facts);
            }
        }
        NodeKind::For { var, iter, body } => {
            if let Some((start, stop, step)) = known_range(iter, scope, direct_idx, scopes, facts) {
                let trip = range_len(start, stop, step);
                if trip >= 1 {
                    let sole_binder = scopes
                        .binding(scope, var)
                        .map(|b| b.assigns == 1)
                        .unwrap_or(false);
                    if sole_binder {
                        let last = start as i128 + (trip as i128 - 1) * step as i128;
                        if let Ok(last) = i64::try_from(last) {
                            let subject = FactSubject::Binding {
                                scope,
                                name: var.clone(),
                            };
                            let id = facts.add(
                                subject.clone(),
                                FactKind::RangeBounds {
                                    lo: start.min(last),
                                    hi: start.max(last),
                                },
                            );
                            facts.add(subject, FactKind::TypeKnown("int"));
                            trace!(target: "treeopt::analysis", fact = %facts.get(id), "loop variable bounds");
                        }
                    }
                }
            }
            walk(body, scope, Some(usize::MAX), scopes, facts);
        }
        NodeKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            walk(then_branch, scope, Some(usize::MAX), scopes, facts);
            if let Some(e) = else_branch {
                walk(e, scope, Some(usize::MAX), scopes, facts);
            }
        }
        NodeKind::FunctionDef { body, .. } => {
            if let Some(child) = scopes.scope_of_def(node.id) {
                walk(body, child, None, scopes, facts);
            }
        }
        _ => {}
    }
}

/// Endpoints of a `range` call when they are statically known. An
/// argument may be a literal, or a name whose single constant
/// assignment provably precedes the loop statement.
fn known_range(
    iter: &Node,
    scope: ScopeId,
    loop_idx: Option<usize>,
    scopes: &ScopeMap,
    facts: &FactBase,
) -> Option<(i64, i64, i64)> {
    let NodeKind::Call { callee, args } = &iter.kind else {
        return None;
    };
    let NodeKind::Name(name) = &callee.kind else {
        return None;
    };
    if !matches!(scopes.resolve(scope, name), Resolution::Builtin("range")) {
        return None;
    }
    if args.is_empty() || args.len() > 3 {
        return None;
    }
    let mut ints = Vec::with_capacity(args.len());
    for arg in args {
        ints.push(known_int(arg, scope, loop_idx, scopes, facts)?);
    }
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return None,
    };
    if step == 0 {
        return None;
    }
    Some((start, stop, step))
}

/// Bounds for a single-assignment sum over bounded operands. Statements
/// run in order, so a loop variable bounded by an earlier `for` is
/// already in the fact base when the sum is reached.
fn record_sum_bounds(
    target: &str,
    value: &Node,
    scope: ScopeId,
    stmt_idx: usize,
    scopes: &ScopeMap,
    facts: &mut FactBase,
) {
    if !matches!(value.kind, NodeKind::BinOp { op: BinOpKind::Add, .. }) {
        return;
    }
    let Some(info) = scopes.binding(scope, target) else {
        return;
    };
    if info.kind != BindingKind::Assigned || info.assigns != 1 || info.def_stmt != Some(stmt_idx) {
        return;
    }
    let Some((lo, hi)) = int_bounds(value, scope, stmt_idx, scopes, facts) else {
        return;
    };
    let subject = FactSubject::Binding {
        scope,
        name: target.to_string(),
    };
    let id = facts.add(subject.clone(), FactKind::RangeBounds { lo, hi });
    facts.add(subject, FactKind::TypeKnown("int"));
    trace!(target: "treeopt::analysis", fact = %facts.get(id), "sum bounds");
}

/// Inclusive bounds of an integer expression built from literals,
/// bounded or constant names defined earlier in the scope, and `+`.
/// Overflow of a bound means unknown.
fn int_bounds(
    expr: &Node,
    scope: ScopeId,
    stmt_idx: usize,
    scopes: &ScopeMap,
    facts: &FactBase,
) -> Option<(i64, i64)> {
    match &expr.kind {
        NodeKind::Literal(Value::Int(n)) => Some((*n, *n)),
        NodeKind::Name(name) => {
            let info = scopes.binding(scope, name)?;
            match info.def_stmt {
                Some(def) if def < stmt_idx => {}
                Some(_) => return None,
                // Loop variables carry no statement index. Their bounds
                // fact exists only once the loop has been walked, which
                // preserves textual order here.
                None if info.kind == BindingKind::LoopVar => {}
                None => return None,
            }
            if let Some((_, lo, hi)) = facts.range_of(scope, name) {
                return Some((lo, hi));
            }
            match facts.constant_of(scope, name) {
                Some((_, Value::Int(n))) => Some((*n, *n)),
                _ => None,
            }
        }
        NodeKind::BinOp {
            op: BinOpKind::Add,
            lhs,
            rhs,
        } => {
            let (llo, lhi) = int_bounds(lhs, scope, stmt_idx, scopes, facts)?;
            let (rlo, rhi) = int_bounds(rhs, scope, stmt_idx, scopes, facts)?;
            Some((llo.checked_add(rlo)?, lhi.checked_add(rhi)?))
        }
        _ => None,
    }
}

fn known_int(
    arg: &Node,
    scope: ScopeId,
    loop_idx: Option<usize>,
    scopes: &ScopeMap,
    facts: &FactBase,
) -> Option<i64> {
    match &arg.kind {
        NodeKind::Literal(Value::Int(n)) => Some(*n),
        NodeKind::Name(name) => {
            let loop_idx = loop_idx?;
            if loop_idx == usize::MAX {
                return None;
            }
            let info = scopes.binding(scope, name)?;
            let def = info.def_stmt?;
            if def >= loop_idx {
                return None;
            }
            match facts.constant_of(scope, name) {
                Some((_, Value::Int(n))) => Some(*n),
                _ => None,
            }
        }
        _ => None,
    }
}
