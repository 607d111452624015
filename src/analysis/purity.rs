//! Purity inference.
//!
//! Attribute reads are treated as pure. Calls are pure when the callee
//! is a pure builtin, a string method, or a user function whose body is
//! itself pure. User-function purity is a fixpoint that starts from
//! "impure" and promotes, so recursive and mutually recursive functions
//! stay impure and every promotion is justified.

use std::collections::HashMap;

use tracing::trace;

use crate::builtins;
use crate::tree::{Node, NodeKind};

use super::bindings::{BindingKind, Resolution, ScopeMap};
use super::facts::{FactBase, FactKind, FactSubject, ScopeId, MODULE_SCOPE};

type FnKey = (ScopeId, String);

struct FnDef<'t> {
    body: &'t Node,
    scope: ScopeId,
}

pub(super) fn infer(tree: &Node, scopes: &ScopeMap, facts: &mut FactBase) {
    let mut defs: HashMap<FnKey, FnDef<'_>> = HashMap::new();
    collect_defs(tree, MODULE_SCOPE, scopes, &mut defs);

    let mut pure: HashMap<FnKey, bool> = defs.keys().map(|k| (k.clone(), false)).collect();
    loop {
        let mut changed = false;
        for (key, def) in &defs {
            if !pure[key] && body_is_pure(def.body, def.scope, scopes, &pure) {
                pure.insert(key.clone(), true);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    let promoted = pure.values().filter(|&&p| p).count();
    trace!(target: "treeopt::analysis", functions = defs.len(), pure = promoted, "purity fixpoint");

    annotate(tree, MODULE_SCOPE, scopes, &pure, facts);
}

/// Every single-definition function binding, keyed by where the name is
/// bound.
fn collect_defs<'t>(
    node: &'t Node,
    scope: ScopeId,
    scopes: &ScopeMap,
    out: &mut HashMap<FnKey, FnDef<'t>>,
) {
    match &node.kind {
        NodeKind::FunctionDef { name, body, .. } => {
            let child = match scopes.scope_of_def(node.id) {
                Some(c) => c,
                None => return,
            };
            if let Some(info) = scopes.binding(scope, name) {
                if info.kind == BindingKind::Function && info.assigns == 1 {
                    out.insert(
                        (scope, name.clone()),
                        FnDef {
                            body,
                            scope: child,
                        },
                    );
                }
            }
            collect_defs(body, child, scopes, out);
        }
        NodeKind::Block(items) => {
            for item in items {
                collect_defs(item, scope, scopes, out);
            }
        }
        NodeKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_defs(then_branch, scope, scopes, out);
            if let Some(e) = else_branch {
                collect_defs(e, scope, scopes, out);
            }
        }
        NodeKind::For { body, .. } => collect_defs(body, scope, scopes, out),
        _ => {}
    }
}

fn callee_is_pure(
    callee: &Node,
    scope: ScopeId,
    scopes: &ScopeMap,
    pure: &HashMap<FnKey, bool>,
) -> bool {
    match &callee.kind {
        NodeKind::Name(name) => match scopes.resolve(scope, name) {
            Resolution::Builtin(b) => builtins::is_pure_builtin(b),
            Resolution::Local(info) => {
                info.kind == BindingKind::Function
                    && info.assigns == 1
                    && pure.get(&(scope, name.clone())).copied().unwrap_or(false)
            }
            Resolution::Module(info) => {
                info.kind == BindingKind::Function
                    && info.assigns == 1
                    && pure
                        .get(&(MODULE_SCOPE, name.clone()))
                        .copied()
                        .unwrap_or(false)
            }
            Resolution::Unbound => false,
        },
        NodeKind::Attribute { attr, .. } => builtins::is_str_method(attr),
        _ => false,
    }
}

/// True when no call in the body (nested function bodies excluded; they
/// run only when called) can have a side effect. Raising is not an
/// effect; totality is checked separately by the passes that need it.
fn body_is_pure(
    node: &Node,
    scope: ScopeId,
    scopes: &ScopeMap,
    pure: &HashMap<FnKey, bool>,
) -> bool {
    match &node.kind {
        NodeKind::Call { callee, args } => {
            callee_is_pure(callee, scope, scopes, pure)
                && callee_operand_is_pure(callee, scope, scopes, pure)
                && args.iter().all(|a| body_is_pure(a, scope, scopes, pure))
        }
        NodeKind::FunctionDef { .. } => true,
        NodeKind::Block(items) => items.iter().all(|i| body_is_pure(i, scope, scopes, pure)),
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            body_is_pure(cond, scope, scopes, pure)
                && body_is_pure(then_branch, scope, scopes, pure)
                && else_branch
                    .as_ref()
                    .map_or(true, |e| body_is_pure(e, scope, scopes, pure))
        }
        NodeKind::For { iter, body, .. } => {
            body_is_pure(iter, scope, scopes, pure) && body_is_pure(body, scope, scopes, pure)
        }
        NodeKind::Assign { value, .. } => body_is_pure(value, scope, scopes, pure),
        NodeKind::Return(Some(v)) => body_is_pure(v, scope, scopes, pure),
        NodeKind::BinOp { lhs, rhs, .. } => {
            body_is_pure(lhs, scope, scopes, pure) && body_is_pure(rhs, scope, scopes, pure)
        }
        NodeKind::Attribute { object, .. } => body_is_pure(object, scope, scopes, pure),
        _ => true,
    }
}

/// The receiver expression of a method callee still needs its own calls
/// checked; a bare `Name` callee has nothing inside it.
fn callee_operand_is_pure(
    callee: &Node,
    scope: ScopeId,
    scopes: &ScopeMap,
    pure: &HashMap<FnKey, bool>,
) -> bool {
    match &callee.kind {
        NodeKind::Attribute { object, .. } => body_is_pure(object, scope, scopes, pure),
        _ => true,
    }
}

fn annotate(
    node: &Node,
    scope: ScopeId,
    scopes: &ScopeMap,
    pure: &HashMap<FnKey, bool>,
    facts: &mut FactBase,
) {
    match &node.kind {
        NodeKind::Attribute { object, .. } => {
            // Attribute reads are pure by definition in this language.
            facts.add(FactSubject::Node(node.id), FactKind::Pure);
            annotate(object, scope, scopes, pure, facts);
        }
        NodeKind::Call { callee, args } => {
            if callee_is_pure(callee, scope, scopes, pure) {
                facts.add(FactSubject::Node(node.id), FactKind::Pure);
            }
            annotate(callee, scope, scopes, pure, facts);
            for arg in args {
                annotate(arg, scope, scopes, pure, facts);
            }
        }
        NodeKind::FunctionDef { body, .. } => {
            if let Some(child) = scopes.scope_of_def(node.id) {
                annotate(body, child, scopes, pure, facts);
            }
        }
        NodeKind::Block(items) => {
            for item in items {
                annotate(item, scope, scopes, pure, facts);
            }
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            annotate(cond, scope, scopes, pure, facts);
            annotate(then_branch, scope, scopes, pure, facts);
            if let Some(e) = else_branch {
                annotate(e, scope, scopes, pure, facts);
            }
        }
        NodeKind::For { iter, body, .. } => {
            annotate(iter, scope, scopes, pure, facts);
            annotate(body, scope, scopes, pure, facts);
        }
        NodeKind::Assign { value, .. } => annotate(value, scope, scopes, pure, facts),
        NodeKind::Return(Some(v)) => annotate(v, scope, scopes, pure, facts),
        NodeKind::BinOp { lhs, rhs, .. } => {
            annotate(lhs, scope, scopes, pure, facts);
            annotate(rhs, scope, scopes, pure, facts);
        }
        _ => {}
    }
}
