//! Constant detection for single-assignment bindings.
//!
//! Only direct, literal assignments produce facts here. Chains of
//! constants resolve through the folding pass instead, which reruns
//! under a fresh analysis every pipeline iteration, so transitive
//! constants surface one iteration later without any ordering hazards.

use tracing::trace;

use crate::tree::{Node, NodeKind};

use super::bindings::{walk_scope_statements, BindingKind, ScopeMap};
use super::facts::{FactBase, FactKind, FactSubject};

pub(super) fn infer(tree: &Node, scopes: &ScopeMap, facts: &mut FactBase) {
    walk_scope_statements(tree, scopes, &mut |scope, idx, stmt| {
        let NodeKind::Assign { target, value } = &stmt.kind else {
            return;
        };
        let Some(info) = scopes.binding(scope, target) else {
            return;
        };
        if info.kind != BindingKind::Assigned || info.assigns != 1 || info.def_stmt != Some(idx) {
            return;
        }
        let Some(v) = value.literal() else {
            return;
        };
        let subject = FactSubject::Binding {
            scope,
            name: target.clone(),
        };
        let id = facts.add(subject.clone(), FactKind::ConstantValue(v.clone()));
        facts.add(subject, FactKind::TypeKnown(v.type_name()));
        trace!(target: "treeopt::analysis", fact = %facts.get(id), "constant binding");
    });
}
