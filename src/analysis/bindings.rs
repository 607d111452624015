//! Scope and binding analysis.
//!
//! The language has a two-level scope chain: one module scope and one
//! scope per function definition. This pass maps every binding to its
//! scope, counts assignments and resolved reads, and records the facts
//! the rewrite preconditions lean on: where a binding's sole definition
//! sits, whether the unit uses introspection builtins, and the first
//! module statement after which user code may have run.

use std::collections::{BTreeSet, HashMap};

use crate::builtins;
use crate::tree::{Node, NodeId, NodeKind};

use super::facts::{ScopeId, MODULE_SCOPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindingKind {
    #[default]
    Assigned,
    Param,
    LoopVar,
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindingInfo {
    /// Times the name is bound in this scope, counting parameters, loop
    /// variables and function definitions along with assignments.
    pub assigns: u32,
    /// Reads that resolve to this binding, from any scope.
    pub reads: u32,
    /// Kind of the first binder seen for this name.
    pub kind: BindingKind,
    /// Index of the sole defining statement, an assignment or function
    /// definition, when it is a direct statement of the scope body.
    /// `None` for multiple or nested definitions and for loop variables,
    /// which are unbound after a zero-trip loop.
    pub def_stmt: Option<usize>,
}

#[derive(Debug)]
pub struct ScopeInfo {
    pub id: ScopeId,
    /// `<module>` or the function name.
    pub name: String,
    pub bindings: HashMap<String, BindingInfo>,
}

impl ScopeInfo {
    pub fn binding(&self, name: &str) -> Option<&BindingInfo> {
        self.bindings.get(name)
    }
}

/// Where a read resolves, following the frame-then-module chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<'a> {
    Local(&'a BindingInfo),
    Module(&'a BindingInfo),
    Builtin(&'static str),
    Unbound,
}

#[derive(Debug)]
pub struct ScopeMap {
    scopes: Vec<ScopeInfo>,
    def_scopes: HashMap<NodeId, ScopeId>,
    /// True when any read reaches `getattr` or `globals`. Passes that
    /// depend on complete read-set knowledge stand down for the unit.
    pub uses_introspection: bool,
    /// First direct module statement containing a call, loop or branch.
    /// Before this point no user function can have executed.
    pub module_effect_boundary: Option<usize>,
    /// Reads that resolve to neither a binding nor a builtin.
    pub unresolved: BTreeSet<String>,
}

impl ScopeMap {
    pub fn build(tree: &Node) -> ScopeMap {
        let mut map = ScopeMap {
            scopes: vec![ScopeInfo {
                id: MODULE_SCOPE,
                name: "<module>".to_string(),
                bindings: HashMap::new(),
            }],
            def_scopes: HashMap::new(),
            uses_introspection: false,
            module_effect_boundary: None,
            unresolved: BTreeSet::new(),
        };
        map.collect_scope_body(MODULE_SCOPE, tree);
        if let NodeKind::Block(items) = &tree.kind {
            for (i, item) in items.iter().enumerate() {
                if map.module_effect_boundary.is_none() && contains_effect_carrier(item) {
                    map.module_effect_boundary = Some(i);
                }
            }
        }
        map.count_reads(MODULE_SCOPE, tree);
        map
    }

    pub fn module(&self) -> &ScopeInfo {
        &self.scopes[0]
    }

    pub fn scopes(&self) -> impl Iterator<Item = &ScopeInfo> {
        self.scopes.iter()
    }

    pub fn get(&self, id: ScopeId) -> &ScopeInfo {
        &self.scopes[id.0 as usize]
    }

    /// The scope introduced by a `FunctionDef` node.
    pub fn scope_of_def(&self, def: NodeId) -> Option<ScopeId> {
        self.def_scopes.get(&def).copied()
    }

    pub fn binding(&self, scope: ScopeId, name: &str) -> Option<&BindingInfo> {
        self.scopes[scope.0 as usize].bindings.get(name)
    }

    pub fn resolve(&self, scope: ScopeId, name: &str) -> Resolution<'_> {
        if let Some(info) = self.scopes[scope.0 as usize].bindings.get(name) {
            return Resolution::Local(info);
        }
        if scope != MODULE_SCOPE {
            if let Some(info) = self.scopes[0].bindings.get(name) {
                return Resolution::Module(info);
            }
        }
        match builtins::builtin_name(name) {
            Some(b) => Resolution::Builtin(b),
            None => Resolution::Unbound,
        }
    }

    fn bind(&mut self, scope: ScopeId, name: &str, kind: BindingKind, direct: Option<usize>) {
        let info = self.scopes[scope.0 as usize]
            .bindings
            .entry(name.to_string())
            .or_default();
        if info.assigns == 0 {
            info.kind = kind;
            info.def_stmt = match kind {
                BindingKind::Assigned | BindingKind::Function => direct,
                _ => None,
            };
        } else {
            info.def_stmt = None;
        }
        info.assigns += 1;
    }

    /// Binding pass over one scope body. `node` is the body block on the
    /// first call; recursion keeps the scope but drops direct indices.
    fn collect_scope_body(&mut self, scope: ScopeId, body: &Node) {
        if let NodeKind::Block(items) = &body.kind {
            for (i, item) in items.iter().enumerate() {
                self.collect_stmt(scope, item, Some(i));
            }
        }
    }

    fn collect_stmt(&mut self, scope: ScopeId, node: &Node, direct: Option<usize>) {
        match &node.kind {
            NodeKind::Assign { target, .. } => {
                self.bind(scope, target, BindingKind::Assigned, direct);
            }
            NodeKind::For { var, body, .. } => {
                self.bind(scope, var, BindingKind::LoopVar, None);
                self.collect_nested(scope, body);
            }
            NodeKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                self.collect_nested(scope, then_branch);
                if let Some(e) = else_branch {
                    self.collect_nested(scope, e);
                }
            }
            NodeKind::FunctionDef { name, params, body } => {
                self.bind(scope, name, BindingKind::Function, direct);
                let child = ScopeId(self.scopes.len() as u32);
                self.scopes.push(ScopeInfo {
                    id: child,
                    name: name.clone(),
                    bindings: HashMap::new(),
                });
                self.def_scopes.insert(node.id, child);
                for p in params {
                    self.bind(child, p, BindingKind::Param, None);
                }
                self.collect_scope_body(child, body);
            }
            NodeKind::Block(_) => self.collect_nested(scope, node),
            _ => {}
        }
    }

    fn collect_nested(&mut self, scope: ScopeId, block: &Node) {
        if let NodeKind::Block(items) = &block.kind {
            for item in items {
                self.collect_stmt(scope, item, None);
            }
        }
    }

    /// Read pass: every `Name` node is a read; binders are plain strings
    /// in their parent nodes and never show up here.
    fn count_reads(&mut self, scope: ScopeId, node: &Node) {
        match &node.kind {
            NodeKind::Name(name) => self.record_read(scope, name),
            NodeKind::FunctionDef { body, .. } => {
                let child = self.def_scopes[&node.id];
                self.count_reads(child, body);
            }
            NodeKind::Attribute { object, .. } => self.count_reads(scope, object),
            NodeKind::Call { callee, args } => {
                self.count_reads(scope, callee);
                for arg in args {
                    self.count_reads(scope, arg);
                }
            }
            NodeKind::BinOp { lhs, rhs, .. } => {
                self.count_reads(scope, lhs);
                self.count_reads(scope, rhs);
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.count_reads(scope, cond);
                self.count_reads(scope, then_branch);
                if let Some(e) = else_branch {
                    self.count_reads(scope, e);
                }
            }
            NodeKind::For { iter, body, .. } => {
                self.count_reads(scope, iter);
                self.count_reads(scope, body);
            }
            NodeKind::Assign { value, .. } => self.count_reads(scope, value),
            NodeKind::Return(Some(v)) => self.count_reads(scope, v),
            NodeKind::Block(items) => {
                for item in items {
                    self.count_reads(scope, item);
                }
            }
            _ => {}
        }
    }

    fn record_read(&mut self, scope: ScopeId, name: &str) {
        let idx = scope.0 as usize;
        if self.scopes[idx].bindings.contains_key(name) {
            let info = self.scopes[idx].bindings.get_mut(name).unwrap();
            info.reads += 1;
            return;
        }
        if scope != MODULE_SCOPE && self.scopes[0].bindings.contains_key(name) {
            let info = self.scopes[0].bindings.get_mut(name).unwrap();
            info.reads += 1;
            return;
        }
        match builtins::builtin_name(name) {
            Some(b) => {
                if builtins::is_introspection_builtin(b) {
                    self.uses_introspection = true;
                }
            }
            None => {
                self.unresolved.insert(name.to_string());
            }
        }
    }
}

/// Function bodies are inert until called, so they never carry the
/// effect boundary forward on their own.
fn contains_effect_carrier(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Call { .. } | NodeKind::For { .. } | NodeKind::If { .. } => true,
        NodeKind::FunctionDef { .. } => false,
        NodeKind::Block(items) => items.iter().any(contains_effect_carrier),
        NodeKind::Assign { value, .. } => contains_effect_carrier(value),
        NodeKind::Return(Some(v)) => contains_effect_carrier(v),
        NodeKind::BinOp { lhs, rhs, .. } => {
            contains_effect_carrier(lhs) || contains_effect_carrier(rhs)
        }
        NodeKind::Attribute { object, .. } => contains_effect_carrier(object),
        _ => false,
    }
}

/// Visit every direct statement of every scope body with its scope and
/// statement index. Used by the fact-producing passes that need ordered
/// positions.
pub(crate) fn walk_scope_statements(
    tree: &Node,
    map: &ScopeMap,
    f: &mut impl FnMut(ScopeId, usize, &Node),
) {
    walk_body(MODULE_SCOPE, tree, map, f);
}

fn walk_body(
    scope: ScopeId,
    body: &Node,
    map: &ScopeMap,
    f: &mut impl FnMut(ScopeId, usize, &Node),
) {
    if let NodeKind::Block(items) = &body.kind {
        for (i, item) in items.iter().enumerate() {
            f(scope, i, item);
            descend(scope, item, map, f);
        }
    }
}

fn descend(scope: ScopeId, node: &Node, map: &ScopeMap, f: &mut impl FnMut(ScopeId, usize, &Node)) {
    match &node.kind {
        NodeKind::FunctionDef { body, .. } => {
            if let Some(child) = map.scope_of_def(node.id) {
                walk_body(child, body, map, f);
            }
        }
        NodeKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            descend_block(scope, then_branch, map, f);
            if let Some(e) = else_branch {
                descend_block(scope, e, map, f);
            }
        }
        NodeKind::For { body, .. } => descend_block(scope, body, map, f),
        NodeKind::Block(_) => descend_block(scope, node, map, f),
        _ => {}
    }
}

fn descend_block(
    scope: ScopeId,
    block: &Node,
    map: &ScopeMap,
    f: &mut impl FnMut(ScopeId, usize, &Node),
) {
    if let NodeKind::Block(items) = &block.kind {
        for item in items {
            descend(scope, item, map, f);
        }
    }
}
