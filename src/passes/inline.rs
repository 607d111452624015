//! Function call inlining.
//!
//! Calls to single-definition module functions are replaced by the
//! callee body. Two shapes are handled. A call in expression position
//! is substituted when the body is a single `return` whose evaluation
//! is provably pure and whose arguments are total, so dropping or
//! duplicating an argument cannot be observed. A bare call statement is
//! spliced in place as a renamed copy of the body, which needs no
//! purity because argument prologues evaluate exactly where the call
//! did. Every declined candidate leaves a skip record naming the unmet
//! condition.

use std::collections::{BTreeSet, HashMap, HashSet};

use smallvec::SmallVec;
use tracing::trace;

use crate::analysis::{BindingKind, Resolution, ScopeId, MODULE_SCOPE};
use crate::tree::{Node, NodeKind};
use crate::validate::scope_bindings;

use super::{next_temp_index, Pass, PassCtx, PassKind, Precondition};

pub struct Inlining;

impl Pass for Inlining {
    fn kind(&self) -> PassKind {
        PassKind::Inlining
    }

    fn run(&self, tree: &Node, ctx: &mut PassCtx<'_>) -> Option<Node> {
        let defs = module_functions(tree);
        if defs.is_empty() {
            return None;
        }
        let calls = call_graph(&defs);
        let counter = next_temp_index(tree, "__inl");
        let mut inliner = Inliner {
            ctx,
            defs,
            calls,
            counter,
            changed: false,
        };
        let rebuilt = inliner.block(tree, MODULE_SCOPE, None);
        inliner.changed.then_some(rebuilt)
    }
}

struct Inliner<'a, 'b, 't> {
    ctx: &'a mut PassCtx<'b>,
    defs: HashMap<&'t str, &'t Node>,
    /// Which module functions each module function mentions, as an
    /// over-approximation of its calls.
    calls: HashMap<&'t str, Vec<&'t str>>,
    counter: u32,
    changed: bool,
}

impl Inliner<'_, '_, '_> {
    /// `base` is `None` when `block` is a scope body, so items carry
    /// their own direct indices. Nested blocks inherit the index of the
    /// direct statement that contains them.
    fn block(&mut self, block: &Node, scope: ScopeId, base: Option<usize>) -> Node {
        let NodeKind::Block(items) = &block.kind else {
            return block.clone();
        };
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let at = base.unwrap_or(i);
            self.stmt(item, scope, at, &mut out);
        }
        Node {
            id: block.id,
            kind: NodeKind::Block(out),
            origin: block.origin,
        }
    }

    fn stmt(&mut self, node: &Node, scope: ScopeId, at: usize, out: &mut Vec<Node>) {
        match &node.kind {
            NodeKind::Call { callee, args } => {
                if let NodeKind::Name(f) = &callee.kind {
                    if self.is_candidate(scope, f) {
                        if let Some(splice) = self.stmt_inline(node, f, args, scope, at) {
                            self.changed = true;
                            out.extend(splice);
                            return;
                        }
                        // The call stays, but its arguments may still
                        // hold expression candidates.
                        let args = args.iter().map(|a| self.expr(a, scope, at)).collect();
                        out.push(Node {
                            id: node.id,
                            kind: NodeKind::Call {
                                callee: callee.clone(),
                                args,
                            },
                            origin: node.origin,
                        });
                        return;
                    }
                }
                out.push(self.expr(node, scope, at));
            }
            NodeKind::Assign { target, value } => out.push(Node {
                id: node.id,
                kind: NodeKind::Assign {
                    target: target.clone(),
                    value: Box::new(self.expr(value, scope, at)),
                },
                origin: node.origin,
            }),
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => out.push(Node {
                id: node.id,
                kind: NodeKind::If {
                    cond: Box::new(self.expr(cond, scope, at)),
                    then_branch: Box::new(self.block(then_branch, scope, Some(at))),
                    else_branch: else_branch
                        .as_ref()
                        .map(|e| Box::new(self.block(e, scope, Some(at)))),
                },
                origin: node.origin,
            }),
            NodeKind::For { var, iter, body } => out.push(Node {
                id: node.id,
                kind: NodeKind::For {
                    var: var.clone(),
                    iter: Box::new(self.expr(iter, scope, at)),
                    body: Box::new(self.block(body, scope, Some(at))),
                },
                origin: node.origin,
            }),
            NodeKind::FunctionDef { name, params, body } => {
                let rebuilt = match self.ctx.analysis.scopes.scope_of_def(node.id) {
                    Some(child) => Node {
                        id: node.id,
                        kind: NodeKind::FunctionDef {
                            name: name.clone(),
                            params: params.clone(),
                            body: Box::new(self.block(body, child, None)),
                        },
                        origin: node.origin,
                    },
                    None => node.clone(),
                };
                out.push(rebuilt);
            }
            NodeKind::Return(value) => out.push(Node {
                id: node.id,
                kind: NodeKind::Return(
                    value.as_ref().map(|e| Box::new(self.expr(e, scope, at))),
                ),
                origin: node.origin,
            }),
            NodeKind::Block(_) => out.push(self.block(node, scope, Some(at))),
            _ => out.push(self.expr(node, scope, at)),
        }
    }

    fn expr(&mut self, node: &Node, scope: ScopeId, at: usize) -> Node {
        if let NodeKind::Call { callee, args } = &node.kind {
            if let NodeKind::Name(f) = &callee.kind {
                if self.is_candidate(scope, f) {
                    if let Some(new) = self.expr_inline(node, f, args, scope, at) {
                        self.changed = true;
                        return new;
                    }
                    let args = args.iter().map(|a| self.expr(a, scope, at)).collect();
                    return Node {
                        id: node.id,
                        kind: NodeKind::Call {
                            callee: callee.clone(),
                            args,
                        },
                        origin: node.origin,
                    };
                }
            }
        }
        let kind = match &node.kind {
            NodeKind::Attribute { object, attr } => NodeKind::Attribute {
                object: Box::new(self.expr(object, scope, at)),
                attr: attr.clone(),
            },
            NodeKind::Call { callee, args } => NodeKind::Call {
                callee: Box::new(self.expr(callee, scope, at)),
                args: args.iter().map(|a| self.expr(a, scope, at)).collect(),
            },
            NodeKind::BinOp { op, lhs, rhs } => NodeKind::BinOp {
                op: *op,
                lhs: Box::new(self.expr(lhs, scope, at)),
                rhs: Box::new(self.expr(rhs, scope, at)),
            },
            _ => return node.clone(),
        };
        Node {
            id: node.id,
            kind,
            origin: node.origin,
        }
    }

    fn is_candidate(&self, scope: ScopeId, name: &str) -> bool {
        if !self.defs.contains_key(name) {
            return false;
        }
        match self.ctx.analysis.scopes.resolve(scope, name) {
            Resolution::Local(info) => scope == MODULE_SCOPE && info.kind == BindingKind::Function,
            Resolution::Module(info) => info.kind == BindingKind::Function,
            _ => false,
        }
    }

    /// Checks shared by both inline shapes. `Err` means a skip record
    /// was written.
    fn common_checks(
        &mut self,
        call: &Node,
        f: &str,
        args: &[Node],
        params: &[String],
        body: &Node,
        scope: ScopeId,
        at: usize,
    ) -> Result<(), ()> {
        if let Err(why) = self
            .ctx
            .gate
            .validate(&[Precondition::SingleModuleFunction { name: f }])
        {
            self.decline(call, why);
            return Err(());
        }
        if !self.ctx.analysis.name_is_bound_at(scope, f, at) {
            self.decline(call, format!("'{}' may be undefined at the call", f));
            return Err(());
        }
        if reaches_self(&self.calls, f) {
            self.decline(call, format!("function '{}' is recursive", f));
            return Err(());
        }
        if args.len() != params.len() {
            self.decline(call, format!("arity mismatch calling '{}'", f));
            return Err(());
        }
        if body.count() > self.ctx.config.inline_size_budget {
            self.decline(call, format!("'{}' exceeds the inlining size limit", f));
            return Err(());
        }
        Ok(())
    }

    fn expr_inline(
        &mut self,
        call: &Node,
        f: &str,
        args: &[Node],
        scope: ScopeId,
        at: usize,
    ) -> Option<Node> {
        let def = *self.defs.get(f)?;
        let NodeKind::FunctionDef { params, body, .. } = &def.kind else {
            return None;
        };
        self.common_checks(call, f, args, params, body, scope, at).ok()?;
        let Some(ret) = single_return(body) else {
            self.decline(call, format!("'{}' is not a single-return function", f));
            return None;
        };
        if scope != MODULE_SCOPE {
            let mut outer = BTreeSet::new();
            reads(ret, &mut outer);
            for n in outer {
                if params.iter().any(|p| p == n) {
                    continue;
                }
                if self.ctx.analysis.scopes.binding(scope, n).is_some() {
                    self.decline(call, format!("inlining '{}' would capture '{}'", f, n));
                    return None;
                }
            }
        }
        let mut pre = vec![
            Precondition::SingleModuleFunction { name: f },
            Precondition::PureExpr(call),
        ];
        for arg in args {
            pre.push(Precondition::TotalExpr {
                expr: arg,
                scope,
                stmt: at,
            });
        }
        let facts = match self.ctx.gate.validate(&pre) {
            Ok(facts) => facts,
            Err(why) => {
                self.decline(call, why);
                return None;
            }
        };
        let map: HashMap<&str, &Node> = params
            .iter()
            .map(String::as_str)
            .zip(args.iter())
            .collect();
        let new = self.subst(ret, &map);
        trace!(
            target: "treeopt::inline",
            call = %call.id,
            func = f,
            expr = %new.id,
            "inlined call expression"
        );
        self.ctx
            .log
            .applied(PassKind::Inlining, call.id, Some(new.id), facts);
        Some(new)
    }

    fn stmt_inline(
        &mut self,
        call: &Node,
        f: &str,
        args: &[Node],
        scope: ScopeId,
        at: usize,
    ) -> Option<Vec<Node>> {
        let def = *self.defs.get(f)?;
        let NodeKind::FunctionDef { params, body, .. } = &def.kind else {
            return None;
        };
        self.common_checks(call, f, args, params, body, scope, at).ok()?;
        if contains_function_def(body) {
            self.decline(call, format!("'{}' defines a nested function", f));
            return None;
        }
        let Ok(tail) = return_shape(body) else {
            self.decline(call, format!("'{}' returns before its final statement", f));
            return None;
        };
        let mut locals = HashSet::new();
        scope_bindings(body, &mut locals);
        let hazard: BTreeSet<String> = locals
            .iter()
            .filter(|l| !params.iter().any(|p| p == *l))
            .cloned()
            .collect();
        if let Err(n) = written_before_read(body, &hazard) {
            self.decline(
                call,
                format!("'{}' may be read before its first write in '{}'", n, f),
            );
            return None;
        }
        let mut outer = BTreeSet::new();
        reads(body, &mut outer);
        for n in outer {
            if params.iter().any(|p| p == n) || locals.contains(n) {
                continue;
            }
            if scope != MODULE_SCOPE && self.ctx.analysis.scopes.binding(scope, n).is_some() {
                self.decline(call, format!("inlining '{}' would capture '{}'", f, n));
                return None;
            }
        }
        let mut pre = vec![Precondition::SingleModuleFunction { name: f }];
        if scope == MODULE_SCOPE {
            // Spliced temporaries become module bindings, which a
            // `globals` snapshot could observe.
            pre.push(Precondition::NoIntrospection);
        }
        let facts = match self.ctx.gate.validate(&pre) {
            Ok(facts) => facts,
            Err(why) => {
                self.decline(call, why);
                return None;
            }
        };

        let k = self.counter;
        self.counter += 1;
        let mut map: HashMap<&str, String> = HashMap::new();
        for p in params {
            map.insert(p.as_str(), format!("__inl{}_{}", k, p));
        }
        for l in &hazard {
            map.insert(l.as_str(), format!("__inl{}_{}", k, l));
        }

        let mut splice = Vec::new();
        for (p, arg) in params.iter().zip(args.iter()) {
            let id = self.ctx.ids.fresh();
            splice.push(Node::derived(
                id,
                call.provenance(),
                NodeKind::Assign {
                    target: map[p.as_str()].clone(),
                    value: Box::new(arg.clone()),
                },
            ));
        }
        let NodeKind::Block(items) = &body.kind else {
            return None;
        };
        for (i, item) in items.iter().enumerate() {
            if i + 1 == items.len() {
                if let NodeKind::Return(_) = &item.kind {
                    if let Tail::Return(Some(value)) = tail {
                        let renamed = self.rename(value, &map);
                        // The returned value is discarded, but its
                        // evaluation may still be observable.
                        if !matches!(renamed.kind, NodeKind::Literal(_)) {
                            splice.push(renamed);
                        }
                    }
                    continue;
                }
            }
            splice.push(self.rename(item, &map));
        }
        trace!(
            target: "treeopt::inline",
            call = %call.id,
            func = f,
            statements = splice.len(),
            "spliced call statement"
        );
        self.ctx.log.applied(
            PassKind::Inlining,
            call.id,
            splice.first().map(|n| n.id),
            facts,
        );
        Some(splice)
    }

    /// Copy of the callee return expression with parameter reads
    /// replaced by the argument expressions, all under fresh ids.
    fn subst(&mut self, template: &Node, params: &HashMap<&str, &Node>) -> Node {
        if let NodeKind::Name(n) = &template.kind {
            if let Some(arg) = params.get(n.as_str()) {
                return arg.refresh_ids(self.ctx.ids);
            }
        }
        let kind = match &template.kind {
            NodeKind::Literal(v) => NodeKind::Literal(v.clone()),
            NodeKind::Name(n) => NodeKind::Name(n.clone()),
            NodeKind::Attribute { object, attr } => NodeKind::Attribute {
                object: Box::new(self.subst(object, params)),
                attr: attr.clone(),
            },
            NodeKind::Call { callee, args } => NodeKind::Call {
                callee: Box::new(self.subst(callee, params)),
                args: args.iter().map(|a| self.subst(a, params)).collect(),
            },
            NodeKind::BinOp { op, lhs, rhs } => NodeKind::BinOp {
                op: *op,
                lhs: Box::new(self.subst(lhs, params)),
                rhs: Box::new(self.subst(rhs, params)),
            },
            _ => return template.refresh_ids(self.ctx.ids),
        };
        Node::derived(self.ctx.ids.fresh(), template.provenance(), kind)
    }

    /// Copy of a callee body statement with locals renamed to their
    /// spliced temporaries, under fresh ids.
    fn rename(&mut self, template: &Node, map: &HashMap<&str, String>) -> Node {
        let renamed = |name: &String| map.get(name.as_str()).cloned().unwrap_or_else(|| name.clone());
        let kind = match &template.kind {
            NodeKind::Literal(v) => NodeKind::Literal(v.clone()),
            NodeKind::Name(n) => NodeKind::Name(renamed(n)),
            NodeKind::Attribute { object, attr } => NodeKind::Attribute {
                object: Box::new(self.rename(object, map)),
                attr: attr.clone(),
            },
            NodeKind::Call { callee, args } => NodeKind::Call {
                callee: Box::new(self.rename(callee, map)),
                args: args.iter().map(|a| self.rename(a, map)).collect(),
            },
            NodeKind::BinOp { op, lhs, rhs } => NodeKind::BinOp {
                op: *op,
                lhs: Box::new(self.rename(lhs, map)),
                rhs: Box::new(self.rename(rhs, map)),
            },
            NodeKind::Assign { target, value } => NodeKind::Assign {
                target: renamed(target),
                value: Box::new(self.rename(value, map)),
            },
            NodeKind::Return(value) => {
                NodeKind::Return(value.as_ref().map(|e| Box::new(self.rename(e, map))))
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => NodeKind::If {
                cond: Box::new(self.rename(cond, map)),
                then_branch: Box::new(self.rename(then_branch, map)),
                else_branch: else_branch.as_ref().map(|e| Box::new(self.rename(e, map))),
            },
            NodeKind::For { var, iter, body } => NodeKind::For {
                var: renamed(var),
                iter: Box::new(self.rename(iter, map)),
                body: Box::new(self.rename(body, map)),
            },
            NodeKind::Block(items) => {
                NodeKind::Block(items.iter().map(|s| self.rename(s, map)).collect())
            }
            NodeKind::FunctionDef { .. } => return template.refresh_ids(self.ctx.ids),
        };
        Node::derived(self.ctx.ids.fresh(), template.provenance(), kind)
    }

    fn decline(&mut self, call: &Node, why: impl Into<String>) {
        self.ctx
            .log
            .skipped(PassKind::Inlining, call.id, why, SmallVec::new());
    }
}

/// Function definitions that bind module names, wherever they sit
/// outside other function bodies.
fn module_functions(tree: &Node) -> HashMap<&str, &Node> {
    let mut defs = HashMap::new();
    collect_defs(tree, &mut defs);
    defs
}

fn collect_defs<'t>(node: &'t Node, defs: &mut HashMap<&'t str, &'t Node>) {
    match &node.kind {
        NodeKind::FunctionDef { name, .. } => {
            defs.entry(name.as_str()).or_insert(node);
        }
        NodeKind::Block(items) => {
            for item in items {
                collect_defs(item, defs);
            }
        }
        NodeKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_defs(then_branch, defs);
            if let Some(e) = else_branch {
                collect_defs(e, defs);
            }
        }
        NodeKind::For { body, .. } => collect_defs(body, defs),
        _ => {}
    }
}

fn call_graph<'t>(defs: &HashMap<&'t str, &'t Node>) -> HashMap<&'t str, Vec<&'t str>> {
    let mut graph = HashMap::new();
    for (&name, &def) in defs {
        let mut mentioned = Vec::new();
        if let NodeKind::FunctionDef { body, .. } = &def.kind {
            let mut out = BTreeSet::new();
            reads(body, &mut out);
            for read in out {
                if let Some((&k, _)) = defs.get_key_value(read) {
                    mentioned.push(k);
                }
            }
        }
        graph.insert(name, mentioned);
    }
    graph
}

fn reaches_self(graph: &HashMap<&str, Vec<&str>>, start: &str) -> bool {
    let mut stack = vec![start];
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(cur) = stack.pop() {
        for &next in graph.get(cur).into_iter().flatten() {
            if next == start {
                return true;
            }
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    false
}

/// The body as `[return expr]`, or `None` for any other shape.
fn single_return(body: &Node) -> Option<&Node> {
    let NodeKind::Block(items) = &body.kind else {
        return None;
    };
    match items.as_slice() {
        [only] => match &only.kind {
            NodeKind::Return(Some(expr)) => Some(&**expr),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum Tail<'t> {
    /// The body falls off the end.
    None,
    /// The body ends with a direct `return`.
    Return(Option<&'t Node>),
}

/// `Err` when a `return` sits anywhere but as the final direct
/// statement, which splicing cannot express.
fn return_shape(body: &Node) -> Result<Tail<'_>, ()> {
    let NodeKind::Block(items) = &body.kind else {
        return Ok(Tail::None);
    };
    let Some((last, init)) = items.split_last() else {
        return Ok(Tail::None);
    };
    if init.iter().any(contains_return) {
        return Err(());
    }
    match &last.kind {
        NodeKind::Return(value) => Ok(Tail::Return(value.as_deref())),
        _ if contains_return(last) => Err(()),
        _ => Ok(Tail::None),
    }
}

fn contains_return(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Return(_) => true,
        NodeKind::Block(items) => items.iter().any(contains_return),
        NodeKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            contains_return(then_branch)
                || else_branch.as_deref().map_or(false, contains_return)
        }
        NodeKind::For { body, .. } => contains_return(body),
        _ => false,
    }
}

fn contains_function_def(node: &Node) -> bool {
    let mut found = false;
    node.visit(&mut |n| {
        if matches!(n.kind, NodeKind::FunctionDef { .. }) {
            found = true;
        }
    });
    found
}

/// Every `Name` read under the node. Binders are plain strings in their
/// parents and do not show up.
fn reads<'t>(node: &'t Node, out: &mut BTreeSet<&'t str>) {
    match &node.kind {
        NodeKind::Name(n) => {
            out.insert(n.as_str());
        }
        NodeKind::Attribute { object, .. } => reads(object, out),
        NodeKind::Call { callee, args } => {
            reads(callee, out);
            for arg in args {
                reads(arg, out);
            }
        }
        NodeKind::BinOp { lhs, rhs, .. } => {
            reads(lhs, out);
            reads(rhs, out);
        }
        NodeKind::Assign { value, .. } => reads(value, out),
        NodeKind::Return(value) => {
            if let Some(e) = value {
                reads(e, out);
            }
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            reads(cond, out);
            reads(then_branch, out);
            if let Some(e) = else_branch {
                reads(e, out);
            }
        }
        NodeKind::For { iter, body, .. } => {
            reads(iter, out);
            reads(body, out);
        }
        NodeKind::Block(items) => {
            for item in items {
                reads(item, out);
            }
        }
        NodeKind::FunctionDef { .. } | NodeKind::Literal(_) => {}
    }
}

/// Definite-assignment walk over the callee body. A read of a name in
/// `hazard` before its first certain write would have reached the
/// module binding at the original call, which uniform renaming breaks.
fn written_before_read<'h>(
    body: &Node,
    hazard: &'h BTreeSet<String>,
) -> Result<(), &'h str> {
    let mut bound = HashSet::new();
    wbr_block(body, hazard, &mut bound)
}

fn wbr_block<'h>(
    block: &Node,
    hazard: &'h BTreeSet<String>,
    bound: &mut HashSet<String>,
) -> Result<(), &'h str> {
    if let NodeKind::Block(items) = &block.kind {
        for item in items {
            wbr_stmt(item, hazard, bound)?;
        }
    }
    Ok(())
}

fn wbr_stmt<'h>(
    stmt: &Node,
    hazard: &'h BTreeSet<String>,
    bound: &mut HashSet<String>,
) -> Result<(), &'h str> {
    match &stmt.kind {
        NodeKind::Assign { target, value } => {
            wbr_expr(value, hazard, bound)?;
            bound.insert(target.clone());
            Ok(())
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            wbr_expr(cond, hazard, bound)?;
            let mut then_bound = bound.clone();
            wbr_block(then_branch, hazard, &mut then_bound)?;
            match else_branch {
                Some(e) => {
                    let mut else_bound = bound.clone();
                    wbr_block(e, hazard, &mut else_bound)?;
                    *bound = then_bound
                        .intersection(&else_bound)
                        .cloned()
                        .collect();
                }
                // A missing else may skip the branch entirely.
                None => {}
            }
            Ok(())
        }
        NodeKind::For { var, iter, body } => {
            wbr_expr(iter, hazard, bound)?;
            let mut body_bound = bound.clone();
            body_bound.insert(var.clone());
            wbr_block(body, hazard, &mut body_bound)?;
            // A zero-trip loop binds nothing.
            Ok(())
        }
        NodeKind::Return(value) => value
            .as_deref()
            .map_or(Ok(()), |e| wbr_expr(e, hazard, bound)),
        NodeKind::Block(_) => wbr_block(stmt, hazard, bound),
        NodeKind::FunctionDef { .. } => Ok(()),
        _ => wbr_expr(stmt, hazard, bound),
    }
}

fn wbr_expr<'h>(
    expr: &Node,
    hazard: &'h BTreeSet<String>,
    bound: &HashSet<String>,
) -> Result<(), &'h str> {
    match &expr.kind {
        NodeKind::Name(n) => match hazard.get(n) {
            Some(name) if !bound.contains(n) => Err(name.as_str()),
            _ => Ok(()),
        },
        NodeKind::Attribute { object, .. } => wbr_expr(object, hazard, bound),
        NodeKind::Call { callee, args } => {
            wbr_expr(callee, hazard, bound)?;
            for arg in args {
                wbr_expr(arg, hazard, bound)?;
            }
            Ok(())
        }
        NodeKind::BinOp { lhs, rhs, .. } => {
            wbr_expr(lhs, hazard, bound)?;
            wbr_expr(rhs, hazard, bound)
        }
        _ => Ok(()),
    }
}
