//! Loop-invariant hoisting.
//!
//! Pure attribute lookups and calls that read nothing the loop binds
//! are computed once before the loop and replaced by a temporary.
//! Candidates come only from the unconditional prefix of the body, in
//! evaluation order: past the first subexpression that may have an
//! effect or raise, first-iteration behavior could no longer be
//! preserved. The loop must provably run at least once, otherwise the
//! hoisted evaluation itself would be new behavior. A candidate that
//! reads object attributes is declined whenever the body can reach an
//! attribute store: such a lookup may change value between iterations
//! even though no name it mentions is reassigned.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use tracing::trace;

use crate::analysis::{FactId, Resolution, ScopeId, MODULE_SCOPE};
use crate::tree::{BinOpKind, Node, NodeId, NodeKind, Value};

use super::{next_temp_index, Pass, PassCtx, PassKind, Precondition};

pub struct InvariantHoisting;

impl Pass for InvariantHoisting {
    fn kind(&self) -> PassKind {
        PassKind::InvariantHoisting
    }

    fn run(&self, tree: &Node, ctx: &mut PassCtx<'_>) -> Option<Node> {
        let counter = next_temp_index(tree, "__h");
        let mut hoister = Hoister {
            ctx,
            counter,
            changed: false,
        };
        let rebuilt = hoister.block(tree, MODULE_SCOPE, None);
        hoister.changed.then_some(rebuilt)
    }
}

/// One hoistable expression with every body occurrence of its shape.
struct Candidate<'x> {
    node: &'x Node,
    occurrences: Vec<NodeId>,
}

/// Context for the candidate scan over one loop body.
struct Scan<'s> {
    var: &'s str,
    loop_bound: &'s HashSet<String>,
    scope: ScopeId,
    at: usize,
}

struct Hoister<'a, 'b> {
    ctx: &'a mut PassCtx<'b>,
    counter: u32,
    changed: bool,
}

impl Hoister<'_, '_> {
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
            NodeKind::For { var, iter, body } => {
                if let Some(splice) = self.try_hoist(node, var, iter, body, scope, at) {
                    self.changed = true;
                    out.extend(splice);
                    return;
                }
                out.push(Node {
                    id: node.id,
                    kind: NodeKind::For {
                        var: var.clone(),
                        iter: iter.clone(),
                        body: Box::new(self.block(body, scope, Some(at))),
                    },
                    origin: node.origin,
                });
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => out.push(Node {
                id: node.id,
                kind: NodeKind::If {
                    cond: cond.clone(),
                    then_branch: Box::new(self.block(then_branch, scope, Some(at))),
                    else_branch: else_branch
                        .as_ref()
                        .map(|e| Box::new(self.block(e, scope, Some(at)))),
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
            NodeKind::Block(_) => out.push(self.block(node, scope, Some(at))),
            _ => out.push(node.clone()),
        }
    }

    fn try_hoist(
        &mut self,
        for_node: &Node,
        var: &str,
        iter: &Node,
        body: &Node,
        scope: ScopeId,
        at: usize,
    ) -> Option<Vec<Node>> {
        let mut loop_bound = body.bound_names();
        loop_bound.insert(var.to_string());
        let scan = Scan {
            var,
            loop_bound: &loop_bound,
            scope,
            at,
        };

        let mut candidates = Vec::new();
        self.scan_block(body, &scan, &mut candidates);
        if candidates.is_empty() {
            return None;
        }

        let mut loop_pre = Vec::new();
        let mut base_evidence: SmallVec<[FactId; 4]> = SmallVec::new();
        if self.ctx.analysis.facts.range_of(scope, var).is_some() {
            loop_pre.push(Precondition::LoopBounds { scope, var });
        } else {
            match self.list_trips(iter, scope, at) {
                Some((trips, evidence)) if trips > 0 => base_evidence = evidence,
                _ => {
                    for cand in &candidates {
                        self.decline(cand.node.id, "the loop may run zero times");
                    }
                    return None;
                }
            }
        }
        if scope == MODULE_SCOPE {
            // Hoisted temporaries become module bindings, which a
            // `globals` snapshot could observe.
            loop_pre.push(Precondition::NoIntrospection);
        }

        let stores = self.may_store_attributes(body, scope);
        let mut prologue = Vec::new();
        let mut replace: HashMap<NodeId, String> = HashMap::new();
        for cand in &candidates {
            if stores && self.reads_attributes(cand.node, scope) {
                self.decline(cand.node.id, "an attribute may be stored during the loop");
                continue;
            }
            let mut pre = vec![Precondition::PureExpr(cand.node)];
            pre.extend_from_slice(&loop_pre);
            let mut facts = match self.ctx.gate.validate(&pre) {
                Ok(facts) => facts,
                Err(why) => {
                    self.decline(cand.node.id, why);
                    continue;
                }
            };
            facts.extend(base_evidence.iter().copied());
            let temp = format!("__h{}", self.counter);
            self.counter += 1;
            let assign = Node::derived(
                self.ctx.ids.fresh(),
                cand.node.provenance(),
                NodeKind::Assign {
                    target: temp.clone(),
                    value: Box::new(cand.node.clone()),
                },
            );
            trace!(
                target: "treeopt::hoist",
                node = %cand.node.id,
                temp = %temp,
                occurrences = cand.occurrences.len(),
                "hoisted invariant expression"
            );
            self.ctx.log.applied(
                PassKind::InvariantHoisting,
                cand.node.id,
                Some(assign.id),
                facts,
            );
            prologue.push(assign);
            for occ in &cand.occurrences {
                replace.insert(*occ, temp.clone());
            }
        }
        if prologue.is_empty() {
            return None;
        }

        let new_body = self.replace(body, &replace);
        let mut out = prologue;
        out.push(Node {
            id: for_node.id,
            kind: NodeKind::For {
                var: var.to_string(),
                iter: Box::new(iter.clone()),
                body: Box::new(new_body),
            },
            origin: for_node.origin,
        });
        Some(out)
    }

    /// Trip count of a list iterable, with the constant fact that
    /// proves it when the list comes through a binding.
    fn list_trips(
        &self,
        iter: &Node,
        scope: ScopeId,
        at: usize,
    ) -> Option<(usize, SmallVec<[FactId; 4]>)> {
        match &iter.kind {
            NodeKind::Literal(Value::List(items)) => Some((items.len(), SmallVec::new())),
            NodeKind::Name(name) => {
                let (fact, value) = self.ctx.analysis.constant_at(scope, name, at)?;
                match value {
                    Value::List(items) => {
                        let mut evidence = SmallVec::new();
                        evidence.push(fact);
                        Some((items.len(), evidence))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Whether executing this subtree could store an object attribute.
    /// Counted stores are `setattr` reached by name and calls to named
    /// callables without purity evidence. A callee read out of an
    /// attribute is judged by the same name-based rules the purity
    /// analysis applies, so it does not count. Defining a nested
    /// function runs nothing, so its body is skipped.
    fn may_store_attributes(&self, node: &Node, scope: ScopeId) -> bool {
        match &node.kind {
            NodeKind::Literal(_) | NodeKind::Name(_) | NodeKind::FunctionDef { .. } => false,
            NodeKind::Attribute { object, .. } => self.may_store_attributes(object, scope),
            NodeKind::Call { callee, args } => {
                let storing = match &callee.kind {
                    NodeKind::Name(n) => match self.ctx.analysis.scopes.resolve(scope, n) {
                        Resolution::Builtin(b) => b == "setattr",
                        // A call tree with purity evidence cannot store.
                        _ => self.ctx.analysis.expr_purity(node).is_none(),
                    },
                    NodeKind::Attribute { .. } => false,
                    _ => true,
                };
                storing
                    || self.may_store_attributes(callee, scope)
                    || args.iter().any(|a| self.may_store_attributes(a, scope))
            }
            NodeKind::BinOp { lhs, rhs, .. } => {
                self.may_store_attributes(lhs, scope) || self.may_store_attributes(rhs, scope)
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.may_store_attributes(cond, scope)
                    || self.may_store_attributes(then_branch, scope)
                    || else_branch
                        .as_deref()
                        .map_or(false, |e| self.may_store_attributes(e, scope))
            }
            NodeKind::For { iter, body, .. } => {
                self.may_store_attributes(iter, scope) || self.may_store_attributes(body, scope)
            }
            NodeKind::Assign { value, .. } => self.may_store_attributes(value, scope),
            NodeKind::Return(value) => value
                .as_deref()
                .map_or(false, |e| self.may_store_attributes(e, scope)),
            NodeKind::Block(items) => items.iter().any(|i| self.may_store_attributes(i, scope)),
        }
    }

    /// Whether evaluating this expression could read an object
    /// attribute, directly or through a called function. Binding a
    /// method on a string literal does not count: the receiver cannot
    /// be mutated.
    fn reads_attributes(&self, node: &Node, scope: ScopeId) -> bool {
        match &node.kind {
            NodeKind::Attribute { object, .. } => {
                !matches!(object.kind, NodeKind::Literal(Value::Str(_)))
            }
            NodeKind::Call { callee, args } => {
                let through_callee = match &callee.kind {
                    NodeKind::Name(n) => !matches!(
                        self.ctx.analysis.scopes.resolve(scope, n),
                        Resolution::Builtin(_)
                    ),
                    _ => self.reads_attributes(callee, scope),
                };
                through_callee || args.iter().any(|a| self.reads_attributes(a, scope))
            }
            NodeKind::BinOp { lhs, rhs, .. } => {
                self.reads_attributes(lhs, scope) || self.reads_attributes(rhs, scope)
            }
            _ => false,
        }
    }

    /// Walk the unconditional prefix of a body in evaluation order.
    /// Returns whether execution is certain to continue cleanly past
    /// this statement.
    fn scan_block<'x>(
        &self,
        block: &'x Node,
        scan: &Scan<'_>,
        cands: &mut Vec<Candidate<'x>>,
    ) -> bool {
        let NodeKind::Block(items) = &block.kind else {
            return false;
        };
        for item in items {
            if !self.scan_stmt(item, scan, cands) {
                return false;
            }
        }
        true
    }

    fn scan_stmt<'x>(
        &self,
        node: &'x Node,
        scan: &Scan<'_>,
        cands: &mut Vec<Candidate<'x>>,
    ) -> bool {
        match &node.kind {
            NodeKind::Assign { value, .. } => self.scan_expr(value, scan, cands),
            NodeKind::If { cond, .. } => {
                self.scan_expr(cond, scan, cands);
                false
            }
            NodeKind::For { iter, .. } => {
                // The nested iterable re-evaluates every iteration; the
                // nested body is conditional on its trip count.
                self.scan_expr(iter, scan, cands);
                false
            }
            NodeKind::Return(value) => {
                if let Some(e) = value {
                    self.scan_expr(e, scan, cands);
                }
                false
            }
            NodeKind::FunctionDef { .. } => true,
            NodeKind::Block(_) => self.scan_block(node, scan, cands),
            _ => self.scan_expr(node, scan, cands),
        }
    }

    fn scan_expr<'x>(
        &self,
        node: &'x Node,
        scan: &Scan<'_>,
        cands: &mut Vec<Candidate<'x>>,
    ) -> bool {
        if self.is_candidate(node, scan.loop_bound) {
            match cands.iter_mut().find(|c| c.node.same_shape(node)) {
                Some(c) => c.occurrences.push(node.id),
                None => cands.push(Candidate {
                    node,
                    occurrences: vec![node.id],
                }),
            }
            return true;
        }
        match &node.kind {
            NodeKind::Literal(_) => true,
            // The loop variable is always bound inside the body, which
            // the position-based query cannot see.
            NodeKind::Name(n) if n == scan.var => true,
            NodeKind::Name(_) => self.ctx.analysis.expr_is_total(node, scan.scope, scan.at),
            NodeKind::Attribute { object, .. } => {
                self.scan_expr(object, scan, cands);
                false
            }
            NodeKind::Call { callee, args } => {
                if self.scan_expr(callee, scan, cands) {
                    for arg in args {
                        if !self.scan_expr(arg, scan, cands) {
                            break;
                        }
                    }
                }
                false
            }
            NodeKind::BinOp { op, lhs, rhs } => {
                let clean =
                    self.scan_expr(lhs, scan, cands) && self.scan_expr(rhs, scan, cands);
                clean
                    && matches!(
                        op,
                        BinOpKind::Eq | BinOpKind::Ne | BinOpKind::And | BinOpKind::Or
                    )
            }
            _ => false,
        }
    }

    fn is_candidate(&self, node: &Node, loop_bound: &HashSet<String>) -> bool {
        matches!(
            node.kind,
            NodeKind::Attribute { .. } | NodeKind::Call { .. }
        ) && loop_bound.iter().all(|b| node.reads_of(b) == 0)
            && self.ctx.analysis.expr_purity(node).is_some()
    }

    /// Body copy with hoisted occurrences replaced by their temporary.
    fn replace(&mut self, node: &Node, map: &HashMap<NodeId, String>) -> Node {
        if let Some(temp) = map.get(&node.id) {
            return Node::derived(
                self.ctx.ids.fresh(),
                node.provenance(),
                NodeKind::Name(temp.clone()),
            );
        }
        let kind = match &node.kind {
            NodeKind::Literal(v) => NodeKind::Literal(v.clone()),
            NodeKind::Name(n) => NodeKind::Name(n.clone()),
            NodeKind::Attribute { object, attr } => NodeKind::Attribute {
                object: Box::new(self.replace(object, map)),
                attr: attr.clone(),
            },
            NodeKind::Call { callee, args } => NodeKind::Call {
                callee: Box::new(self.replace(callee, map)),
                args: args.iter().map(|a| self.replace(a, map)).collect(),
            },
            NodeKind::BinOp { op, lhs, rhs } => NodeKind::BinOp {
                op: *op,
                lhs: Box::new(self.replace(lhs, map)),
                rhs: Box::new(self.replace(rhs, map)),
            },
            NodeKind::Assign { target, value } => NodeKind::Assign {
                target: target.clone(),
                value: Box::new(self.replace(value, map)),
            },
            NodeKind::Return(value) => {
                NodeKind::Return(value.as_ref().map(|e| Box::new(self.replace(e, map))))
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => NodeKind::If {
                cond: Box::new(self.replace(cond, map)),
                then_branch: Box::new(self.replace(then_branch, map)),
                else_branch: else_branch.as_ref().map(|e| Box::new(self.replace(e, map))),
            },
            NodeKind::For { var, iter, body } => NodeKind::For {
                var: var.clone(),
                iter: Box::new(self.replace(iter, map)),
                body: Box::new(self.replace(body, map)),
            },
            NodeKind::FunctionDef { name, params, body } => NodeKind::FunctionDef {
                name: name.clone(),
                params: params.clone(),
                body: Box::new(self.replace(body, map)),
            },
            NodeKind::Block(items) => {
                NodeKind::Block(items.iter().map(|s| self.replace(s, map)).collect())
            }
        };
        Node {
            id: node.id,
            kind,
            origin: node.origin,
        }
    }

    fn decline(&mut self, node: NodeId, why: impl Into<String>) {
        self.ctx
            .log
            .skipped(PassKind::InvariantHoisting, node, why, SmallVec::new());
    }
}
