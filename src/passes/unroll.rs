//! Loop unrolling.
//!
//! `for` loops whose iteration sequence is statically known are turned
//! into straight-line copies of the body, each prologued by an
//! assignment of the loop variable. A known range longer than the
//! unroll factor becomes a grouped loop over a fresh variable carrying
//! factor-many copies, with the remainder expanded after it. The
//! grouped residue may expand fully once its trip count allows, but is
//! never grouped a second time. The loop variable keeps its final
//! value, exactly as the loop left it.

use smallvec::SmallVec;
use tracing::trace;

use crate::analysis::{FactId, Resolution, ScopeId, MODULE_SCOPE};
use crate::builtins::range_len;
use crate::tree::{Node, NodeKind, Value};

use super::{next_temp_index, orphaned_binding, Pass, PassCtx, PassKind, Precondition};

pub struct LoopUnrolling;

impl Pass for LoopUnrolling {
    fn kind(&self) -> PassKind {
        PassKind::LoopUnrolling
    }

    fn run(&self, tree: &Node, ctx: &mut PassCtx<'_>) -> Option<Node> {
        let counter = next_temp_index(tree, "__u");
        let mut unroller = Unroller {
            ctx,
            root: tree,
            counter,
            changed: false,
        };
        let rebuilt = unroller.block(tree, MODULE_SCOPE, None);
        unroller.changed.then_some(rebuilt)
    }
}

/// A statically known iteration sequence.
enum Plan {
    Range {
        start: i64,
        step: i64,
        trips: i64,
        evidence: SmallVec<[FactId; 4]>,
    },
    List {
        values: Vec<Value>,
        evidence: SmallVec<[FactId; 4]>,
    },
}

struct Unroller<'a, 'b, 't> {
    ctx: &'a mut PassCtx<'b>,
    root: &'t Node,
    counter: u32,
    changed: bool,
}

impl Unroller<'_, '_, '_> {
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
                if let Some(splice) = self.try_unroll(node, var, iter, body, scope, at) {
                    self.changed = true;
                    out.extend(splice);
                    return;
                }
                // Declined loops still get their bodies walked for
                // nested candidates.
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

    fn try_unroll(
        &mut self,
        for_node: &Node,
        var: &str,
        iter: &Node,
        body: &Node,
        scope: ScopeId,
        at: usize,
    ) -> Option<Vec<Node>> {
        let plan = match self.loop_plan(iter, scope, at) {
            None => return None,
            Some(Err(why)) => {
                self.decline(for_node, why);
                return None;
            }
            Some(Ok(plan)) => plan,
        };
        let factor = self.ctx.config.unroll_factor as i64;
        match plan {
            Plan::List { values, evidence } => {
                let trips = values.len() as i64;
                if trips == 0 {
                    self.remove_loop(for_node, scope, evidence)
                } else if trips <= factor {
                    self.expand(for_node, var, body, values, evidence)
                } else {
                    self.decline(for_node, "trip count exceeds the unroll factor");
                    None
                }
            }
            Plan::Range {
                start,
                step,
                trips,
                evidence,
            } => {
                if trips == 0 {
                    self.remove_loop(for_node, scope, evidence)
                } else if trips <= factor {
                    let values = (0..trips)
                        .map(|j| Value::Int((start as i128 + j as i128 * step as i128) as i64))
                        .collect();
                    self.expand(for_node, var, body, values, evidence)
                } else if is_group_temp(var) {
                    self.decline(for_node, "the loop already carries grouped copies");
                    None
                } else {
                    self.grouped(for_node, var, body, start, step, trips, factor, evidence, scope)
                }
            }
        }
    }

    /// Recognize the iteration source. `None` is no candidate at all,
    /// `Some(Err)` a candidate that must stay.
    fn loop_plan(
        &self,
        iter: &Node,
        scope: ScopeId,
        at: usize,
    ) -> Option<Result<Plan, String>> {
        match &iter.kind {
            NodeKind::Literal(Value::List(items)) => Some(Ok(Plan::List {
                values: items.clone(),
                evidence: SmallVec::new(),
            })),
            NodeKind::Name(name) => {
                let (fact, value) = self.ctx.analysis.constant_at(scope, name, at)?;
                match value {
                    Value::List(items) => {
                        let mut evidence = SmallVec::new();
                        evidence.push(fact);
                        Some(Ok(Plan::List {
                            values: items.clone(),
                            evidence,
                        }))
                    }
                    _ => None,
                }
            }
            NodeKind::Call { callee, args } => {
                let NodeKind::Name(callee_name) = &callee.kind else {
                    return None;
                };
                if self.ctx.analysis.scopes.resolve(scope, callee_name)
                    != Resolution::Builtin("range")
                {
                    return None;
                }
                if args.is_empty() || args.len() > 3 {
                    return None;
                }
                let mut evidence = SmallVec::new();
                let mut bounds = Vec::with_capacity(3);
                for arg in args {
                    match &arg.kind {
                        NodeKind::Literal(Value::Int(v)) => bounds.push(*v),
                        NodeKind::Literal(_) => return None,
                        NodeKind::Name(n) => {
                            match self.ctx.analysis.constant_at(scope, n, at) {
                                Some((fact, Value::Int(v))) => {
                                    evidence.push(fact);
                                    bounds.push(*v);
                                }
                                Some(_) => return None,
                                None => {
                                    return Some(Err("loop bounds are unknown".to_string()))
                                }
                            }
                        }
                        _ => return Some(Err("loop bounds are unknown".to_string())),
                    }
                }
                let (start, stop, step) = match bounds[..] {
                    [stop] => (0, stop, 1),
                    [start, stop] => (start, stop, 1),
                    [start, stop, step] => (start, stop, step),
                    _ => return None,
                };
                if step == 0 {
                    return Some(Err("the loop step is zero".to_string()));
                }
                Some(Ok(Plan::Range {
                    start,
                    step,
                    trips: range_len(start, stop, step),
                    evidence,
                }))
            }
            _ => None,
        }
    }

    /// A provably zero-trip loop disappears, unless it is the sole
    /// binder of a name read elsewhere and removal would strand those
    /// reads.
    fn remove_loop(
        &mut self,
        for_node: &Node,
        scope: ScopeId,
        evidence: SmallVec<[FactId; 4]>,
    ) -> Option<Vec<Node>> {
        if let Some(name) = orphaned_binding(self.ctx.analysis, self.root, for_node, scope) {
            self.decline(
                for_node,
                format!("removing the loop would orphan reads of '{}'", name),
            );
            return None;
        }
        trace!(target: "treeopt::unroll", node = %for_node.id, "removed zero-trip loop");
        self.ctx
            .log
            .applied(PassKind::LoopUnrolling, for_node.id, None, evidence);
        Some(Vec::new())
    }

    fn expand(
        &mut self,
        for_node: &Node,
        var: &str,
        body: &Node,
        values: Vec<Value>,
        evidence: SmallVec<[FactId; 4]>,
    ) -> Option<Vec<Node>> {
        let NodeKind::Block(items) = &body.kind else {
            return None;
        };
        let mut out = Vec::new();
        for value in values {
            out.push(self.assign_literal(for_node, var, value));
            for item in items {
                out.push(item.refresh_ids(self.ctx.ids));
            }
        }
        trace!(
            target: "treeopt::unroll",
            node = %for_node.id,
            statements = out.len(),
            "expanded loop"
        );
        self.ctx.log.applied(
            PassKind::LoopUnrolling,
            for_node.id,
            out.first().map(|n| n.id),
            evidence,
        );
        Some(out)
    }

    /// `trips > factor`: a loop over group starts carrying factor-many
    /// copies, then the remainder expanded straight-line.
    #[allow(clippy::too_many_arguments)]
    fn grouped(
        &mut self,
        for_node: &Node,
        var: &str,
        body: &Node,
        start: i64,
        step: i64,
        trips: i64,
        factor: i64,
        evidence: SmallVec<[FactId; 4]>,
        scope: ScopeId,
    ) -> Option<Vec<Node>> {
        if scope == MODULE_SCOPE {
            // The group variable would be a new module binding, which a
            // `globals` snapshot could observe.
            if let Err(why) = self.ctx.gate.validate(&[Precondition::NoIntrospection]) {
                self.decline(for_node, why);
                return None;
            }
        }
        let NodeKind::Block(items) = &body.kind else {
            return None;
        };
        let groups = trips / factor;
        let tail = trips % factor;
        let derived = i64::try_from(step as i128 * factor as i128)
            .and_then(|group_step| {
                i64::try_from(start as i128 + groups as i128 * group_step as i128)
                    .map(|group_stop| (group_step, group_stop))
            });
        let Ok((group_step, group_stop)) = derived else {
            self.decline(for_node, "derived loop bounds overflow");
            return None;
        };

        let group_var = format!("__u{}", self.counter);
        self.counter += 1;
        let origin = for_node.provenance();

        let mut group_body = Vec::new();
        for copy in 0..factor {
            let offset = (copy as i128 * step as i128) as i64;
            let value = if copy == 0 {
                Node::derived(self.ctx.ids.fresh(), origin, NodeKind::Name(group_var.clone()))
            } else {
                Node::derived(
                    self.ctx.ids.fresh(),
                    origin,
                    NodeKind::BinOp {
                        op: crate::tree::BinOpKind::Add,
                        lhs: Box::new(Node::derived(
                            self.ctx.ids.fresh(),
                            origin,
                            NodeKind::Name(group_var.clone()),
                        )),
                        rhs: Box::new(Node::derived(
                            self.ctx.ids.fresh(),
                            origin,
                            NodeKind::Literal(Value::Int(offset)),
                        )),
                    },
                )
            };
            group_body.push(Node::derived(
                self.ctx.ids.fresh(),
                origin,
                NodeKind::Assign {
                    target: var.to_string(),
                    value: Box::new(value),
                },
            ));
            for item in items {
                group_body.push(item.refresh_ids(self.ctx.ids));
            }
        }

        let range_args = [start, group_stop, group_step]
            .iter()
            .map(|v| {
                Node::derived(self.ctx.ids.fresh(), origin, NodeKind::Literal(Value::Int(*v)))
            })
            .collect();
        let grouped_loop = Node::derived(
            self.ctx.ids.fresh(),
            origin,
            NodeKind::For {
                var: group_var,
                iter: Box::new(Node::derived(
                    self.ctx.ids.fresh(),
                    origin,
                    NodeKind::Call {
                        callee: Box::new(Node::derived(
                            self.ctx.ids.fresh(),
                            origin,
                            NodeKind::Name("range".to_string()),
                        )),
                        args: range_args,
                    },
                )),
                body: Box::new(Node::derived(
                    self.ctx.ids.fresh(),
                    origin,
                    NodeKind::Block(group_body),
                )),
            },
        );

        let mut out = vec![grouped_loop];
        for j in 0..tail {
            let value =
                (start as i128 + (groups as i128 * factor as i128 + j as i128) * step as i128)
                    as i64;
            out.push(self.assign_literal(for_node, var, Value::Int(value)));
            for item in items {
                out.push(item.refresh_ids(self.ctx.ids));
            }
        }
        trace!(
            target: "treeopt::unroll",
            node = %for_node.id,
            groups = groups,
            tail = tail,
            "grouped loop"
        );
        self.ctx.log.applied(
            PassKind::LoopUnrolling,
            for_node.id,
            out.first().map(|n| n.id),
            evidence,
        );
        Some(out)
    }

    fn assign_literal(&mut self, for_node: &Node, var: &str, value: Value) -> Node {
        let origin = for_node.provenance();
        let literal = Node::derived(self.ctx.ids.fresh(), origin, NodeKind::Literal(value));
        Node::derived(
            self.ctx.ids.fresh(),
            origin,
            NodeKind::Assign {
                target: var.to_string(),
                value: Box::new(literal),
            },
        )
    }

    fn decline(&mut self, for_node: &Node, why: impl Into<String>) {
        self.ctx
            .log
            .skipped(PassKind::LoopUnrolling, for_node.id, why, SmallVec::new());
    }
}

/// A variable synthesized by an earlier grouping. Grouping such a loop
/// again would multiply its copies each round instead of bounding them,
/// so a residue only ever shrinks through full expansion.
fn is_group_temp(var: &str) -> bool {
    var.strip_prefix("__u").map_or(false, |rest| {
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
    })
}
