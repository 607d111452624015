//! Dead-code elimination.
//!
//! Three shapes of dead code go: branches of an `if` whose condition is
//! already a literal, statements below an unconditional `return`, and
//! assignments to names nothing reads. Removal is refused, with a skip
//! record, whenever the read set is not exhaustively enumerable or the
//! removed value could raise.

use crate::analysis::ScopeId;
use crate::builtins::truthy;
use crate::tree::{Node, NodeKind};

use super::{orphaned_binding, Pass, PassCtx, PassKind, Precondition};

pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn kind(&self) -> PassKind {
        PassKind::DeadCodeElimination
    }

    fn run(&self, tree: &Node, ctx: &mut PassCtx<'_>) -> Option<Node> {
        let mut dce = Dce {
            ctx,
            root: tree,
            changed: false,
        };
        let out = dce.process_block(tree, crate::analysis::MODULE_SCOPE, None);
        dce.changed.then_some(out)
    }
}

struct Dce<'a, 'b> {
    ctx: &'a mut PassCtx<'b>,
    root: &'a Node,
    changed: bool,
}

impl Dce<'_, '_> {
    /// `ctx_idx` is the direct statement index of the enclosing scope
    /// body statement, used for ordered-definition queries; `None` when
    /// this block IS a scope body and items carry their own indices.
    fn process_block(&mut self, block: &Node, scope: ScopeId, ctx_idx: Option<usize>) -> Node {
        let items = match &block.kind {
            NodeKind::Block(items) => items,
            _ => return block.clone(),
        };
        let mut out: Vec<Node> = Vec::with_capacity(items.len());
        let mut returned = false;
        for (i, item) in items.iter().enumerate() {
            let idx = ctx_idx.unwrap_or(i);
            if returned {
                if !self.drop_unreachable(item, scope) {
                    out.push(item.clone());
                }
                continue;
            }
            if let Some(kept) = self.process_stmt(item, scope, idx) {
                if always_returns(&kept) {
                    returned = true;
                }
                // An emptied nested block is a no-op statement.
                if matches!(&kept.kind, NodeKind::Block(b) if b.is_empty()) && ctx_idx.is_some() {
                    self.ctx.log.applied(
                        PassKind::DeadCodeElimination,
                        kept.id,
                        None,
                        Default::default(),
                    );
                    self.changed = true;
                    continue;
                }
                out.push(kept);
            }
        }
        Node {
            id: block.id,
            kind: NodeKind::Block(out),
            origin: block.origin,
        }
    }

    fn process_stmt(&mut self, stmt: &Node, scope: ScopeId, idx: usize) -> Option<Node> {
        match &stmt.kind {
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => match cond.literal() {
                Some(v) => {
                    let (kept, dropped) = if truthy(v) {
                        (Some(then_branch.as_ref()), else_branch.as_deref())
                    } else {
                        (else_branch.as_deref(), Some(then_branch.as_ref()))
                    };
                    if let Some(dropped) = dropped {
                        if let Some(name) = orphaned_binding(self.ctx.analysis, self.root, dropped, scope) {
                            self.ctx.log.skipped(
                                PassKind::DeadCodeElimination,
                                stmt.id,
                                format!("removing the branch would orphan reads of '{}'", name),
                                Default::default(),
                            );
                            return Some(self.rebuild_if(stmt, cond, then_branch, else_branch, scope, idx));
                        }
                    }
                    match kept {
                        Some(branch) => {
                            let branch = self.process_block(branch, scope, Some(idx));
                            self.ctx.log.applied(
                                PassKind::DeadCodeElimination,
                                stmt.id,
                                Some(branch.id),
                                Default::default(),
                            );
                            self.changed = true;
                            Some(branch)
                        }
                        None => {
                            self.ctx.log.applied(
                                PassKind::DeadCodeElimination,
                                stmt.id,
                                None,
                                Default::default(),
                            );
                            self.changed = true;
                            None
                        }
                    }
                }
                None => Some(self.rebuild_if(stmt, cond, then_branch, else_branch, scope, idx)),
            },
            NodeKind::For { var, iter, body } => Some(Node {
                id: stmt.id,
                kind: NodeKind::For {
                    var: var.clone(),
                    iter: (*iter).clone(),
                    body: Box::new(self.process_block(body, scope, Some(idx))),
                },
                origin: stmt.origin,
            }),
            NodeKind::FunctionDef { name, params, body } => {
                let fn_scope = self.ctx.analysis.scopes.scope_of_def(stmt.id);
                let body = match fn_scope {
                    Some(fn_scope) => self.process_block(body, fn_scope, None),
                    None => (**body).clone(),
                };
                Some(Node {
                    id: stmt.id,
                    kind: NodeKind::FunctionDef {
                        name: name.clone(),
                        params: params.clone(),
                        body: Box::new(body),
                    },
                    origin: stmt.origin,
                })
            }
            NodeKind::Assign { target, value } => {
                let dead = self
                    .ctx
                    .analysis
                    .scopes
                    .binding(scope, target)
                    .map(|b| b.reads == 0)
                    .unwrap_or(false);
                if dead {
                    let preconditions = [
                        Precondition::NoReads {
                            scope,
                            name: target,
                        },
                        Precondition::PureExpr(value),
                        Precondition::TotalExpr {
                            expr: value,
                            scope,
                            stmt: idx,
                        },
                    ];
                    match self.ctx.gate.validate(&preconditions) {
                        Ok(evidence) => {
                            self.ctx.log.applied(
                                PassKind::DeadCodeElimination,
                                stmt.id,
                                None,
                                evidence,
                            );
                            self.changed = true;
                            return None;
                        }
                        Err(unmet) => {
                            self.ctx.log.skipped(
                                PassKind::DeadCodeElimination,
                                stmt.id,
                                unmet,
                                Default::default(),
                            );
                        }
                    }
                }
                Some(stmt.clone())
            }
            NodeKind::Block(_) => Some(self.process_block(stmt, scope, Some(idx))),
            _ => Some(stmt.clone()),
        }
    }

    fn rebuild_if(
        &mut self,
        stmt: &Node,
        cond: &Node,
        then_branch: &Node,
        else_branch: &Option<Box<Node>>,
        scope: ScopeId,
        idx: usize,
    ) -> Node {
        Node {
            id: stmt.id,
            kind: NodeKind::If {
                cond: Box::new(cond.clone()),
                then_branch: Box::new(self.process_block(then_branch, scope, Some(idx))),
                else_branch: else_branch
                    .as_ref()
                    .map(|e| Box::new(self.process_block(e, scope, Some(idx)))),
            },
            origin: stmt.origin,
        }
    }

    /// Unreachable statements vanish, unless one of them is the only
    /// thing binding a name something reads. Returns whether the
    /// statement was dropped.
    fn drop_unreachable(&mut self, stmt: &Node, scope: ScopeId) -> bool {
        if let Some(name) = orphaned_binding(self.ctx.analysis, self.root, stmt, scope) {
            self.ctx.log.skipped(
                PassKind::DeadCodeElimination,
                stmt.id,
                format!("unreachable statement still binds '{}'", name),
                Default::default(),
            );
            return false;
        }
        self.ctx
            .log
            .applied(PassKind::DeadCodeElimination, stmt.id, None, Default::default());
        self.changed = true;
        true
    }
}

/// True when executing the statement always leaves the enclosing
/// function or module. Loops may run zero times and never qualify.
fn always_returns(stmt: &Node) -> bool {
    match &stmt.kind {
        NodeKind::Return(_) => true,
        NodeKind::Block(items) => items.iter().any(always_returns),
        NodeKind::If {
            then_branch,
            else_branch,
            ..
        } => match else_branch {
            Some(e) => always_returns(then_branch) && always_returns(e),
            None => false,
        },
        _ => false,
    }
}
