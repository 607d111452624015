//! Constant folding.
//!
//! Folding is flow-sensitive within a scope body: a constant-valued
//! environment follows statement order, is forked for branch arms and
//! invalidated at joins, and drops every name a loop body may rewrite.
//! Values are computed by the same operator and builtin code the
//! interpreter runs, and any computation that would raise at run time
//! is left in place with a skip record saying so.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use crate::analysis::{FactId, Resolution, ScopeId, MODULE_SCOPE};
use crate::builtins::{self, OpError};
use crate::tree::{Node, NodeKind, Value};

use super::{Pass, PassCtx, PassKind, Precondition};

pub struct ConstantFolding;

impl Pass for ConstantFolding {
    fn kind(&self) -> PassKind {
        PassKind::ConstantFolding
    }

    fn run(&self, tree: &Node, ctx: &mut PassCtx<'_>) -> Option<Node> {
        let mut folder = Folder {
            ctx,
            changed: false,
        };
        let mut env = HashMap::new();
        let folded = folder.fold_block(tree, MODULE_SCOPE, &mut env);
        folder.changed.then_some(folded)
    }
}

type Env = HashMap<String, Value>;

struct Folder<'a, 'b> {
    ctx: &'a mut PassCtx<'b>,
    changed: bool,
}

impl Folder<'_, '_> {
    fn fold_block(&mut self, block: &Node, scope: ScopeId, env: &mut Env) -> Node {
        let items = match &block.kind {
            NodeKind::Block(items) => items
                .iter()
                .map(|item| self.fold_stmt(item, scope, env))
                .collect(),
            _ => vec![],
        };
        Node {
            id: block.id,
            kind: NodeKind::Block(items),
            origin: block.origin,
        }
    }

    fn fold_stmt(&mut self, stmt: &Node, scope: ScopeId, env: &mut Env) -> Node {
        let kind = match &stmt.kind {
            NodeKind::Assign { target, value } => {
                let value = self.fold_expr(value, scope, env);
                match value.literal() {
                    Some(v) => {
                        env.insert(target.clone(), v.clone());
                    }
                    None => {
                        env.remove(target);
                    }
                }
                NodeKind::Assign {
                    target: target.clone(),
                    value: Box::new(value),
                }
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.fold_expr(cond, scope, env);
                let mut then_env = env.clone();
                let then_branch = self.fold_block(then_branch, scope, &mut then_env);
                let else_branch = else_branch.as_ref().map(|e| {
                    let mut else_env = env.clone();
                    Box::new(self.fold_block(e, scope, &mut else_env))
                });
                // Join: either arm may or may not have run.
                let mut touched = then_branch.bound_names();
                if let Some(e) = &else_branch {
                    touched.extend(e.bound_names());
                }
                for name in &touched {
                    env.remove(name);
                }
                NodeKind::If {
                    cond: Box::new(cond),
                    then_branch: Box::new(then_branch),
                    else_branch,
                }
            }
            NodeKind::For { var, iter, body } => {
                let iter = self.fold_expr(iter, scope, env);
                let mut carried: HashSet<String> = body.bound_names();
                carried.insert(var.clone());
                let mut body_env: Env = env
                    .iter()
                    .filter(|(k, _)| !carried.contains(*k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let body = self.fold_block(body, scope, &mut body_env);
                for name in &carried {
                    env.remove(name);
                }
                NodeKind::For {
                    var: var.clone(),
                    iter: Box::new(iter),
                    body: Box::new(body),
                }
            }
            NodeKind::FunctionDef { name, params, body } => {
                let fn_scope = self.ctx.analysis.scopes.scope_of_def(stmt.id);
                let body = match fn_scope {
                    Some(fn_scope) => {
                        let mut fn_env = Env::new();
                        self.fold_block(body, fn_scope, &mut fn_env)
                    }
                    None => (**body).clone(),
                };
                NodeKind::FunctionDef {
                    name: name.clone(),
                    params: params.clone(),
                    body: Box::new(body),
                }
            }
            NodeKind::Return(value) => NodeKind::Return(
                value
                    .as_ref()
                    .map(|v| Box::new(self.fold_expr(v, scope, env))),
            ),
            NodeKind::Block(_) => return self.fold_block(stmt, scope, env),
            // Bare expression statement.
            _ => return self.fold_expr(stmt, scope, env),
        };
        Node {
            id: stmt.id,
            kind,
            origin: stmt.origin,
        }
    }

    fn fold_expr(&mut self, expr: &Node, scope: ScopeId, env: &mut Env) -> Node {
        match &expr.kind {
            NodeKind::Literal(_) => expr.clone(),
            NodeKind::Name(name) => self.fold_name(expr, name, scope, env),
            NodeKind::BinOp { op, lhs, rhs } => {
                let lhs = self.fold_expr(lhs, scope, env);
                let rhs = self.fold_expr(rhs, scope, env);
                if let (Some(l), Some(r)) = (lhs.literal(), rhs.literal()) {
                    match builtins::apply_binop(*op, l, r) {
                        Ok(v) if v.is_literal() => {
                            return self.substitute(expr, v, Default::default())
                        }
                        Ok(_) => self.decline(expr, "result is not a finite literal"),
                        Err(e) => self.decline_raises(expr, &e),
                    }
                }
                Node {
                    id: expr.id,
                    kind: NodeKind::BinOp {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    origin: expr.origin,
                }
            }
            NodeKind::Call { callee, args } => {
                let callee = self.fold_expr(callee, scope, env);
                let args: Vec<Node> = args
                    .iter()
                    .map(|a| self.fold_expr(a, scope, env))
                    .collect();
                let rebuilt = Node {
                    id: expr.id,
                    kind: NodeKind::Call {
                        callee: Box::new(callee),
                        args,
                    },
                    origin: expr.origin,
                };
                self.fold_call(rebuilt, scope)
            }
            NodeKind::Attribute { object, attr } => Node {
                id: expr.id,
                kind: NodeKind::Attribute {
                    object: Box::new(self.fold_expr(object, scope, env)),
                    attr: attr.clone(),
                },
                origin: expr.origin,
            },
            _ => expr.clone(),
        }
    }

    fn fold_name(&mut self, expr: &Node, name: &str, scope: ScopeId, env: &mut Env) -> Node {
        if let Some(v) = env.get(name) {
            let facts = self
                .ctx
                .analysis
                .facts
                .constant_of(scope, name)
                .map(|(id, _)| SmallVec::from_slice(&[id]))
                .unwrap_or_default();
            let v = v.clone();
            return self.substitute(expr, v, facts);
        }
        // A constant module binding read from inside a function body.
        if scope != MODULE_SCOPE
            && matches!(
                self.ctx.analysis.scopes.resolve(scope, name),
                Resolution::Module(_)
            )
        {
            let known = self
                .ctx
                .analysis
                .facts
                .constant_of(MODULE_SCOPE, name)
                .map(|(_, v)| v.clone());
            if let Some(v) = known {
                match self
                    .ctx
                    .gate
                    .validate(&[Precondition::StableModuleBinding { name }])
                {
                    Ok(evidence) => return self.substitute(expr, v, evidence),
                    Err(unmet) => {
                        self.ctx.log.skipped(
                            PassKind::ConstantFolding,
                            expr.id,
                            unmet,
                            Default::default(),
                        );
                    }
                }
            }
        }
        expr.clone()
    }

    fn fold_call(&mut self, call: Node, scope: ScopeId) -> Node {
        let (callee, args) = match &call.kind {
            NodeKind::Call { callee, args } => (callee, args),
            _ => return call,
        };
        let arg_values: Option<Vec<Value>> =
            args.iter().map(|a| a.literal().cloned()).collect();
        let Some(values) = arg_values else {
            return call;
        };

        match &callee.kind {
            NodeKind::Name(name) => {
                let Resolution::Builtin(builtin) = self.ctx.analysis.scopes.resolve(scope, name)
                else {
                    return call;
                };
                let Some(result) = builtins::fold_builtin_call(builtin, &values) else {
                    return call;
                };
                match self.ctx.gate.validate(&[Precondition::PureExpr(&call)]) {
                    Ok(evidence) => match result {
                        Ok(v) if v.is_literal() => self.substitute(&call, v, evidence),
                        Ok(_) => {
                            self.decline(&call, "result is not a finite literal");
                            call
                        }
                        Err(e) => {
                            self.decline_raises(&call, &e);
                            call
                        }
                    },
                    Err(unmet) => {
                        self.ctx.log.skipped(
                            PassKind::ConstantFolding,
                            call.id,
                            unmet,
                            Default::default(),
                        );
                        call
                    }
                }
            }
            NodeKind::Attribute { object, attr } => {
                let Some(Value::Str(recv)) = object.literal() else {
                    return call;
                };
                let Some(result) = builtins::str_method(recv, attr, &values) else {
                    self.decline(&call, "unknown string attribute");
                    return call;
                };
                match self.ctx.gate.validate(&[Precondition::PureExpr(&call)]) {
                    Ok(evidence) => match result {
                        Ok(v) if v.is_literal() => self.substitute(&call, v, evidence),
                        Ok(_) => {
                            self.decline(&call, "result is not a finite literal");
                            call
                        }
                        Err(e) => {
                            self.decline_raises(&call, &e);
                            call
                        }
                    },
                    Err(unmet) => {
                        self.ctx.log.skipped(
                            PassKind::ConstantFolding,
                            call.id,
                            unmet,
                            Default::default(),
                        );
                        call
                    }
                }
            }
            _ => call,
        }
    }

    fn substitute(&mut self, source: &Node, value: Value, facts: SmallVec<[FactId; 4]>) -> Node {
        let new = Node::derived(
            self.ctx.ids.fresh(),
            source.provenance(),
            NodeKind::Literal(value),
        );
        self.ctx
            .log
            .applied(PassKind::ConstantFolding, source.id, Some(new.id), facts);
        self.changed = true;
        new
    }

    fn decline(&mut self, source: &Node, why: &str) {
        self.ctx
            .log
            .skipped(PassKind::ConstantFolding, source.id, why, Default::default());
    }

    fn decline_raises(&mut self, source: &Node, err: &OpError) {
        let why = format!("evaluation raises: {}", err);
        self.ctx
            .log
            .skipped(PassKind::ConstantFolding, source.id, why, Default::default());
    }
}
