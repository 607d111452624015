//! Global-to-local rebinding.
//!
//! A function body that repeatedly reads a stable module binding pays
//! the frame-then-module lookup chain on every read. The pass assigns
//! such names to a local alias at the top of the body and renames the
//! reads. Locals are invisible to `globals` snapshots, so the alias
//! never needs an introspection precondition; the gatekeeper instead
//! proves the module binding cannot change between calls. Nested
//! function bodies are their own frames and keep their direct reads.

use std::collections::{BTreeSet, HashMap};

use smallvec::SmallVec;
use tracing::trace;

use crate::analysis::{BindingKind, Resolution, ScopeId, MODULE_SCOPE};
use crate::tree::{Node, NodeId, NodeKind};

use super::{next_temp_index, Pass, PassCtx, PassKind, Precondition};

pub struct GlobalRebinding;

impl Pass for GlobalRebinding {
    fn kind(&self) -> PassKind {
        PassKind::GlobalRebinding
    }

    fn run(&self, tree: &Node, ctx: &mut PassCtx<'_>) -> Option<Node> {
        let counter = next_temp_index(tree, "__g");
        let mut rebinder = Rebinder {
            ctx,
            counter,
            changed: false,
        };
        let rebuilt = rebinder.block(tree, MODULE_SCOPE);
        rebinder.changed.then_some(rebuilt)
    }
}

struct Rebinder<'a, 'b> {
    ctx: &'a mut PassCtx<'b>,
    counter: u32,
    changed: bool,
}

impl Rebinder<'_, '_> {
    fn block(&mut self, block: &Node, scope: ScopeId) -> Node {
        let NodeKind::Block(items) = &block.kind else {
            return block.clone();
        };
        let items = items.iter().map(|item| self.stmt(item, scope)).collect();
        Node {
            id: block.id,
            kind: NodeKind::Block(items),
            origin: block.origin,
        }
    }

    fn stmt(&mut self, node: &Node, scope: ScopeId) -> Node {
        match &node.kind {
            NodeKind::FunctionDef { name, params, body } => {
                let Some(child) = self.ctx.analysis.scopes.scope_of_def(node.id) else {
                    return node.clone();
                };
                let walked = self.block(body, child);
                let aliased = self.try_rebind(node, child, walked);
                Node {
                    id: node.id,
                    kind: NodeKind::FunctionDef {
                        name: name.clone(),
                        params: params.clone(),
                        body: Box::new(aliased),
                    },
                    origin: node.origin,
                }
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => Node {
                id: node.id,
                kind: NodeKind::If {
                    cond: cond.clone(),
                    then_branch: Box::new(self.block(then_branch, scope)),
                    else_branch: else_branch.as_ref().map(|e| Box::new(self.block(e, scope))),
                },
                origin: node.origin,
            },
            NodeKind::For { var, iter, body } => Node {
                id: node.id,
                kind: NodeKind::For {
                    var: var.clone(),
                    iter: iter.clone(),
                    body: Box::new(self.block(body, scope)),
                },
                origin: node.origin,
            },
            NodeKind::Block(_) => self.block(node, scope),
            _ => node.clone(),
        }
    }

    /// Alias the stable module reads of one function body.
    fn try_rebind(&mut self, def: &Node, scope: ScopeId, body: Node) -> Node {
        let NodeKind::Block(items) = &body.kind else {
            return body;
        };

        // Aliases from an earlier run sit at the top of the body; their
        // source names are done and their own reads stay as they are.
        let mut already: BTreeSet<String> = BTreeSet::new();
        let mut lead = 0;
        for item in items {
            match &item.kind {
                NodeKind::Assign { target, value } if target.starts_with("__g") => {
                    if let NodeKind::Name(source) = &value.kind {
                        already.insert(source.clone());
                        lead += 1;
                        continue;
                    }
                    break;
                }
                _ => break,
            }
        }

        let mut reads: Vec<(String, NodeId)> = Vec::new();
        for item in &items[lead..] {
            self.collect_module_reads(item, scope, &already, &mut reads);
        }
        if reads.is_empty() {
            return body;
        }

        let mut aliases: Vec<(String, String, NodeId, SmallVec<_>)> = Vec::new();
        for (name, first_read) in reads {
            match self
                .ctx
                .gate
                .validate(&[Precondition::StableModuleBinding { name: &name }])
            {
                Ok(facts) => {
                    let temp = format!("__g{}_{}", self.counter, name);
                    self.counter += 1;
                    trace!(
                        target: "treeopt::rebind",
                        func = %self.ctx.analysis.scopes.get(scope).name,
                        name = %name,
                        temp = %temp,
                        "aliased module binding"
                    );
                    aliases.push((name, temp, first_read, facts));
                }
                Err(why) => {
                    self.ctx
                        .log
                        .skipped(PassKind::GlobalRebinding, first_read, why, SmallVec::new());
                }
            }
        }
        if aliases.is_empty() {
            return body;
        }

        let mut map: HashMap<&str, &str> = HashMap::new();
        for (name, temp, _, _) in &aliases {
            map.insert(name.as_str(), temp.as_str());
        }

        let mut new_items: Vec<Node> = items[..lead].to_vec();
        for (name, temp, first_read, facts) in &aliases {
            let source = Node::derived(
                self.ctx.ids.fresh(),
                def.provenance(),
                NodeKind::Name(name.clone()),
            );
            let assign = Node::derived(
                self.ctx.ids.fresh(),
                def.provenance(),
                NodeKind::Assign {
                    target: temp.clone(),
                    value: Box::new(source),
                },
            );
            self.ctx.log.applied(
                PassKind::GlobalRebinding,
                *first_read,
                Some(assign.id),
                facts.clone(),
            );
            new_items.push(assign);
        }
        for item in &items[lead..] {
            new_items.push(rename_reads(item, &map));
        }
        self.changed = true;
        Node {
            id: body.id,
            kind: NodeKind::Block(new_items),
            origin: body.origin,
        }
    }

    /// Module-resolved reads of a statement in first-appearance order,
    /// not descending into nested function bodies.
    fn collect_module_reads(
        &self,
        node: &Node,
        scope: ScopeId,
        already: &BTreeSet<String>,
        reads: &mut Vec<(String, NodeId)>,
    ) {
        match &node.kind {
            NodeKind::Name(n) => {
                if already.contains(n) || reads.iter().any(|(seen, _)| seen == n) {
                    return;
                }
                // Callee reads of module functions stay direct so the
                // inliner still sees them.
                if let Resolution::Module(info) = self.ctx.analysis.scopes.resolve(scope, n) {
                    if info.kind != BindingKind::Function {
                        reads.push((n.clone(), node.id));
                    }
                }
            }
            NodeKind::Attribute { object, .. } => {
                self.collect_module_reads(object, scope, already, reads)
            }
            NodeKind::Call { callee, args } => {
                self.collect_module_reads(callee, scope, already, reads);
                for arg in args {
                    self.collect_module_reads(arg, scope, already, reads);
                }
            }
            NodeKind::BinOp { lhs, rhs, .. } => {
                self.collect_module_reads(lhs, scope, already, reads);
                self.collect_module_reads(rhs, scope, already, reads);
            }
            NodeKind::Assign { value, .. } => {
                self.collect_module_reads(value, scope, already, reads)
            }
            NodeKind::Return(value) => {
                if let Some(e) = value {
                    self.collect_module_reads(e, scope, already, reads);
                }
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.collect_module_reads(cond, scope, already, reads);
                self.collect_module_reads(then_branch, scope, already, reads);
                if let Some(e) = else_branch {
                    self.collect_module_reads(e, scope, already, reads);
                }
            }
            NodeKind::For { iter, body, .. } => {
                self.collect_module_reads(iter, scope, already, reads);
                self.collect_module_reads(body, scope, already, reads);
            }
            NodeKind::Block(stmts) => {
                for stmt in stmts {
                    self.collect_module_reads(stmt, scope, already, reads);
                }
            }
            NodeKind::FunctionDef { .. } | NodeKind::Literal(_) => {}
        }
    }
}

/// Rename aliased reads in place, keeping ids. Nested function bodies
/// read their own frames and stay untouched.
fn rename_reads(node: &Node, map: &HashMap<&str, &str>) -> Node {
    let kind = match &node.kind {
        NodeKind::Literal(v) => NodeKind::Literal(v.clone()),
        NodeKind::Name(n) => match map.get(n.as_str()) {
            Some(temp) => NodeKind::Name((*temp).to_string()),
            None => NodeKind::Name(n.clone()),
        },
        NodeKind::Attribute { object, attr } => NodeKind::Attribute {
            object: Box::new(rename_reads(object, map)),
            attr: attr.clone(),
        },
        NodeKind::Call { callee, args } => NodeKind::Call {
            callee: Box::new(rename_reads(callee, map)),
            args: args.iter().map(|a| rename_reads(a, map)).collect(),
        },
        NodeKind::BinOp { op, lhs, rhs } => NodeKind::BinOp {
            op: *op,
            lhs: Box::new(rename_reads(lhs, map)),
            rhs: Box::new(rename_reads(rhs, map)),
        },
        NodeKind::Assign { target, value } => NodeKind::Assign {
            target: target.clone(),
            value: Box::new(rename_reads(value, map)),
        },
        NodeKind::Return(value) => {
            NodeKind::Return(value.as_ref().map(|e| Box::new(rename_reads(e, map))))
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => NodeKind::If {
            cond: Box::new(rename_reads(cond, map)),
            then_branch: Box::new(rename_reads(then_branch, map)),
            else_branch: else_branch.as_ref().map(|e| Box::new(rename_reads(e, map))),
        },
        NodeKind::For { var, iter, body } => NodeKind::For {
            var: var.clone(),
            iter: Box::new(rename_reads(iter, map)),
            body: Box::new(rename_reads(body, map)),
        },
        NodeKind::FunctionDef { .. } => return node.clone(),
        NodeKind::Block(items) => {
            NodeKind::Block(items.iter().map(|s| rename_reads(s, map)).collect())
        }
    };
    Node {
        id: node.id,
        kind,
        origin: node.origin,
    }
}
