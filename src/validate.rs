//! Tree well-formedness checks.
//!
//! `structure` is the malformed-input gate at the front of the pipeline
//! and the post-rewrite sanity check inside it. `free_names` supports
//! the other half of the post-rewrite check: a rewrite may remove free
//! names but must never introduce one.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::tree::{Node, NodeId, NodeKind};

/// A structural defect, pointing at the offending node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureError {
    pub node: NodeId,
    pub detail: String,
}

impl StructureError {
    fn new(node: &Node, detail: impl Into<String>) -> StructureError {
        StructureError {
            node: node.id,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for StructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed tree at {}: {}", self.node, self.detail)
    }
}

impl std::error::Error for StructureError {}

/// Validate the whole tree: the root is a block, node ids are unique,
/// literals hold literal values, and statements appear only in
/// statement positions.
pub fn structure(tree: &Node) -> Result<(), StructureError> {
    if !matches!(tree.kind, NodeKind::Block(_)) {
        return Err(StructureError::new(tree, "program root must be a block"));
    }
    let mut seen = HashSet::new();
    let mut dup = None;
    tree.visit(&mut |n| {
        if !seen.insert(n.id) && dup.is_none() {
            dup = Some(n.id);
        }
    });
    if let Some(id) = dup {
        return Err(StructureError {
            node: id,
            detail: format!("duplicate node id {}", id),
        });
    }
    check_statement(tree)
}

fn check_block(node: &Node) -> Result<(), StructureError> {
    match &node.kind {
        NodeKind::Block(items) => {
            for item in items {
                check_statement(item)?;
            }
            Ok(())
        }
        _ => Err(StructureError::new(node, "expected a block")),
    }
}

fn check_statement(node: &Node) -> Result<(), StructureError> {
    match &node.kind {
        NodeKind::Block(_) => check_block(node),
        NodeKind::Assign { value, .. } => check_expression(value),
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            check_expression(cond)?;
            check_block(then_branch)?;
            if let Some(e) = else_branch {
                check_block(e)?;
            }
            Ok(())
        }
        NodeKind::For { iter, body, .. } => {
            check_expression(iter)?;
            check_block(body)
        }
        NodeKind::FunctionDef { params, body, .. } => {
            let mut names = HashSet::new();
            for p in params {
                if !names.insert(p.as_str()) {
                    return Err(StructureError::new(
                        node,
                        format!("duplicate parameter '{}'", p),
                    ));
                }
            }
            check_block(body)
        }
        NodeKind::Return(value) => match value {
            Some(v) => check_expression(v),
            None => Ok(()),
        },
        // Bare expression in statement position.
        _ => check_expression(node),
    }
}

fn check_expression(node: &Node) -> Result<(), StructureError> {
    match &node.kind {
        NodeKind::Literal(v) => {
            if v.is_literal() {
                Ok(())
            } else {
                Err(StructureError::new(
                    node,
                    format!("literal holds a runtime-only {} value", v.type_name()),
                ))
            }
        }
        NodeKind::Name(_) => Ok(()),
        NodeKind::Attribute { object, .. } => check_expression(object),
        NodeKind::Call { callee, args } => {
            check_expression(callee)?;
            for arg in args {
                check_expression(arg)?;
            }
            Ok(())
        }
        NodeKind::BinOp { lhs, rhs, .. } => {
            check_expression(lhs)?;
            check_expression(rhs)
        }
        _ => Err(StructureError::new(
            node,
            "statement in expression position",
        )),
    }
}

/// Names bound in this scope: assignment targets, loop variables and
/// function names. Does not descend into nested function bodies, whose
/// bindings are their own.
pub(crate) fn scope_bindings(node: &Node, out: &mut HashSet<String>) {
    match &node.kind {
        NodeKind::Assign { target, value } => {
            out.insert(target.clone());
            scope_bindings(value, out);
        }
        NodeKind::For { var, iter, body } => {
            out.insert(var.clone());
            scope_bindings(iter, out);
            scope_bindings(body, out);
        }
        NodeKind::FunctionDef { name, .. } => {
            out.insert(name.clone());
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            scope_bindings(cond, out);
            scope_bindings(then_branch, out);
            if let Some(e) = else_branch {
                scope_bindings(e, out);
            }
        }
        NodeKind::Block(items) => {
            for item in items {
                scope_bindings(item, out);
            }
        }
        NodeKind::Return(Some(v)) => scope_bindings(v, out),
        _ => {}
    }
}

/// Free names of the program: reads that no enclosing scope binds.
/// Static approximation: a name assigned anywhere in a scope counts as
/// bound for the whole scope. Builtin names are reported too.
pub fn free_names(tree: &Node) -> BTreeSet<String> {
    let mut bound = HashSet::new();
    scope_bindings(tree, &mut bound);
    let mut out = BTreeSet::new();
    walk_free(tree, &bound, &mut out);
    out
}

fn walk_free(node: &Node, bound: &HashSet<String>, out: &mut BTreeSet<String>) {
    match &node.kind {
        NodeKind::Name(name) => {
            if !bound.contains(name) {
                out.insert(name.clone());
            }
        }
        NodeKind::FunctionDef { params, body, .. } => {
            let mut inner = bound.clone();
            inner.extend(params.iter().cloned());
            scope_bindings(body, &mut inner);
            walk_free(body, &inner, out);
        }
        NodeKind::Attribute { object, .. } => walk_free(object, bound, out),
        NodeKind::Call { callee, args } => {
            walk_free(callee, bound, out);
            for arg in args {
                walk_free(arg, bound, out);
            }
        }
        NodeKind::BinOp { lhs, rhs, .. } => {
            walk_free(lhs, bound, out);
            walk_free(rhs, bound, out);
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            walk_free(cond, bound, out);
            walk_free(then_branch, bound, out);
            if let Some(e) = else_branch {
                walk_free(e, bound, out);
            }
        }
        NodeKind::For { iter, body, .. } => {
            walk_free(iter, bound, out);
            walk_free(body, bound, out);
        }
        NodeKind::Assign { value, .. } => walk_free(value, bound, out),
        NodeKind::Return(Some(v)) => walk_free(v, bound, out),
        NodeKind::Block(items) => {
            for item in items {
                walk_free(item, bound, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{parse_program, IdGen, Value};

    fn parse(src: &str) -> Node {
        parse_program(src).unwrap()
    }

    #[test]
    fn test_valid_program_passes() {
        let tree = parse(
            "(block (defn f (a) (block (return (binop + a 1)))) (assign x (call f 1)) (return x))",
        );
        assert!(structure(&tree).is_ok());
    }

    #[test]
    fn test_rejects_non_block_root() {
        let mut ids = IdGen::new();
        let root = Node::new(ids.fresh(), NodeKind::Literal(Value::Int(1)));
        let err = structure(&root).unwrap_err();
        assert!(err.detail.contains("root"));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let id = NodeId(7);
        let lit = Node::new(id, NodeKind::Literal(Value::Int(1)));
        let root = Node::new(id, NodeKind::Block(vec![lit]));
        let err = structure(&root).unwrap_err();
        assert!(err.detail.contains("duplicate node id"));
    }

    #[test]
    fn test_rejects_runtime_value_literal() {
        let mut ids = IdGen::new();
        let lit = Node::new(
            ids.fresh(),
            NodeKind::Literal(Value::Builtin("range")),
        );
        let root = Node::new(ids.fresh(), NodeKind::Block(vec![lit]));
        let err = structure(&root).unwrap_err();
        assert!(err.detail.contains("runtime-only"));
    }

    #[test]
    fn test_rejects_statement_in_expression_position() {
        let mut ids = IdGen::new();
        let inner = Node::new(
            ids.fresh(),
            NodeKind::Assign {
                target: "x".to_string(),
                value: Box::new(Node::new(ids.fresh(), NodeKind::Literal(Value::Int(1)))),
            },
        );
        let ret = Node::new(ids.fresh(), NodeKind::Return(Some(Box::new(inner))));
        let root = Node::new(ids.fresh(), NodeKind::Block(vec![ret]));
        let err = structure(&root).unwrap_err();
        assert!(err.detail.contains("expression position"));
    }

    #[test]
    fn test_rejects_non_block_branch() {
        let mut ids = IdGen::new();
        let cond = Node::new(ids.fresh(), NodeKind::Literal(Value::Bool(true)));
        let branch = Node::new(ids.fresh(), NodeKind::Literal(Value::Int(1)));
        let stmt = Node::new(
            ids.fresh(),
            NodeKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(branch),
                else_branch: None,
            },
        );
        let root = Node::new(ids.fresh(), NodeKind::Block(vec![stmt]));
        let err = structure(&root).unwrap_err();
        assert!(err.detail.contains("block"));
    }

    #[test]
    fn test_rejects_duplicate_parameters() {
        let err = structure(&parse("(block (defn f (a a) (block (return a))))")).unwrap_err();
        assert!(err.detail.contains("duplicate parameter"));
    }

    #[test]
    fn test_rejects_nonfinite_float_literal() {
        let mut ids = IdGen::new();
        let lit = Node::new(ids.fresh(), NodeKind::Literal(Value::Float(f64::INFINITY)));
        let assign = Node::new(
            ids.fresh(),
            NodeKind::Assign {
                target: "x".to_string(),
                value: Box::new(lit),
            },
        );
        let root = Node::new(ids.fresh(), NodeKind::Block(vec![assign]));
        assert!(structure(&root).is_err());
    }

    #[test]
    fn test_free_names_of_closed_program() {
        let tree = parse("(block (assign x 1) (return x))");
        assert!(free_names(&tree).is_empty());
    }

    #[test]
    fn test_free_names_reports_unbound_reads() {
        let tree = parse("(block (return (binop + x y)))");
        let free = free_names(&tree);
        assert!(free.contains("x"));
        assert!(free.contains("y"));
    }

    #[test]
    fn test_free_names_include_builtin_reads() {
        let tree = parse("(block (for i (call range 3) (block)))");
        let free = free_names(&tree);
        assert!(free.contains("range"));
        assert!(!free.contains("i"));
    }

    #[test]
    fn test_function_scope_binds_params_and_locals() {
        let tree = parse(
            "(block (assign g 1) (defn f (p) (block (assign t p) (return (binop + t g)))))",
        );
        assert!(free_names(&tree).is_empty());
    }

    #[test]
    fn test_function_read_of_missing_global_is_free() {
        let tree = parse("(block (defn f () (block (return elsewhere))))");
        assert!(free_names(&tree).contains("elsewhere"));
    }
}
