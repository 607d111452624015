//! Source tree data model.
//!
//! Trees are immutable from the point of view of the passes: a rewrite
//! builds a replacement subtree, it never mutates nodes in place. Every
//! node carries a stable [`NodeId`] for diagnostics, and synthesized nodes
//! keep a non-owning `origin` back-reference to the node they were derived
//! from so rewrite logs can point at source positions after several rounds
//! of rewriting.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use itertools::Itertools;

use crate::sexpr::{self, SExpr};

/// Stable node identity, unique within one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Allocator for fresh node ids.
///
/// One generator lives for the whole pipeline run so ids stay unique
/// across every rewrite.
#[derive(Debug, Clone)]
pub struct IdGen {
    next: u32,
}

impl IdGen {
    pub fn new() -> Self {
        IdGen { next: 0 }
    }

    /// Start numbering above every id already present in `tree`.
    pub fn after(tree: &Node) -> Self {
        let mut max = 0;
        tree.visit(&mut |n| {
            if n.id.0 >= max {
                max = n.id.0 + 1;
            }
        });
        IdGen { next: max }
    }

    pub fn fresh(&mut self) -> NodeId {
        let id = NodeId(self.next);
        self.next += 1;
        id
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// A user function value: captured definition, shared cheaply between
/// environment frames.
#[derive(Debug)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Node,
}

/// Values of the object language.
///
/// The first six variants are literals and may appear in `Literal` nodes.
/// The remaining variants only exist at evaluation time; the reader never
/// produces them and `validate` rejects trees that contain them.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    None,
    /// Lazy integer range produced by the `range` builtin.
    Range { start: i64, stop: i64, step: i64 },
    /// User function (runtime only).
    Func(Rc<FuncDef>),
    /// Builtin function referenced by name (runtime only).
    Builtin(&'static str),
    /// Method bound to a receiver value (runtime only).
    Method { recv: Box<Value>, name: String },
    /// Mutable attribute record created by `object()` (runtime only).
    Object(Rc<RefCell<HashMap<String, Value>>>),
}

impl Value {
    /// True for values a `Literal` node is allowed to hold. Non-finite
    /// floats are excluded so every literal round-trips through the
    /// printer.
    pub fn is_literal(&self) -> bool {
        match self {
            Value::Int(_) | Value::Bool(_) | Value::Str(_) | Value::None => true,
            Value::Float(f) => f.is_finite(),
            Value::List(items) => items.iter().all(Value::is_literal),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::None => "none",
            Value::Range { .. } => "range",
            Value::Func(_) => "function",
            Value::Builtin(_) => "builtin",
            Value::Method { .. } => "method",
            Value::Object(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::None, Value::None) => true,
            (
                Value::Range { start, stop, step },
                Value::Range { start: s2, stop: e2, step: t2 },
            ) => start == s2 && stop == e2 && step == t2,
            // Identity comparison: objects and functions are reference-like.
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Method { recv: r1, name: n1 }, Value::Method { recv: r2, name: n2 }) => {
                n1 == n2 && r1 == r2
            }
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn escape_str(s: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "\"")?;
    for ch in s.chars() {
        match ch {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            '\n' => write!(f, "\\n")?,
            '\t' => write!(f, "\\t")?,
            _ => write!(f, "{}", ch)?,
        }
    }
    write!(f, "\"")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => {
                // Keep a decimal point so the literal reads back as a float.
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => escape_str(s, f),
            Value::List(items) => {
                write!(f, "(list")?;
                for item in items {
                    write!(f, " {}", item)?;
                }
                write!(f, ")")
            }
            Value::None => write!(f, "none"),
            Value::Range { start, stop, step } => {
                write!(f, "<range {} {} {}>", start, stop, step)
            }
            Value::Func(def) => write!(f, "<fn {}>", def.name),
            Value::Builtin(name) => write!(f, "<builtin {}>", name),
            Value::Method { name, .. } => write!(f, "<method {}>", name),
            Value::Object(_) => write!(f, "<object>"),
        }
    }
}

/// Binary operators. `And`/`Or` are strict in this language: both
/// operands are always evaluated and the result is a bool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOpKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOpKind::Add => "+",
            BinOpKind::Sub => "-",
            BinOpKind::Mul => "*",
            BinOpKind::Div => "/",
            BinOpKind::Mod => "%",
            BinOpKind::Eq => "==",
            BinOpKind::Ne => "!=",
            BinOpKind::Lt => "<",
            BinOpKind::Le => "<=",
            BinOpKind::Gt => ">",
            BinOpKind::Ge => ">=",
            BinOpKind::And => "and",
            BinOpKind::Or => "or",
        }
    }

    pub fn from_symbol(sym: &str) -> Option<BinOpKind> {
        let op = match sym {
            "+" => BinOpKind::Add,
            "-" => BinOpKind::Sub,
            "*" => BinOpKind::Mul,
            "/" => BinOpKind::Div,
            "%" => BinOpKind::Mod,
            "==" => BinOpKind::Eq,
            "!=" => BinOpKind::Ne,
            "<" => BinOpKind::Lt,
            "<=" => BinOpKind::Le,
            ">" => BinOpKind::Gt,
            ">=" => BinOpKind::Ge,
            "and" => BinOpKind::And,
            "or" => BinOpKind::Or,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for BinOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// The node variants of the object language.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Literal(Value),
    Name(String),
    Attribute {
        object: Box<Node>,
        attr: String,
    },
    Call {
        callee: Box<Node>,
        args: Vec<Node>,
    },
    BinOp {
        op: BinOpKind,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    If {
        cond: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Option<Box<Node>>,
    },
    For {
        var: String,
        iter: Box<Node>,
        body: Box<Node>,
    },
    FunctionDef {
        name: String,
        params: Vec<String>,
        body: Box<Node>,
    },
    Assign {
        target: String,
        value: Box<Node>,
    },
    Return(Option<Box<Node>>),
    Block(Vec<Node>),
}

/// One tree node. Children are owned; `origin` is a diagnostic
/// back-reference only and never affects semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub origin: Option<NodeId>,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind) -> Node {
        Node {
            id,
            kind,
            origin: None,
        }
    }

    /// A node produced by a rewrite, pointing back at its source.
    pub fn derived(id: NodeId, origin: NodeId, kind: NodeKind) -> Node {
        Node {
            id,
            kind,
            origin: Some(origin),
        }
    }

    /// Provenance for nodes derived from this one: the original source
    /// node, even after several generations of rewriting.
    pub fn provenance(&self) -> NodeId {
        self.origin.unwrap_or(self.id)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, NodeKind::Literal(_))
    }

    pub fn literal(&self) -> Option<&Value> {
        match &self.kind {
            NodeKind::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Statement node kinds may appear only as direct items of a `Block`.
    pub fn is_statement(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::If { .. }
                | NodeKind::For { .. }
                | NodeKind::FunctionDef { .. }
                | NodeKind::Assign { .. }
                | NodeKind::Return(_)
                | NodeKind::Block(_)
        )
    }

    /// Number of nodes in this subtree, root included.
    pub fn count(&self) -> usize {
        let mut n = 0;
        self.visit(&mut |_| n += 1);
        n
    }

    /// Preorder walk over the subtree.
    pub fn visit(&self, f: &mut impl FnMut(&Node)) {
        f(self);
        match &self.kind {
            NodeKind::Literal(_) | NodeKind::Name(_) => {}
            NodeKind::Attribute { object, .. } => object.visit(f),
            NodeKind::Call { callee, args } => {
                callee.visit(f);
                for arg in args {
                    arg.visit(f);
                }
            }
            NodeKind::BinOp { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.visit(f);
                then_branch.visit(f);
                if let Some(e) = else_branch {
                    e.visit(f);
                }
            }
            NodeKind::For { iter, body, .. } => {
                iter.visit(f);
                body.visit(f);
            }
            NodeKind::FunctionDef { body, .. } => body.visit(f),
            NodeKind::Assign { value, .. } => value.visit(f),
            NodeKind::Return(value) => {
                if let Some(v) = value {
                    v.visit(f);
                }
            }
            NodeKind::Block(items) => {
                for item in items {
                    item.visit(f);
                }
            }
        }
    }

    /// Structural equality, ignoring ids and provenance.
    pub fn same_shape(&self, other: &Node) -> bool {
        match (&self.kind, &other.kind) {
            (NodeKind::Literal(a), NodeKind::Literal(b)) => a == b,
            (NodeKind::Name(a), NodeKind::Name(b)) => a == b,
            (
                NodeKind::Attribute { object: o1, attr: a1 },
                NodeKind::Attribute { object: o2, attr: a2 },
            ) => a1 == a2 && o1.same_shape(o2),
            (
                NodeKind::Call { callee: c1, args: a1 },
                NodeKind::Call { callee: c2, args: a2 },
            ) => {
                c1.same_shape(c2)
                    && a1.len() == a2.len()
                    && a1.iter().zip(a2).all(|(x, y)| x.same_shape(y))
            }
            (
                NodeKind::BinOp { op: op1, lhs: l1, rhs: r1 },
                NodeKind::BinOp { op: op2, lhs: l2, rhs: r2 },
            ) => op1 == op2 && l1.same_shape(l2) && r1.same_shape(r2),
            (
                NodeKind::If { cond: c1, then_branch: t1, else_branch: e1 },
                NodeKind::If { cond: c2, then_branch: t2, else_branch: e2 },
            ) => {
                c1.same_shape(c2)
                    && t1.same_shape(t2)
                    && match (e1, e2) {
                        (Some(a), Some(b)) => a.same_shape(b),
                        (None, None) => true,
                        _ => false,
                    }
            }
            (
                NodeKind::For { var: v1, iter: i1, body: b1 },
                NodeKind::For { var: v2, iter: i2, body: b2 },
            ) => v1 == v2 && i1.same_shape(i2) && b1.same_shape(b2),
            (
                NodeKind::FunctionDef { name: n1, params: p1, body: b1 },
                NodeKind::FunctionDef { name: n2, params: p2, body: b2 },
            ) => n1 == n2 && p1 == p2 && b1.same_shape(b2),
            (
                NodeKind::Assign { target: t1, value: v1 },
                NodeKind::Assign { target: t2, value: v2 },
            ) => t1 == t2 && v1.same_shape(v2),
            (NodeKind::Return(a), NodeKind::Return(b)) => match (a, b) {
                (Some(x), Some(y)) => x.same_shape(y),
                (None, None) => true,
                _ => false,
            },
            (NodeKind::Block(a), NodeKind::Block(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_shape(y))
            }
            _ => false,
        }
    }

    /// Number of `Name` reads of `name` in this subtree. Assignment
    /// targets, loop variables and parameter lists are binders, not
    /// reads, and do not count.
    pub fn reads_of(&self, name: &str) -> usize {
        let mut n = 0;
        self.visit(&mut |node| {
            if let NodeKind::Name(read) = &node.kind {
                if read == name {
                    n += 1;
                }
            }
        });
        n
    }

    /// Every name bound somewhere in this subtree: assignment targets,
    /// loop variables, function names and parameters. Conservative in
    /// that nested function bodies are included.
    pub fn bound_names(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        self.visit(&mut |node| match &node.kind {
            NodeKind::Assign { target, .. } => {
                out.insert(target.clone());
            }
            NodeKind::For { var, .. } => {
                out.insert(var.clone());
            }
            NodeKind::FunctionDef { name, params, .. } => {
                out.insert(name.clone());
                for p in params {
                    out.insert(p.clone());
                }
            }
            _ => {}
        });
        out
    }

    /// Deep copy with fresh ids, keeping provenance. See [`refresh_ids`].
    pub fn refresh_ids(&self, ids: &mut IdGen) -> Node {
        refresh_ids(self, ids)
    }
}

/// Deep copy with fresh ids. Every copied node keeps the provenance of
/// its source, so diagnostics still point at the original tree.
pub fn refresh_ids(node: &Node, ids: &mut IdGen) -> Node {
    let kind = match &node.kind {
        NodeKind::Literal(v) => NodeKind::Literal(v.clone()),
        NodeKind::Name(n) => NodeKind::Name(n.clone()),
        NodeKind::Attribute { object, attr } => NodeKind::Attribute {
            object: Box::new(refresh_ids(object, ids)),
            attr: attr.clone(),
        },
        NodeKind::Call { callee, args } => NodeKind::Call {
            callee: Box::new(refresh_ids(callee, ids)),
            args: args.iter().map(|a| refresh_ids(a, ids)).collect(),
        },
        NodeKind::BinOp { op, lhs, rhs } => NodeKind::BinOp {
            op: *op,
            lhs: Box::new(refresh_ids(lhs, ids)),
            rhs: Box::new(refresh_ids(rhs, ids)),
        },
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => NodeKind::If {
            cond: Box::new(refresh_ids(cond, ids)),
            then_branch: Box::new(refresh_ids(then_branch, ids)),
            else_branch: else_branch
                .as_ref()
                .map(|e| Box::new(refresh_ids(e, ids))),
        },
        NodeKind::For { var, iter, body } => NodeKind::For {
            var: var.clone(),
            iter: Box::new(refresh_ids(iter, ids)),
            body: Box::new(refresh_ids(body, ids)),
        },
        NodeKind::FunctionDef { name, params, body } => NodeKind::FunctionDef {
            name: name.clone(),
            params: params.clone(),
            body: Box::new(refresh_ids(body, ids)),
        },
        NodeKind::Assign { target, value } => NodeKind::Assign {
            target: target.clone(),
            value: Box::new(refresh_ids(value, ids)),
        },
        NodeKind::Return(value) => {
            NodeKind::Return(value.as_ref().map(|v| Box::new(refresh_ids(v, ids))))
        }
        NodeKind::Block(items) => {
            NodeKind::Block(items.iter().map(|i| refresh_ids(i, ids)).collect())
        }
    };
    Node {
        id: ids.fresh(),
        kind,
        origin: Some(node.provenance()),
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Literal(v) => write!(f, "{}", v),
            NodeKind::Name(n) => write!(f, "{}", n),
            NodeKind::Attribute { object, attr } => write!(f, "(attr {} {})", object, attr),
            NodeKind::Call { callee, args } => {
                write!(f, "(call {}", callee)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                write!(f, ")")
            }
            NodeKind::BinOp { op, lhs, rhs } => write!(f, "(binop {} {} {})", op, lhs, rhs),
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                write!(f, "(if {} {}", cond, then_branch)?;
                if let Some(e) = else_branch {
                    write!(f, " {}", e)?;
                }
                write!(f, ")")
            }
            NodeKind::For { var, iter, body } => write!(f, "(for {} {} {})", var, iter, body),
            NodeKind::FunctionDef { name, params, body } => {
                write!(f, "(defn {} ({}) {})", name, params.iter().format(" "), body)
            }
            NodeKind::Assign { target, value } => write!(f, "(assign {} {})", target, value),
            NodeKind::Return(value) => match value {
                Some(v) => write!(f, "(return {})", v),
                None => write!(f, "(return)"),
            },
            NodeKind::Block(items) => {
                write!(f, "(block")?;
                for item in items {
                    write!(f, " {}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Node {
    /// Indented rendering for CLI output. Reads back identically to the
    /// single-line `Display` form.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.pretty_into(&mut out, 0);
        out.push('\n');
        out
    }

    fn pretty_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        match &self.kind {
            NodeKind::Block(items) => {
                out.push_str(&pad);
                out.push_str("(block");
                for item in items {
                    out.push('\n');
                    item.pretty_into(out, depth + 1);
                }
                out.push(')');
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                out.push_str(&pad);
                out.push_str(&format!("(if {}\n", cond));
                then_branch.pretty_into(out, depth + 1);
                if let Some(e) = else_branch {
                    out.push('\n');
                    e.pretty_into(out, depth + 1);
                }
                out.push(')');
            }
            NodeKind::For { var, iter, body } => {
                out.push_str(&pad);
                out.push_str(&format!("(for {} {}\n", var, iter));
                body.pretty_into(out, depth + 1);
                out.push(')');
            }
            NodeKind::FunctionDef { name, params, body } => {
                out.push_str(&pad);
                out.push_str(&format!("(defn {} ({})\n", name, params.join(" ")));
                body.pretty_into(out, depth + 1);
                out.push(')');
            }
            _ => {
                out.push_str(&pad);
                out.push_str(&self.to_string());
            }
        }
    }
}

fn expect_atom(expr: &SExpr) -> Result<&str, String> {
    match expr {
        SExpr::Atom(s) => Ok(s),
        other => Err(format!("expected a symbol, found {}", other)),
    }
}

fn lower_block(expr: &SExpr, ids: &mut IdGen) -> Result<Node, String> {
    let node = lower(expr, ids)?;
    match node.kind {
        NodeKind::Block(_) => Ok(node),
        _ => Err(format!("expected a (block ...) form, found {}", node)),
    }
}

/// Lower one s-expression into a tree node.
fn lower(expr: &SExpr, ids: &mut IdGen) -> Result<Node, String> {
    match expr {
        SExpr::Atom(s) => {
            let kind = match s.as_str() {
                "true" => NodeKind::Literal(Value::Bool(true)),
                "false" => NodeKind::Literal(Value::Bool(false)),
                "none" => NodeKind::Literal(Value::None),
                name => NodeKind::Name(name.to_string()),
            };
            Ok(Node::new(ids.fresh(), kind))
        }
        SExpr::Str(s) => Ok(Node::new(ids.fresh(), NodeKind::Literal(Value::Str(s.clone())))),
        SExpr::Int(n) => Ok(Node::new(ids.fresh(), NodeKind::Literal(Value::Int(*n)))),
        SExpr::Float(x) => Ok(Node::new(ids.fresh(), NodeKind::Literal(Value::Float(*x)))),
        SExpr::List(items) => {
            let head = match items.first() {
                Some(SExpr::Atom(s)) => s.as_str(),
                Some(other) => return Err(format!("expected a form head symbol, found {}", other)),
                None => return Err("empty form".to_string()),
            };
            let rest = &items[1..];
            let kind = match head {
                "block" => {
                    let stmts = rest
                        .iter()
                        .map(|s| lower(s, ids))
                        .collect::<Result<Vec<_>, _>>()?;
                    NodeKind::Block(stmts)
                }
                "assign" => {
                    if rest.len() != 2 {
                        return Err(format!("assign takes a name and a value, got {} items", rest.len()));
                    }
                    NodeKind::Assign {
                        target: expect_atom(&rest[0])?.to_string(),
                        value: Box::new(lower(&rest[1], ids)?),
                    }
                }
                "if" => {
                    if rest.len() != 2 && rest.len() != 3 {
                        return Err("if takes a condition, a then block and an optional else block".to_string());
                    }
                    NodeKind::If {
                        cond: Box::new(lower(&rest[0], ids)?),
                        then_branch: Box::new(lower_block(&rest[1], ids)?),
                        else_branch: match rest.get(2) {
                            Some(e) => Some(Box::new(lower_block(e, ids)?)),
                            None => None,
                        },
                    }
                }
                "for" => {
                    if rest.len() != 3 {
                        return Err("for takes a variable, an iterable and a body block".to_string());
                    }
                    NodeKind::For {
                        var: expect_atom(&rest[0])?.to_string(),
                        iter: Box::new(lower(&rest[1], ids)?),
                        body: Box::new(lower_block(&rest[2], ids)?),
                    }
                }
                "defn" => {
                    if rest.len() != 3 {
                        return Err("defn takes a name, a parameter list and a body block".to_string());
                    }
                    let params = match &rest[1] {
                        SExpr::List(ps) => ps
                            .iter()
                            .map(|p| expect_atom(p).map(str::to_string))
                            .collect::<Result<Vec<_>, _>>()?,
                        other => return Err(format!("expected a parameter list, found {}", other)),
                    };
                    NodeKind::FunctionDef {
                        name: expect_atom(&rest[0])?.to_string(),
                        params,
                        body: Box::new(lower_block(&rest[2], ids)?),
                    }
                }
                "return" => match rest.len() {
                    0 => NodeKind::Return(None),
                    1 => NodeKind::Return(Some(Box::new(lower(&rest[0], ids)?))),
                    n => return Err(format!("return takes at most one value, got {}", n)),
                },
                "binop" => {
                    if rest.len() != 3 {
                        return Err("binop takes an operator and two operands".to_string());
                    }
                    let sym = expect_atom(&rest[0])?;
                    let op = BinOpKind::from_symbol(sym)
                        .ok_or_else(|| format!("unknown operator: {}", sym))?;
                    NodeKind::BinOp {
                        op,
                        lhs: Box::new(lower(&rest[1], ids)?),
                        rhs: Box::new(lower(&rest[2], ids)?),
                    }
                }
                "call" => {
                    if rest.is_empty() {
                        return Err("call takes a callee".to_string());
                    }
                    NodeKind::Call {
                        callee: Box::new(lower(&rest[0], ids)?),
                        args: rest[1..]
                            .iter()
                            .map(|a| lower(a, ids))
                            .collect::<Result<Vec<_>, _>>()?,
                    }
                }
                "attr" => {
                    if rest.len() != 2 {
                        return Err("attr takes an object and an attribute name".to_string());
                    }
                    NodeKind::Attribute {
                        object: Box::new(lower(&rest[0], ids)?),
                        attr: expect_atom(&rest[1])?.to_string(),
                    }
                }
                "list" => {
                    let mut values = Vec::with_capacity(rest.len());
                    for item in rest {
                        let node = lower(item, ids)?;
                        match node.kind {
                            NodeKind::Literal(v) => values.push(v),
                            other => {
                                return Err(format!(
                                    "list literal elements must be literals, found {}",
                                    Node::new(NodeId(0), other)
                                ))
                            }
                        }
                    }
                    NodeKind::Literal(Value::List(values))
                }
                "name" => {
                    if rest.len() != 1 {
                        return Err("name takes one symbol".to_string());
                    }
                    NodeKind::Name(expect_atom(&rest[0])?.to_string())
                }
                other => return Err(format!("unknown form: {}", other)),
            };
            Ok(Node::new(ids.fresh(), kind))
        }
    }
}

/// Parse a whole program from text. Multiple top-level forms are wrapped
/// in a single block; a single top-level `(block ...)` is used as-is.
pub fn parse_program(input: &str) -> Result<Node, String> {
    let exprs = sexpr::parse(input)?;
    let mut ids = IdGen::new();
    if exprs.is_empty() {
        return Err("empty input".to_string());
    }
    if exprs.len() == 1 {
        let node = lower(&exprs[0], &mut ids)?;
        if matches!(node.kind, NodeKind::Block(_)) {
            return Ok(node);
        }
        return Ok(Node::new(ids.fresh(), NodeKind::Block(vec![node])));
    }
    let stmts = exprs
        .iter()
        .map(|e| lower(e, &mut ids))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Node::new(ids.fresh(), NodeKind::Block(stmts)))
}
