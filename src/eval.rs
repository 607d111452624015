//! Reference interpreter.
//!
//! This is the executable definition of the language: the pipeline's
//! equivalence tests and the CLI `--check` mode run the input tree and
//! the optimized tree side by side and compare outcomes. Evaluation is
//! fuel-bounded so a non-terminating input cannot hang the check.
//!
//! Scoping is dynamic and two-level: a call pushes a fresh frame whose
//! parent is always the module frame. Assignment binds in the current
//! frame. There are no closures.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::builtins::{self, OpError};
use crate::tree::{FuncDef, Node, NodeKind, Value};

/// Limit on call nesting, independent of fuel.
const MAX_CALL_DEPTH: usize = 256;

/// Runtime error raised by the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    UnboundName(String),
    NotCallable(String),
    MissingAttribute { on: String, attr: String },
    ArityMismatch { callee: String, expected: usize, got: usize },
    DivideByZero,
    Overflow,
    Type(String),
    RecursionLimit,
    FuelExhausted,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::UnboundName(name) => write!(f, "name '{}' is not bound", name),
            EvalError::NotCallable(what) => write!(f, "{} is not callable", what),
            EvalError::MissingAttribute { on, attr } => {
                write!(f, "{} has no attribute '{}'", on, attr)
            }
            EvalError::ArityMismatch { callee, expected, got } => {
                write!(f, "{}() takes {} arguments, got {}", callee, expected, got)
            }
            EvalError::DivideByZero => write!(f, "division by zero"),
            EvalError::Overflow => write!(f, "integer overflow"),
            EvalError::Type(msg) => write!(f, "{}", msg),
            EvalError::RecursionLimit => write!(f, "recursion limit reached"),
            EvalError::FuelExhausted => write!(f, "evaluation fuel exhausted"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<OpError> for EvalError {
    fn from(err: OpError) -> EvalError {
        match err {
            OpError::DivideByZero => EvalError::DivideByZero,
            OpError::Overflow => EvalError::Overflow,
            OpError::Type(msg) => EvalError::Type(msg),
        }
    }
}

/// Work counters, tracked so tests can assert that an optimized tree
/// does strictly less work than its source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    /// Nodes evaluated.
    pub steps: u64,
    /// Observable effects: `print` lines and `setattr` stores.
    pub side_effects: u64,
    /// Attribute lookups, including method binding on strings.
    pub attr_lookups: u64,
    /// User function calls.
    pub calls: u64,
}

/// Result of running a program to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Value of a module-level `return`, or none.
    pub value: Value,
    /// Lines produced by `print`, in order.
    pub output: Vec<String>,
    pub stats: EvalStats,
}

enum Flow {
    Normal,
    Return(Value),
}

pub struct Interp {
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
    fuel: u64,
    output: Vec<String>,
    stats: EvalStats,
}

/// Run a whole program with the given fuel budget.
pub fn run_program(tree: &Node, fuel: u64) -> Result<Outcome, EvalError> {
    let mut interp = Interp::new(fuel);
    let value = interp.run(tree)?;
    Ok(Outcome {
        value,
        output: interp.output,
        stats: interp.stats,
    })
}

impl Interp {
    pub fn new(fuel: u64) -> Self {
        Interp {
            globals: HashMap::new(),
            frames: Vec::new(),
            fuel,
            output: Vec::new(),
            stats: EvalStats::default(),
        }
    }

    /// Execute `tree` as a module body. A module-level `return` stops
    /// execution and becomes the program value.
    pub fn run(&mut self, tree: &Node) -> Result<Value, EvalError> {
        match self.exec(tree)? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::None),
        }
    }

    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    fn tick(&mut self) -> Result<(), EvalError> {
        if self.fuel == 0 {
            return Err(EvalError::FuelExhausted);
        }
        self.fuel -= 1;
        self.stats.steps += 1;
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(frame) = self.frames.last() {
            if let Some(v) = frame.get(name) {
                return Some(v.clone());
            }
        }
        if let Some(v) = self.globals.get(name) {
            return Some(v.clone());
        }
        builtins::builtin_name(name).map(Value::Builtin)
    }

    fn assign(&mut self, name: &str, value: Value) {
        let frame = self.frames.last_mut().unwrap_or(&mut self.globals);
        frame.insert(name.to_string(), value);
    }

    fn exec(&mut self, node: &Node) -> Result<Flow, EvalError> {
        self.tick()?;
        match &node.kind {
            NodeKind::Block(items) => {
                for item in items {
                    if let Flow::Return(v) = self.exec(item)? {
                        return Ok(Flow::Return(v));
                    }
                }
                Ok(Flow::Normal)
            }
            NodeKind::Assign { target, value } => {
                let v = self.eval_expr(value)?;
                self.assign(target, v);
                Ok(Flow::Normal)
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let c = self.eval_expr(cond)?;
                if builtins::truthy(&c) {
                    self.exec(then_branch)
                } else if let Some(e) = else_branch {
                    self.exec(e)
                } else {
                    Ok(Flow::Normal)
                }
            }
            NodeKind::For { var, iter, body } => {
                let iterable = self.eval_expr(iter)?;
                self.iterate(var, &iterable, body)
            }
            NodeKind::FunctionDef { name, params, body } => {
                let def = FuncDef {
                    name: name.clone(),
                    params: params.clone(),
                    body: (**body).clone(),
                };
                self.assign(name, Value::Func(Rc::new(def)));
                Ok(Flow::Normal)
            }
            NodeKind::Return(value) => {
                let v = match value {
                    Some(v) => self.eval_expr(v)?,
                    None => Value::None,
                };
                Ok(Flow::Return(v))
            }
            // Bare expression in statement position: evaluate for effect.
            _ => {
                self.eval_expr_inner(node)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn iterate(&mut self, var: &str, iterable: &Value, body: &Node) -> Result<Flow, EvalError> {
        match iterable {
            Value::Range { start, stop, step } => {
                let mut i = *start;
                loop {
                    let done = if *step > 0 { i >= *stop } else { i <= *stop };
                    if done {
                        break;
                    }
                    self.assign(var, Value::Int(i));
                    if let Flow::Return(v) = self.exec(body)? {
                        return Ok(Flow::Return(v));
                    }
                    i = match i.checked_add(*step) {
                        Some(next) => next,
                        None => break,
                    };
                }
                Ok(Flow::Normal)
            }
            Value::List(items) => {
                for item in items.clone() {
                    self.assign(var, item);
                    if let Flow::Return(v) = self.exec(body)? {
                        return Ok(Flow::Return(v));
                    }
                }
                Ok(Flow::Normal)
            }
            other => Err(EvalError::Type(format!(
                "cannot iterate over {}",
                other.type_name()
            ))),
        }
    }

    fn eval_expr(&mut self, node: &Node) -> Result<Value, EvalError> {
        self.tick()?;
        self.eval_expr_inner(node)
    }

    fn eval_expr_inner(&mut self, node: &Node) -> Result<Value, EvalError> {
        match &node.kind {
            NodeKind::Literal(v) => Ok(v.clone()),
            NodeKind::Name(name) => self
                .lookup(name)
                .ok_or_else(|| EvalError::UnboundName(name.clone())),
            NodeKind::BinOp { op, lhs, rhs } => {
                let l = self.eval_expr(lhs)?;
                let r = self.eval_expr(rhs)?;
                Ok(builtins::apply_binop(*op, &l, &r)?)
            }
            NodeKind::Attribute { object, attr } => {
                let obj = self.eval_expr(object)?;
                self.attr_lookup(&obj, attr)
            }
            NodeKind::Call { callee, args } => {
                let callee_value = self.eval_expr(callee)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval_expr(arg)?);
                }
                self.call_value(&callee_value, arg_values)
            }
            _ => Err(EvalError::Type(
                "statement in expression position".to_string(),
            )),
        }
    }

    fn attr_lookup(&mut self, obj: &Value, attr: &str) -> Result<Value, EvalError> {
        self.stats.attr_lookups += 1;
        match obj {
            Value::Str(s) => {
                if builtins::is_str_method(attr) {
                    Ok(Value::Method {
                        recv: Box::new(Value::Str(s.clone())),
                        name: attr.to_string(),
                    })
                } else {
                    Err(EvalError::MissingAttribute {
                        on: "str".to_string(),
                        attr: attr.to_string(),
                    })
                }
            }
            Value::Object(fields) => match fields.borrow().get(attr) {
                Some(v) => Ok(v.clone()),
                None => Err(EvalError::MissingAttribute {
                    on: "object".to_string(),
                    attr: attr.to_string(),
                }),
            },
            other => Err(EvalError::MissingAttribute {
                on: other.type_name().to_string(),
                attr: attr.to_string(),
            }),
        }
    }

    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, EvalError> {
        match callee {
            Value::Func(def) => {
                if args.len() != def.params.len() {
                    return Err(EvalError::ArityMismatch {
                        callee: def.name.clone(),
                        expected: def.params.len(),
                        got: args.len(),
                    });
                }
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(EvalError::RecursionLimit);
                }
                self.stats.calls += 1;
                let mut frame = HashMap::with_capacity(def.params.len());
                for (param, arg) in def.params.iter().zip(args) {
                    frame.insert(param.clone(), arg);
                }
                self.frames.push(frame);
                let flow = self.exec(&def.body);
                self.frames.pop();
                match flow? {
                    Flow::Return(v) => Ok(v),
                    Flow::Normal => Ok(Value::None),
                }
            }
            Value::Builtin(name) => self.call_builtin(name, args),
            Value::Method { recv, name } => match recv.as_ref() {
                Value::Str(s) => match builtins::str_method(s, name, &args) {
                    Some(result) => Ok(result?),
                    None => Err(EvalError::MissingAttribute {
                        on: "str".to_string(),
                        attr: name.clone(),
                    }),
                },
                other => Err(EvalError::NotCallable(format!(
                    "method on {}",
                    other.type_name()
                ))),
            },
            other => Err(EvalError::NotCallable(other.type_name().to_string())),
        }
    }

    fn call_builtin(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        match name {
            "print" => {
                let line = args
                    .iter()
                    .map(print_repr)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.output.push(line);
                self.stats.side_effects += 1;
                Ok(Value::None)
            }
            "object" => {
                if !args.is_empty() {
                    return Err(EvalError::ArityMismatch {
                        callee: "object".to_string(),
                        expected: 0,
                        got: args.len(),
                    });
                }
                Ok(Value::Object(Rc::new(RefCell::new(HashMap::new()))))
            }
            "setattr" => match args.as_slice() {
                [Value::Object(fields), Value::Str(attr), value] => {
                    fields.borrow_mut().insert(attr.clone(), value.clone());
                    self.stats.side_effects += 1;
                    Ok(Value::None)
                }
                _ => Err(EvalError::Type(
                    "setattr() takes an object, a string and a value".to_string(),
                )),
            },
            "getattr" => match args.as_slice() {
                [obj, Value::Str(attr)] => self.attr_lookup(obj, attr),
                [obj, Value::Str(attr), default] => match self.attr_lookup(obj, attr) {
                    Ok(v) => Ok(v),
                    Err(EvalError::MissingAttribute { .. }) => Ok(default.clone()),
                    Err(e) => Err(e),
                },
                _ => Err(EvalError::Type(
                    "getattr() takes a value, a string and an optional default".to_string(),
                )),
            },
            "globals" => {
                if !args.is_empty() {
                    return Err(EvalError::ArityMismatch {
                        callee: "globals".to_string(),
                        expected: 0,
                        got: args.len(),
                    });
                }
                let snapshot: HashMap<String, Value> = self
                    .globals
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(Value::Object(Rc::new(RefCell::new(snapshot))))
            }
            _ => Ok(builtins::call_pure_builtin(name, &args)?),
        }
    }
}

/// `print` renders strings without quotes; everything else uses the
/// literal form.
fn print_repr(v: &Value) -> String {
    match v {
        Value::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::parse_program;

    const FUEL: u64 = 100_000;

    fn run(src: &str) -> Outcome {
        run_program(&parse_program(src).unwrap(), FUEL).unwrap()
    }

    fn run_err(src: &str) -> EvalError {
        run_program(&parse_program(src).unwrap(), FUEL).unwrap_err()
    }

    #[test]
    fn test_sum_loop() {
        let out = run(
            "(block (assign s 0) (for i (call range 10) (block (assign s (binop + s i)))) (return s))",
        );
        assert_eq!(out.value, Value::Int(45));
    }

    #[test]
    fn test_loop_var_keeps_final_value() {
        let out = run("(block (for i (call range 0 10 3) (block)) (return i))");
        assert_eq!(out.value, Value::Int(9));
    }

    #[test]
    fn test_zero_trip_loop_leaves_var_unbound() {
        let err = run_err("(block (for i (call range 0) (block)) (return i))");
        assert_eq!(err, EvalError::UnboundName("i".to_string()));
    }

    #[test]
    fn test_list_iteration() {
        let out = run("(block (assign s 0) (for x (list 1 2 3) (block (assign s (binop + s x)))) (return s))");
        assert_eq!(out.value, Value::Int(6));
    }

    #[test]
    fn test_function_call_and_return() {
        let out = run("(block (defn add (a b) (block (return (binop + a b)))) (return (call add 2 3)))");
        assert_eq!(out.value, Value::Int(5));
    }

    #[test]
    fn test_function_without_return_yields_none() {
        let out = run("(block (defn f () (block (assign x 1))) (return (call f)))");
        assert_eq!(out.value, Value::None);
    }

    #[test]
    fn test_locals_do_not_leak() {
        let err = run_err("(block (defn f () (block (assign x 1))) (call f) (return x))");
        assert_eq!(err, EvalError::UnboundName("x".to_string()));
    }

    #[test]
    fn test_function_reads_module_binding() {
        let out = run("(block (assign g 7) (defn f () (block (return g))) (return (call f)))");
        assert_eq!(out.value, Value::Int(7));
    }

    #[test]
    fn test_no_closures_inner_frame_is_not_captured() {
        // f's local is invisible to g even when g is called from f.
        let src = "(block \
            (defn g () (block (return x))) \
            (defn f () (block (assign x 1) (return (call g)))) \
            (return (call f)))";
        let err = run_err(src);
        assert_eq!(err, EvalError::UnboundName("x".to_string()));
    }

    #[test]
    fn test_recursion() {
        let src = "(block \
            (defn fact (n) (block \
                (if (binop <= n 1) (block (return 1))) \
                (return (binop * n (call fact (binop - n 1)))))) \
            (return (call fact 5)))";
        let out = run(src);
        assert_eq!(out.value, Value::Int(120));
    }

    #[test]
    fn test_recursion_limit() {
        let err = run_err("(block (defn f () (block (return (call f)))) (call f))");
        assert_eq!(err, EvalError::RecursionLimit);
    }

    #[test]
    fn test_if_else() {
        let out = run("(block (if (binop < 2 1) (block (return 1)) (block (return 2))))");
        assert_eq!(out.value, Value::Int(2));
    }

    #[test]
    fn test_print_output() {
        let out = run(r#"(block (call print "hello" 42) (call print 1.5))"#);
        assert_eq!(out.output, vec!["hello 42".to_string(), "1.5".to_string()]);
        assert_eq!(out.stats.side_effects, 2);
    }

    #[test]
    fn test_str_method_call() {
        let out = run(r#"(block (assign v "python2.7") (return (call (attr v startswith) "python")))"#);
        assert_eq!(out.value, Value::Bool(true));
        assert_eq!(out.stats.attr_lookups, 1);
    }

    #[test]
    fn test_unknown_str_attribute() {
        let err = run_err(r#"(block (return (attr "x" cleanup)))"#);
        assert_eq!(
            err,
            EvalError::MissingAttribute {
                on: "str".to_string(),
                attr: "cleanup".to_string()
            }
        );
    }

    #[test]
    fn test_objects() {
        let src = r#"(block
            (assign o (call object))
            (call setattr o "version" 3)
            (return (binop + (attr o version) (call getattr o "missing" 10))))"#;
        let out = run(src);
        assert_eq!(out.value, Value::Int(13));
        assert_eq!(out.stats.side_effects, 1);
    }

    #[test]
    fn test_globals_snapshot() {
        let src = r#"(block
            (assign version 2)
            (assign env (call globals))
            (assign version 3)
            (return (attr env version)))"#;
        let out = run(src);
        assert_eq!(out.value, Value::Int(2));
    }

    #[test]
    fn test_division_by_zero_raises() {
        let err = run_err("(block (return (binop / 1 0)))");
        assert_eq!(err, EvalError::DivideByZero);
    }

    #[test]
    fn test_overflow_raises() {
        let err = run_err(&format!("(block (return (binop + {} 1)))", i64::MAX));
        assert_eq!(err, EvalError::Overflow);
    }

    #[test]
    fn test_unbound_name() {
        let err = run_err("(block (return nothing_here))");
        assert_eq!(err, EvalError::UnboundName("nothing_here".to_string()));
    }

    #[test]
    fn test_fuel_exhaustion() {
        let tree = parse_program(
            "(block (assign s 0) (for i (call range 1000000) (block (assign s (binop + s i)))))",
        )
        .unwrap();
        let err = run_program(&tree, 1_000).unwrap_err();
        assert_eq!(err, EvalError::FuelExhausted);
    }

    #[test]
    fn test_strict_and_evaluates_both_sides() {
        // Unlike short-circuit languages, the rhs effect always happens.
        let src = r#"(block
            (defn noisy () (block (call print "hit") (return true)))
            (assign r (binop and false (call noisy)))
            (return r))"#;
        let out = run(src);
        assert_eq!(out.value, Value::Bool(false));
        assert_eq!(out.output, vec!["hit".to_string()]);
    }

    #[test]
    fn test_steps_count_work() {
        let small = run("(block (return 1))");
        let large = run("(block (assign s 0) (for i (call range 50) (block (assign s (binop + s i)))) (return s))");
        assert!(large.stats.steps > small.stats.steps);
    }
}
