//! Builtin registry: the purity allow-list and the evaluation semantics
//! of operators and builtin callables.
//!
//! The constant folder and the reference interpreter both dispatch
//! through this module, so a folded value is computed by exactly the
//! code that would have computed it at run time. Arithmetic on `int` is
//! checked: overflow and division by zero are reported as errors here,
//! which the interpreter raises and the folder treats as a reason not
//! to fold.

use std::cmp::Ordering;
use std::fmt;

use crate::tree::{BinOpKind, Value};

/// Error from an operator or builtin application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    DivideByZero,
    Overflow,
    /// Operand or argument mismatch, with a human-readable detail.
    Type(String),
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::DivideByZero => write!(f, "division by zero"),
            OpError::Overflow => write!(f, "integer overflow"),
            OpError::Type(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for OpError {}

/// Builtins with no observable side effects. Safe to fold and to hoist.
const PURE_BUILTINS: &[&str] = &["range", "len", "abs", "min", "max"];

/// Builtins with effects or with access to mutable external state.
const IMPURE_BUILTINS: &[&str] = &["print", "object", "setattr", "getattr", "globals"];

/// Builtins that observe bindings or attributes dynamically. Their
/// presence anywhere in a unit makes read-set enumeration unreliable,
/// so dead-store elimination and global rebinding stand down.
const INTROSPECTION_BUILTINS: &[&str] = &["getattr", "globals"];

/// String methods known to be pure. All string methods this language
/// defines happen to be pure, so this doubles as the method table.
const PURE_STR_METHODS: &[&str] = &[
    "startswith",
    "endswith",
    "upper",
    "lower",
    "strip",
    "isdigit",
    "isalpha",
];

pub fn is_builtin(name: &str) -> bool {
    builtin_name(name).is_some()
}

/// The interned name of a builtin, used to make `Value::Builtin` cheap.
pub fn builtin_name(name: &str) -> Option<&'static str> {
    PURE_BUILTINS
        .iter()
        .chain(IMPURE_BUILTINS.iter())
        .find(|&&b| b == name)
        .copied()
}

pub fn is_pure_builtin(name: &str) -> bool {
    PURE_BUILTINS.contains(&name)
}

pub fn is_introspection_builtin(name: &str) -> bool {
    INTROSPECTION_BUILTINS.contains(&name)
}

pub fn is_str_method(name: &str) -> bool {
    PURE_STR_METHODS.contains(&name)
}

pub fn is_pure_str_method(name: &str) -> bool {
    PURE_STR_METHODS.contains(&name)
}

/// Truthiness of a value, used by `if`, `and` and `or`.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Int(n) => *n != 0,
        Value::Float(f) => *f != 0.0,
        Value::Bool(b) => *b,
        Value::Str(s) => !s.is_empty(),
        Value::List(items) => !items.is_empty(),
        Value::None => false,
        Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
        _ => true,
    }
}

/// Number of elements a range yields. Zero-length when the bounds point
/// the wrong way. A zero step is the caller's error, checked in `range`.
pub fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    debug_assert!(step != 0);
    let (start, stop, step) = (start as i128, stop as i128, step as i128);
    let span = if step > 0 { stop - start } else { start - stop };
    let step = step.abs();
    let count = (span + step - 1).div_euclid(step).max(0);
    count.min(i64::MAX as i128) as i64
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Value equality as the `==` operator sees it: numeric values compare
/// across int and float, everything else compares within its own type.
pub fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        _ => lhs == rhs,
    }
}

/// Ordering as `<` and friends see it, also used by `min`/`max`.
pub fn compare_values(lhs: &Value, rhs: &Value) -> Result<Ordering, OpError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => {
            if let (Some(a), Some(b)) = (as_f64(lhs), as_f64(rhs)) {
                a.partial_cmp(&b)
                    .ok_or_else(|| OpError::Type("cannot order nan".to_string()))
            } else {
                Err(OpError::Type(format!(
                    "cannot order {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                )))
            }
        }
    }
}

fn arith_type_error(op: BinOpKind, lhs: &Value, rhs: &Value) -> OpError {
    OpError::Type(format!(
        "unsupported operands for {}: {} and {}",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// Apply a binary operator. `and`/`or` are strict: both operands are
/// already evaluated by the time this runs, and the result is a bool.
pub fn apply_binop(op: BinOpKind, lhs: &Value, rhs: &Value) -> Result<Value, OpError> {
    match op {
        BinOpKind::Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_add(*b).map(Value::Int).ok_or(OpError::Overflow)
            }
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::List(out))
            }
            _ => match (as_f64(lhs), as_f64(rhs)) {
                (Some(a), Some(b)) => Ok(Value::Float(a + b)),
                _ => Err(arith_type_error(op, lhs, rhs)),
            },
        },
        BinOpKind::Sub => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_sub(*b).map(Value::Int).ok_or(OpError::Overflow)
            }
            _ => match (as_f64(lhs), as_f64(rhs)) {
                (Some(a), Some(b)) => Ok(Value::Float(a - b)),
                _ => Err(arith_type_error(op, lhs, rhs)),
            },
        },
        BinOpKind::Mul => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                a.checked_mul(*b).map(Value::Int).ok_or(OpError::Overflow)
            }
            _ => match (as_f64(lhs), as_f64(rhs)) {
                (Some(a), Some(b)) => Ok(Value::Float(a * b)),
                _ => Err(arith_type_error(op, lhs, rhs)),
            },
        },
        BinOpKind::Div => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    Err(OpError::DivideByZero)
                } else {
                    a.checked_div(*b).map(Value::Int).ok_or(OpError::Overflow)
                }
            }
            _ => match (as_f64(lhs), as_f64(rhs)) {
                (Some(a), Some(b)) => {
                    if b == 0.0 {
                        Err(OpError::DivideByZero)
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
                _ => Err(arith_type_error(op, lhs, rhs)),
            },
        },
        BinOpKind::Mod => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    Err(OpError::DivideByZero)
                } else {
                    a.checked_rem(*b).map(Value::Int).ok_or(OpError::Overflow)
                }
            }
            _ => Err(arith_type_error(op, lhs, rhs)),
        },
        BinOpKind::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        BinOpKind::Ne => Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinOpKind::Lt => Ok(Value::Bool(compare_values(lhs, rhs)? == Ordering::Less)),
        BinOpKind::Le => Ok(Value::Bool(compare_values(lhs, rhs)? != Ordering::Greater)),
        BinOpKind::Gt => Ok(Value::Bool(compare_values(lhs, rhs)? == Ordering::Greater)),
        BinOpKind::Ge => Ok(Value::Bool(compare_values(lhs, rhs)? != Ordering::Less)),
        BinOpKind::And => Ok(Value::Bool(truthy(lhs) && truthy(rhs))),
        BinOpKind::Or => Ok(Value::Bool(truthy(lhs) || truthy(rhs))),
    }
}

fn expect_arity(name: &str, args: &[Value], lo: usize, hi: usize) -> Result<(), OpError> {
    if args.len() < lo || args.len() > hi {
        return Err(OpError::Type(format!(
            "{}() takes {} to {} arguments, got {}",
            name,
            lo,
            hi,
            args.len()
        )));
    }
    Ok(())
}

fn expect_int(name: &str, v: &Value) -> Result<i64, OpError> {
    match v {
        Value::Int(n) => Ok(*n),
        other => Err(OpError::Type(format!(
            "{}() expects an int argument, got {}",
            name,
            other.type_name()
        ))),
    }
}

/// Apply one of the pure builtins. `range` returns a lazy range value.
pub fn call_pure_builtin(name: &str, args: &[Value]) -> Result<Value, OpError> {
    match name {
        "range" => {
            expect_arity("range", args, 1, 3)?;
            let (start, stop, step) = match args {
                [stop] => (0, expect_int("range", stop)?, 1),
                [start, stop] => (expect_int("range", start)?, expect_int("range", stop)?, 1),
                [start, stop, step] => (
                    expect_int("range", start)?,
                    expect_int("range", stop)?,
                    expect_int("range", step)?,
                ),
                _ => unreachable!(),
            };
            if step == 0 {
                return Err(OpError::Type("range() step must not be zero".to_string()));
            }
            Ok(Value::Range { start, stop, step })
        }
        "len" => {
            expect_arity("len", args, 1, 1)?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::Range { start, stop, step } => {
                    Ok(Value::Int(range_len(*start, *stop, *step)))
                }
                other => Err(OpError::Type(format!(
                    "len() got an unsized {}",
                    other.type_name()
                ))),
            }
        }
        "abs" => {
            expect_arity("abs", args, 1, 1)?;
            match &args[0] {
                Value::Int(n) => n.checked_abs().map(Value::Int).ok_or(OpError::Overflow),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(OpError::Type(format!(
                    "abs() expects a number, got {}",
                    other.type_name()
                ))),
            }
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(OpError::Type(format!("{}() expects arguments", name)));
            }
            let items: Vec<Value> = match args {
                [Value::List(items)] => {
                    if items.is_empty() {
                        return Err(OpError::Type(format!("{}() arg is an empty list", name)));
                    }
                    items.clone()
                }
                _ => args.to_vec(),
            };
            let mut best = items[0].clone();
            for item in &items[1..] {
                let ord = compare_values(item, &best)?;
                let better = if name == "min" {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                if better {
                    best = item.clone();
                }
            }
            Ok(best)
        }
        other => Err(OpError::Type(format!("{}() is not a pure builtin", other))),
    }
}

/// Apply a string method. `None` means the method does not exist.
pub fn str_method(recv: &str, name: &str, args: &[Value]) -> Option<Result<Value, OpError>> {
    let result = match name {
        "startswith" => match args {
            [Value::Str(prefix)] => Ok(Value::Bool(recv.starts_with(prefix.as_str()))),
            _ => Err(OpError::Type(
                "startswith() takes one string argument".to_string(),
            )),
        },
        "endswith" => match args {
            [Value::Str(suffix)] => Ok(Value::Bool(recv.ends_with(suffix.as_str()))),
            _ => Err(OpError::Type(
                "endswith() takes one string argument".to_string(),
            )),
        },
        "upper" => match args {
            [] => Ok(Value::Str(recv.to_uppercase())),
            _ => Err(OpError::Type("upper() takes no arguments".to_string())),
        },
        "lower" => match args {
            [] => Ok(Value::Str(recv.to_lowercase())),
            _ => Err(OpError::Type("lower() takes no arguments".to_string())),
        },
        "strip" => match args {
            [] => Ok(Value::Str(recv.trim().to_string())),
            _ => Err(OpError::Type("strip() takes no arguments".to_string())),
        },
        "isdigit" => match args {
            [] => Ok(Value::Bool(
                !recv.is_empty() && recv.chars().all(|c| c.is_ascii_digit()),
            )),
            _ => Err(OpError::Type("isdigit() takes no arguments".to_string())),
        },
        "isalpha" => match args {
            [] => Ok(Value::Bool(
                !recv.is_empty() && recv.chars().all(char::is_alphabetic),
            )),
            _ => Err(OpError::Type("isalpha() takes no arguments".to_string())),
        },
        _ => return None,
    };
    Some(result)
}

/// Fold-time builtin application: the call must be pure and the result
/// must be representable as a literal. `range` is pure but lazy, so it
/// is never folded.
pub fn fold_builtin_call(name: &str, args: &[Value]) -> Option<Result<Value, OpError>> {
    if !is_pure_builtin(name) || name == "range" {
        return None;
    }
    Some(call_pure_builtin(name, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic() {
        let v = apply_binop(BinOpKind::Add, &Value::Int(2), &Value::Int(3)).unwrap();
        assert_eq!(v, Value::Int(5));
        let v = apply_binop(BinOpKind::Mod, &Value::Int(7), &Value::Int(3)).unwrap();
        assert_eq!(v, Value::Int(1));
    }

    #[test]
    fn test_int_overflow_is_an_error() {
        let r = apply_binop(BinOpKind::Add, &Value::Int(i64::MAX), &Value::Int(1));
        assert_eq!(r, Err(OpError::Overflow));
        let r = apply_binop(BinOpKind::Div, &Value::Int(i64::MIN), &Value::Int(-1));
        assert_eq!(r, Err(OpError::Overflow));
    }

    #[test]
    fn test_division_by_zero() {
        let r = apply_binop(BinOpKind::Div, &Value::Int(1), &Value::Int(0));
        assert_eq!(r, Err(OpError::DivideByZero));
        let r = apply_binop(BinOpKind::Mod, &Value::Int(1), &Value::Int(0));
        assert_eq!(r, Err(OpError::DivideByZero));
    }

    #[test]
    fn test_mixed_numeric_promotes_to_float() {
        let v = apply_binop(BinOpKind::Add, &Value::Int(1), &Value::Float(0.5)).unwrap();
        assert_eq!(v, Value::Float(1.5));
    }

    #[test]
    fn test_string_concat() {
        let v = apply_binop(
            BinOpKind::Add,
            &Value::Str("ab".to_string()),
            &Value::Str("cd".to_string()),
        )
        .unwrap();
        assert_eq!(v, Value::Str("abcd".to_string()));
    }

    #[test]
    fn test_comparisons() {
        let v = apply_binop(BinOpKind::Lt, &Value::Int(1), &Value::Int(2)).unwrap();
        assert_eq!(v, Value::Bool(true));
        let v = apply_binop(
            BinOpKind::Ge,
            &Value::Str("b".to_string()),
            &Value::Str("a".to_string()),
        )
        .unwrap();
        assert_eq!(v, Value::Bool(true));
        let r = apply_binop(BinOpKind::Lt, &Value::Int(1), &Value::Str("a".to_string()));
        assert!(matches!(r, Err(OpError::Type(_))));
    }

    #[test]
    fn test_equality_promotes_numerics() {
        let v = apply_binop(BinOpKind::Eq, &Value::Int(1), &Value::Float(1.0)).unwrap();
        assert_eq!(v, Value::Bool(true));
        let v = apply_binop(BinOpKind::Ne, &Value::Int(1), &Value::Str("1".to_string())).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn test_strict_and_or() {
        let v = apply_binop(BinOpKind::And, &Value::Int(1), &Value::Str(String::new())).unwrap();
        assert_eq!(v, Value::Bool(false));
        let v = apply_binop(BinOpKind::Or, &Value::Int(0), &Value::Bool(true)).unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&Value::Int(0)));
        assert!(truthy(&Value::Int(-1)));
        assert!(!truthy(&Value::Str(String::new())));
        assert!(truthy(&Value::Str("x".to_string())));
        assert!(!truthy(&Value::None));
        assert!(!truthy(&Value::List(vec![])));
    }

    #[test]
    fn test_range_len() {
        assert_eq!(range_len(0, 10, 1), 10);
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -2), 5);
        assert_eq!(range_len(5, 5, 1), 0);
        assert_eq!(range_len(0, 5, -1), 0);
    }

    #[test]
    fn test_range_builtin() {
        let v = call_pure_builtin("range", &[Value::Int(3)]).unwrap();
        assert_eq!(
            v,
            Value::Range {
                start: 0,
                stop: 3,
                step: 1
            }
        );
        let r = call_pure_builtin("range", &[Value::Int(0), Value::Int(3), Value::Int(0)]);
        assert!(matches!(r, Err(OpError::Type(_))));
    }

    #[test]
    fn test_len_abs_min_max() {
        assert_eq!(
            call_pure_builtin("len", &[Value::Str("abc".to_string())]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            call_pure_builtin("abs", &[Value::Int(-4)]).unwrap(),
            Value::Int(4)
        );
        assert_eq!(
            call_pure_builtin("min", &[Value::Int(4), Value::Int(2), Value::Int(9)]).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            call_pure_builtin(
                "max",
                &[Value::List(vec![Value::Int(1), Value::Int(7), Value::Int(3)])]
            )
            .unwrap(),
            Value::Int(7)
        );
    }

    #[test]
    fn test_str_methods() {
        let v = str_method("python2.7", "startswith", &[Value::Str("python".to_string())])
            .unwrap()
            .unwrap();
        assert_eq!(v, Value::Bool(true));
        let v = str_method("  pad  ", "strip", &[]).unwrap().unwrap();
        assert_eq!(v, Value::Str("pad".to_string()));
        let v = str_method("123", "isdigit", &[]).unwrap().unwrap();
        assert_eq!(v, Value::Bool(true));
        assert!(str_method("x", "cleanup", &[]).is_none());
    }

    #[test]
    fn test_fold_builtin_declines_range() {
        assert!(fold_builtin_call("range", &[Value::Int(10)]).is_none());
        assert!(fold_builtin_call("print", &[]).is_none());
        let v = fold_builtin_call("len", &[Value::Str("ab".to_string())])
            .unwrap()
            .unwrap();
        assert_eq!(v, Value::Int(2));
    }
}
