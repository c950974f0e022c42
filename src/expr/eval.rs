//! Tree-walking evaluator over [`Value`].

use super::parser::{BinaryOp, Expr, UnaryOp};
use super::{Activation, ExprError};
use crate::core::types::Value;
use indexmap::IndexMap;
use std::cmp::Ordering;

/// Global functions known to the compiler.
pub const FUNCTIONS: &[&str] = &["size", "string", "int", "double", "type"];

/// Receiver-style methods known to the compiler.
pub const METHODS: &[&str] = &[
    "size",
    "contains",
    "startsWith",
    "endsWith",
    "matches",
    "lowerAscii",
    "upperAscii",
    "join",
    "split",
];

pub fn eval(expr: &Expr, activation: &Activation) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => activation
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::Unbound(name.clone())),
        Expr::Member(target, field) => {
            let target = eval(target, activation)?;
            select(&target, field)
        }
        Expr::Index(target, index) => {
            let target = eval(target, activation)?;
            let index = eval(index, activation)?;
            index_value(&target, &index)
        }
        Expr::Call {
            target,
            function,
            args,
        } => {
            let args = args
                .iter()
                .map(|a| eval(a, activation))
                .collect::<Result<Vec<_>, _>>()?;
            match target {
                Some(t) => {
                    let receiver = eval(t, activation)?;
                    call_method(&receiver, function, &args)
                }
                None => call_function(function, &args),
            }
        }
        Expr::Unary(op, e) => {
            let v = eval(e, activation)?;
            match (op, v) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Int(i)) => {
                    i.checked_neg().map(Value::Int).ok_or(ExprError::Overflow)
                }
                (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
                (op, v) => Err(no_overload(&format!("{:?}", op), &[&v])),
            }
        }
        Expr::Binary(BinaryOp::And, l, r) => {
            if !truthy(&eval(l, activation)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, activation)?, "&&")?))
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            if truthy(&eval(l, activation)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, activation)?, "||")?))
        }
        Expr::Binary(op, l, r) => {
            let l = eval(l, activation)?;
            let r = eval(r, activation)?;
            binary(*op, l, r)
        }
        Expr::Ternary(cond, then, otherwise) => {
            if truthy(&eval(cond, activation)?, "?:")? {
                eval(then, activation)
            } else {
                eval(otherwise, activation)
            }
        }
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|i| eval(i, activation))
                .collect::<Result<_, _>>()?,
        )),
        Expr::Map(entries) => {
            let mut map = IndexMap::new();
            for (k, v) in entries {
                let key = match eval(k, activation)? {
                    Value::String(s) => s,
                    Value::Int(i) => i.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => return Err(no_overload("map key", &[&other])),
                };
                map.insert(key, eval(v, activation)?);
            }
            Ok(Value::Map(map))
        }
    }
}

fn no_overload(op: &str, args: &[&Value]) -> ExprError {
    let types: Vec<_> = args.iter().map(|v| v.type_name()).collect();
    ExprError::NoOverload(format!("{}({})", op, types.join(", ")))
}

fn truthy(v: &Value, op: &str) -> Result<bool, ExprError> {
    match v {
        Value::Bool(b) => Ok(*b),
        other => Err(no_overload(op, &[other])),
    }
}

fn select(target: &Value, field: &str) -> Result<Value, ExprError> {
    match target {
        Value::Map(m) => m
            .get(field)
            .cloned()
            .ok_or_else(|| ExprError::NoSuchKey(field.to_string())),
        Value::List(items) => match field.parse::<usize>() {
            Ok(i) => list_get(items, i as i64),
            Err(_) => Err(no_overload(&format!(".{}", field), &[target])),
        },
        other => Err(no_overload(&format!(".{}", field), &[other])),
    }
}

fn list_get(items: &[Value], index: i64) -> Result<Value, ExprError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or(ExprError::IndexOutOfRange {
            index,
            size: items.len(),
        })
}

fn index_value(target: &Value, index: &Value) -> Result<Value, ExprError> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => list_get(items, *i),
        (Value::Map(m), Value::String(k)) => m
            .get(k)
            .cloned()
            .ok_or_else(|| ExprError::NoSuchKey(k.clone())),
        (Value::Map(m), Value::Int(i)) => m
            .get(&i.to_string())
            .cloned()
            .ok_or_else(|| ExprError::NoSuchKey(i.to_string())),
        (t, i) => Err(no_overload("[]", &[t, i])),
    }
}

/// Numeric-aware structural equality.
fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| equals(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| equals(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

fn compare(op: BinaryOp, a: &Value, b: &Value) -> Result<Ordering, ExprError> {
    let ord = match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    };
    ord.ok_or_else(|| no_overload(&format!("{:?}", op), &[a, b]))
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(&l, &r))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(&l, &r))),
        BinaryOp::Lt => Ok(Value::Bool(compare(op, &l, &r)? == Ordering::Less)),
        BinaryOp::Le => Ok(Value::Bool(compare(op, &l, &r)? != Ordering::Greater)),
        BinaryOp::Gt => Ok(Value::Bool(compare(op, &l, &r)? == Ordering::Greater)),
        BinaryOp::Ge => Ok(Value::Bool(compare(op, &l, &r)? != Ordering::Less)),
        BinaryOp::In => match &r {
            Value::List(items) => Ok(Value::Bool(items.iter().any(|i| equals(i, &l)))),
            Value::Map(m) => match &l {
                Value::String(k) => Ok(Value::Bool(m.contains_key(k))),
                other => Err(no_overload("in", &[other, &r])),
            },
            _ => Err(no_overload("in", &[&l, &r])),
        },
        BinaryOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (a, b) => arithmetic(op, &a, &b),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, &l, &r),
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators handled in eval"),
    }
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, ExprError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x, *y);
            let result = match op {
                BinaryOp::Add => x.checked_add(y),
                BinaryOp::Sub => x.checked_sub(y),
                BinaryOp::Mul => x.checked_mul(y),
                BinaryOp::Div | BinaryOp::Rem if y == 0 => return Err(ExprError::DivisionByZero),
                BinaryOp::Div => x.checked_div(y),
                BinaryOp::Rem => x.checked_rem(y),
                _ => None,
            };
            result.map(Value::Int).ok_or(ExprError::Overflow)
        }
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let x = as_f64(a);
            let y = as_f64(b);
            let result = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div if y == 0.0 => return Err(ExprError::DivisionByZero),
                BinaryOp::Div => x / y,
                _ => return Err(no_overload(&format!("{:?}", op), &[a, b])),
            };
            Ok(Value::Float(result))
        }
        _ => Err(no_overload(&format!("{:?}", op), &[a, b])),
    }
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Int(i) => *i as f64,
        Value::Float(x) => *x,
        _ => f64::NAN,
    }
}

fn size_of(v: &Value) -> Result<Value, ExprError> {
    let n = match v {
        Value::String(s) => s.chars().count(),
        Value::List(l) => l.len(),
        Value::Map(m) => m.len(),
        other => return Err(no_overload("size", &[other])),
    };
    Ok(Value::Int(n as i64))
}

fn call_function(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match (name, args) {
        ("size", [v]) => size_of(v),
        ("string", [v]) => Ok(Value::String(v.to_string())),
        ("type", [v]) => Ok(Value::String(v.type_name().to_string())),
        ("int", [Value::Int(i)]) => Ok(Value::Int(*i)),
        ("int", [Value::Float(x)]) => {
            if x.is_finite() && x.abs() < i64::MAX as f64 {
                Ok(Value::Int(x.trunc() as i64))
            } else {
                Err(ExprError::Overflow)
            }
        }
        ("int", [Value::String(s)]) => s
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| ExprError::NoOverload(format!("int(\"{}\")", s))),
        ("double", [Value::Int(i)]) => Ok(Value::Float(*i as f64)),
        ("double", [Value::Float(x)]) => Ok(Value::Float(*x)),
        ("double", [Value::String(s)]) => s
            .trim()
            .parse()
            .map(Value::Float)
            .map_err(|_| ExprError::NoOverload(format!("double(\"{}\")", s))),
        (name, args) => Err(no_overload(name, &args.iter().collect::<Vec<_>>())),
    }
}

fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match (receiver, name, args) {
        (v, "size", []) => size_of(v),
        (Value::String(s), "contains", [Value::String(sub)]) => Ok(Value::Bool(s.contains(sub.as_str()))),
        (Value::List(items), "contains", [v]) => Ok(Value::Bool(items.iter().any(|i| equals(i, v)))),
        (Value::String(s), "startsWith", [Value::String(p)]) => Ok(Value::Bool(s.starts_with(p.as_str()))),
        (Value::String(s), "endsWith", [Value::String(p)]) => Ok(Value::Bool(s.ends_with(p.as_str()))),
        (Value::String(s), "matches", [Value::String(pattern)]) => {
            let re = regex::Regex::new(pattern)
                .map_err(|e| ExprError::NoOverload(format!("matches: {}", e)))?;
            Ok(Value::Bool(re.is_match(s)))
        }
        (Value::String(s), "lowerAscii", []) => Ok(Value::String(s.to_ascii_lowercase())),
        (Value::String(s), "upperAscii", []) => Ok(Value::String(s.to_ascii_uppercase())),
        (Value::List(items), "join", []) => Ok(Value::String(join(items, ""))),
        (Value::List(items), "join", [Value::String(sep)]) => Ok(Value::String(join(items, sep))),
        (Value::String(s), "split", [Value::String(sep)]) => Ok(Value::List(
            s.split(sep.as_str()).map(Value::from).collect(),
        )),
        (r, name, args) => {
            let mut all: Vec<&Value> = vec![r];
            all.extend(args.iter());
            Err(no_overload(name, &all))
        }
    }
}

fn join(items: &[Value], sep: &str) -> String {
    items
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}
