//! Compiled expressions and the tree-walking evaluator.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::duration::parse_duration;
use crate::env::{Activation, Env};
use crate::error::{ExprError, Result};
use crate::parser::parse;
use crate::value::Value;

const GLOBAL_FUNCTIONS: &[&str] = &["int", "uint", "double", "string", "duration", "size"];
const METHODS: &[&str] = &[
    "hasValue", "orValue", "value", "startsWith", "endsWith", "contains", "matches", "size",
];

/// A parsed expression, kept alongside its source text.
///
/// Serializes as the source string. Deserialization only checks syntax;
/// references are checked by [`Expression::compile`].
#[derive(Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parses `source` without checking references.
    pub fn new(source: &str) -> Result<Self> {
        Ok(Self {
            source: source.to_string(),
            ast: parse(source)?,
        })
    }

    /// Parses `source` and checks every reference against `env`.
    pub fn compile(source: &str, env: &Env) -> Result<Self> {
        let expr = Self::new(source)?;
        expr.check(env)?;
        Ok(expr)
    }

    /// Checks every reference against `env`.
    pub fn check(&self, env: &Env) -> Result<()> {
        check_refs(&self.ast, env)
    }

    /// Source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Syntax tree.
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluates against `activation`; constants and functions come from `env`.
    pub fn eval(&self, env: &Env, activation: &Activation) -> Result<Value> {
        Evaluator { env, activation }.eval(&self.ast)
    }

    /// Evaluates and requires a boolean result.
    pub fn eval_bool(&self, env: &Env, activation: &Activation) -> Result<bool> {
        match self.eval(env, activation)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::UnexpectedType {
                expected: "bool",
                actual: other.type_name(),
            }),
        }
    }

    /// Evaluates and requires a numeric result, widened to a double.
    pub fn eval_double(&self, env: &Env, activation: &Activation) -> Result<f64> {
        match self.eval(env, activation)? {
            Value::Double(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            Value::Uint(v) => Ok(v as f64),
            other => Err(ExprError::UnexpectedType {
                expected: "double",
                actual: other.type_name(),
            }),
        }
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.source).finish()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Expression::new(&source).map_err(serde::de::Error::custom)
    }
}

fn is_optional_namespace(target: &Option<Box<Expr>>) -> bool {
    matches!(target.as_deref(), Some(Expr::Ident(name)) if name == "optional")
}

fn check_refs(expr: &Expr, env: &Env) -> Result<()> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::Ident(name) => {
            if env.resolves(name) {
                Ok(())
            } else {
                Err(ExprError::UndeclaredReference(name.clone()))
            }
        }
        Expr::Select { operand, .. } | Expr::Unary { operand, .. } => check_refs(operand, env),
        Expr::Index { operand, index } => {
            check_refs(operand, env)?;
            check_refs(index, env)
        }
        Expr::Call { target, function, args } => {
            if is_optional_namespace(target) {
                if function != "of" && function != "none" {
                    return Err(ExprError::UndeclaredFunction(format!("optional.{function}")));
                }
            } else if let Some(target) = target {
                if !METHODS.contains(&function.as_str()) {
                    return Err(ExprError::UndeclaredFunction(function.clone()));
                }
                check_refs(target, env)?;
            } else if !GLOBAL_FUNCTIONS.contains(&function.as_str()) && env.lookup_function(function).is_none() {
                return Err(ExprError::UndeclaredFunction(function.clone()));
            }
            args.iter().try_for_each(|arg| check_refs(arg, env))
        }
        Expr::Binary { lhs, rhs, .. } => {
            check_refs(lhs, env)?;
            check_refs(rhs, env)
        }
        Expr::Conditional { cond, then, otherwise } => {
            check_refs(cond, env)?;
            check_refs(then, env)?;
            check_refs(otherwise, env)
        }
        Expr::List(items) => items.iter().try_for_each(|i| check_refs(i, env)),
        Expr::Map(entries) => entries.iter().try_for_each(|(k, v)| {
            check_refs(k, env)?;
            check_refs(v, env)
        }),
    }
}

fn overload(op: &str, args: &[&Value]) -> ExprError {
    let types: Vec<_> = args.iter().map(|v| v.type_name()).collect();
    ExprError::NoSuchOverload(format!("{op}({})", types.join(", ")))
}

fn overflow(op: &str) -> ExprError {
    ExprError::Arithmetic(format!("{op} overflow"))
}

struct Evaluator<'a> {
    env: &'a Env,
    activation: &'a Activation,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self
                .activation
                .get(name)
                .or_else(|| self.env.constant_value(name))
                .cloned()
                .ok_or_else(|| ExprError::UndeclaredReference(name.clone())),
            Expr::Select { operand, field } => {
                let operand = self.eval(operand)?;
                match &operand {
                    Value::Map(_) => operand
                        .get(&Value::String(field.clone()))
                        .cloned()
                        .ok_or_else(|| ExprError::NoSuchKey(field.clone())),
                    other => Err(overload(&format!("_.{field}"), &[other])),
                }
            }
            Expr::Index { operand, index } => {
                let operand = self.eval(operand)?;
                let index = self.eval(index)?;
                self.index(&operand, &index)
            }
            Expr::Call { target, function, args } => self.call(target, function, args),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                match (op, &v) {
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(|| overflow("-")),
                    (UnaryOp::Neg, Value::Double(d)) => Ok(Value::Double(-d)),
                    (UnaryOp::Neg, Value::Duration(d)) => {
                        d.checked_neg().map(Value::Duration).ok_or_else(|| overflow("-"))
                    }
                    (UnaryOp::Not, _) => Err(overload("!_", &[&v])),
                    (UnaryOp::Neg, _) => Err(overload("-_", &[&v])),
                }
            }
            Expr::Binary { op: BinaryOp::And, lhs, rhs } => self.logical(lhs, rhs, false),
            Expr::Binary { op: BinaryOp::Or, lhs, rhs } => self.logical(lhs, rhs, true),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::Conditional { cond, then, otherwise } => match self.eval(cond)? {
                Value::Bool(true) => self.eval(then),
                Value::Bool(false) => self.eval(otherwise),
                other => Err(overload("_?_:_", &[&other])),
            },
            Expr::List(items) => Ok(Value::List(
                items.iter().map(|i| self.eval(i)).collect::<Result<Vec<_>>>()?,
            )),
            Expr::Map(entries) => {
                let mut out: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = self.eval(k)?;
                    if out.iter().any(|(existing, _)| existing.equals(&key)) {
                        return Err(ExprError::InvalidArgument(format!("duplicate map key {key}")));
                    }
                    out.push((key, self.eval(v)?));
                }
                Ok(Value::Map(out))
            }
        }
    }

    /// `&&` and `||` absorb an error on one side when the other side decides.
    fn logical(&self, lhs: &Expr, rhs: &Expr, short: bool) -> Result<Value> {
        let symbol = if short { "_||_" } else { "_&&_" };
        let left = self.eval(lhs);
        if let Ok(Value::Bool(b)) = left {
            if b == short {
                return Ok(Value::Bool(short));
            }
        }
        let right = self.eval(rhs);
        if let Ok(Value::Bool(b)) = right {
            if b == short {
                return Ok(Value::Bool(short));
            }
        }
        match (left?, right?) {
            (Value::Bool(_), Value::Bool(_)) => Ok(Value::Bool(!short)),
            (l, r) => Err(overload(symbol, &[&l, &r])),
        }
    }

    fn index(&self, operand: &Value, index: &Value) -> Result<Value> {
        match (operand, index) {
            (Value::List(items), Value::Int(i)) => list_at(items, *i),
            (Value::List(items), Value::Uint(u)) => list_at(items, i64::try_from(*u).unwrap_or(i64::MAX)),
            (Value::Map(_), key) => operand
                .get(key)
                .cloned()
                .ok_or_else(|| ExprError::NoSuchKey(key.to_string())),
            _ => Err(overload("_[_]", &[operand, index])),
        }
    }

    fn call(&self, target: &Option<Box<Expr>>, function: &str, args: &[Expr]) -> Result<Value> {
        if is_optional_namespace(target) {
            return match (function, args) {
                ("of", [arg]) => Ok(Value::some(self.eval(arg)?)),
                ("none", []) => Ok(Value::none()),
                _ => Err(ExprError::UndeclaredFunction(format!("optional.{function}"))),
            };
        }

        let args = args.iter().map(|a| self.eval(a)).collect::<Result<Vec<_>>>()?;

        if let Some(target) = target {
            let target = self.eval(target)?;
            return method(&target, function, &args);
        }

        if let Some(f) = self.env.lookup_function(function) {
            return f(&args);
        }

        match (function, args.as_slice()) {
            ("int", [v]) => to_int(v),
            ("uint", [v]) => to_uint(v),
            ("double", [v]) => to_double(v),
            ("string", [v]) => to_string(v),
            ("duration", [Value::String(s)]) => parse_duration(s).map(Value::Duration),
            ("duration", [Value::Duration(d)]) => Ok(Value::Duration(*d)),
            ("size", [v]) => size(v),
            _ => Err(overload(function, &args.iter().collect::<Vec<_>>())),
        }
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    use Value::*;

    let symbol = op.symbol();
    let no_overload = || overload(&format!("_{symbol}_"), &[lhs, rhs]);

    match op {
        BinaryOp::Eq => Ok(Bool(lhs.equals(rhs))),
        BinaryOp::Ne => Ok(Bool(!lhs.equals(rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = lhs.compare(rhs).ok_or_else(no_overload)?;
            Ok(Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::In => match rhs {
            List(items) => Ok(Bool(items.iter().any(|i| i.equals(lhs)))),
            Map(_) => Ok(Bool(rhs.get(lhs).is_some())),
            _ => Err(no_overload()),
        },
        BinaryOp::Add => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_add(*b).map(Int).ok_or_else(|| overflow(symbol)),
            (Uint(a), Uint(b)) => a.checked_add(*b).map(Uint).ok_or_else(|| overflow(symbol)),
            (Double(a), Double(b)) => Ok(Double(a + b)),
            (Duration(a), Duration(b)) => a.checked_add(*b).map(Duration).ok_or_else(|| overflow(symbol)),
            (String(a), String(b)) => Ok(String(format!("{a}{b}"))),
            (List(a), List(b)) => Ok(List(a.iter().chain(b).cloned().collect())),
            _ => Err(no_overload()),
        },
        BinaryOp::Sub => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_sub(*b).map(Int).ok_or_else(|| overflow(symbol)),
            (Uint(a), Uint(b)) => a.checked_sub(*b).map(Uint).ok_or_else(|| overflow(symbol)),
            (Double(a), Double(b)) => Ok(Double(a - b)),
            (Duration(a), Duration(b)) => a.checked_sub(*b).map(Duration).ok_or_else(|| overflow(symbol)),
            _ => Err(no_overload()),
        },
        BinaryOp::Mul => match (lhs, rhs) {
            (Int(a), Int(b)) => a.checked_mul(*b).map(Int).ok_or_else(|| overflow(symbol)),
            (Uint(a), Uint(b)) => a.checked_mul(*b).map(Uint).ok_or_else(|| overflow(symbol)),
            (Double(a), Double(b)) => Ok(Double(a * b)),
            _ => Err(no_overload()),
        },
        BinaryOp::Div => match (lhs, rhs) {
            (Int(_), Int(0)) | (Uint(_), Uint(0)) => Err(ExprError::Arithmetic("division by zero".into())),
            (Int(a), Int(b)) => a.checked_div(*b).map(Int).ok_or_else(|| overflow(symbol)),
            (Uint(a), Uint(b)) => Ok(Uint(a / b)),
            (Double(a), Double(b)) => Ok(Double(a / b)),
            _ => Err(no_overload()),
        },
        BinaryOp::Rem => match (lhs, rhs) {
            (Int(_), Int(0)) | (Uint(_), Uint(0)) => Err(ExprError::Arithmetic("modulus by zero".into())),
            (Int(a), Int(b)) => a.checked_rem(*b).map(Int).ok_or_else(|| overflow(symbol)),
            (Uint(a), Uint(b)) => Ok(Uint(a % b)),
            _ => Err(no_overload()),
        },
        BinaryOp::And | BinaryOp::Or => Err(no_overload()),
    }
}

fn method(target: &Value, function: &str, args: &[Value]) -> Result<Value> {
    match (target, function, args) {
        (Value::Optional(v), "hasValue", []) => Ok(Value::Bool(v.is_some())),
        (Value::Optional(Some(v)), "value", []) => Ok((**v).clone()),
        (Value::Optional(None), "value", []) => Err(ExprError::EmptyOptional),
        (Value::Optional(v), "orValue", [default]) => Ok(match v {
            Some(v) => (**v).clone(),
            None => default.clone(),
        }),
        (Value::String(s), "startsWith", [Value::String(p)]) => Ok(Value::Bool(s.starts_with(p.as_str()))),
        (Value::String(s), "endsWith", [Value::String(p)]) => Ok(Value::Bool(s.ends_with(p.as_str()))),
        (Value::String(s), "contains", [Value::String(p)]) => Ok(Value::Bool(s.contains(p.as_str()))),
        (Value::String(s), "matches", [Value::String(p)]) => {
            let re = regex::Regex::new(p).map_err(|e| ExprError::InvalidArgument(e.to_string()))?;
            Ok(Value::Bool(re.is_match(s)))
        }
        (v, "size", []) => size(v),
        _ => {
            let mut all = vec![target];
            all.extend(args.iter());
            Err(overload(function, &all))
        }
    }
}

fn list_at(items: &[Value], i: i64) -> Result<Value> {
    usize::try_from(i)
        .ok()
        .and_then(|idx| items.get(idx))
        .cloned()
        .ok_or(ExprError::IndexOutOfRange(i))
}

fn size(v: &Value) -> Result<Value> {
    let n = match v {
        Value::String(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(entries) => entries.len(),
        other => return Err(overload("size", &[other])),
    };
    Ok(Value::Int(n as i64))
}

fn to_int(v: &Value) -> Result<Value> {
    let range = || ExprError::Arithmetic(format!("int({v}) out of range"));
    match v {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Uint(u) => i64::try_from(*u).map(Value::Int).map_err(|_| range()),
        Value::Double(d) if d.is_finite() && *d >= i64::MIN as f64 && *d < i64::MAX as f64 => {
            Ok(Value::Int(d.trunc() as i64))
        }
        Value::Double(_) => Err(range()),
        Value::String(s) => s
            .parse()
            .map(Value::Int)
            .map_err(|_| ExprError::InvalidArgument(format!("int({s:?})"))),
        Value::Duration(d) => Ok(Value::Int(*d)),
        other => Err(overload("int", &[other])),
    }
}

fn to_uint(v: &Value) -> Result<Value> {
    let range = || ExprError::Arithmetic(format!("uint({v}) out of range"));
    match v {
        Value::Uint(u) => Ok(Value::Uint(*u)),
        Value::Int(i) => u64::try_from(*i).map(Value::Uint).map_err(|_| range()),
        Value::Double(d) if d.is_finite() && *d >= 0.0 && *d < u64::MAX as f64 => Ok(Value::Uint(d.trunc() as u64)),
        Value::Double(_) => Err(range()),
        Value::String(s) => s
            .parse()
            .map(Value::Uint)
            .map_err(|_| ExprError::InvalidArgument(format!("uint({s:?})"))),
        other => Err(overload("uint", &[other])),
    }
}

fn to_double(v: &Value) -> Result<Value> {
    match v {
        Value::Double(d) => Ok(Value::Double(*d)),
        Value::Int(i) => Ok(Value::Double(*i as f64)),
        Value::Uint(u) => Ok(Value::Double(*u as f64)),
        Value::String(s) => s
            .parse()
            .map(Value::Double)
            .map_err(|_| ExprError::InvalidArgument(format!("double({s:?})"))),
        other => Err(overload("double", &[other])),
    }
}

fn to_string(v: &Value) -> Result<Value> {
    Ok(Value::String(match v {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Uint(u) => u.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Duration(d) => format!("{}s", *d as f64 / 1e9),
        other => return Err(overload("string", &[other])),
    }))
}
