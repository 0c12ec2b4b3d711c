//! AST evaluation against a bound variable context.

use std::collections::HashMap;

use envelope::MessageEnvelope;

use crate::parser::{BinaryOp, ElseBranch, Expr, IfStmt, Program, UnaryOp};
use crate::value::Value;
use crate::ExprError;

/// Per-evaluation variable bindings. Built fresh for every message; never
/// shared across workers.
#[derive(Debug, Default)]
pub struct Context {
    vars: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Bind an envelope and its tag map the way partition expressions expect:
    /// every envelope field by its wire name, the whole `envelope` object,
    /// each tag under its symbolic name and `Tag<N>`, and the indexable
    /// `parsedTags` map. The envelope's own tags win over `tags` when
    /// non-empty.
    pub fn for_envelope(envelope: &MessageEnvelope, tags: Option<&HashMap<u32, String>>) -> Self {
        let mut ctx = Self::new();

        let opt = |value: &Option<String>| match value {
            Some(s) => Value::Str(s.clone()),
            None => Value::Null,
        };

        let fields = [
            ("sessionId", opt(&envelope.session_id)),
            ("senderCompId", opt(&envelope.sender_comp_id)),
            ("targetCompId", opt(&envelope.target_comp_id)),
            ("msgType", opt(&envelope.msg_type)),
            ("clOrdID", opt(&envelope.cl_ord_id)),
            ("symbol", opt(&envelope.symbol)),
            ("side", opt(&envelope.side)),
            ("orderQty", opt(&envelope.order_qty)),
            ("price", opt(&envelope.price)),
            ("rawMessage", Value::Str(envelope.raw_message.clone())),
            (
                "createdTimestamp",
                Value::Str(envelope.created_timestamp.to_rfc3339()),
            ),
        ];

        let mut object = HashMap::new();
        for (name, value) in fields {
            object.insert(name.to_string(), value.clone());
            ctx.insert(name, value);
        }
        ctx.insert("envelope", Value::Map(object));

        let empty = HashMap::new();
        let bound_tags = if !envelope.parsed_tags.is_empty() {
            &envelope.parsed_tags
        } else {
            tags.unwrap_or(&empty)
        };

        let mut tag_map = HashMap::new();
        for (tag, value) in bound_tags {
            let symbolic = fixwire::tags::tag_name(*tag)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Tag{tag}"));
            ctx.insert(symbolic, Value::Str(value.clone()));
            ctx.insert(format!("Tag{tag}"), Value::Str(value.clone()));
            tag_map.insert(tag.to_string(), Value::Str(value.clone()));
        }
        ctx.insert("parsedTags", Value::Map(tag_map));

        ctx
    }
}

impl Program {
    pub fn eval(&self, ctx: &Context) -> Result<Value, ExprError> {
        match self {
            Program::Expr(expr) => eval_expr(expr, ctx),
            Program::If(stmt) => eval_if(stmt, ctx),
        }
    }
}

fn eval_if(stmt: &IfStmt, ctx: &Context) -> Result<Value, ExprError> {
    if truthy(eval_expr(&stmt.condition, ctx)?)? {
        return eval_expr(&stmt.then_value, ctx);
    }
    match &stmt.else_branch {
        Some(ElseBranch::Value(expr)) => eval_expr(expr, ctx),
        Some(ElseBranch::If(nested)) => eval_if(nested, ctx),
        None => Ok(Value::Null),
    }
}

fn eval_expr(expr: &Expr, ctx: &Context) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
        Expr::Member(target, name) => match eval_expr(target, ctx)? {
            Value::Map(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
            other => Err(ExprError::Type(format!(
                "cannot access member '{name}' on {}",
                other.type_name()
            ))),
        },
        Expr::Index(target, index) => {
            let key = eval_expr(index, ctx)?;
            match eval_expr(target, ctx)? {
                Value::Map(map) => Ok(map.get(&key.to_string()).cloned().unwrap_or(Value::Null)),
                other => Err(ExprError::Type(format!(
                    "cannot index {}",
                    other.type_name()
                ))),
            }
        }
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!truthy(eval_expr(inner, ctx)?)?)),
        Expr::Unary(UnaryOp::Neg, inner) => negate(eval_expr(inner, ctx)?),
        Expr::Binary(BinaryOp::And, left, right) => {
            if !truthy(eval_expr(left, ctx)?)? {
                Ok(Value::Bool(false))
            } else {
                Ok(Value::Bool(truthy(eval_expr(right, ctx)?)?))
            }
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if truthy(eval_expr(left, ctx)?)? {
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(truthy(eval_expr(right, ctx)?)?))
            }
        }
        Expr::Binary(op, left, right) => {
            binary(*op, eval_expr(left, ctx)?, eval_expr(right, ctx)?)
        }
        Expr::Ternary(condition, then_value, else_value) => {
            if truthy(eval_expr(condition, ctx)?)? {
                eval_expr(then_value, ctx)
            } else {
                eval_expr(else_value, ctx)
            }
        }
    }
}

fn truthy(value: Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Type(format!(
            "condition must be boolean, got {}",
            other.type_name()
        ))),
    }
}

fn negate(value: Value) -> Result<Value, ExprError> {
    match value {
        Value::Int(i) => i.checked_neg().map(Value::Int).ok_or(ExprError::Overflow),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => match other.as_f64() {
            Some(f) => Ok(Value::Float(-f)),
            None => Err(ExprError::Type(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!equals(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, &left, &right),
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, &left, &right)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit in eval"),
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    let ordering = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (left, right) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return Err(ExprError::Type(format!(
            "cannot compare {} with {}",
            left.type_name(),
            right.type_name()
        )));
    };
    let result = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn add(left: Value, right: Value) -> Result<Value, ExprError> {
    // String concatenation wins whenever either side is a string.
    if matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)) {
        return Ok(Value::Str(format!("{left}{right}")));
    }
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        return a.checked_add(*b).map(Value::Int).ok_or(ExprError::Overflow);
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Float(a + b)),
        _ => Err(ExprError::Type(format!(
            "cannot add {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        return match op {
            BinaryOp::Sub => a.checked_sub(*b).map(Value::Int).ok_or(ExprError::Overflow),
            BinaryOp::Mul => a.checked_mul(*b).map(Value::Int).ok_or(ExprError::Overflow),
            BinaryOp::Div => {
                if *b == 0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    a.checked_div(*b).map(Value::Int).ok_or(ExprError::Overflow)
                }
            }
            BinaryOp::Rem => {
                if *b == 0 {
                    Err(ExprError::DivisionByZero)
                } else {
                    a.checked_rem(*b).map(Value::Int).ok_or(ExprError::Overflow)
                }
            }
            _ => unreachable!(),
        };
    }

    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::Float(match op {
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            _ => unreachable!(),
        })),
        _ => Err(ExprError::Type(format!(
            "arithmetic needs numbers, got {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}
