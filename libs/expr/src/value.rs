//! Runtime values produced by expression evaluation.

use std::collections::HashMap;
use std::fmt;

/// A value in the expression language.
///
/// Tag values arrive as strings and are coerced to numbers where an
/// operator needs one, matching the permissive dialect partition
/// expressions are written in.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Map(HashMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "decimal",
            Value::Str(_) => "string",
            Value::Map(_) => "map",
        }
    }

    /// Numeric view used by arithmetic and comparison coercion. Strings that
    /// parse as numbers participate; everything else does not.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Partition-number coercion for the EXPR strategy: integers pass
    /// through, decimals truncate, numeric strings parse. Anything else is
    /// not a partition.
    pub fn as_partition(&self) -> Option<i32> {
        match self {
            Value::Int(i) => i32::try_from(*i).ok(),
            Value::Float(f) if f.is_finite() => {
                let truncated = f.trunc();
                if truncated >= i32::MIN as f64 && truncated <= i32::MAX as f64 {
                    Some(truncated as i32)
                } else {
                    None
                }
            }
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Map(m) => write!(f, "{{map of {} entries}}", m.len()),
        }
    }
}
