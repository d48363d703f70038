//! # Row Filters
//!
//! Row-level filter expressions in PostgREST form (`document_id=eq.42`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};

/// Filter operator for row predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
        }
    }
}

impl FromStr for FilterOp {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(FilterOp::Eq),
            "neq" => Ok(FilterOp::Neq),
            "gt" => Ok(FilterOp::Gt),
            "gte" => Ok(FilterOp::Gte),
            "lt" => Ok(FilterOp::Lt),
            "lte" => Ok(FilterOp::Lte),
            "in" => Ok(FilterOp::In),
            other => Err(RealtimeError::InvalidFilter(format!(
                "unknown operator '{}'",
                other
            ))),
        }
    }
}

/// A single-column row filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    /// Column to filter on
    pub column: String,
    /// Operator
    pub op: FilterOp,
    /// Value to compare (an array for `in`)
    pub value: Value,
}

impl RowFilter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    /// Shorthand for `column=eq.value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value.into())
    }

    /// Parse `column=op.value`
    pub fn parse(expr: &str) -> RealtimeResult<Self> {
        let (column, rest) = expr
            .split_once('=')
            .ok_or_else(|| RealtimeError::InvalidFilter(format!("missing '=' in '{}'", expr)))?;
        let column = column.trim();
        if column.is_empty() {
            return Err(RealtimeError::InvalidFilter(format!(
                "missing column in '{}'",
                expr
            )));
        }

        let (op, raw) = rest.split_once('.').ok_or_else(|| {
            RealtimeError::InvalidFilter(format!("missing operator in '{}'", expr))
        })?;
        let op: FilterOp = op.parse()?;

        let value = if op == FilterOp::In {
            let inner = raw
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| {
                    RealtimeError::InvalidFilter(format!("'in' expects (a,b,...) in '{}'", expr))
                })?;
            Value::Array(
                inner
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(parse_scalar)
                    .collect(),
            )
        } else {
            parse_scalar(raw)
        };

        Ok(Self {
            column: column.to_string(),
            op,
            value,
        })
    }

    /// Check if a row matches this filter
    pub fn matches(&self, row: &Value) -> bool {
        let Some(field_value) = row.get(&self.column) else {
            return false;
        };

        match self.op {
            FilterOp::Eq => loosely_equal(field_value, &self.value),
            FilterOp::Neq => !loosely_equal(field_value, &self.value),
            FilterOp::Gt => compare(field_value, &self.value, |a, b| a > b),
            FilterOp::Gte => compare(field_value, &self.value, |a, b| a >= b),
            FilterOp::Lt => compare(field_value, &self.value, |a, b| a < b),
            FilterOp::Lte => compare(field_value, &self.value, |a, b| a <= b),
            FilterOp::In => match self.value.as_array() {
                Some(values) => values.iter().any(|v| loosely_equal(field_value, v)),
                None => false,
            },
        }
    }
}

impl FromStr for RowFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RowFilter::parse(s)
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}.", self.column, self.op.as_str())?;
        match (&self.op, &self.value) {
            (FilterOp::In, Value::Array(items)) => {
                let rendered: Vec<String> = items.iter().map(render_scalar).collect();
                write!(f, "({})", rendered.join(","))
            }
            (_, value) => write!(f, "{}", render_scalar(value)),
        }
    }
}

/// Numbers and booleans become JSON scalars, everything else stays a string.
fn parse_scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// Filter values arrive as text, so `"42"` and `42` compare equal.
fn loosely_equal(field: &Value, expected: &Value) -> bool {
    if field == expected {
        return true;
    }
    match (field, expected) {
        (Value::String(s), other) | (other, Value::String(s)) => *s == render_scalar(other),
        _ => false,
    }
}

fn compare(field: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(field), as_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
