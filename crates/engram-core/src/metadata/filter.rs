//! Structured metadata filters.
//!
//! A filter is a tree of comparison leaves {eq, ne, lt, le, gt, ge, in,
//! range} under {and, or, not} combinators, capped at 64 leaves. The
//! [`FilterPredicate`] DSL builds the tree from a JSON-shaped map:
//! plain scalars become `eq`, an `{"$op": operand}` object becomes the
//! matching leaf, and multiple keys AND together.
//!
//! Evaluation is short-circuit and constant time per leaf.

use std::cmp::Ordering;

use serde_json::Value as Json;

use crate::error::{EngramError, Result};
use crate::metadata::{Metadata, Value};

/// Maximum comparison leaves per filter expression
pub const MAX_FILTER_LEAVES: usize = 64;

/// Comparison operator at a filter leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
    /// Member of an operand list
    In,
    /// Inclusive [lo, hi]
    Range,
}

impl FilterOp {
    fn parse(dollar_name: &str) -> Result<Self> {
        match dollar_name {
            "$eq" => Ok(Self::Eq),
            "$ne" => Ok(Self::Ne),
            "$lt" => Ok(Self::Lt),
            "$le" | "$lte" => Ok(Self::Le),
            "$gt" => Ok(Self::Gt),
            "$ge" | "$gte" => Ok(Self::Ge),
            "$in" => Ok(Self::In),
            "$range" => Ok(Self::Range),
            other => Err(EngramError::validation(format!(
                "unknown filter operator: {other}"
            ))),
        }
    }
}

/// Operand carried by a leaf
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Single comparison value
    One(Value),
    /// List for `in`
    Many(Vec<Value>),
    /// Inclusive bounds for `range`
    Bounds(f64, f64),
}

/// A filter expression tree
#[derive(Debug, Clone)]
pub enum FilterExpr {
    /// Comparison of one field against an operand
    Leaf {
        /// Field name
        field: String,
        /// Comparison operator
        op: FilterOp,
        /// Right-hand side
        operand: Operand,
    },
    /// Every child must match
    And(Vec<FilterExpr>),
    /// Any child must match
    Or(Vec<FilterExpr>),
    /// Child must not match
    Not(Box<FilterExpr>),
}

impl FilterExpr {
    /// Equality leaf
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Leaf {
            field: field.into(),
            op: FilterOp::Eq,
            operand: Operand::One(value.into()),
        }
    }

    /// Number of comparison leaves in the tree
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf { .. } => 1,
            Self::And(children) | Self::Or(children) => {
                children.iter().map(Self::leaf_count).sum()
            }
            Self::Not(child) => child.leaf_count(),
        }
    }

    /// Reject trees over the leaf budget
    pub fn validate(&self) -> Result<()> {
        let leaves = self.leaf_count();
        if leaves > MAX_FILTER_LEAVES {
            return Err(EngramError::validation(format!(
                "filter has {leaves} leaves, maximum is {MAX_FILTER_LEAVES}"
            )));
        }
        Ok(())
    }

    /// Evaluate against a metadata row; short-circuits on combinators
    pub fn evaluate(&self, row: &Metadata) -> bool {
        match self {
            Self::Leaf { field, op, operand } => match row.get(field) {
                Some(value) => leaf_matches(value, *op, operand),
                None => false,
            },
            Self::And(children) => children.iter().all(|c| c.evaluate(row)),
            Self::Or(children) => children.iter().any(|c| c.evaluate(row)),
            Self::Not(child) => !child.evaluate(row),
        }
    }
}

fn compare(value: &Value, rhs: &Value) -> Option<Ordering> {
    match (value, rhs) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn leaf_matches(value: &Value, op: FilterOp, operand: &Operand) -> bool {
    match (op, operand) {
        (FilterOp::Eq, Operand::One(rhs)) => value == rhs,
        (FilterOp::Ne, Operand::One(rhs)) => value != rhs,
        (FilterOp::Lt, Operand::One(rhs)) => {
            compare(value, rhs) == Some(Ordering::Less)
        }
        (FilterOp::Le, Operand::One(rhs)) => {
            matches!(compare(value, rhs), Some(Ordering::Less | Ordering::Equal))
        }
        (FilterOp::Gt, Operand::One(rhs)) => {
            compare(value, rhs) == Some(Ordering::Greater)
        }
        (FilterOp::Ge, Operand::One(rhs)) => {
            matches!(compare(value, rhs), Some(Ordering::Greater | Ordering::Equal))
        }
        (FilterOp::In, Operand::Many(list)) => match value {
            // String-array rows match when any element is in the operand list
            Value::StrList(items) => items
                .iter()
                .any(|item| list.iter().any(|rhs| rhs == &Value::Str(item.clone()))),
            scalar => list.contains(scalar),
        },
        (FilterOp::Range, Operand::Bounds(lo, hi)) => match value {
            Value::Number(n) => *n >= *lo && *n <= *hi,
            _ => false,
        },
        _ => false,
    }
}

// ============================================================================
// PREDICATE DSL
// ============================================================================

/// Builds a [`FilterExpr`] from a JSON-shaped predicate map
pub struct FilterPredicate;

impl FilterPredicate {
    /// Parse `{field: scalar | {"$op": operand}}` into a validated tree.
    ///
    /// Multiple fields AND together. Unknown `$` operators are rejected.
    pub fn parse(predicate: &Json) -> Result<FilterExpr> {
        let Json::Object(map) = predicate else {
            return Err(EngramError::validation("filter predicate must be an object"));
        };
        let mut children = Vec::with_capacity(map.len());
        for (field, spec) in map {
            children.push(Self::parse_field(field, spec)?);
        }
        let expr = match children.len() {
            1 => children.into_iter().next().expect("len checked"),
            _ => FilterExpr::And(children),
        };
        expr.validate()?;
        Ok(expr)
    }

    fn parse_field(field: &str, spec: &Json) -> Result<FilterExpr> {
        match spec {
            Json::Object(ops) => {
                let mut leaves = Vec::with_capacity(ops.len());
                for (name, operand) in ops {
                    let op = FilterOp::parse(name)?;
                    leaves.push(FilterExpr::Leaf {
                        field: field.to_string(),
                        op,
                        operand: Self::parse_operand(op, operand)?,
                    });
                }
                Ok(match leaves.len() {
                    1 => leaves.into_iter().next().expect("len checked"),
                    _ => FilterExpr::And(leaves),
                })
            }
            scalar => Ok(FilterExpr::Leaf {
                field: field.to_string(),
                op: FilterOp::Eq,
                operand: Operand::One(Self::scalar(scalar)?),
            }),
        }
    }

    fn parse_operand(op: FilterOp, operand: &Json) -> Result<Operand> {
        match op {
            FilterOp::In => {
                let Json::Array(items) = operand else {
                    return Err(EngramError::validation("$in operand must be an array"));
                };
                let values: Result<Vec<Value>> = items.iter().map(Self::scalar).collect();
                Ok(Operand::Many(values?))
            }
            FilterOp::Range => {
                let bounds = operand
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .and_then(|a| Some((a[0].as_f64()?, a[1].as_f64()?)))
                    .ok_or_else(|| {
                        EngramError::validation("$range operand must be [lo, hi] numbers")
                    })?;
                Ok(Operand::Bounds(bounds.0, bounds.1))
            }
            _ => Ok(Operand::One(Self::scalar(operand)?)),
        }
    }

    fn scalar(json: &Json) -> Result<Value> {
        match json {
            Json::String(s) => Ok(Value::Str(s.clone())),
            Json::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| EngramError::validation("non-finite number in filter")),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Array(items) => {
                let strings: Option<Vec<String>> =
                    items.iter().map(|i| i.as_str().map(String::from)).collect();
                strings
                    .map(Value::StrList)
                    .ok_or_else(|| EngramError::validation("filter arrays must hold strings"))
            }
            other => Err(EngramError::validation(format!(
                "unsupported filter value: {other}"
            ))),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
