//! Structural boolean predicates over data-point fields. The wire form
//! is a JSON expression tree (`{"eq": ["optype", "read"]}`,
//! `{"and": [...]}`); parsing and field validation happen once when an
//! instrumentation is created or enabled, evaluation on every tick.

use cairn_common::types::{FieldArity, FieldType, FieldValue};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("predicate must be an object, got {0}")]
    NotAnObject(String),

    #[error("predicate has unknown operator \"{0}\"")]
    UnknownOperator(String),

    #[error("operator \"{op}\" expects {expected}")]
    BadOperands { op: &'static str, expected: &'static str },

    #[error("predicate references undeclared field \"{0}\"")]
    UnknownField(String),

    #[error("operator \"{op}\" not supported on discrete field \"{field}\"")]
    DiscreteOrdering { op: &'static str, field: String },

    #[error("value for field \"{field}\" does not match its type")]
    ValueTypeMismatch { field: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// The empty predicate `{}`: matches every data point.
    True,
    Eq(String, FieldValue),
    Ne(String, FieldValue),
    Gt(String, i64),
    Lt(String, i64),
    Ge(String, i64),
    Le(String, i64),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Parses the wire expression tree. Structure only; field existence
    /// and operator/type compatibility are checked by [`Predicate::validate`].
    pub fn parse(raw: &Value) -> Result<Predicate, PredicateError> {
        let Value::Object(map) = raw else {
            return Err(PredicateError::NotAnObject(raw.to_string()));
        };
        if map.is_empty() {
            return Ok(Predicate::True);
        }
        if map.len() != 1 {
            return Err(PredicateError::BadOperands {
                op: "predicate",
                expected: "exactly one operator key",
            });
        }
        let (op, operands) = map.iter().next().unwrap();
        match op.as_str() {
            "eq" => Self::parse_relation(operands, "eq").map(|(f, v)| Predicate::Eq(f, v)),
            "ne" => Self::parse_relation(operands, "ne").map(|(f, v)| Predicate::Ne(f, v)),
            "gt" => Self::parse_ordering(operands, "gt").map(|(f, n)| Predicate::Gt(f, n)),
            "lt" => Self::parse_ordering(operands, "lt").map(|(f, n)| Predicate::Lt(f, n)),
            "ge" => Self::parse_ordering(operands, "ge").map(|(f, n)| Predicate::Ge(f, n)),
            "le" => Self::parse_ordering(operands, "le").map(|(f, n)| Predicate::Le(f, n)),
            "and" => Self::parse_junction(operands, "and").map(Predicate::And),
            "or" => Self::parse_junction(operands, "or").map(Predicate::Or),
            other => Err(PredicateError::UnknownOperator(other.to_string())),
        }
    }

    fn parse_relation(
        operands: &Value,
        op: &'static str,
    ) -> Result<(String, FieldValue), PredicateError> {
        let expected = "[field, value] with a string or integer value";
        let Value::Array(items) = operands else {
            return Err(PredicateError::BadOperands { op, expected });
        };
        let [field, value] = items.as_slice() else {
            return Err(PredicateError::BadOperands { op, expected });
        };
        let Value::String(field) = field else {
            return Err(PredicateError::BadOperands { op, expected });
        };
        let value = match value {
            Value::String(s) => FieldValue::Str(s.clone()),
            Value::Number(n) => {
                let n = n
                    .as_i64()
                    .ok_or(PredicateError::BadOperands { op, expected })?;
                FieldValue::Num(n)
            }
            _ => return Err(PredicateError::BadOperands { op, expected }),
        };
        Ok((field.clone(), value))
    }

    fn parse_ordering(
        operands: &Value,
        op: &'static str,
    ) -> Result<(String, i64), PredicateError> {
        let expected = "[field, integer]";
        let Value::Array(items) = operands else {
            return Err(PredicateError::BadOperands { op, expected });
        };
        let [field, value] = items.as_slice() else {
            return Err(PredicateError::BadOperands { op, expected });
        };
        let (Value::String(field), Value::Number(n)) = (field, value) else {
            return Err(PredicateError::BadOperands { op, expected });
        };
        let n = n
            .as_i64()
            .ok_or(PredicateError::BadOperands { op, expected })?;
        Ok((field.clone(), n))
    }

    fn parse_junction(
        operands: &Value,
        op: &'static str,
    ) -> Result<Vec<Predicate>, PredicateError> {
        let Value::Array(items) = operands else {
            return Err(PredicateError::BadOperands { op, expected: "a non-empty array" });
        };
        if items.is_empty() {
            return Err(PredicateError::BadOperands { op, expected: "a non-empty array" });
        }
        items.iter().map(Self::parse).collect()
    }

    /// Checks that every referenced field is declared and that ordering
    /// operators are only applied to numeric fields.
    pub fn validate(&self, fields: &BTreeMap<String, FieldType>) -> Result<(), PredicateError> {
        let check_ordering = |op: &'static str, field: &str| {
            let ftype = fields
                .get(field)
                .ok_or_else(|| PredicateError::UnknownField(field.to_string()))?;
            if ftype.arity() == FieldArity::Discrete {
                return Err(PredicateError::DiscreteOrdering { op, field: field.to_string() });
            }
            Ok(())
        };
        match self {
            Predicate::True => Ok(()),
            Predicate::Eq(field, value) | Predicate::Ne(field, value) => {
                let ftype = fields
                    .get(field)
                    .ok_or_else(|| PredicateError::UnknownField(field.clone()))?;
                let matches = match (ftype.arity(), value) {
                    (FieldArity::Discrete, FieldValue::Str(_)) => true,
                    (FieldArity::Numeric, FieldValue::Num(_)) => true,
                    _ => false,
                };
                if !matches {
                    return Err(PredicateError::ValueTypeMismatch { field: field.clone() });
                }
                Ok(())
            }
            Predicate::Gt(field, _) => check_ordering("gt", field),
            Predicate::Lt(field, _) => check_ordering("lt", field),
            Predicate::Ge(field, _) => check_ordering("ge", field),
            Predicate::Le(field, _) => check_ordering("le", field),
            Predicate::And(subs) | Predicate::Or(subs) => {
                subs.iter().try_for_each(|p| p.validate(fields))
            }
        }
    }

    /// Evaluates against one data point's field assignment. Missing
    /// fields and type mismatches evaluate to false, never panic.
    pub fn eval(&self, fields: &BTreeMap<String, FieldValue>) -> bool {
        let num = |field: &str| match fields.get(field) {
            Some(FieldValue::Num(n)) => Some(*n),
            _ => None,
        };
        match self {
            Predicate::True => true,
            Predicate::Eq(field, value) => fields.get(field) == Some(value),
            Predicate::Ne(field, value) => {
                fields.get(field).map(|v| v != value).unwrap_or(false)
            }
            Predicate::Gt(field, n) => num(field).map(|v| v > *n).unwrap_or(false),
            Predicate::Lt(field, n) => num(field).map(|v| v < *n).unwrap_or(false),
            Predicate::Ge(field, n) => num(field).map(|v| v >= *n).unwrap_or(false),
            Predicate::Le(field, n) => num(field).map(|v| v <= *n).unwrap_or(false),
            Predicate::And(subs) => subs.iter().all(|p| p.eval(fields)),
            Predicate::Or(subs) => subs.iter().any(|p| p.eval(fields)),
        }
    }

    /// Collects every field name the predicate references, for backend
    /// implementation selection.
    pub fn field_names(&self, out: &mut BTreeSet<String>) {
        match self {
            Predicate::True => {}
            Predicate::Eq(field, _)
            | Predicate::Ne(field, _)
            | Predicate::Gt(field, _)
            | Predicate::Lt(field, _)
            | Predicate::Ge(field, _)
            | Predicate::Le(field, _) => {
                out.insert(field.clone());
            }
            Predicate::And(subs) | Predicate::Or(subs) => {
                for p in subs {
                    p.field_names(out);
                }
            }
        }
    }
}
