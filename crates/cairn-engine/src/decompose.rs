//! Folding filtered data points into the final value shape: sum to a
//! scalar, partition per discrete field value and recurse, bucketize at
//! a trailing numeric field.

use crate::bucketize::Bucketizer;
use crate::datapoint::DataPoint;
use crate::source::FieldSpec;
use cairn_common::types::{FieldArity, FieldValue, MetricValue};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum DecompositionError {
    #[error("decomposition references undeclared field \"{0}\"")]
    UnknownField(String),

    #[error("field \"{0}\" may not follow a numeric decomposition field")]
    NumericNotLast(String),

    #[error("decomposition allows at most one numeric field")]
    MultipleNumeric,
}

/// Checks existence and ordering of a decomposition field list against
/// a plain field-type table, without needing bucketizers. Used by the
/// authority (against the merged catalog) and by the instrumenter
/// before instantiating a backend.
pub fn validate_order(
    decomposition: &[String],
    fields: &BTreeMap<String, cairn_common::types::FieldType>,
) -> Result<(), DecompositionError> {
    let mut saw_numeric = false;
    for name in decomposition {
        let ftype = fields
            .get(name)
            .ok_or_else(|| DecompositionError::UnknownField(name.clone()))?;
        if saw_numeric {
            return match ftype.arity() {
                FieldArity::Numeric => Err(DecompositionError::MultipleNumeric),
                FieldArity::Discrete => Err(DecompositionError::NumericNotLast(name.clone())),
            };
        }
        if ftype.arity() == FieldArity::Numeric {
            saw_numeric = true;
        }
    }
    Ok(())
}

#[derive(Debug)]
enum Level {
    Discrete(String),
    Numeric(String, Bucketizer),
}

/// Validated decomposition order for one instrumentation: zero or more
/// discrete fields followed by at most one numeric field.
#[derive(Debug)]
pub struct DecompositionPlan {
    levels: Vec<Level>,
}

impl DecompositionPlan {
    pub fn new(
        decomposition: &[String],
        fields: &BTreeMap<String, FieldSpec>,
    ) -> Result<Self, DecompositionError> {
        let mut levels = Vec::with_capacity(decomposition.len());
        let mut saw_numeric = false;
        for name in decomposition {
            let spec = fields
                .get(name)
                .ok_or_else(|| DecompositionError::UnknownField(name.clone()))?;
            if saw_numeric {
                // Anything after a numeric field is invalid, numeric or not.
                return match spec.ftype.arity() {
                    FieldArity::Numeric => Err(DecompositionError::MultipleNumeric),
                    FieldArity::Discrete => {
                        Err(DecompositionError::NumericNotLast(name.clone()))
                    }
                };
            }
            match spec.ftype.arity() {
                FieldArity::Discrete => levels.push(Level::Discrete(name.clone())),
                FieldArity::Numeric => {
                    saw_numeric = true;
                    // Registration guarantees numeric fields carry one.
                    let bucketizer = spec
                        .bucketize
                        .clone()
                        .unwrap_or(Bucketizer::Linear { step: 1 });
                    levels.push(Level::Numeric(name.clone(), bucketizer));
                }
            }
        }
        Ok(Self { levels })
    }

    /// Identity value for this plan's shape, returned on the first tick
    /// when no delta exists yet.
    pub fn zero(&self) -> MetricValue {
        match self.levels.first() {
            None => MetricValue::Scalar(0),
            Some(Level::Discrete(_)) => MetricValue::Map(BTreeMap::new()),
            Some(Level::Numeric(..)) => MetricValue::Distribution(Vec::new()),
        }
    }

    pub fn fold(&self, points: &[DataPoint]) -> MetricValue {
        self.fold_level(points, 0)
    }

    fn fold_level(&self, points: &[DataPoint], depth: usize) -> MetricValue {
        match self.levels.get(depth) {
            None => MetricValue::Scalar(points.iter().map(|p| p.value).sum()),
            Some(Level::Numeric(name, bucketizer)) => {
                let mut dist = Vec::new();
                for point in points {
                    let Some(FieldValue::Num(position)) = point.fields.get(name) else {
                        continue;
                    };
                    bucketizer.insert(&mut dist, *position, point.value);
                }
                MetricValue::Distribution(dist)
            }
            Some(Level::Discrete(name)) => {
                let mut partitions: BTreeMap<String, Vec<DataPoint>> = BTreeMap::new();
                for point in points {
                    let Some(value) = point.fields.get(name) else {
                        continue;
                    };
                    partitions
                        .entry(value.to_string())
                        .or_default()
                        .push(point.clone());
                }
                MetricValue::Map(
                    partitions
                        .into_iter()
                        .map(|(key, subset)| (key, self.fold_level(&subset, depth + 1)))
                        .collect(),
                )
            }
        }
    }
}
