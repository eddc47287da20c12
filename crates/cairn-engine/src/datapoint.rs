//! Data points: the engine-internal unit between raw snapshots and the
//! decomposed value. Never persisted; produced and consumed in one tick.

use crate::predicate::Predicate;
use cairn_common::types::FieldValue;
use std::collections::BTreeMap;

/// One (field assignment, value) pair, e.g.
/// `{disk: "sda", optype: "read"} -> 100`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub fields: BTreeMap<String, FieldValue>,
    pub value: i64,
}

impl DataPoint {
    pub fn new(fields: BTreeMap<String, FieldValue>, value: i64) -> Self {
        Self { fields, value }
    }
}

/// Keeps only the points matching the predicate.
pub fn filter(points: Vec<DataPoint>, predicate: &Predicate) -> Vec<DataPoint> {
    points
        .into_iter()
        .filter(|p| predicate.eval(&p.fields))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn points() -> Vec<DataPoint> {
        vec![
            DataPoint::new(
                BTreeMap::from([("optype".to_string(), "read".into())]),
                5,
            ),
            DataPoint::new(
                BTreeMap::from([("optype".to_string(), "write".into())]),
                7,
            ),
        ]
    }

    #[test]
    fn filter_by_eq_keeps_only_matching_points() {
        let p = Predicate::parse(&json!({"eq": ["optype", "read"]})).unwrap();
        let kept = filter(points(), &p);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].value, 5);
    }

    #[test]
    fn filter_by_true_keeps_everything() {
        let kept = filter(points(), &Predicate::True);
        assert_eq!(kept.len(), 2);
    }
}
