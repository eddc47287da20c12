//! Per-instrumentation time series. Timestamps are floored to the
//! instrumentation's granularity; values landing on the same instant
//! are sum-merged, so several instrumenters can feed one series.

use cairn_common::types::{Bucket, FqId, MetricValue};
use std::collections::{BTreeMap, HashMap};

struct Series {
    granularity: u64,
    retention: u64,
    values: BTreeMap<i64, MetricValue>,
}

#[derive(Default)]
pub struct SeriesStore {
    series: HashMap<FqId, Series>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or re-parameterizes) the series for an instrumentation.
    /// Idempotent: re-enabling an already-known id keeps its data.
    pub fn enable(&mut self, id: FqId, granularity: u64, retention: u64) {
        let granularity = granularity.max(1);
        match self.series.get_mut(&id) {
            Some(series) => {
                series.granularity = granularity;
                series.retention = retention;
            }
            None => {
                self.series.insert(
                    id,
                    Series { granularity, retention, values: BTreeMap::new() },
                );
            }
        }
    }

    /// Forgets a series. Unknown ids succeed trivially.
    pub fn disable(&mut self, id: &FqId) {
        self.series.remove(id);
    }

    pub fn is_enabled(&self, id: &FqId) -> bool {
        self.series.contains_key(id)
    }

    pub fn ninsts(&self) -> usize {
        self.series.len()
    }

    /// Folds one data message into its series. Returns false when the
    /// id is unknown (data racing ahead of its enable command); the
    /// caller logs and drops it.
    pub fn ingest(&mut self, id: &FqId, time_ms: i64, value: MetricValue) -> bool {
        let Some(series) = self.series.get_mut(id) else {
            return false;
        };
        let granularity = series.granularity as i64;
        let instant = (time_ms / 1000).div_euclid(granularity) * granularity;

        match series.values.get_mut(&instant) {
            Some(existing) => merge(existing, value),
            None => {
                series.values.insert(instant, value);
            }
        }

        // Evict instants older than the retention window behind the
        // newest instant we have.
        if let Some((&latest, _)) = series.values.iter().next_back() {
            let cutoff = latest - series.retention as i64;
            series.values.retain(|&instant, _| instant > cutoff);
        }
        true
    }

    pub fn value_at(&self, id: &FqId, instant: i64) -> Option<&MetricValue> {
        self.series.get(id)?.values.get(&instant)
    }

    /// Newest (instant, value) pair for an instrumentation.
    pub fn latest(&self, id: &FqId) -> Option<(i64, &MetricValue)> {
        self.series
            .get(id)?
            .values
            .iter()
            .next_back()
            .map(|(&instant, value)| (instant, value))
    }
}

/// Sum-merges `incoming` into `existing`: scalars add, mappings merge
/// key-wise, distributions merge bucket-wise by range. Mismatched
/// shapes keep the newer value, since a shape change means the
/// instrumentation was redefined.
fn merge(existing: &mut MetricValue, incoming: MetricValue) {
    match (existing, incoming) {
        (MetricValue::Scalar(a), MetricValue::Scalar(b)) => *a += b,
        (MetricValue::Map(a), MetricValue::Map(b)) => {
            for (key, value) in b {
                match a.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        a.insert(key, value);
                    }
                }
            }
        }
        (MetricValue::Distribution(a), MetricValue::Distribution(b)) => merge_buckets(a, b),
        (existing, incoming) => {
            tracing::warn!("mismatched value shapes at one instant, keeping newer");
            *existing = incoming;
        }
    }
}

fn merge_buckets(existing: &mut Vec<Bucket>, incoming: Vec<Bucket>) {
    for (range, weight) in incoming {
        let mut at = existing.len();
        let mut merged = false;
        for (i, (existing_range, existing_weight)) in existing.iter_mut().enumerate() {
            if *existing_range == range {
                *existing_weight += weight;
                merged = true;
                break;
            }
            if range.0 < existing_range.0 {
                at = i;
                break;
            }
        }
        if !merged {
            existing.insert(at.min(existing.len()), (range, weight));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::types::Scope;

    fn id(n: u32) -> FqId {
        FqId::new(Scope::Global, n)
    }

    #[test]
    fn ingest_requires_enable_first() {
        let mut store = SeriesStore::new();
        assert!(!store.ingest(&id(1), 1_000, MetricValue::Scalar(5)));
        store.enable(id(1), 1, 600);
        assert!(store.ingest(&id(1), 1_000, MetricValue::Scalar(5)));
        assert_eq!(store.value_at(&id(1), 1), Some(&MetricValue::Scalar(5)));
    }

    #[test]
    fn same_instant_values_sum_merge() {
        let mut store = SeriesStore::new();
        store.enable(id(1), 1, 600);
        store.ingest(&id(1), 5_000, MetricValue::Scalar(3));
        store.ingest(&id(1), 5_400, MetricValue::Scalar(4));
        assert_eq!(store.value_at(&id(1), 5), Some(&MetricValue::Scalar(7)));
    }

    #[test]
    fn granularity_floors_instants() {
        let mut store = SeriesStore::new();
        store.enable(id(1), 10, 600);
        store.ingest(&id(1), 17_000, MetricValue::Scalar(1));
        store.ingest(&id(1), 19_000, MetricValue::Scalar(2));
        store.ingest(&id(1), 21_000, MetricValue::Scalar(4));
        assert_eq!(store.value_at(&id(1), 10), Some(&MetricValue::Scalar(3)));
        assert_eq!(store.value_at(&id(1), 20), Some(&MetricValue::Scalar(4)));
    }

    #[test]
    fn maps_and_distributions_merge_structurally() {
        let mut store = SeriesStore::new();
        store.enable(id(1), 1, 600);
        store.ingest(
            &id(1),
            1_000,
            MetricValue::Map(BTreeMap::from([
                ("read".to_string(), MetricValue::Scalar(5)),
            ])),
        );
        store.ingest(
            &id(1),
            1_000,
            MetricValue::Map(BTreeMap::from([
                ("read".to_string(), MetricValue::Scalar(2)),
                ("write".to_string(), MetricValue::Scalar(1)),
            ])),
        );
        let expected = MetricValue::Map(BTreeMap::from([
            ("read".to_string(), MetricValue::Scalar(7)),
            ("write".to_string(), MetricValue::Scalar(1)),
        ]));
        assert_eq!(store.value_at(&id(1), 1), Some(&expected));

        store.enable(id(2), 1, 600);
        store.ingest(
            &id(2),
            1_000,
            MetricValue::Distribution(vec![((0, 9), 2), ((20, 29), 1)]),
        );
        store.ingest(
            &id(2),
            1_000,
            MetricValue::Distribution(vec![((0, 9), 1), ((10, 19), 4)]),
        );
        assert_eq!(
            store.value_at(&id(2), 1),
            Some(&MetricValue::Distribution(vec![
                ((0, 9), 3),
                ((10, 19), 4),
                ((20, 29), 1)
            ]))
        );
    }

    #[test]
    fn retention_evicts_old_instants() {
        let mut store = SeriesStore::new();
        store.enable(id(1), 1, 10);
        store.ingest(&id(1), 1_000, MetricValue::Scalar(1));
        store.ingest(&id(1), 5_000, MetricValue::Scalar(2));
        store.ingest(&id(1), 20_000, MetricValue::Scalar(3));
        assert_eq!(store.value_at(&id(1), 1), None);
        assert_eq!(store.value_at(&id(1), 5), None);
        assert_eq!(store.latest(&id(1)), Some((20, &MetricValue::Scalar(3))));
    }

    #[test]
    fn reenable_keeps_accumulated_data() {
        let mut store = SeriesStore::new();
        store.enable(id(1), 1, 600);
        store.ingest(&id(1), 1_000, MetricValue::Scalar(5));
        store.enable(id(1), 1, 600);
        assert_eq!(store.value_at(&id(1), 1), Some(&MetricValue::Scalar(5)));

        store.disable(&id(1));
        store.disable(&id(1));
        assert!(!store.is_enabled(&id(1)));
    }
}
