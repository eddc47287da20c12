//! Deterministic synthetic backend. One worker item whose read/write
//! counters advance by a fixed amount per snapshot, with a cycling
//! latency value. Used by the test suites and kept available in
//! production fleets for end-to-end pipeline checks.

use cairn_common::types::{FieldType, UnitType};
use cairn_engine::{
    Bucketizer, ConfigError, CounterSource, ExtractFn, FieldSpec, ImplField, MetricDecl,
    MetricRegistry, Snapshot, SnapshotMetric, SourceItem,
};
use cairn_common::types::FieldValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counters advance by these amounts on every read.
const READS_PER_TICK: i64 = 5;
const WRITES_PER_TICK: i64 = 5;

struct SyntheticSource {
    ticks: i64,
}

impl CounterSource for SyntheticSource {
    fn read(&mut self) -> anyhow::Result<Snapshot> {
        self.ticks += 1;
        let mut counters = BTreeMap::new();
        counters.insert("reads".to_string(), self.ticks * READS_PER_TICK);
        counters.insert("writes".to_string(), self.ticks * WRITES_PER_TICK);
        // Cycles through [0, 97) so numeric decompositions see several
        // buckets over time.
        counters.insert("latency".to_string(), (self.ticks * 13) % 97);
        let item = SourceItem {
            name: "worker0".to_string(),
            snaptime: self.ticks * 1_000_000_000,
            counters,
        };
        Ok(BTreeMap::from([("worker0".to_string(), item)]))
    }
}

fn fields(hostname: &str) -> BTreeMap<String, FieldSpec> {
    let hostname = hostname.to_string();
    BTreeMap::from([
        (
            "hostname".to_string(),
            FieldSpec {
                label: "server host name".to_string(),
                ftype: FieldType::String,
                values: Arc::new(move |_, _, _| vec![FieldValue::Str(hostname.clone())]),
                bucketize: None,
            },
        ),
        (
            "optype".to_string(),
            FieldSpec {
                label: "operation type".to_string(),
                ftype: FieldType::String,
                values: Arc::new(|_, _, _| vec!["read".into(), "write".into()]),
                bucketize: None,
            },
        ),
        (
            "latency".to_string(),
            FieldSpec {
                label: "duration of op".to_string(),
                ftype: FieldType::Time,
                values: Arc::new(|cur, _, _| vec![FieldValue::Num(cur.counter("latency"))]),
                bucketize: Some(Bucketizer::linear(10)),
            },
        ),
    ])
}

fn extract() -> ExtractFn {
    Arc::new(|assignment, cur, prev, _interval| {
        let key = match assignment.get("optype") {
            Some(FieldValue::Str(s)) if s == "write" => "writes",
            _ => "reads",
        };
        cur.counter(key) - prev.counter(key)
    })
}

pub fn register(registry: &mut MetricRegistry, hostname: &str) -> Result<(), ConfigError> {
    registry.register_module("test_module", "test module description")?;

    let field_specs = fields(hostname);
    let impl_fields: BTreeMap<String, ImplField> = field_specs
        .iter()
        .map(|(name, spec)| {
            (
                name.clone(),
                ImplField {
                    label: spec.label.clone(),
                    ftype: spec.ftype,
                    bucketize: spec.bucketize.clone(),
                },
            )
        })
        .collect();

    registry.register_metric(MetricDecl {
        module: "test_module".to_string(),
        stat: "ops1".to_string(),
        label: "test ops 1".to_string(),
        unit: UnitType::Ops,
        cost: 1,
        fields: impl_fields,
        factory: Arc::new(move |request| {
            let plan = cairn_engine::DecompositionPlan::new(
                &request.decomposition,
                &field_specs,
            )?;
            Ok(Box::new(SnapshotMetric::new(
                Box::new(SyntheticSource { ticks: 0 }),
                field_specs.clone(),
                extract(),
                request.predicate.clone(),
                plan,
            )))
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::types::MetricValue;
    use cairn_common::types::{FqId, Scope};
    use cairn_engine::{BackendRequest, MetricBackend, Predicate};
    use std::collections::BTreeSet;

    fn build(decomposition: &[&str]) -> Box<dyn MetricBackend> {
        let mut registry = MetricRegistry::new();
        register(&mut registry, "testhost").unwrap();
        let required: BTreeSet<String> = decomposition.iter().map(|s| s.to_string()).collect();
        let implementation = registry.resolve("test_module", "ops1", &required).unwrap();
        (implementation.factory)(&BackendRequest {
            id: FqId::new(Scope::Global, 1),
            module: "test_module".to_string(),
            stat: "ops1".to_string(),
            predicate: Predicate::True,
            decomposition: decomposition.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn scalar_value_is_total_delta_after_the_first_tick() {
        let mut backend = build(&[]);
        assert_eq!(backend.value().unwrap(), MetricValue::Scalar(0));
        assert_eq!(
            backend.value().unwrap(),
            MetricValue::Scalar(READS_PER_TICK + WRITES_PER_TICK)
        );
    }

    #[test]
    fn optype_decomposition_splits_reads_and_writes() {
        let mut backend = build(&["optype"]);
        backend.value().unwrap();
        let expected = MetricValue::Map(BTreeMap::from([
            ("read".to_string(), MetricValue::Scalar(READS_PER_TICK)),
            ("write".to_string(), MetricValue::Scalar(WRITES_PER_TICK)),
        ]));
        assert_eq!(backend.value().unwrap(), expected);
    }

    #[test]
    fn latency_decomposition_produces_a_distribution() {
        let mut backend = build(&["latency"]);
        backend.value().unwrap();
        let MetricValue::Distribution(dist) = backend.value().unwrap() else {
            panic!("expected a distribution");
        };
        assert_eq!(dist.iter().map(|(_, w)| w).sum::<i64>(), 10);
    }
}
