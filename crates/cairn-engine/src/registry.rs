//! Per-node catalog of available metrics. Each (module, stat) carries
//! one or more cost-ranked implementations; selection always picks the
//! cheapest one whose field set covers the requested predicate and
//! decomposition fields. Declaration mistakes are fatal at startup, not
//! runtime errors.

use crate::backend::MetricBackend;
use crate::bucketize::Bucketizer;
use crate::predicate::Predicate;
use cairn_common::types::{
    FieldArity, FieldDecl, FieldType, FqId, ModuleDecl, StatDecl, UnitType,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Malformed backend declaration. Raised while backends register at
/// startup and aborts the node.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("module \"{module}\" redeclared with label \"{new}\" (was \"{old}\")")]
    ModuleRelabeled { module: String, old: String, new: String },

    #[error("metric {module}.{stat} declared in unregistered module")]
    UndeclaredModule { module: String, stat: String },

    #[error("numeric field \"{field}\" of {module}.{stat} has no bucketizer")]
    MissingBucketizer { module: String, stat: String, field: String },

    #[error("discrete field \"{field}\" of {module}.{stat} declares a bucketizer")]
    DiscreteBucketizer { module: String, stat: String, field: String },

    #[error(
        "implementation of {module}.{stat} partially overlaps an existing \
         implementation's field set"
    )]
    OverlappingFields { module: String, stat: String },
}

/// What a factory gets when an instrumentation binds to this node: the
/// already-validated request description.
#[derive(Clone)]
pub struct BackendRequest {
    pub id: FqId,
    pub module: String,
    pub stat: String,
    pub predicate: Predicate,
    pub decomposition: Vec<String>,
}

pub type BackendFactory =
    Arc<dyn Fn(&BackendRequest) -> anyhow::Result<Box<dyn MetricBackend>> + Send + Sync>;

/// Registry-level field declaration for one implementation.
#[derive(Clone)]
pub struct ImplField {
    pub label: String,
    pub ftype: FieldType,
    pub bucketize: Option<Bucketizer>,
}

/// One ranked implementation of a (module, stat).
pub struct Implementation {
    pub label: String,
    pub unit: UnitType,
    /// Relative instrumentation cost; lower is cheaper.
    pub cost: u32,
    pub fields: BTreeMap<String, ImplField>,
    pub factory: BackendFactory,
}

impl Implementation {
    pub fn field_types(&self) -> BTreeMap<String, FieldType> {
        self.fields
            .iter()
            .map(|(name, f)| (name.clone(), f.ftype))
            .collect()
    }

    fn field_names(&self) -> BTreeSet<&str> {
        self.fields.keys().map(String::as_str).collect()
    }
}

/// Everything needed to register one implementation.
pub struct MetricDecl {
    pub module: String,
    pub stat: String,
    pub label: String,
    pub unit: UnitType,
    pub cost: u32,
    pub fields: BTreeMap<String, ImplField>,
    pub factory: BackendFactory,
}

struct ModuleEntry {
    label: String,
    stats: BTreeMap<String, Vec<Implementation>>,
}

#[derive(Default)]
pub struct MetricRegistry {
    modules: BTreeMap<String, ModuleEntry>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module namespace. Idempotent; a name re-registered
    /// with a different label is a configuration error, since multiple
    /// backends may legitimately share a module only when they agree on
    /// what it is.
    pub fn register_module(&mut self, name: &str, label: &str) -> Result<(), ConfigError> {
        match self.modules.get(name) {
            None => {
                self.modules.insert(
                    name.to_string(),
                    ModuleEntry { label: label.to_string(), stats: BTreeMap::new() },
                );
                Ok(())
            }
            Some(existing) if existing.label == label => Ok(()),
            Some(existing) => Err(ConfigError::ModuleRelabeled {
                module: name.to_string(),
                old: existing.label.clone(),
                new: label.to_string(),
            }),
        }
    }

    /// Appends one more ranked implementation for (module, stat).
    pub fn register_metric(&mut self, decl: MetricDecl) -> Result<(), ConfigError> {
        for (name, field) in &decl.fields {
            match (field.ftype.arity(), &field.bucketize) {
                (FieldArity::Numeric, None) => {
                    return Err(ConfigError::MissingBucketizer {
                        module: decl.module.clone(),
                        stat: decl.stat.clone(),
                        field: name.clone(),
                    });
                }
                (FieldArity::Discrete, Some(_)) => {
                    return Err(ConfigError::DiscreteBucketizer {
                        module: decl.module.clone(),
                        stat: decl.stat.clone(),
                        field: name.clone(),
                    });
                }
                _ => {}
            }
        }

        let Some(module) = self.modules.get_mut(&decl.module) else {
            return Err(ConfigError::UndeclaredModule { module: decl.module, stat: decl.stat });
        };

        let implementation = Implementation {
            label: decl.label,
            unit: decl.unit,
            cost: decl.cost,
            fields: decl.fields,
            factory: decl.factory,
        };

        let impls = module.stats.entry(decl.stat.clone()).or_default();
        // Implementations of one stat must be strictly ordered by field
        // power: each pair is subset or superset, never partially
        // overlapping, so cost-based selection is well-defined.
        let new_names = implementation.field_names();
        for existing in impls.iter() {
            let old_names = existing.field_names();
            if !new_names.is_subset(&old_names) && !old_names.is_subset(&new_names) {
                return Err(ConfigError::OverlappingFields {
                    module: decl.module,
                    stat: decl.stat,
                });
            }
        }
        impls.push(implementation);
        Ok(())
    }

    /// The cheapest implementation of (module, stat) whose field set
    /// covers `required`; ties keep registration order.
    pub fn resolve(
        &self,
        module: &str,
        stat: &str,
        required: &BTreeSet<String>,
    ) -> Option<&Implementation> {
        self.modules
            .get(module)?
            .stats
            .get(stat)?
            .iter()
            .filter(|imp| required.iter().all(|f| imp.fields.contains_key(f)))
            .min_by_key(|imp| imp.cost)
    }

    pub fn contains(&self, module: &str, stat: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|m| m.stats.contains_key(stat))
    }

    /// Description tree advertised to the authority: per stat, the
    /// union of all implementations' fields, first declaration of a
    /// field name winning.
    pub fn catalog(&self) -> Vec<ModuleDecl> {
        self.modules
            .iter()
            .map(|(module_name, module)| ModuleDecl {
                name: module_name.clone(),
                label: module.label.clone(),
                stats: module
                    .stats
                    .iter()
                    .map(|(stat_name, impls)| {
                        let mut fields: Vec<FieldDecl> = Vec::new();
                        let mut seen = BTreeSet::new();
                        for imp in impls {
                            for (field_name, field) in &imp.fields {
                                if seen.insert(field_name.clone()) {
                                    fields.push(FieldDecl {
                                        name: field_name.clone(),
                                        label: field.label.clone(),
                                        ftype: field.ftype,
                                    });
                                }
                            }
                        }
                        // The most capable implementation names the stat.
                        let best = impls
                            .iter()
                            .max_by_key(|imp| imp.fields.len());
                        StatDecl {
                            name: stat_name.clone(),
                            label: best.map(|b| b.label.clone()).unwrap_or_default(),
                            unit: best.map(|b| b.unit).unwrap_or(UnitType::Ops),
                            fields,
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    /// Count of advertised stats, for status reporting.
    pub fn nmetrics(&self) -> usize {
        self.modules.values().map(|m| m.stats.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_common::types::MetricValue;

    struct FixedBackend;

    impl MetricBackend for FixedBackend {
        fn instrument(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn deinstrument(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn value(&mut self) -> anyhow::Result<MetricValue> {
            Ok(MetricValue::Scalar(1))
        }
    }

    fn factory() -> BackendFactory {
        Arc::new(|_| Ok(Box::new(FixedBackend)))
    }

    fn string_field(label: &str) -> ImplField {
        ImplField { label: label.to_string(), ftype: FieldType::String, bucketize: None }
    }

    fn decl(stat: &str, cost: u32, field_names: &[&str]) -> MetricDecl {
        MetricDecl {
            module: "io".to_string(),
            stat: stat.to_string(),
            label: "I/O ops".to_string(),
            unit: UnitType::Ops,
            cost,
            fields: field_names
                .iter()
                .map(|n| (n.to_string(), string_field(n)))
                .collect(),
            factory: factory(),
        }
    }

    #[test]
    fn module_reregistration_is_idempotent_but_relabeling_is_fatal() {
        let mut reg = MetricRegistry::new();
        reg.register_module("io", "Disk I/O").unwrap();
        reg.register_module("io", "Disk I/O").unwrap();
        let err = reg.register_module("io", "Input/Output").unwrap_err();
        assert!(matches!(err, ConfigError::ModuleRelabeled { .. }));
    }

    #[test]
    fn metric_in_undeclared_module_is_fatal() {
        let mut reg = MetricRegistry::new();
        let err = reg.register_metric(decl("ops", 1, &["hostname"])).unwrap_err();
        assert!(matches!(err, ConfigError::UndeclaredModule { .. }));
    }

    #[test]
    fn numeric_field_requires_a_bucketizer_and_discrete_forbids_one() {
        let mut reg = MetricRegistry::new();
        reg.register_module("io", "Disk I/O").unwrap();

        let mut bad = decl("ops", 1, &[]);
        bad.fields.insert(
            "latency".to_string(),
            ImplField { label: "latency".into(), ftype: FieldType::Time, bucketize: None },
        );
        assert!(matches!(
            reg.register_metric(bad),
            Err(ConfigError::MissingBucketizer { .. })
        ));

        let mut bad = decl("ops", 1, &[]);
        bad.fields.insert(
            "optype".to_string(),
            ImplField {
                label: "type".into(),
                ftype: FieldType::String,
                bucketize: Some(Bucketizer::linear(10)),
            },
        );
        assert!(matches!(
            reg.register_metric(bad),
            Err(ConfigError::DiscreteBucketizer { .. })
        ));
    }

    #[test]
    fn selection_picks_cheapest_covering_implementation() {
        let mut reg = MetricRegistry::new();
        reg.register_module("io", "Disk I/O").unwrap();
        // Cheap implementation: no fields beyond hostname.
        reg.register_metric(decl("ops", 1, &["hostname"])).unwrap();
        // Expensive implementation: can also break down by optype.
        reg.register_metric(decl("ops", 10, &["hostname", "optype"])).unwrap();

        let none = BTreeSet::new();
        assert_eq!(reg.resolve("io", "ops", &none).unwrap().cost, 1);

        let by_optype = BTreeSet::from(["optype".to_string()]);
        assert_eq!(reg.resolve("io", "ops", &by_optype).unwrap().cost, 10);

        let unknown = BTreeSet::from(["zone".to_string()]);
        assert!(reg.resolve("io", "ops", &unknown).is_none());
    }

    #[test]
    fn partially_overlapping_field_sets_are_rejected() {
        let mut reg = MetricRegistry::new();
        reg.register_module("io", "Disk I/O").unwrap();
        reg.register_metric(decl("ops", 1, &["hostname", "optype"])).unwrap();
        let err = reg
            .register_metric(decl("ops", 2, &["hostname", "zone"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingFields { .. }));
    }

    #[test]
    fn catalog_unions_fields_with_first_declaration_winning() {
        let mut reg = MetricRegistry::new();
        reg.register_module("io", "Disk I/O").unwrap();
        let mut first = decl("ops", 1, &["hostname"]);
        first
            .fields
            .insert("optype".to_string(), string_field("operation type"));
        reg.register_metric(first).unwrap();
        let mut second = decl("ops", 10, &["hostname", "optype"]);
        second
            .fields
            .insert("optype".to_string(), string_field("relabeled"));
        reg.register_metric(second).unwrap();

        let catalog = reg.catalog();
        assert_eq!(catalog.len(), 1);
        let stat = &catalog[0].stats[0];
        let optype = stat.fields.iter().find(|f| f.name == "optype").unwrap();
        assert_eq!(optype.label, "operation type");
        assert_eq!(reg.nmetrics(), 1);
    }
}
