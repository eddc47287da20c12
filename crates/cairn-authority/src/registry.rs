//! Fleet registry: presence and capability tracking for instrumenters
//! and aggregators, plus the merged metric catalog offered to clients.
//!
//! Records are keyed by hostname. A second online notification from the
//! same hostname is a restart: identity and capability data are
//! replaced, but the set of bound instrumentations is preserved so the
//! lifecycle manager can reconcile. Records are never evicted; the
//! admin status report carries `last_online` so staleness is visible.

use cairn_common::types::{
    AggregatorOnline, FieldType, FqId, InstrumenterOnline, ModuleDecl, UnitType,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnlineAction {
    Started,
    Restarted,
}

#[derive(Debug, Clone)]
pub struct InstrumenterRecord {
    pub hostname: String,
    pub routekey: String,
    pub agent_name: String,
    pub agent_version: String,
    pub os_name: String,
    pub os_release: String,
    pub os_revision: String,
    pub nmetrics_avail: usize,
    /// module -> stat -> advertised field names, used for eligibility.
    pub capabilities: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// Instrumentations currently bound to this node. Survives restarts.
    pub insts: BTreeSet<FqId>,
    pub last_online: i64,
}

impl InstrumenterRecord {
    pub fn advertises(&self, module: &str, stat: &str, required: &BTreeSet<String>) -> bool {
        self.capabilities
            .get(module)
            .and_then(|stats| stats.get(stat))
            .is_some_and(|fields| required.iter().all(|f| fields.contains(f)))
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorRecord {
    pub hostname: String,
    pub routekey: String,
    pub agent_name: String,
    pub agent_version: String,
    pub os_name: String,
    pub os_release: String,
    pub os_revision: String,
    pub http_port: u16,
    pub transformations: BTreeMap<String, String>,
    pub insts: BTreeSet<FqId>,
    pub last_online: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogField {
    pub label: String,
    #[serde(rename = "type")]
    pub ftype: FieldType,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogStat {
    pub label: String,
    pub unit: UnitType,
    pub fields: BTreeMap<String, CatalogField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogModule {
    pub label: String,
    pub stats: BTreeMap<String, CatalogStat>,
}

/// The authoritative set of metrics offered to clients: the monotonic
/// merge of everything the fleet has ever advertised.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    pub modules: BTreeMap<String, CatalogModule>,
}

impl Catalog {
    /// Merges advertised modules. Growth is monotonic: entries are
    /// added, never replaced or removed, so the first writer for a
    /// field name within a stat wins.
    fn merge(&mut self, modules: &[ModuleDecl]) {
        for module in modules {
            let entry = self
                .modules
                .entry(module.name.clone())
                .or_insert_with(|| CatalogModule {
                    label: module.label.clone(),
                    stats: BTreeMap::new(),
                });
            for stat in &module.stats {
                let stat_entry =
                    entry
                        .stats
                        .entry(stat.name.clone())
                        .or_insert_with(|| CatalogStat {
                            label: stat.label.clone(),
                            unit: stat.unit,
                            fields: BTreeMap::new(),
                        });
                for field in &stat.fields {
                    stat_entry
                        .fields
                        .entry(field.name.clone())
                        .or_insert_with(|| CatalogField {
                            label: field.label.clone(),
                            ftype: field.ftype,
                        });
                }
            }
        }
    }

    pub fn contains(&self, module: &str, stat: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|m| m.stats.contains_key(stat))
    }

    pub fn field_types(&self, module: &str, stat: &str) -> Option<BTreeMap<String, FieldType>> {
        let stat = self.modules.get(module)?.stats.get(stat)?;
        Some(
            stat.fields
                .iter()
                .map(|(name, field)| (name.clone(), field.ftype))
                .collect(),
        )
    }
}

#[derive(Default)]
pub struct FleetRegistry {
    instrumenters: BTreeMap<String, InstrumenterRecord>,
    aggregators: BTreeMap<String, AggregatorRecord>,
    catalog: Catalog,
    transformations: BTreeMap<String, String>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently inserts or updates the instrumenter record and
    /// merges its advertised metrics into the catalog. The caller is
    /// responsible for re-binding on [`OnlineAction::Restarted`]; the
    /// registry performs no re-enable logic itself.
    pub fn record_instrumenter_online(
        &mut self,
        routekey: &str,
        msg: &InstrumenterOnline,
    ) -> OnlineAction {
        let hostname = &msg.identity.hostname;
        let (action, insts) = match self.instrumenters.remove(hostname) {
            Some(existing) => (OnlineAction::Restarted, existing.insts),
            None => (OnlineAction::Started, BTreeSet::new()),
        };

        let mut capabilities: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> =
            BTreeMap::new();
        let mut nmetrics = 0;
        for module in &msg.modules {
            let stats = capabilities.entry(module.name.clone()).or_default();
            for stat in &module.stats {
                nmetrics += 1;
                stats.insert(
                    stat.name.clone(),
                    stat.fields.iter().map(|f| f.name.clone()).collect(),
                );
            }
        }

        self.instrumenters.insert(
            hostname.clone(),
            InstrumenterRecord {
                hostname: hostname.clone(),
                routekey: routekey.to_string(),
                agent_name: msg.identity.agent_name.clone(),
                agent_version: msg.identity.agent_version.clone(),
                os_name: msg.identity.os_name.clone(),
                os_release: msg.identity.os_release.clone(),
                os_revision: msg.identity.os_revision.clone(),
                nmetrics_avail: nmetrics,
                capabilities,
                insts,
                last_online: Utc::now().timestamp_millis(),
            },
        );
        self.catalog.merge(&msg.modules);
        action
    }

    pub fn record_aggregator_online(
        &mut self,
        routekey: &str,
        msg: &AggregatorOnline,
    ) -> OnlineAction {
        let hostname = &msg.identity.hostname;
        let (action, insts) = match self.aggregators.remove(hostname) {
            Some(existing) => (OnlineAction::Restarted, existing.insts),
            None => (OnlineAction::Started, BTreeSet::new()),
        };

        self.aggregators.insert(
            hostname.clone(),
            AggregatorRecord {
                hostname: hostname.clone(),
                routekey: routekey.to_string(),
                agent_name: msg.identity.agent_name.clone(),
                agent_version: msg.identity.agent_version.clone(),
                os_name: msg.identity.os_name.clone(),
                os_release: msg.identity.os_release.clone(),
                os_revision: msg.identity.os_revision.clone(),
                http_port: msg.http_port,
                transformations: msg.transformations.clone(),
                insts,
                last_online: Utc::now().timestamp_millis(),
            },
        );

        // Transformations merge like catalog fields: first writer wins.
        for (name, label) in &msg.transformations {
            self.transformations
                .entry(name.clone())
                .or_insert_with(|| label.clone());
        }
        action
    }

    pub fn instrumenter(&self, hostname: &str) -> Option<&InstrumenterRecord> {
        self.instrumenters.get(hostname)
    }

    pub fn instrumenter_mut(&mut self, hostname: &str) -> Option<&mut InstrumenterRecord> {
        self.instrumenters.get_mut(hostname)
    }

    pub fn aggregator(&self, hostname: &str) -> Option<&AggregatorRecord> {
        self.aggregators.get(hostname)
    }

    pub fn aggregator_mut(&mut self, hostname: &str) -> Option<&mut AggregatorRecord> {
        self.aggregators.get_mut(hostname)
    }

    pub fn instrumenters(&self) -> impl Iterator<Item = &InstrumenterRecord> {
        self.instrumenters.values()
    }

    pub fn aggregators(&self) -> impl Iterator<Item = &AggregatorRecord> {
        self.aggregators.values()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn transformations(&self) -> &BTreeMap<String, String> {
        &self.transformations
    }
}
