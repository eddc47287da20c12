//! Instrumentation lifecycle: validation, id allocation, node binding,
//! and the asynchronous enable/disable command flow.
//!
//! The manager owns the instrumentation namespace. Creation validates
//! and records synchronously, then issues enable commands
//! asynchronously; enablement may still fail without unwinding the
//! record, trading hard collection guarantees for availability of the
//! control-plane view. Deletion removes the record unconditionally
//! before any disable command is sent, so repeated deletes and
//! concurrent reads behave predictably.

use crate::registry::FleetRegistry;
use cairn_common::types::{FqId, InstnProperties, Scope};
use cairn_engine::decompose;
use cairn_engine::Predicate;
use cairn_protocol::bus::key_aggregator;
use cairn_protocol::message::{Ack, Command, EnableInstrumentation};
use cairn_protocol::{EnableStatus, Peer};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_GRANULARITY: u64 = 1;
const DEFAULT_RETENTION: u64 = 600;
const DEFAULT_IDLE_MAX: u64 = 3600;
/// Retention is bounded by this many data points per series.
const MAX_DATAPOINTS: u64 = 3600;
const MAX_IDLE_MAX: u64 = 604_800;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field \"{0}\"")]
    MissingField(&'static str),

    #[error("field \"{field}\": {reason}")]
    BadValue { field: &'static str, reason: String },

    #[error("unknown metric {module}.{stat}")]
    UnknownMetric { module: String, stat: String },

    #[error("invalid predicate: {0}")]
    BadPredicate(String),

    #[error("invalid decomposition: {0}")]
    BadDecomposition(String),

    #[error("granularity must be a positive integer, a multiple of {step} when above 1")]
    BadGranularity { step: u64 },

    #[error("retention-time must be between {min} and {max} seconds")]
    BadRetention { min: u64, max: u64 },

    #[error("idle-max must be between 1 and {max} seconds")]
    BadIdleMax { max: u64 },

    #[error("property \"{0}\" cannot be modified")]
    ImmutableProperty(&'static str),

    #[error("timeout must be between {min} and {max} seconds")]
    BadTimeout { min: u64, max: u64 },

    #[error("no instrumenter advertises the requested metric and fields")]
    NoEligibleInstrumenter,

    #[error("no aggregator is online")]
    NoAggregator,
}

/// Loosely-typed creation/update input, as the HTTP surface hands it
/// over: every field may arrive as a JSON value of the client's
/// choosing and is coerced or rejected here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRequest {
    pub module: Option<Value>,
    pub stat: Option<Value>,
    pub predicate: Option<Value>,
    pub decomposition: Option<Value>,
    pub granularity: Option<Value>,
    #[serde(rename = "retention-time")]
    pub retention_time: Option<Value>,
    #[serde(rename = "idle-max")]
    pub idle_max: Option<Value>,
    #[serde(rename = "persist-data")]
    pub persist_data: Option<Value>,
    pub enabled: Option<Value>,
}

/// A live instrumentation: validated properties plus its bindings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Instrumentation {
    pub id: FqId,
    #[serde(flatten)]
    pub properties: InstnProperties,
    pub instrumenter: String,
    pub aggregator: String,
}

pub struct LifecycleManager {
    insts: BTreeMap<FqId, Instrumentation>,
    by_scope: BTreeMap<Scope, BTreeSet<u32>>,
    /// Next id per scope. Monotonic for the life of the process so ids
    /// are never reused, even after destroy.
    next_id: BTreeMap<Scope, u32>,
    granularity_step: u64,
    command_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(granularity_step: u64, command_timeout: Duration) -> Self {
        Self {
            insts: BTreeMap::new(),
            by_scope: BTreeMap::new(),
            next_id: BTreeMap::new(),
            granularity_step,
            command_timeout,
        }
    }

    // ---- input coercion ----

    fn coerce_string(field: &'static str, value: &Value) -> Result<String, ValidationError> {
        match value {
            Value::String(s) if !s.is_empty() => Ok(s.clone()),
            other => Err(ValidationError::BadValue {
                field,
                reason: format!("expected a non-empty string, got {other}"),
            }),
        }
    }

    /// Numbers and numeric strings are accepted; fractions truncate
    /// toward zero, so `"10.5"` becomes 10.
    fn coerce_number(field: &'static str, value: &Value) -> Result<i64, ValidationError> {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match parsed {
            Some(f) if f.is_finite() => Ok(f.trunc() as i64),
            _ => Err(ValidationError::BadValue {
                field,
                reason: format!("expected a number, got {value}"),
            }),
        }
    }

    fn coerce_bool(field: &'static str, value: &Value) -> Result<bool, ValidationError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::String(s) if s == "true" => Ok(true),
            Value::String(s) if s == "false" => Ok(false),
            other => Err(ValidationError::BadValue {
                field,
                reason: format!("expected a boolean, got {other}"),
            }),
        }
    }

    /// A decomposition arrives as a list of field names or, for
    /// convenience, a single bare name.
    fn coerce_decomposition(value: &Value) -> Result<Vec<String>, ValidationError> {
        match value {
            Value::String(s) => Ok(vec![s.clone()]),
            Value::Array(items) => items
                .iter()
                .map(|item| Self::coerce_string("decomposition", item))
                .collect(),
            other => Err(ValidationError::BadValue {
                field: "decomposition",
                reason: format!("expected a field list, got {other}"),
            }),
        }
    }

    fn validate_granularity(&self, raw: Option<&Value>) -> Result<u64, ValidationError> {
        let Some(raw) = raw else {
            return Ok(DEFAULT_GRANULARITY);
        };
        let n = Self::coerce_number("granularity", raw)?;
        let step = self.granularity_step;
        if n < 1 {
            return Err(ValidationError::BadGranularity { step });
        }
        let n = n as u64;
        if n > 1 && n % step != 0 {
            return Err(ValidationError::BadGranularity { step });
        }
        Ok(n)
    }

    fn validate_retention(
        raw: Option<&Value>,
        granularity: u64,
    ) -> Result<u64, ValidationError> {
        let min = granularity;
        let max = granularity * MAX_DATAPOINTS;
        let Some(raw) = raw else {
            return Ok(DEFAULT_RETENTION.clamp(min, max));
        };
        let n = Self::coerce_number("retention-time", raw)?;
        if n < 0 || (n as u64) < min || (n as u64) > max {
            return Err(ValidationError::BadRetention { min, max });
        }
        Ok(n as u64)
    }

    fn validate_idle_max(raw: Option<&Value>) -> Result<u64, ValidationError> {
        let Some(raw) = raw else {
            return Ok(DEFAULT_IDLE_MAX);
        };
        let n = Self::coerce_number("idle-max", raw)?;
        if n < 1 || (n as u64) > MAX_IDLE_MAX {
            return Err(ValidationError::BadIdleMax { max: MAX_IDLE_MAX });
        }
        Ok(n as u64)
    }

    // ---- operations ----

    /// Validates the request, binds it to an instrumenter and an
    /// aggregator, records it under a fresh id, and issues the enable
    /// commands asynchronously. Returns synchronously with the record;
    /// a later enable failure is logged, never unwound.
    pub fn create(
        &mut self,
        scope: Scope,
        request: &CreateRequest,
        fleet: &mut FleetRegistry,
        peer: &Arc<Peer>,
    ) -> Result<Instrumentation, ValidationError> {
        let module = Self::coerce_string(
            "module",
            request
                .module
                .as_ref()
                .ok_or(ValidationError::MissingField("module"))?,
        )?;
        let stat = Self::coerce_string(
            "stat",
            request
                .stat
                .as_ref()
                .ok_or(ValidationError::MissingField("stat"))?,
        )?;
        if !fleet.catalog().contains(&module, &stat) {
            return Err(ValidationError::UnknownMetric { module, stat });
        }
        // The stat exists, so its field table does too.
        let field_types = fleet
            .catalog()
            .field_types(&module, &stat)
            .unwrap_or_default();

        let raw_predicate = request
            .predicate
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let predicate = Predicate::parse(&raw_predicate)
            .map_err(|e| ValidationError::BadPredicate(e.to_string()))?;
        predicate
            .validate(&field_types)
            .map_err(|e| ValidationError::BadPredicate(e.to_string()))?;

        let decomposition = match &request.decomposition {
            None => Vec::new(),
            Some(raw) => Self::coerce_decomposition(raw)?,
        };
        decompose::validate_order(&decomposition, &field_types)
            .map_err(|e| ValidationError::BadDecomposition(e.to_string()))?;

        let granularity = self.validate_granularity(request.granularity.as_ref())?;
        let retention_time =
            Self::validate_retention(request.retention_time.as_ref(), granularity)?;
        let idle_max = Self::validate_idle_max(request.idle_max.as_ref())?;
        let persist_data = match &request.persist_data {
            None => false,
            Some(raw) => Self::coerce_bool("persist-data", raw)?,
        };
        let enabled = match &request.enabled {
            None => true,
            Some(raw) => Self::coerce_bool("enabled", raw)?,
        };

        let mut required = BTreeSet::new();
        predicate.field_names(&mut required);
        required.extend(decomposition.iter().cloned());

        // Pick the least-loaded eligible instrumenter and the
        // least-loaded aggregator; BTreeMap iteration makes the
        // hostname tie-break deterministic.
        let instrumenter = fleet
            .instrumenters()
            .filter(|r| r.advertises(&module, &stat, &required))
            .min_by_key(|r| (r.insts.len(), r.hostname.clone()))
            .map(|r| r.hostname.clone())
            .ok_or(ValidationError::NoEligibleInstrumenter)?;
        let aggregator = fleet
            .aggregators()
            .min_by_key(|r| (r.insts.len(), r.hostname.clone()))
            .map(|r| r.hostname.clone())
            .ok_or(ValidationError::NoAggregator)?;

        let counter = self.next_id.entry(scope.clone()).or_insert(1);
        let id = FqId::new(scope.clone(), *counter);
        *counter += 1;

        let instrumentation = Instrumentation {
            id: id.clone(),
            properties: InstnProperties {
                module,
                stat,
                predicate: raw_predicate,
                decomposition,
                granularity,
                retention_time,
                idle_max,
                persist_data,
                enabled,
                crtime: Utc::now().timestamp_millis(),
            },
            instrumenter: instrumenter.clone(),
            aggregator: aggregator.clone(),
        };

        self.insts.insert(id.clone(), instrumentation.clone());
        self.by_scope.entry(scope).or_default().insert(id.instid);
        if let Some(record) = fleet.instrumenter_mut(&instrumenter) {
            record.insts.insert(id.clone());
        }
        if let Some(record) = fleet.aggregator_mut(&aggregator) {
            record.insts.insert(id.clone());
        }

        let instrumenter_key = fleet
            .instrumenter(&instrumenter)
            .map(|r| r.routekey.clone())
            .unwrap_or_default();
        let aggregator_key = fleet
            .aggregator(&aggregator)
            .map(|r| r.routekey.clone())
            .unwrap_or_default();
        self.send_enable(peer, &instrumentation, instrumenter_key, aggregator_key);

        tracing::info!(id = %id, "instrumentation created");
        Ok(instrumentation)
    }

    /// Issues enable commands for one instrumentation: aggregation
    /// first so data has somewhere to land, then the instrumenter.
    /// Runs detached from the service loop; failures are logged and the
    /// record stays, to be reconciled on the next online notification.
    fn send_enable(
        &self,
        peer: &Arc<Peer>,
        instrumentation: &Instrumentation,
        instrumenter_key: String,
        aggregator_key: String,
    ) {
        let peer = peer.clone();
        let timeout = self.command_timeout;
        let id = instrumentation.id.clone();
        let destination = key_aggregator(&instrumentation.aggregator);
        let enable_agg = Command::EnableAggregation {
            id: id.clone(),
            granularity: instrumentation.properties.granularity,
            retention_time: instrumentation.properties.retention_time,
        };
        let enable_inst = Command::EnableInstrumentation(EnableInstrumentation {
            id: id.clone(),
            module: instrumentation.properties.module.clone(),
            stat: instrumentation.properties.stat.clone(),
            predicate: instrumentation.properties.predicate.clone(),
            decomposition: instrumentation.properties.decomposition.clone(),
            destination,
        });
        let enabled = instrumentation.properties.enabled;

        tokio::spawn(async move {
            match peer.command(&aggregator_key, enable_agg, timeout).await {
                Ok(Ack::EnableAggregation { status: EnableStatus::Enabled, .. }) => {}
                Ok(ack) => {
                    tracing::error!(%id, ?ack, "aggregator rejected enable");
                }
                Err(e) => {
                    tracing::warn!(%id, error = %e, "enable_aggregation did not complete");
                }
            }

            if !enabled {
                return;
            }
            match peer.command(&instrumenter_key, enable_inst, timeout).await {
                Ok(Ack::EnableInstrumentation {
                    status: EnableStatus::Enabled, ..
                }) => {
                    tracing::info!(%id, "instrumentation enabled");
                }
                Ok(Ack::EnableInstrumentation { status, error, .. }) => {
                    tracing::error!(%id, ?status, ?error, "instrumenter rejected enable");
                }
                Ok(ack) => {
                    tracing::error!(%id, ?ack, "unexpected enable ack");
                }
                Err(e) => {
                    tracing::warn!(%id, error = %e, "enable_instrumentation did not complete");
                }
            }
        });
    }

    /// Removes the record immediately and unconditionally, then sends
    /// best-effort disable commands. Returns the removed record, or
    /// `None` when the id was already gone (repeated deletes succeed at
    /// the HTTP layer as not-found).
    pub fn destroy(
        &mut self,
        id: &FqId,
        fleet: &mut FleetRegistry,
        peer: &Arc<Peer>,
    ) -> Option<Instrumentation> {
        let instrumentation = self.insts.remove(id)?;
        if let Some(ids) = self.by_scope.get_mut(&id.scope) {
            ids.remove(&id.instid);
        }
        let mut instrumenter_key = None;
        if let Some(record) = fleet.instrumenter_mut(&instrumentation.instrumenter) {
            record.insts.remove(id);
            instrumenter_key = Some(record.routekey.clone());
        }
        let mut aggregator_key = None;
        if let Some(record) = fleet.aggregator_mut(&instrumentation.aggregator) {
            record.insts.remove(id);
            aggregator_key = Some(record.routekey.clone());
        }

        // The record is already gone; disable failures are logged, not
        // surfaced.
        let peer = peer.clone();
        let timeout = self.command_timeout;
        let spawn_id = id.clone();
        tokio::spawn(async move {
            let id = spawn_id;
            if let Some(key) = instrumenter_key {
                let cmd = Command::DisableInstrumentation { id: id.clone() };
                if let Err(e) = peer.command(&key, cmd, timeout).await {
                    tracing::warn!(%id, error = %e, "failure during instrumentation delete");
                }
            }
            if let Some(key) = aggregator_key {
                let cmd = Command::DisableAggregation { id: id.clone() };
                if let Err(e) = peer.command(&key, cmd, timeout).await {
                    tracing::warn!(%id, error = %e, "failure during aggregation delete");
                }
            }
        });

        tracing::info!(%id, "instrumentation destroyed");
        Some(instrumentation)
    }

    /// Mutates the documented mutable properties only; any invalid
    /// value fails the whole request without partial mutation.
    pub fn set_properties(
        &mut self,
        id: &FqId,
        changes: &CreateRequest,
    ) -> Result<Option<Instrumentation>, ValidationError> {
        let immutable = [
            ("module", changes.module.is_some()),
            ("stat", changes.stat.is_some()),
            ("predicate", changes.predicate.is_some()),
            ("decomposition", changes.decomposition.is_some()),
            ("granularity", changes.granularity.is_some()),
        ];
        for (name, present) in immutable {
            if present {
                return Err(ValidationError::ImmutableProperty(name));
            }
        }

        let Some(granularity) = self.insts.get(id).map(|i| i.properties.granularity) else {
            return Ok(None);
        };

        // Validate everything against current state before touching it.
        let retention = match &changes.retention_time {
            None => None,
            Some(raw) => Some(Self::validate_retention(Some(raw), granularity)?),
        };
        let idle_max = match &changes.idle_max {
            None => None,
            Some(raw) => Some(Self::validate_idle_max(Some(raw))?),
        };
        let persist = match &changes.persist_data {
            None => None,
            Some(raw) => Some(Self::coerce_bool("persist-data", raw)?),
        };
        let enabled = match &changes.enabled {
            None => None,
            Some(raw) => Some(Self::coerce_bool("enabled", raw)?),
        };

        let Some(entry) = self.insts.get_mut(id) else {
            return Ok(None);
        };
        if let Some(v) = retention {
            entry.properties.retention_time = v;
        }
        if let Some(v) = idle_max {
            entry.properties.idle_max = v;
        }
        if let Some(v) = persist {
            entry.properties.persist_data = v;
        }
        if let Some(v) = enabled {
            entry.properties.enabled = v;
        }
        Ok(Some(entry.clone()))
    }

    pub fn get(&self, id: &FqId) -> Option<&Instrumentation> {
        self.insts.get(id)
    }

    /// All instrumentations, or those in one scope.
    pub fn list(&self, scope: Option<&Scope>) -> Vec<Instrumentation> {
        self.insts
            .values()
            .filter(|inst| scope.is_none_or(|s| &inst.id.scope == s))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrumentation> {
        self.insts.values()
    }

    pub fn scopes(&self) -> &BTreeMap<Scope, BTreeSet<u32>> {
        &self.by_scope
    }

    pub fn ninsts(&self) -> usize {
        self.insts.len()
    }

    /// Re-sends enable commands for every instrumentation bound to an
    /// instrumenter that just reported online, so its in-memory state
    /// converges back to the authority's.
    pub fn reenable_instrumenter(&self, hostname: &str, routekey: &str, peer: &Arc<Peer>) {
        for instrumentation in self.insts.values() {
            if instrumentation.instrumenter != hostname || !instrumentation.properties.enabled {
                continue;
            }
            let cmd = Command::EnableInstrumentation(EnableInstrumentation {
                id: instrumentation.id.clone(),
                module: instrumentation.properties.module.clone(),
                stat: instrumentation.properties.stat.clone(),
                predicate: instrumentation.properties.predicate.clone(),
                decomposition: instrumentation.properties.decomposition.clone(),
                destination: key_aggregator(&instrumentation.aggregator),
            });
            self.resend(peer, routekey, cmd, instrumentation.id.clone());
        }
    }

    /// Aggregator counterpart of [`Self::reenable_instrumenter`].
    pub fn reenable_aggregator(&self, hostname: &str, routekey: &str, peer: &Arc<Peer>) {
        for instrumentation in self.insts.values() {
            if instrumentation.aggregator != hostname {
                continue;
            }
            let cmd = Command::EnableAggregation {
                id: instrumentation.id.clone(),
                granularity: instrumentation.properties.granularity,
                retention_time: instrumentation.properties.retention_time,
            };
            self.resend(peer, routekey, cmd, instrumentation.id.clone());
        }
    }

    fn resend(&self, peer: &Arc<Peer>, routekey: &str, cmd: Command, id: FqId) {
        let peer = peer.clone();
        let routekey = routekey.to_string();
        let timeout = self.command_timeout;
        tokio::spawn(async move {
            if let Err(e) = peer.command(&routekey, cmd, timeout).await {
                tracing::error!(%id, key = %routekey, error = %e, "failed to re-enable");
            }
        });
    }
}
