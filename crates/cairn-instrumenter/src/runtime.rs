//! Active-instrumentation table and the once-a-second tick.

use cairn_common::types::FqId;
use cairn_engine::decompose;
use cairn_engine::{BackendRequest, MetricBackend, MetricRegistry, Predicate};
use cairn_protocol::message::{DataMessage, EnableInstrumentation, InstrumentationSummary};
use cairn_protocol::Peer;
use chrono::Utc;
use std::collections::BTreeSet;
use std::collections::HashMap;

struct Active {
    backend: Box<dyn MetricBackend>,
    destination: String,
    module: String,
    stat: String,
    since: i64,
}

pub struct Runtime {
    registry: MetricRegistry,
    active: HashMap<FqId, Active>,
    last_tick_sec: Option<i64>,
}

impl Runtime {
    pub fn new(registry: MetricRegistry) -> Self {
        Self { registry, active: HashMap::new(), last_tick_sec: None }
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    /// Enables an instrumentation. Idempotent: an id that is already
    /// active acks success without instantiating a second backend, so
    /// the authority can resend freely after restarts and timeouts.
    pub fn enable(&mut self, req: &EnableInstrumentation) -> Result<(), String> {
        if self.active.contains_key(&req.id) {
            return Ok(());
        }

        let predicate = Predicate::parse(&req.predicate).map_err(|e| e.to_string())?;
        let mut required = BTreeSet::new();
        predicate.field_names(&mut required);
        required.extend(req.decomposition.iter().cloned());

        let Some(implementation) = self.registry.resolve(&req.module, &req.stat, &required)
        else {
            return Err(if self.registry.contains(&req.module, &req.stat) {
                "no implementation covers the requested fields".to_string()
            } else {
                "unknown module or stat".to_string()
            });
        };

        let field_types = implementation.field_types();
        predicate.validate(&field_types).map_err(|e| e.to_string())?;
        // The factory rebuilds the plan; checking order here keeps a bad
        // decomposition from instantiating anything.
        decompose::validate_order(&req.decomposition, &field_types)
            .map_err(|e| e.to_string())?;

        let request = BackendRequest {
            id: req.id.clone(),
            module: req.module.clone(),
            stat: req.stat.clone(),
            predicate,
            decomposition: req.decomposition.clone(),
        };
        let mut backend =
            (implementation.factory)(&request).map_err(|e| e.to_string())?;
        backend.instrument().map_err(|e| e.to_string())?;

        self.active.insert(
            req.id.clone(),
            Active {
                backend,
                destination: req.destination.clone(),
                module: req.module.clone(),
                stat: req.stat.clone(),
                since: Utc::now().timestamp_millis(),
            },
        );
        tracing::info!(id = %req.id, module = %req.module, stat = %req.stat, "instrumented");
        Ok(())
    }

    /// Disables an instrumentation. Unknown ids succeed trivially; a
    /// failed deinstrument keeps the entry so a retry can succeed.
    pub fn disable(&mut self, id: &FqId) -> Result<(), String> {
        let Some(active) = self.active.get_mut(id) else {
            return Ok(());
        };
        active.backend.deinstrument().map_err(|e| e.to_string())?;
        self.active.remove(id);
        tracing::info!(id = %id, "deinstrumented");
        Ok(())
    }

    pub fn is_active(&self, id: &FqId) -> bool {
        self.active.contains_key(id)
    }

    pub fn ninsts(&self) -> usize {
        self.active.len()
    }

    pub fn status(&self) -> Vec<InstrumentationSummary> {
        self.active
            .iter()
            .map(|(id, a)| InstrumentationSummary {
                id: id.clone(),
                module: a.module.clone(),
                stat: a.stat.clone(),
                since: a.since,
            })
            .collect()
    }

    /// Computes and ships one value per active instrumentation.
    pub async fn tick(&mut self, peer: &Peer) {
        self.tick_at(peer, Utc::now()).await;
    }

    /// Tick against an explicit clock reading. If the timer re-enters
    /// within the same wall-clock second the tick is skipped so the
    /// aggregator never sees duplicate samples.
    pub async fn tick_at(&mut self, peer: &Peer, now: chrono::DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let now_sec = now.timestamp();
        if self.last_tick_sec == Some(now_sec) {
            return;
        }
        self.last_tick_sec = Some(now_sec);

        for (id, active) in self.active.iter_mut() {
            let value = match active.backend.value() {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "backend read failed, skipping tick");
                    continue;
                }
            };
            let message = DataMessage { id: id.clone(), value, time: now_ms };
            if let Err(e) = peer.data(&active.destination, message).await {
                tracing::warn!(id = %id, error = %e, "failed to ship data message");
            }
        }
    }
}
