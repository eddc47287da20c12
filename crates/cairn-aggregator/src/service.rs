//! The aggregator's event loop: announce, accept enable/disable
//! commands, fold inbound data messages into the series store.

use crate::store::SeriesStore;
use cairn_common::types::{AggregatorOnline, FqId, HostIdentity, MetricValue};
use cairn_protocol::bus::key_authority;
use cairn_protocol::message::{
    Ack, AggregatorSummary, Command, Envelope, Notify, Payload, StatusReport,
};
use cairn_protocol::{EnableStatus, Peer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

enum ApiRequest {
    Latest { id: FqId, reply: oneshot::Sender<Option<(i64, MetricValue)>> },
    ValueAt { id: FqId, instant: i64, reply: oneshot::Sender<Option<MetricValue>> },
    Ninsts { reply: oneshot::Sender<usize> },
}

/// Read handle for the value surface: the API an HTTP layer would
/// forward raw-value reads into. Cheap to clone.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::UnboundedSender<ApiRequest>,
}

impl AggregatorHandle {
    pub async fn latest(&self, id: FqId) -> Option<(i64, MetricValue)> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ApiRequest::Latest { id, reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn value_at(&self, id: FqId, instant: i64) -> Option<MetricValue> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ApiRequest::ValueAt { id, instant, reply }).ok()?;
        rx.await.ok().flatten()
    }

    pub async fn ninsts(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ApiRequest::Ninsts { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub struct AggregatorService {
    peer: Arc<Peer>,
    store: SeriesStore,
    identity: HostIdentity,
    http_port: u16,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    api: mpsc::UnboundedReceiver<ApiRequest>,
}

impl AggregatorService {
    pub fn new(
        peer: Arc<Peer>,
        store: SeriesStore,
        identity: HostIdentity,
        http_port: u16,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> (Self, AggregatorHandle) {
        let (tx, api) = mpsc::unbounded_channel();
        let service = Self { peer, store, identity, http_port, inbound, api };
        (service, AggregatorHandle { tx })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.announce().await?;
        loop {
            tokio::select! {
                envelope = self.inbound.recv() => {
                    match envelope {
                        Some(envelope) => self.handle(envelope).await,
                        None => {
                            tracing::info!("inbound channel closed, shutting down");
                            return Ok(());
                        }
                    }
                }
                request = self.api.recv() => {
                    match request {
                        Some(request) => self.handle_api(request),
                        None => {
                            tracing::info!("api channel closed, shutting down");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_api(&self, request: ApiRequest) {
        match request {
            ApiRequest::Latest { id, reply } => {
                let value = self
                    .store
                    .latest(&id)
                    .map(|(instant, value)| (instant, value.clone()));
                let _ = reply.send(value);
            }
            ApiRequest::ValueAt { id, instant, reply } => {
                let _ = reply.send(self.store.value_at(&id, instant).cloned());
            }
            ApiRequest::Ninsts { reply } => {
                let _ = reply.send(self.store.ninsts());
            }
        }
    }

    async fn announce(&self) -> anyhow::Result<()> {
        let online = AggregatorOnline {
            identity: self.identity.clone(),
            http_port: self.http_port,
            // Value transformations are an HTTP-surface concern; none
            // are advertised by this build.
            transformations: BTreeMap::new(),
        };
        self.peer
            .notify(&key_authority(), Notify::AggregatorOnline(online))
            .await?;
        tracing::info!(hostname = %self.identity.hostname, "aggregator online");
        Ok(())
    }

    async fn handle(&mut self, envelope: Envelope) {
        let source = envelope.source.clone();
        let correlation = envelope.id;
        match envelope.payload {
            Payload::Cmd(Command::Ping) => {
                self.reply(&source, correlation, Ack::Ping).await;
            }
            Payload::Cmd(Command::Status) => {
                let report = StatusReport {
                    component: "aggregator".to_string(),
                    aggregators: vec![AggregatorSummary {
                        hostname: self.identity.hostname.clone(),
                        ninsts: self.store.ninsts(),
                    }],
                    ..StatusReport::default()
                };
                self.reply(&source, correlation, Ack::Status(report)).await;
            }
            Payload::Cmd(Command::EnableAggregation { id, granularity, retention_time }) => {
                self.store.enable(id.clone(), granularity, retention_time);
                tracing::info!(%id, granularity, "aggregation enabled");
                let ack = Ack::EnableAggregation {
                    id,
                    status: EnableStatus::Enabled,
                    error: None,
                };
                self.reply(&source, correlation, ack).await;
            }
            Payload::Cmd(Command::DisableAggregation { id }) => {
                self.store.disable(&id);
                tracing::info!(%id, "aggregation disabled");
                let ack = Ack::DisableAggregation {
                    id,
                    status: EnableStatus::Disabled,
                    error: None,
                };
                self.reply(&source, correlation, ack).await;
            }
            Payload::Data(data) => {
                if !self.store.ingest(&data.id, data.time, data.value) {
                    tracing::warn!(id = %data.id, "dropping data for unknown instrumentation");
                }
            }
            Payload::Cmd(other) => {
                tracing::warn!(source = %source, ?other, "dropping unsupported command");
            }
            Payload::Notify(Notify::AuthorityOnline { .. }) => {
                // A (re)started authority has an empty fleet registry;
                // announcing again is idempotent and lets it re-learn us.
                if let Err(e) = self.announce().await {
                    tracing::warn!(error = %e, "re-announce failed");
                }
            }
            Payload::Ack(_) => self.peer.resolve_ack(envelope),
            Payload::Notify(_) => {
                tracing::warn!(source = %source, "dropping unexpected notification");
            }
        }
    }

    async fn reply(&self, source: &str, correlation: u64, ack: Ack) {
        if let Err(e) = self.peer.ack(source, correlation, ack).await {
            tracing::warn!(source = %source, error = %e, "failed to send ack");
        }
    }
}
