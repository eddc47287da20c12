//! The authority's event loop. One task owns the fleet registry and the
//! lifecycle manager; inbound protocol messages and API requests (from
//! the HTTP surface or tests) arrive over channels and are handled
//! strictly one at a time, so no internal locking exists anywhere in
//! the control plane.

use crate::config::AuthorityConfig;
use crate::lifecycle::{CreateRequest, Instrumentation, LifecycleManager, ValidationError};
use crate::registry::FleetRegistry;
use crate::status::{
    self, AdminStatus, AggregatorEntry, InstrumenterEntry, NodeSection,
    STATUS_TIMEOUT_MAX_SECS, STATUS_TIMEOUT_MIN_SECS,
};
use cairn_common::types::{FqId, HostIdentity, Scope};
use cairn_protocol::message::{
    Ack, AggregatorSummary, Command, Envelope, InstrumenterSummary, Notify, Payload, StatusReport,
};
use cairn_protocol::Peer;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("no such instrumentation: {0}")]
    NotFound(FqId),

    #[error("authority is not running")]
    Unavailable,
}

enum ApiRequest {
    Create {
        scope: Scope,
        request: CreateRequest,
        reply: oneshot::Sender<Result<Instrumentation, ValidationError>>,
    },
    Destroy {
        id: FqId,
        reply: oneshot::Sender<bool>,
    },
    Get {
        id: FqId,
        reply: oneshot::Sender<Option<Instrumentation>>,
    },
    List {
        scope: Option<Scope>,
        reply: oneshot::Sender<Vec<Instrumentation>>,
    },
    SetProperties {
        id: FqId,
        changes: CreateRequest,
        reply: oneshot::Sender<Result<Option<Instrumentation>, ValidationError>>,
    },
    Catalog {
        reply: oneshot::Sender<serde_json::Value>,
    },
    AdminStatus {
        recurse: bool,
        timeout_secs: u64,
        reply: oneshot::Sender<Result<AdminStatus, ValidationError>>,
    },
}

/// Client-side handle to a running authority: the API the HTTP surface
/// translates requests into. Cheap to clone.
#[derive(Clone)]
pub struct AuthorityHandle {
    tx: mpsc::UnboundedSender<ApiRequest>,
}

impl AuthorityHandle {
    async fn roundtrip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ApiRequest,
    ) -> Result<T, AuthorityError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| AuthorityError::Unavailable)?;
        rx.await.map_err(|_| AuthorityError::Unavailable)
    }

    pub async fn create(
        &self,
        scope: Scope,
        request: CreateRequest,
    ) -> Result<Instrumentation, AuthorityError> {
        let result = self
            .roundtrip(|reply| ApiRequest::Create { scope, request, reply })
            .await?;
        Ok(result?)
    }

    /// Destroy always completes immediately; a missing id reports
    /// not-found but nothing else can fail.
    pub async fn destroy(&self, id: FqId) -> Result<(), AuthorityError> {
        let found = self
            .roundtrip(|reply| ApiRequest::Destroy { id: id.clone(), reply })
            .await?;
        if found {
            Ok(())
        } else {
            Err(AuthorityError::NotFound(id))
        }
    }

    pub async fn get(&self, id: FqId) -> Result<Instrumentation, AuthorityError> {
        self.roundtrip(|reply| ApiRequest::Get { id: id.clone(), reply })
            .await?
            .ok_or(AuthorityError::NotFound(id))
    }

    pub async fn list(&self, scope: Option<Scope>) -> Result<Vec<Instrumentation>, AuthorityError> {
        self.roundtrip(|reply| ApiRequest::List { scope, reply }).await
    }

    pub async fn set_properties(
        &self,
        id: FqId,
        changes: CreateRequest,
    ) -> Result<Instrumentation, AuthorityError> {
        let result = self
            .roundtrip(|reply| ApiRequest::SetProperties { id: id.clone(), changes, reply })
            .await?;
        result?.ok_or(AuthorityError::NotFound(id))
    }

    pub async fn catalog(&self) -> Result<serde_json::Value, AuthorityError> {
        self.roundtrip(|reply| ApiRequest::Catalog { reply }).await
    }

    /// Snapshot of all registries; with `recurse`, extended by one
    /// status sub-request per known node, bounded by `timeout_secs`.
    pub async fn admin_status(
        &self,
        recurse: bool,
        timeout_secs: u64,
    ) -> Result<AdminStatus, AuthorityError> {
        let result = self
            .roundtrip(|reply| ApiRequest::AdminStatus { recurse, timeout_secs, reply })
            .await?;
        Ok(result?)
    }
}

pub struct AuthorityService {
    peer: Arc<Peer>,
    identity: HostIdentity,
    fleet: FleetRegistry,
    lifecycle: LifecycleManager,
    inbound: mpsc::UnboundedReceiver<Envelope>,
    api: mpsc::UnboundedReceiver<ApiRequest>,
    started: i64,
}

impl AuthorityService {
    pub fn new(
        peer: Arc<Peer>,
        identity: HostIdentity,
        config: &AuthorityConfig,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> (Self, AuthorityHandle) {
        let (tx, api) = mpsc::unbounded_channel();
        let lifecycle = LifecycleManager::new(
            config.granularity_step,
            Duration::from_secs(config.command_timeout_secs),
        );
        let service = Self {
            peer,
            identity,
            fleet: FleetRegistry::new(),
            lifecycle,
            inbound,
            api,
            started: Utc::now().timestamp_millis(),
        };
        (service, AuthorityHandle { tx })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.peer
            .notify(
                cairn_protocol::bus::KEY_ALL,
                Notify::AuthorityOnline { identity: self.identity.clone() },
            )
            .await?;
        tracing::info!(hostname = %self.identity.hostname, "authority online");

        loop {
            tokio::select! {
                envelope = self.inbound.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope).await,
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

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let source = envelope.source.clone();
        let correlation = envelope.id;
        match envelope.payload {
            Payload::Cmd(Command::Ping) => {
                if let Err(e) = self.peer.ack(&source, correlation, Ack::Ping).await {
                    tracing::warn!(source = %source, error = %e, "failed to ack ping");
                }
            }
            Payload::Cmd(Command::Status) => {
                let report = self.status_report();
                if let Err(e) = self.peer.ack(&source, correlation, Ack::Status(report)).await {
                    tracing::warn!(source = %source, error = %e, "failed to ack status");
                }
            }
            Payload::Cmd(other) => {
                tracing::warn!(source = %source, ?other, "dropping unsupported command");
            }
            Payload::Notify(Notify::InstrumenterOnline(msg)) => {
                let hostname = msg.identity.hostname.clone();
                let action = self.fleet.record_instrumenter_online(&source, &msg);
                tracing::info!(
                    hostname = %hostname,
                    action = ?action,
                    "instrumenter online"
                );
                // Fresh start or restart, the node's in-memory state must
                // converge back to ours. With no bindings this is a no-op.
                self.lifecycle.reenable_instrumenter(&hostname, &source, &self.peer);
            }
            Payload::Notify(Notify::AggregatorOnline(msg)) => {
                let hostname = msg.identity.hostname.clone();
                let action = self.fleet.record_aggregator_online(&source, &msg);
                tracing::info!(hostname = %hostname, action = ?action, "aggregator online");
                self.lifecycle.reenable_aggregator(&hostname, &source, &self.peer);
            }
            Payload::Notify(Notify::AuthorityOnline { .. }) => {
                // Our own broadcast, or a peer authority; nothing to do.
            }
            Payload::Notify(Notify::Log { hostname, time, message }) => {
                tracing::warn!(from = %hostname, time, "{message}");
            }
            Payload::Notify(Notify::InstrumenterError { hostname, id, status, error }) => {
                if self.fleet.instrumenter(&hostname).is_none() {
                    tracing::warn!(
                        hostname = %hostname,
                        "dropping instrumenter error from unknown host"
                    );
                    return;
                }
                tracing::warn!(%id, hostname = %hostname, ?status, %error, "instrumenter error");
            }
            Payload::Ack(_) => self.peer.resolve_ack(envelope),
            Payload::Data(_) => {
                tracing::warn!(source = %source, "dropping stray data message");
            }
        }
    }

    fn handle_api(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::Create { scope, request, reply } => {
                let result =
                    self.lifecycle.create(scope, &request, &mut self.fleet, &self.peer);
                let _ = reply.send(result);
            }
            ApiRequest::Destroy { id, reply } => {
                let removed = self.lifecycle.destroy(&id, &mut self.fleet, &self.peer);
                let _ = reply.send(removed.is_some());
            }
            ApiRequest::Get { id, reply } => {
                let _ = reply.send(self.lifecycle.get(&id).cloned());
            }
            ApiRequest::List { scope, reply } => {
                let _ = reply.send(self.lifecycle.list(scope.as_ref()));
            }
            ApiRequest::SetProperties { id, changes, reply } => {
                let _ = reply.send(self.lifecycle.set_properties(&id, &changes));
            }
            ApiRequest::Catalog { reply } => {
                let value =
                    serde_json::to_value(self.fleet.catalog()).unwrap_or_default();
                let _ = reply.send(value);
            }
            ApiRequest::AdminStatus { recurse, timeout_secs, reply } => {
                if recurse
                    && !(STATUS_TIMEOUT_MIN_SECS..=STATUS_TIMEOUT_MAX_SECS)
                        .contains(&timeout_secs)
                {
                    let _ = reply.send(Err(ValidationError::BadTimeout {
                        min: STATUS_TIMEOUT_MIN_SECS,
                        max: STATUS_TIMEOUT_MAX_SECS,
                    }));
                    return;
                }

                let start = Utc::now().timestamp_millis();
                let mut snapshot = self.status_snapshot();
                if !recurse {
                    snapshot.request_latency_ms = Utc::now().timestamp_millis() - start;
                    let _ = reply.send(Ok(snapshot));
                    return;
                }

                // The fan-out happens off the service loop so slow nodes
                // never stall command handling; it only needs the peer
                // and the already-taken snapshot.
                let targets: Vec<(NodeSection, String, String)> = self
                    .fleet
                    .instrumenters()
                    .map(|r| {
                        (NodeSection::Instrumenters, r.hostname.clone(), r.routekey.clone())
                    })
                    .chain(self.fleet.aggregators().map(|r| {
                        (NodeSection::Aggregators, r.hostname.clone(), r.routekey.clone())
                    }))
                    .collect();
                let peer = self.peer.clone();
                let timeout = Duration::from_secs(timeout_secs);
                tokio::spawn(async move {
                    status::fill_remote(&mut snapshot, targets, peer, timeout).await;
                    snapshot.request_latency_ms = Utc::now().timestamp_millis() - start;
                    let _ = reply.send(Ok(snapshot));
                });
            }
        }
    }

    /// The short status shape exchanged over the bus.
    fn status_report(&self) -> StatusReport {
        StatusReport {
            component: "authority".to_string(),
            instrumenters: self
                .fleet
                .instrumenters()
                .map(|r| InstrumenterSummary {
                    hostname: r.hostname.clone(),
                    nmetrics_avail: r.nmetrics_avail,
                    ninsts: r.insts.len(),
                })
                .collect(),
            aggregators: self
                .fleet
                .aggregators()
                .map(|r| AggregatorSummary {
                    hostname: r.hostname.clone(),
                    ninsts: r.insts.len(),
                })
                .collect(),
            instrumentations: Vec::new(),
        }
    }

    /// The full administrative snapshot.
    fn status_snapshot(&self) -> AdminStatus {
        let now = Utc::now().timestamp_millis();
        AdminStatus {
            component: "authority".to_string(),
            hostname: self.identity.hostname.clone(),
            started: self.started,
            uptime_ms: now - self.started,
            instrumenters: self
                .fleet
                .instrumenters()
                .map(|r| {
                    (
                        r.hostname.clone(),
                        InstrumenterEntry {
                            hostname: r.hostname.clone(),
                            routekey: r.routekey.clone(),
                            nmetrics_avail: r.nmetrics_avail,
                            ninsts: r.insts.len(),
                            insts: r.insts.iter().map(|id| id.to_string()).collect(),
                            last_online: r.last_online,
                        },
                    )
                })
                .collect(),
            aggregators: self
                .fleet
                .aggregators()
                .map(|r| {
                    (
                        r.hostname.clone(),
                        AggregatorEntry {
                            hostname: r.hostname.clone(),
                            routekey: r.routekey.clone(),
                            http_port: r.http_port,
                            transformations: r.transformations.clone(),
                            ninsts: r.insts.len(),
                            insts: r.insts.iter().map(|id| id.to_string()).collect(),
                            last_online: r.last_online,
                        },
                    )
                })
                .collect(),
            transformations: self.fleet.transformations().clone(),
            instrumentations: self
                .lifecycle
                .iter()
                .map(|inst| (inst.id.to_string(), inst.clone()))
                .collect(),
            scopes: self
                .lifecycle
                .scopes()
                .iter()
                .map(|(scope, ids)| (scope.to_string(), ids.iter().copied().collect()))
                .collect(),
            remote_instrumenters: None,
            remote_aggregators: None,
            request_latency_ms: 0,
        }
    }
}
