//! The instrumenter's event loop: announce capabilities, answer
//! commands, tick the runtime once a second.

use crate::runtime::Runtime;
use cairn_common::types::{HostIdentity, InstrumenterOnline};
use cairn_protocol::bus::key_authority;
use cairn_protocol::message::{Ack, Command, Envelope, Notify, Payload, StatusReport};
use cairn_protocol::{EnableStatus, Peer};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

pub struct InstrumenterService {
    peer: Arc<Peer>,
    runtime: Runtime,
    identity: HostIdentity,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl InstrumenterService {
    pub fn new(
        peer: Arc<Peer>,
        runtime: Runtime,
        identity: HostIdentity,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self { peer, runtime, identity, inbound }
    }

    /// Runs until the inbound channel closes. The loop owns all mutable
    /// state; handlers never block beyond channel writes.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.announce().await?;

        let mut tick = interval(Duration::from_secs(1));
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
                _ = tick.tick() => {
                    self.runtime.tick(&self.peer).await;
                }
            }
        }
    }

    /// Sends the online notification carrying this node's capability
    /// catalog. Safe to deliver more than once: the authority merges.
    async fn announce(&self) -> anyhow::Result<()> {
        let online = InstrumenterOnline {
            identity: self.identity.clone(),
            modules: self.runtime.registry().catalog(),
        };
        self.peer
            .notify(&key_authority(), Notify::InstrumenterOnline(online))
            .await?;
        tracing::info!(hostname = %self.identity.hostname, "instrumenter online");
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
                    component: "instrumenter".to_string(),
                    instrumentations: self.runtime.status(),
                    ..StatusReport::default()
                };
                self.reply(&source, correlation, Ack::Status(report)).await;
            }
            Payload::Cmd(Command::EnableInstrumentation(req)) => {
                let id = req.id.clone();
                let ack = match self.runtime.enable(&req) {
                    Ok(()) => Ack::EnableInstrumentation {
                        id,
                        status: EnableStatus::Enabled,
                        error: None,
                    },
                    Err(error) => {
                        tracing::warn!(id = %req.id, %error, "enable failed");
                        Ack::EnableInstrumentation {
                            id,
                            status: EnableStatus::EnableFailed,
                            error: Some(error),
                        }
                    }
                };
                self.reply(&source, correlation, ack).await;
            }
            Payload::Cmd(Command::DisableInstrumentation { id }) => {
                let ack = match self.runtime.disable(&id) {
                    Ok(()) => Ack::DisableInstrumentation {
                        id,
                        status: EnableStatus::Disabled,
                        error: None,
                    },
                    Err(error) => {
                        tracing::warn!(%id, %error, "disable failed");
                        Ack::DisableInstrumentation {
                            id,
                            status: EnableStatus::DisableFailed,
                            error: Some(error),
                        }
                    }
                };
                self.reply(&source, correlation, ack).await;
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
            Payload::Notify(_) | Payload::Data(_) => {
                tracing::warn!(source = %source, "dropping unexpected message");
            }
        }
    }

    async fn reply(&self, source: &str, correlation: u64, ack: Ack) {
        if let Err(e) = self.peer.ack(source, correlation, ack).await {
            tracing::warn!(source = %source, error = %e, "failed to send ack");
        }
    }
}
