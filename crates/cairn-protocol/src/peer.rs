//! Request/reply bookkeeping on top of the bus. A `Peer` owns the
//! pending-response table for one node: entries keyed by correlation id,
//! resolved exactly once by either a matching ack or the deadline.

use crate::bus::Bus;
use crate::error::ProtocolError;
use crate::message::{Ack, Command, DataMessage, Envelope, Notify, Payload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub struct Peer {
    bus: Arc<dyn Bus>,
    source: String,
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    next_id: AtomicU64,
}

impl Peer {
    pub fn new(bus: Arc<dyn Bus>, source: String) -> Arc<Self> {
        Arc::new(Self {
            bus,
            source,
            pending: Mutex::new(HashMap::new()),
            // 0 is reserved for fire-and-forget messages.
            next_id: AtomicU64::new(1),
        })
    }

    /// This node's own routing key, used as the source of every message
    /// it sends and as the reply address by its peers.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fire-and-forget notification. No pending entry, correlation id 0.
    pub async fn notify(&self, key: &str, notify: Notify) -> Result<(), ProtocolError> {
        self.bus
            .send(
                key,
                Envelope {
                    source: self.source.clone(),
                    id: 0,
                    payload: Payload::Notify(notify),
                },
            )
            .await
    }

    /// Emits one data message toward an aggregator.
    pub async fn data(&self, key: &str, data: DataMessage) -> Result<(), ProtocolError> {
        self.bus
            .send(
                key,
                Envelope {
                    source: self.source.clone(),
                    id: 0,
                    payload: Payload::Data(data),
                },
            )
            .await
    }

    /// Sends a command and waits for its ack or the deadline, whichever
    /// comes first. On expiry the pending entry is removed so a late ack
    /// finds nothing and is dropped by [`Peer::resolve_ack`].
    pub async fn command(
        &self,
        key: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<Ack, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let sent = self
            .bus
            .send(
                key,
                Envelope {
                    source: self.source.clone(),
                    id,
                    payload: Payload::Cmd(command),
                },
            )
            .await;
        if let Err(e) = sent {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ProtocolError::Closed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Routes an inbound ack to its pending command. `HashMap::remove`
    /// is the exactly-once guard: if the deadline got there first the
    /// entry is gone and the ack is discarded.
    pub fn resolve_ack(&self, envelope: Envelope) {
        let Payload::Ack(ack) = envelope.payload else {
            return;
        };
        match self.pending.lock().unwrap().remove(&envelope.id) {
            Some(tx) => {
                // A receiver dropped between timeout and removal is fine.
                let _ = tx.send(ack);
            }
            None => {
                tracing::debug!(
                    id = envelope.id,
                    source = %envelope.source,
                    "discarding ack with no pending command"
                );
            }
        }
    }

    /// Replies to a command, echoing its correlation id.
    pub async fn ack(&self, key: &str, correlation: u64, ack: Ack) -> Result<(), ProtocolError> {
        self.bus
            .send(
                key,
                Envelope {
                    source: self.source.clone(),
                    id: correlation,
                    payload: Payload::Ack(ack),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{key_authority, key_instrumenter, LocalBus};
    use std::time::Instant;

    #[tokio::test]
    async fn command_resolves_on_matching_ack() {
        let bus = Arc::new(LocalBus::new());
        let mut responder_rx = bus.attach(&[key_instrumenter("a")]);
        let peer = Peer::new(bus.clone(), key_authority());

        let responder_bus = bus.clone();
        tokio::spawn(async move {
            let env = responder_rx.recv().await.unwrap();
            responder_bus
                .send(
                    &env.source.clone(),
                    Envelope {
                        source: key_instrumenter("a"),
                        id: env.id,
                        payload: Payload::Ack(Ack::Ping),
                    },
                )
                .await
                .unwrap();
        });

        let mut own_rx = bus.attach(&[key_authority()]);
        let peer2 = peer.clone();
        tokio::spawn(async move {
            while let Some(env) = own_rx.recv().await {
                peer2.resolve_ack(env);
            }
        });

        let ack = peer
            .command(&key_instrumenter("a"), Command::Ping, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(ack, Ack::Ping);
    }

    #[tokio::test]
    async fn command_times_out_when_nobody_replies() {
        let bus = Arc::new(LocalBus::new());
        let peer = Peer::new(bus, key_authority());

        let start = Instant::now();
        let err = peer
            .command(
                &key_instrumenter("silent"),
                Command::Ping,
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn late_ack_is_discarded_without_effect() {
        let bus = Arc::new(LocalBus::new());
        let peer = Peer::new(bus, key_authority());

        let err = peer
            .command(
                &key_instrumenter("slow"),
                Command::Ping,
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));

        // The ack shows up after the deadline already resolved the slot.
        peer.resolve_ack(Envelope {
            source: key_instrumenter("slow"),
            id: 1,
            payload: Payload::Ack(Ack::Ping),
        });
        assert!(peer.pending.lock().unwrap().is_empty());
    }
}
