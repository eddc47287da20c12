//! The pub/sub bus seam. The core only ever needs `send(key, envelope)`
//! plus delivery of inbound envelopes for the keys a node binds; the
//! wire transport behind that seam is a deployment concern.

use crate::error::ProtocolError;
use crate::message::Envelope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Broadcast routing key every node binds in addition to its own key.
pub const KEY_ALL: &str = "cairn.all";

pub fn key_authority() -> String {
    "cairn.authority".to_string()
}

pub fn key_instrumenter(hostname: &str) -> String {
    format!("cairn.instrumenter.{hostname}")
}

pub fn key_aggregator(hostname: &str) -> String {
    format!("cairn.aggregator.{hostname}")
}

/// Outbound half of the bus. Inbound delivery is a receiver handed out
/// at attach/connect time, keyed by the bindings the node declared.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn send(&self, key: &str, envelope: Envelope) -> Result<(), ProtocolError>;
}

/// In-process exchange: direct key matching, one sender clone per
/// subscriber bound to the key. Used standalone in tests and as the
/// switching fabric inside the TCP relay.
#[derive(Default)]
pub struct LocalBus {
    bindings: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for the given routing keys and returns its
    /// inbound channel. A key may be bound by any number of subscribers;
    /// each gets its own copy of matching envelopes.
    pub fn attach(&self, keys: &[String]) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bindings = self.bindings.lock().unwrap();
        for key in keys {
            bindings.entry(key.clone()).or_default().push(tx.clone());
        }
        rx
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn send(&self, key: &str, envelope: Envelope) -> Result<(), ProtocolError> {
        let mut bindings = self.bindings.lock().unwrap();
        if let Some(subscribers) = bindings.get_mut(key) {
            // Closed receivers are pruned as we go; a send to a key with
            // no live subscriber is not an error (at-most-once, no
            // delivery guarantee at this seam).
            subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
        }
        Ok(())
    }
}
