//! Administrative status: a synchronous registry snapshot, optionally
//! extended with one status sub-request per known node. Each
//! sub-request carries its own deadline, so one unresponsive node never
//! delays or poisons the others; its slot resolves to a timed-out
//! marker instead.

use crate::lifecycle::Instrumentation;
use cairn_protocol::message::{Ack, Command, StatusReport};
use cairn_protocol::Peer;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

pub const STATUS_TIMEOUT_MIN_SECS: u64 = 1;
pub const STATUS_TIMEOUT_MAX_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct InstrumenterEntry {
    pub hostname: String,
    pub routekey: String,
    pub nmetrics_avail: usize,
    pub ninsts: usize,
    pub insts: Vec<String>,
    pub last_online: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorEntry {
    pub hostname: String,
    pub routekey: String,
    pub http_port: u16,
    pub transformations: BTreeMap<String, String>,
    pub ninsts: usize,
    pub insts: Vec<String>,
    pub last_online: i64,
}

/// One remote node's contribution to a recursive status: either its
/// report or the error that took its place.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RemoteStatus {
    Report(StatusReport),
    Error { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminStatus {
    pub component: String,
    pub hostname: String,
    pub started: i64,
    pub uptime_ms: i64,
    pub instrumenters: BTreeMap<String, InstrumenterEntry>,
    pub aggregators: BTreeMap<String, AggregatorEntry>,
    /// Every transformation any aggregator has ever advertised.
    pub transformations: BTreeMap<String, String>,
    pub instrumentations: BTreeMap<String, Instrumentation>,
    pub scopes: BTreeMap<String, Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_instrumenters: Option<BTreeMap<String, RemoteStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_aggregators: Option<BTreeMap<String, RemoteStatus>>,
    pub request_latency_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSection {
    Instrumenters,
    Aggregators,
}

/// Fans one status sub-request out to every listed node and fills the
/// remote sections of `status`. Every slot starts as timed-out and is
/// overwritten when (and only when) its node answers in time, so the
/// whole call terminates within the timeout no matter how many nodes
/// stay silent.
pub async fn fill_remote(
    status: &mut AdminStatus,
    targets: Vec<(NodeSection, String, String)>,
    peer: Arc<Peer>,
    timeout: Duration,
) {
    let mut remote_instrumenters = BTreeMap::new();
    let mut remote_aggregators = BTreeMap::new();
    for (section, hostname, _) in &targets {
        let slot = RemoteStatus::Error { error: "timed out".to_string() };
        match section {
            NodeSection::Instrumenters => remote_instrumenters.insert(hostname.clone(), slot),
            NodeSection::Aggregators => remote_aggregators.insert(hostname.clone(), slot),
        };
    }

    let mut subrequests = JoinSet::new();
    for (section, hostname, routekey) in targets {
        let peer = peer.clone();
        subrequests.spawn(async move {
            let outcome = match peer.command(&routekey, Command::Status, timeout).await {
                Ok(Ack::Status(report)) => RemoteStatus::Report(report),
                Ok(_) => RemoteStatus::Error { error: "unexpected ack".to_string() },
                Err(cairn_protocol::ProtocolError::Timeout) => {
                    RemoteStatus::Error { error: "timed out".to_string() }
                }
                Err(e) => RemoteStatus::Error { error: e.to_string() },
            };
            (section, hostname, outcome)
        });
    }

    while let Some(joined) = subrequests.join_next().await {
        let Ok((section, hostname, outcome)) = joined else {
            continue;
        };
        match section {
            NodeSection::Instrumenters => remote_instrumenters.insert(hostname, outcome),
            NodeSection::Aggregators => remote_aggregators.insert(hostname, outcome),
        };
    }

    status.remote_instrumenters = Some(remote_instrumenters);
    status.remote_aggregators = Some(remote_aggregators);
}
