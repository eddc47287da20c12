//! Wire shapes for the command/notify protocol. Everything is plain
//! serde over JSON; the bus does not interpret payloads.

use cairn_common::types::{
    AggregatorOnline, FqId, HostIdentity, InstrumenterOnline, MetricValue,
};
use serde::{Deserialize, Serialize};

/// One message on the bus: the sender's routing key, a correlation id
/// (0 for fire-and-forget), and the typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub id: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Cmd(Command),
    Ack(Ack),
    Notify(Notify),
    Data(DataMessage),
}

/// Request/reply commands. Every command expects a matching [`Ack`]
/// carrying the same correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum Command {
    Ping,
    Status,
    EnableInstrumentation(EnableInstrumentation),
    DisableInstrumentation {
        id: FqId,
    },
    EnableAggregation {
        id: FqId,
        granularity: u64,
        #[serde(rename = "retention-time")]
        retention_time: u64,
    },
    DisableAggregation {
        id: FqId,
    },
}

/// Description copy pushed to an instrumenter when an instrumentation
/// is bound to it. `destination` is the routing key of the aggregator
/// that should receive the data messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableInstrumentation {
    pub id: FqId,
    pub module: String,
    pub stat: String,
    pub predicate: serde_json::Value,
    pub decomposition: Vec<String>,
    pub destination: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnableStatus {
    Enabled,
    EnableFailed,
    Disabled,
    DisableFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum Ack {
    Ping,
    Status(StatusReport),
    EnableInstrumentation {
        id: FqId,
        status: EnableStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DisableInstrumentation {
        id: FqId,
        status: EnableStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    EnableAggregation {
        id: FqId,
        status: EnableStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DisableAggregation {
        id: FqId,
        status: EnableStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Status ack body. Each component fills the sections it has; the rest
/// stay empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub component: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instrumenters: Vec<InstrumenterSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregators: Vec<AggregatorSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instrumentations: Vec<InstrumentationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumenterSummary {
    pub hostname: String,
    pub nmetrics_avail: usize,
    pub ninsts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSummary {
    pub hostname: String,
    pub ninsts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationSummary {
    pub id: FqId,
    pub module: String,
    pub stat: String,
    /// Milliseconds since the epoch when the binding became active.
    pub since: i64,
}

/// Fire-and-forget notifications. Duplicate delivery must be harmless;
/// every consumer treats these as idempotent merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum Notify {
    AuthorityOnline { identity: HostIdentity },
    InstrumenterOnline(InstrumenterOnline),
    AggregatorOnline(AggregatorOnline),
    Log { hostname: String, time: i64, message: String },
    InstrumenterError { hostname: String, id: FqId, status: EnableStatus, error: String },
}

/// One tick's computed value for one instrumentation, addressed to its
/// aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub id: FqId,
    pub value: MetricValue,
    /// Milliseconds since the epoch at which the value was computed.
    pub time: i64,
}
