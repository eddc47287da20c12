use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Ownership scope of an instrumentation: fleet-wide or one customer's.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Global,
    Customer(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Customer(id) => write!(f, "cust:{id}"),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Scope::Global);
        }
        match s.strip_prefix("cust:") {
            Some(id) if !id.is_empty() => Ok(Scope::Customer(id.to_string())),
            _ => Err(format!("unknown scope: {s}")),
        }
    }
}

/// Qualified instrumentation identifier, rendered `global;7` or
/// `cust:<id>;7`. Unique for the life of the authority process and never
/// reused while any node still references it.
///
/// # Examples
///
/// ```
/// use cairn_common::types::{FqId, Scope};
///
/// let id = FqId::new(Scope::Customer("acme".into()), 3);
/// assert_eq!(id.to_string(), "cust:acme;3");
/// assert_eq!(id, "cust:acme;3".parse().unwrap());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FqId {
    pub scope: Scope,
    pub instid: u32,
}

impl FqId {
    pub fn new(scope: Scope, instid: u32) -> Self {
        Self { scope, instid }
    }
}

impl fmt::Display for FqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.scope, self.instid)
    }
}

impl From<FqId> for String {
    fn from(id: FqId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for FqId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl FromStr for FqId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scope, instid) = s
            .rsplit_once(';')
            .ok_or_else(|| format!("malformed qualified id: {s}"))?;
        let instid: u32 = instid
            .parse()
            .map_err(|_| format!("malformed qualified id: {s}"))?;
        Ok(FqId::new(scope.parse()?, instid))
    }
}

/// Field value type. The arity derived from it decides which predicate
/// operators and decomposition positions a field supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Time,
}

impl FieldType {
    pub fn arity(self) -> FieldArity {
        match self {
            FieldType::String => FieldArity::Discrete,
            FieldType::Number | FieldType::Time => FieldArity::Numeric,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldArity {
    Discrete,
    Numeric,
}

/// Scalar unit of a metric's base value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Ops,
    Size,
    Throughput,
    Time,
    Percent,
}

/// One concrete field value carried by a data point.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Num(i64),
    Str(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Num(n) => write!(f, "{n}"),
            FieldValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Num(n)
    }
}

/// One histogram bucket: inclusive `[lo, hi]` range plus accumulated
/// weight, serialized `[[lo, hi], weight]`.
pub type Bucket = ((i64, i64), i64);

/// A computed metric value: a plain scalar, a nested mapping produced by
/// discrete decomposition, or an ordered bucket list produced by numeric
/// decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(i64),
    Distribution(Vec<Bucket>),
    Map(BTreeMap<String, MetricValue>),
}

/// Validated instrumentation properties as owned by the authority and
/// pushed (by copy) to the serving nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstnProperties {
    pub module: String,
    pub stat: String,
    /// Structural boolean expression tree; `{}` means "match everything".
    pub predicate: serde_json::Value,
    pub decomposition: Vec<String>,
    /// Reporting granularity in seconds.
    pub granularity: u64,
    /// How long the aggregator keeps values, in seconds.
    #[serde(rename = "retention-time")]
    pub retention_time: u64,
    /// Seconds of client inactivity after which collection may stop.
    #[serde(rename = "idle-max")]
    pub idle_max: u64,
    #[serde(rename = "persist-data")]
    pub persist_data: bool,
    pub enabled: bool,
    /// Creation time, milliseconds since the epoch.
    pub crtime: i64,
}

// ---- capability catalog declarations ----

/// Field declaration advertised by an instrumenter for one stat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub ftype: FieldType,
}

/// Stat declaration: one metric within a module's namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatDecl {
    pub name: String,
    pub label: String,
    pub unit: UnitType,
    pub fields: Vec<FieldDecl>,
}

/// Module declaration: a family of stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDecl {
    pub name: String,
    pub label: String,
    pub stats: Vec<StatDecl>,
}

/// Identity fields every node reports when announcing itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub agent_name: String,
    pub agent_version: String,
    pub os_name: String,
    pub os_release: String,
    pub os_revision: String,
}

/// Payload of the `instrumenter_online` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumenterOnline {
    pub identity: HostIdentity,
    pub modules: Vec<ModuleDecl>,
}

/// Payload of the `aggregator_online` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorOnline {
    pub identity: HostIdentity,
    /// Port on which the aggregator serves raw value reads over HTTP.
    pub http_port: u16,
    /// Advertised value transformations, name to human label.
    pub transformations: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqid_round_trips_through_display_and_parse() {
        let global = FqId::new(Scope::Global, 17);
        assert_eq!(global.to_string(), "global;17");
        assert_eq!(global, "global;17".parse().unwrap());

        let cust = FqId::new(Scope::Customer("acme".into()), 3);
        assert_eq!(cust.to_string(), "cust:acme;3");
        assert_eq!(cust, "cust:acme;3".parse().unwrap());
    }

    #[test]
    fn fqid_rejects_garbage() {
        assert!("".parse::<FqId>().is_err());
        assert!("global".parse::<FqId>().is_err());
        assert!("global;x".parse::<FqId>().is_err());
        assert!("cust:;1".parse::<FqId>().is_err());
        assert!("other:a;1".parse::<FqId>().is_err());
    }

    #[test]
    fn fqid_serializes_as_string() {
        let id = FqId::new(Scope::Global, 2);
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("global;2"));
        let back: FqId = serde_json::from_value(serde_json::json!("global;2")).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn field_arity_follows_type() {
        assert_eq!(FieldType::String.arity(), FieldArity::Discrete);
        assert_eq!(FieldType::Number.arity(), FieldArity::Numeric);
        assert_eq!(FieldType::Time.arity(), FieldArity::Numeric);
    }

    #[test]
    fn metric_value_shapes_serialize_distinctly() {
        let scalar = MetricValue::Scalar(10);
        assert_eq!(serde_json::to_value(&scalar).unwrap(), serde_json::json!(10));

        let dist = MetricValue::Distribution(vec![((0, 9), 2), ((10, 19), 1)]);
        assert_eq!(
            serde_json::to_value(&dist).unwrap(),
            serde_json::json!([[[0, 9], 2], [[10, 19], 1]])
        );

        let mut map = BTreeMap::new();
        map.insert("read".to_string(), MetricValue::Scalar(5));
        let value = MetricValue::Map(map);
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            serde_json::json!({"read": 5})
        );

        // Untagged round trips pick the right shape back.
        let back: MetricValue = serde_json::from_value(serde_json::json!([])).unwrap();
        assert_eq!(back, MetricValue::Distribution(vec![]));
        let back: MetricValue = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(back, MetricValue::Map(BTreeMap::new()));
    }
}
