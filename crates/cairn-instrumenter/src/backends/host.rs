//! Host metric backend built on the `sysinfo` crate: CPU, disk and
//! network counter sources exposed through the snapshot-delta engine.
//!
//! Each metric description names the source items it reads, the fields
//! available for predicates and decompositions, and an extract function
//! producing the base value for one field assignment.

use cairn_common::types::{FieldType, FieldValue, UnitType};
use cairn_engine::{
    Bucketizer, ConfigError, CounterSource, ExtractFn, FieldSpec, ImplField, MetricDecl,
    MetricRegistry, Snapshot, SnapshotMetric, SourceItem,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use sysinfo::{Disks, Networks, System};

fn snaptime_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

// ---- sources ----

struct CpuSource {
    system: System,
}

impl CpuSource {
    fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self { system }
    }
}

impl CounterSource for CpuSource {
    fn read(&mut self) -> anyhow::Result<Snapshot> {
        self.system.refresh_cpu_all();
        let now = snaptime_ns();
        let mut snapshot = Snapshot::new();
        for (i, cpu) in self.system.cpus().iter().enumerate() {
            let name = format!("cpu{i}");
            let mut counters = BTreeMap::new();
            counters.insert("usage".to_string(), cpu.cpu_usage() as i64);
            snapshot.insert(name.clone(), SourceItem { name, snaptime: now, counters });
        }
        Ok(snapshot)
    }
}

struct DiskSource {
    disks: Disks,
}

impl DiskSource {
    fn new() -> Self {
        Self { disks: Disks::new_with_refreshed_list() }
    }
}

impl CounterSource for DiskSource {
    fn read(&mut self) -> anyhow::Result<Snapshot> {
        self.disks.refresh(true);
        let now = snaptime_ns();
        let mut snapshot = Snapshot::new();
        for disk in self.disks.list() {
            let name = disk.name().to_string_lossy().to_string();
            let usage = disk.usage();
            let mut counters = BTreeMap::new();
            counters.insert("nread".to_string(), usage.total_read_bytes as i64);
            counters.insert("nwritten".to_string(), usage.total_written_bytes as i64);
            snapshot.insert(name.clone(), SourceItem { name, snaptime: now, counters });
        }
        Ok(snapshot)
    }
}

struct NetSource {
    networks: Networks,
}

impl NetSource {
    fn new() -> Self {
        Self { networks: Networks::new_with_refreshed_list() }
    }
}

impl CounterSource for NetSource {
    fn read(&mut self) -> anyhow::Result<Snapshot> {
        self.networks.refresh(true);
        let now = snaptime_ns();
        let mut snapshot = Snapshot::new();
        for (name, data) in self.networks.iter() {
            let mut counters = BTreeMap::new();
            counters.insert("rbytes".to_string(), data.total_received() as i64);
            counters.insert("obytes".to_string(), data.total_transmitted() as i64);
            snapshot.insert(
                name.clone(),
                SourceItem { name: name.clone(), snaptime: now, counters },
            );
        }
        Ok(snapshot)
    }
}

// ---- field helpers ----

fn hostname_field(hostname: &str) -> FieldSpec {
    let hostname = hostname.to_string();
    FieldSpec {
        label: "server host name".to_string(),
        ftype: FieldType::String,
        values: Arc::new(move |_, _, _| vec![FieldValue::Str(hostname.clone())]),
        bucketize: None,
    }
}

fn item_name_field(label: &str) -> FieldSpec {
    FieldSpec {
        label: label.to_string(),
        ftype: FieldType::String,
        values: Arc::new(|cur, _, _| vec![FieldValue::Str(cur.name.clone())]),
        bucketize: None,
    }
}

fn impl_fields(specs: &BTreeMap<String, FieldSpec>) -> BTreeMap<String, ImplField> {
    specs
        .iter()
        .map(|(name, spec)| {
            (
                name.clone(),
                ImplField {
                    label: spec.label.clone(),
                    ftype: spec.ftype,
                    bucketize: spec.bucketize.clone(),
                },
            )
        })
        .collect()
}

/// Registers one snapshot-engine metric whose source is built fresh per
/// instrumentation.
fn register_snapshot_metric<F>(
    registry: &mut MetricRegistry,
    module: &str,
    stat: &str,
    label: &str,
    unit: UnitType,
    cost: u32,
    specs: BTreeMap<String, FieldSpec>,
    extract: ExtractFn,
    make_source: F,
) -> Result<(), ConfigError>
where
    F: Fn() -> Box<dyn CounterSource> + Send + Sync + 'static,
{
    let fields = impl_fields(&specs);
    registry.register_metric(MetricDecl {
        module: module.to_string(),
        stat: stat.to_string(),
        label: label.to_string(),
        unit,
        cost,
        fields,
        factory: Arc::new(move |request| {
            let plan =
                cairn_engine::DecompositionPlan::new(&request.decomposition, &specs)?;
            Ok(Box::new(SnapshotMetric::new(
                make_source(),
                specs.clone(),
                extract.clone(),
                request.predicate.clone(),
                plan,
            )))
        }),
    })
}

pub fn register(registry: &mut MetricRegistry, hostname: &str) -> Result<(), ConfigError> {
    registry.register_module("cpu", "CPU")?;
    registry.register_module("disk", "Disk I/O")?;
    registry.register_module("nic", "Network interfaces")?;

    // cpu.cpus: one unit per CPU, decomposable by core and utilization.
    let specs = BTreeMap::from([
        ("hostname".to_string(), hostname_field(hostname)),
        ("cpu".to_string(), item_name_field("CPU identifier")),
        (
            "utilization".to_string(),
            FieldSpec {
                label: "utilization".to_string(),
                ftype: FieldType::Number,
                values: Arc::new(|cur, _, _| vec![FieldValue::Num(cur.counter("usage"))]),
                bucketize: Some(Bucketizer::linear(1)),
            },
        ),
    ]);
    register_snapshot_metric(
        registry,
        "cpu",
        "cpus",
        "CPUs",
        UnitType::Size,
        10,
        specs,
        Arc::new(|_, _, _, _| 1),
        || Box::new(CpuSource::new()),
    )?;

    // disk.physio_bytes: bytes transferred, decomposable by device and
    // operation type.
    let specs = BTreeMap::from([
        ("hostname".to_string(), hostname_field(hostname)),
        ("disk".to_string(), item_name_field("device name")),
        (
            "optype".to_string(),
            FieldSpec {
                label: "type".to_string(),
                ftype: FieldType::String,
                values: Arc::new(|_, _, _| vec!["read".into(), "write".into()]),
                bucketize: None,
            },
        ),
    ]);
    register_snapshot_metric(
        registry,
        "disk",
        "physio_bytes",
        "bytes transferred",
        UnitType::Throughput,
        20,
        specs,
        Arc::new(|assignment, cur, prev, _| {
            let key = match assignment.get("optype") {
                Some(FieldValue::Str(s)) if s == "read" => "nread",
                _ => "nwritten",
            };
            cur.counter(key) - prev.counter(key)
        }),
        || Box::new(DiskSource::new()),
    )?;

    // disk.disks: one unit per disk, with a bucketizable total-bytes
    // field for heatmap-style decompositions.
    let specs = BTreeMap::from([
        ("hostname".to_string(), hostname_field(hostname)),
        ("disk".to_string(), item_name_field("device name")),
        (
            "bytes".to_string(),
            FieldSpec {
                label: "total bytes transferred".to_string(),
                ftype: FieldType::Number,
                values: Arc::new(|cur, prev, _| {
                    let delta = (cur.counter("nread") + cur.counter("nwritten"))
                        - (prev.counter("nread") + prev.counter("nwritten"));
                    vec![FieldValue::Num(delta)]
                }),
                bucketize: Some(Bucketizer::log_linear(10, 2, 100)),
            },
        ),
    ]);
    register_snapshot_metric(
        registry,
        "disk",
        "disks",
        "disks",
        UnitType::Size,
        10,
        specs,
        Arc::new(|_, _, _, _| 1),
        || Box::new(DiskSource::new()),
    )?;

    // nic.bytes: network throughput, decomposable by interface and
    // direction.
    let specs = BTreeMap::from([
        ("hostname".to_string(), hostname_field(hostname)),
        ("nic".to_string(), item_name_field("NIC name")),
        (
            "direction".to_string(),
            FieldSpec {
                label: "sent/received".to_string(),
                ftype: FieldType::String,
                values: Arc::new(|_, _, _| vec!["sent".into(), "received".into()]),
                bucketize: None,
            },
        ),
    ]);
    register_snapshot_metric(
        registry,
        "nic",
        "bytes",
        "bytes sent and received",
        UnitType::Throughput,
        20,
        specs,
        Arc::new(|assignment, cur, prev, _| {
            let key = match assignment.get("direction") {
                Some(FieldValue::Str(s)) if s == "sent" => "obytes",
                _ => "rbytes",
            };
            cur.counter(key) - prev.counter(key)
        }),
        || Box::new(NetSource::new()),
    )?;

    Ok(())
}
