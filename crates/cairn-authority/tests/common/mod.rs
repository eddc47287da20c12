//! Shared harness: boots an authority plus a configurable set of
//! instrumenter and aggregator services over one in-process bus.

// Each integration test binary compiles its own copy of this module and
// uses a different subset of it.
#![allow(dead_code)]

use cairn_aggregator::{AggregatorHandle, AggregatorService, SeriesStore};
use cairn_authority::{AuthorityConfig, AuthorityHandle, AuthorityService};
use cairn_common::types::HostIdentity;
use cairn_engine::MetricRegistry;
use cairn_instrumenter::{backends, InstrumenterService, Runtime};
use cairn_protocol::bus::{key_aggregator, key_authority, key_instrumenter, LocalBus, KEY_ALL};
use cairn_protocol::Peer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct TestFleet {
    pub bus: Arc<LocalBus>,
    pub authority: AuthorityHandle,
    pub aggregators: Vec<AggregatorHandle>,
    pub tasks: Vec<JoinHandle<()>>,
}

pub fn identity(agent_name: &str, hostname: &str) -> HostIdentity {
    HostIdentity {
        hostname: hostname.to_string(),
        agent_name: agent_name.to_string(),
        agent_version: "0.3.0".to_string(),
        os_name: "linux".to_string(),
        os_release: "6.1".to_string(),
        os_revision: "generic".to_string(),
    }
}

pub fn start_authority(bus: &Arc<LocalBus>) -> (AuthorityHandle, JoinHandle<()>) {
    let inbound = bus.attach(&[key_authority(), KEY_ALL.to_string()]);
    let peer = Peer::new(bus.clone(), key_authority());
    let config = AuthorityConfig {
        command_timeout_secs: 2,
        ..AuthorityConfig::default()
    };
    let (service, handle) =
        AuthorityService::new(peer, identity("authority", "auth01"), &config, inbound);
    let task = tokio::spawn(async move {
        let _ = service.run().await;
    });
    (handle, task)
}

/// Starts an instrumenter carrying only the synthetic backend, so tests
/// never touch real system counters.
pub fn start_instrumenter(bus: &Arc<LocalBus>, hostname: &str) -> JoinHandle<()> {
    let own_key = key_instrumenter(hostname);
    let inbound = bus.attach(&[own_key.clone(), KEY_ALL.to_string()]);
    let peer = Peer::new(bus.clone(), own_key);
    let mut registry = MetricRegistry::new();
    backends::synthetic::register(&mut registry, hostname).unwrap();
    let service = InstrumenterService::new(
        peer,
        Runtime::new(registry),
        identity("instrumenter", hostname),
        inbound,
    );
    tokio::spawn(async move {
        let _ = service.run().await;
    })
}

pub fn start_aggregator(
    bus: &Arc<LocalBus>,
    hostname: &str,
) -> (AggregatorHandle, JoinHandle<()>) {
    let own_key = key_aggregator(hostname);
    let inbound = bus.attach(&[own_key.clone(), KEY_ALL.to_string()]);
    let peer = Peer::new(bus.clone(), own_key);
    let (service, handle) = AggregatorService::new(
        peer,
        SeriesStore::new(),
        identity("aggregator", hostname),
        7751,
        inbound,
    );
    let task = tokio::spawn(async move {
        let _ = service.run().await;
    });
    (handle, task)
}

/// Boots a fleet and waits until the authority has seen every node.
pub async fn start_fleet(n_instrumenters: usize, n_aggregators: usize) -> TestFleet {
    let bus = Arc::new(LocalBus::new());
    let mut tasks = Vec::new();

    let (authority, task) = start_authority(&bus);
    tasks.push(task);
    for i in 0..n_instrumenters {
        tasks.push(start_instrumenter(&bus, &format!("ins{i:02}")));
    }
    let mut aggregators = Vec::new();
    for i in 0..n_aggregators {
        let (handle, task) = start_aggregator(&bus, &format!("agg{i:02}"));
        aggregators.push(handle);
        tasks.push(task);
    }

    wait_for_fleet(&authority, n_instrumenters, n_aggregators).await;
    TestFleet { bus, authority, aggregators, tasks }
}

/// Polls the registry snapshot until the expected node counts appear.
pub async fn wait_for_fleet(
    authority: &AuthorityHandle,
    n_instrumenters: usize,
    n_aggregators: usize,
) {
    for _ in 0..100 {
        let status = authority.admin_status(false, 5).await.unwrap();
        if status.instrumenters.len() >= n_instrumenters
            && status.aggregators.len() >= n_aggregators
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("fleet did not come online in time");
}
