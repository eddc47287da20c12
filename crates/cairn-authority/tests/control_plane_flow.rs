//! End-to-end control-plane behavior over the in-process bus: values
//! flowing into the aggregator, unconditional destroy, and restart
//! reconciliation.

mod common;

use cairn_authority::status::RemoteStatus;
use cairn_authority::{AuthorityError, AuthorityHandle, CreateRequest};
use cairn_common::types::{FqId, MetricValue, Scope};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

fn request(value: serde_json::Value) -> CreateRequest {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn values_flow_from_instrumenter_to_aggregator() {
    let fleet = common::start_fleet(1, 1).await;
    let inst = fleet
        .authority
        .create(
            Scope::Global,
            request(json!({
                "module": "test_module",
                "stat": "ops1",
                "decomposition": ["optype"]
            })),
        )
        .await
        .unwrap();

    // The synthetic source advances its counters by 5 reads and 5
    // writes per tick, so every settled instant carries this value.
    let expected = MetricValue::Map(BTreeMap::from([
        ("read".to_string(), MetricValue::Scalar(5)),
        ("write".to_string(), MetricValue::Scalar(5)),
    ]));

    let aggregator = &fleet.aggregators[0];
    let mut seen = None;
    for _ in 0..100 {
        if let Some((_, value)) = aggregator.latest(inst.id.clone()).await {
            if value == expected {
                seen = Some(value);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(seen, Some(expected), "aggregator never saw a full tick value");
}

#[tokio::test]
async fn destroy_is_immediate_unconditional_and_idempotent() {
    let fleet = common::start_fleet(1, 1).await;
    let inst = fleet
        .authority
        .create(Scope::Global, request(json!({"module": "test_module", "stat": "ops1"})))
        .await
        .unwrap();

    fleet.authority.destroy(inst.id.clone()).await.unwrap();

    // Immediately after destroy returns, no read can observe the
    // record, whatever the remote disable commands are still doing.
    let result = fleet.authority.get(inst.id.clone()).await;
    assert!(matches!(result, Err(AuthorityError::NotFound(_))));
    assert!(fleet.authority.list(None).await.unwrap().is_empty());

    let result = fleet.authority.destroy(inst.id.clone()).await;
    assert!(matches!(result, Err(AuthorityError::NotFound(_))));

    // The binding disappeared from the registry snapshot too.
    let status = fleet.authority.admin_status(false, 5).await.unwrap();
    assert!(status.instrumenters["ins00"].insts.is_empty());
    assert!(status.aggregators["agg00"].insts.is_empty());
}

/// Polls recursive status until the given instrumenter's report lists
/// the instrumentation, or the attempts run out.
async fn wait_until_instrumented(
    authority: &AuthorityHandle,
    hostname: &str,
    id: &FqId,
) -> bool {
    for _ in 0..100 {
        let status = authority.admin_status(true, 2).await.unwrap();
        if let Some(remotes) = &status.remote_instrumenters {
            if let Some(RemoteStatus::Report(report)) = remotes.get(hostname) {
                if report.instrumentations.iter().any(|s| &s.id == id) {
                    return true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn restart_retains_bindings_and_reenables_each_instrumentation() {
    let bus = std::sync::Arc::new(cairn_protocol::bus::LocalBus::new());
    let (authority, _authority_task) = common::start_authority(&bus);
    let (_aggregator, _aggregator_task) = common::start_aggregator(&bus, "agg00");
    let instrumenter_task = common::start_instrumenter(&bus, "ins00");
    common::wait_for_fleet(&authority, 1, 1).await;

    let inst = authority
        .create(Scope::Global, request(json!({"module": "test_module", "stat": "ops1"})))
        .await
        .unwrap();
    assert!(
        wait_until_instrumented(&authority, "ins00", &inst.id).await,
        "instrumentation never became active"
    );

    // Kill the instrumenter and bring up a fresh process under the same
    // hostname. Its in-memory state starts empty.
    instrumenter_task.abort();
    let _restarted_task = common::start_instrumenter(&bus, "ins00");

    // The authority-side binding survives the restart...
    let status = authority.admin_status(false, 5).await.unwrap();
    assert!(status.instrumenters["ins00"]
        .insts
        .contains(&inst.id.to_string()));

    // ...and the re-sent enable command brings the new process back in
    // sync with the authority's view.
    assert!(
        wait_until_instrumented(&authority, "ins00", &inst.id).await,
        "restarted instrumenter was never re-enabled"
    );
}
