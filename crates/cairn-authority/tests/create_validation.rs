//! Creation-time validation, defaulting, and property mutation against
//! a live fleet.

mod common;

use cairn_authority::{AuthorityError, CreateRequest, ValidationError};
use cairn_common::types::{FqId, Scope};
use chrono::Utc;
use serde_json::json;

fn request(value: serde_json::Value) -> CreateRequest {
    serde_json::from_value(value).unwrap()
}

fn assert_invalid(result: Result<impl std::fmt::Debug, AuthorityError>, name: &str) {
    match result {
        Err(AuthorityError::Invalid(_)) => {}
        other => panic!("case \"{name}\": expected validation error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_applies_documented_defaults() {
    let fleet = common::start_fleet(1, 1).await;
    let start = Utc::now().timestamp_millis();

    let inst = fleet
        .authority
        .create(Scope::Global, request(json!({"module": "test_module", "stat": "ops1"})))
        .await
        .unwrap();

    assert_eq!(inst.id, FqId::new(Scope::Global, 1));
    assert_eq!(inst.properties.granularity, 1);
    assert_eq!(inst.properties.retention_time, 600);
    assert_eq!(inst.properties.idle_max, 3600);
    assert!(!inst.properties.persist_data);
    assert!(inst.properties.enabled);
    assert!(inst.properties.decomposition.is_empty());
    assert_eq!(inst.properties.predicate, json!({}));
    assert!(inst.properties.crtime >= start);
    assert!(inst.properties.crtime <= Utc::now().timestamp_millis());
    assert_eq!(inst.instrumenter, "ins00");
    assert_eq!(inst.aggregator, "agg00");
}

#[tokio::test]
async fn granularity_strings_truncate_to_integers() {
    let fleet = common::start_fleet(1, 1).await;

    let inst = fleet
        .authority
        .create(
            Scope::Global,
            request(json!({"module": "test_module", "stat": "ops1", "granularity": "10.5"})),
        )
        .await
        .unwrap();
    assert_eq!(inst.properties.granularity, 10);

    let inst = fleet
        .authority
        .create(
            Scope::Global,
            request(json!({
                "module": "test_module",
                "stat": "ops1",
                "granularity": "10",
                "retention-time": 3601
            })),
        )
        .await
        .unwrap();
    assert_eq!(inst.properties.granularity, 10);
    assert_eq!(inst.properties.retention_time, 3601);
}

#[tokio::test]
async fn ids_are_unique_for_the_life_of_the_process() {
    let fleet = common::start_fleet(1, 1).await;
    let simple = json!({"module": "test_module", "stat": "ops1"});

    let first = fleet
        .authority
        .create(Scope::Global, request(simple.clone()))
        .await
        .unwrap();
    fleet.authority.destroy(first.id.clone()).await.unwrap();

    let second = fleet
        .authority
        .create(Scope::Global, request(simple.clone()))
        .await
        .unwrap();
    assert_ne!(first.id, second.id, "destroyed ids must never be reused");

    // Scopes get their own id sequences.
    let scoped = fleet
        .authority
        .create(Scope::Customer("acme".to_string()), request(simple))
        .await
        .unwrap();
    assert_eq!(scoped.id.scope, Scope::Customer("acme".to_string()));
    assert_eq!(scoped.id.instid, 1);
}

#[tokio::test]
async fn malformed_requests_are_rejected_without_side_effects() {
    let fleet = common::start_fleet(1, 1).await;

    let cases = [
        ("missing stat", json!({"module": "test_module"})),
        ("missing module", json!({"stat": "ops1"})),
        ("unknown module", json!({"module": "test_module_wrong", "stat": "ops1"})),
        ("unknown stat", json!({"module": "test_module", "stat": "ops2"})),
        ("module not a string", json!({"module": {}, "stat": "ops1"})),
        ("stat not a string", json!({"module": "test_module", "stat": {}})),
        (
            "predicate unknown key",
            json!({"module": "test_module", "stat": "ops1", "predicate": {"junk": []}}),
        ),
        (
            "predicate arity",
            json!({"module": "test_module", "stat": "ops1", "predicate": {"eq": []}}),
        ),
        (
            "predicate wrong type",
            json!({"module": "test_module", "stat": "ops1", "predicate": "blah"}),
        ),
        (
            "decomposition unknown field",
            json!({"module": "test_module", "stat": "ops1", "decomposition": ["junk"]}),
        ),
        (
            "granularity not a number",
            json!({"module": "test_module", "stat": "ops1", "granularity": "foo"}),
        ),
        (
            "granularity zero",
            json!({"module": "test_module", "stat": "ops1", "granularity": "0"}),
        ),
        (
            "granularity not a step multiple",
            json!({"module": "test_module", "stat": "ops1", "granularity": "11"}),
        ),
        (
            "retention too long for granularity",
            json!({
                "module": "test_module",
                "stat": "ops1",
                "granularity": "1",
                "retention-time": 3601
            }),
        ),
        (
            "persist-data not boolean",
            json!({"module": "test_module", "stat": "ops1", "persist-data": "junk"}),
        ),
    ];

    for (name, raw) in cases {
        let result = fleet.authority.create(Scope::Global, request(raw)).await;
        assert_invalid(result, name);
    }

    // Nothing was recorded by any of the rejected requests.
    assert!(fleet.authority.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn predicates_and_decompositions_are_validated_against_the_catalog() {
    let fleet = common::start_fleet(1, 1).await;

    let inst = fleet
        .authority
        .create(
            Scope::Global,
            request(json!({
                "module": "test_module",
                "stat": "ops1",
                "predicate": {"and": [{"eq": ["hostname", "foo"]}, {"gt": ["latency", 20]}]},
                "decomposition": ["optype", "latency"]
            })),
        )
        .await
        .unwrap();
    assert_eq!(inst.properties.decomposition, vec!["optype", "latency"]);

    // A single bare field name is accepted as a one-element list.
    let inst = fleet
        .authority
        .create(
            Scope::Global,
            request(json!({
                "module": "test_module",
                "stat": "ops1",
                "decomposition": "optype"
            })),
        )
        .await
        .unwrap();
    assert_eq!(inst.properties.decomposition, vec!["optype"]);

    // Ordering predicates on discrete fields are rejected.
    let result = fleet
        .authority
        .create(
            Scope::Global,
            request(json!({
                "module": "test_module",
                "stat": "ops1",
                "predicate": {"gt": ["optype", 5]}
            })),
        )
        .await;
    assert_invalid(result, "ordering on discrete field");

    // Numeric decomposition fields must come last.
    let result = fleet
        .authority
        .create(
            Scope::Global,
            request(json!({
                "module": "test_module",
                "stat": "ops1",
                "decomposition": ["latency", "optype"]
            })),
        )
        .await;
    assert_invalid(result, "numeric not last");
}

#[tokio::test]
async fn set_properties_mutates_only_mutable_fields_without_partial_updates() {
    let fleet = common::start_fleet(1, 1).await;
    let inst = fleet
        .authority
        .create(Scope::Global, request(json!({"module": "test_module", "stat": "ops1"})))
        .await
        .unwrap();

    let updated = fleet
        .authority
        .set_properties(
            inst.id.clone(),
            request(json!({"retention-time": 1200, "enabled": false})),
        )
        .await
        .unwrap();
    assert_eq!(updated.properties.retention_time, 1200);
    assert!(!updated.properties.enabled);

    // Immutable property: rejected outright.
    let result = fleet
        .authority
        .set_properties(inst.id.clone(), request(json!({"module": "other"})))
        .await;
    assert!(matches!(
        result,
        Err(AuthorityError::Invalid(ValidationError::ImmutableProperty("module")))
    ));

    // One invalid value fails the whole request; the valid one must not
    // have been applied.
    let result = fleet
        .authority
        .set_properties(
            inst.id.clone(),
            request(json!({"idle-max": 120, "retention-time": "junk"})),
        )
        .await;
    assert_invalid(result, "partial mutation");
    let current = fleet.authority.get(inst.id.clone()).await.unwrap();
    assert_eq!(current.properties.idle_max, 3600);
    assert_eq!(current.properties.retention_time, 1200);

    // Unknown id reports not-found.
    let result = fleet
        .authority
        .set_properties(FqId::new(Scope::Global, 999), request(json!({"enabled": true})))
        .await;
    assert!(matches!(result, Err(AuthorityError::NotFound(_))));
}
