use domain::{
    Direction, MappingRule, MappingType, ProcessingCache, RepairStrategy, Substitution,
    SubstituteValue, TargetApi, TenantContext,
};
use mapper_cache::{CacheSettings, IdentityService, InMemoryIdentityResolver};
use mapper_substitute::{SubstituteError, SubstitutionEngine, reconcile_cardinality};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

const DEVICE: &str = "_IDENTITY_.externalId";

fn rule(substitutions: Vec<Substitution>) -> MappingRule {
    MappingRule {
        id: "m-1".to_string(),
        name: "m-1".to_string(),
        direction: Direction::Inbound,
        subscription_topic: "device/+".to_string(),
        mapping_topic_sample: "device/x".to_string(),
        publish_topic: None,
        filter_mapping: None,
        filter_inventory: None,
        target_api: TargetApi::Measurement,
        mapping_type: MappingType::Json,
        target_template: json!({}),
        substitutions,
        map_device_identifier: true,
        external_id_type: "c8y_Serial".to_string(),
        active: true,
        deployed: true,
        debug: false,
    }
}

fn texts(values: &[&str]) -> Vec<SubstituteValue> {
    values.iter().map(|value| SubstituteValue::text(*value)).collect()
}

fn identity(pairs: &[(&str, &str)]) -> IdentityService {
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    for (external, global) in pairs {
        resolver
            .register("t1", "c8y_Serial", external, global)
            .expect("register");
    }
    IdentityService::new(&CacheSettings::default(), resolver)
}

#[test]
fn no_device_entries_is_extraction_error() {
    let rule = rule(vec![Substitution::new("id", DEVICE)]);
    let mut cache = ProcessingCache::new();
    cache.touch(DEVICE);
    let err = reconcile_cardinality(&rule, &cache).expect_err("empty");
    assert_eq!(
        err,
        SubstituteError::Extraction("no device entries found".to_string())
    );
}

#[test]
fn single_default_entry_is_broadcast() {
    let rule = rule(vec![
        Substitution::new("ids", DEVICE),
        Substitution::new("unit", "c8y.T.unit"),
    ]);
    let mut cache = ProcessingCache::new();
    cache.insert(DEVICE, texts(&["a", "b", "c"]));
    cache.insert("c8y.T.unit", texts(&["C"]));

    let instances = reconcile_cardinality(&rule, &cache).expect("reconcile");
    assert_eq!(instances.len(), 3);
    for (index, instance) in instances.iter().enumerate() {
        assert_eq!(instance.index, index);
        assert_eq!(instance.get("c8y.T.unit"), Some(&SubstituteValue::text("C")));
    }
    assert_eq!(instances[2].get(DEVICE), Some(&SubstituteValue::text("c")));
}

#[test]
fn last_value_policy_broadcasts_last_entry() {
    let rule = rule(vec![
        Substitution::new("ids", DEVICE),
        Substitution::new("ts", "time").with_repair(RepairStrategy::UseLastValueOfArray),
    ]);
    let mut cache = ProcessingCache::new();
    cache.insert(DEVICE, texts(&["a", "b", "c"]));
    cache.insert("time", texts(&["t1", "t2"]));

    let instances = reconcile_cardinality(&rule, &cache).expect("reconcile");
    assert!(instances
        .iter()
        .all(|instance| instance.get("time") == Some(&SubstituteValue::text("t2"))));
}

#[test]
fn other_policies_degrade_to_first_entry() {
    let rule = rule(vec![
        Substitution::new("ids", DEVICE),
        Substitution::new("x", "x").with_repair(RepairStrategy::CreateIfMissing),
    ]);
    let mut cache = ProcessingCache::new();
    cache.insert(DEVICE, texts(&["a", "b"]));
    cache.insert("x", texts(&["x0"]));

    let instances = reconcile_cardinality(&rule, &cache).expect("reconcile");
    assert!(instances
        .iter()
        .all(|instance| instance.get("x") == Some(&SubstituteValue::text("x0"))));
}

#[test]
fn empty_and_longer_lists() {
    let rule = rule(vec![
        Substitution::new("ids", DEVICE),
        Substitution::new("missing", "absent"),
        Substitution::new("many", "many"),
    ]);
    let mut cache = ProcessingCache::new();
    cache.insert(DEVICE, texts(&["a", "b"]));
    cache.touch("absent");
    cache.insert("many", texts(&["m0", "m1", "m2"]));

    let instances = reconcile_cardinality(&rule, &cache).expect("reconcile");
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|instance| instance.get("absent").is_none()));
    assert_eq!(instances[1].get("many"), Some(&SubstituteValue::text("m1")));
}

#[tokio::test]
async fn identifier_miss_fails_only_that_instance() {
    let ctx = TenantContext::new("t1");
    let rule = rule(vec![Substitution::new("ids", DEVICE)]);
    let mut cache = ProcessingCache::new();
    cache.insert(DEVICE, texts(&["known", "unknown"]));
    let identity = identity(&[("known", "101")]);

    let outcomes = SubstitutionEngine::reconcile(&ctx, &rule, &cache, &identity)
        .await
        .expect("reconcile");
    assert_eq!(outcomes.len(), 2);
    let first = outcomes[0].as_ref().expect("resolved");
    assert_eq!(first.global_id.as_deref(), Some("101"));
    assert_eq!(first.external_id.as_deref(), Some("known"));
    assert!(matches!(
        outcomes[1],
        Err(SubstituteError::IdentifierResolution { ref external_id, .. }) if external_id == "unknown"
    ));
}

#[tokio::test]
async fn dry_run_passes_raw_identifier_through() {
    let ctx = TenantContext::new("t1").with_dry_run(true);
    let rule = rule(vec![Substitution::new("ids", DEVICE)]);
    let mut cache = ProcessingCache::new();
    cache.insert(DEVICE, texts(&["unknown"]));
    let identity = identity(&[]);

    let outcomes = SubstitutionEngine::reconcile(&ctx, &rule, &cache, &identity)
        .await
        .expect("reconcile");
    let instance = outcomes[0].as_ref().expect("passed through");
    assert_eq!(instance.global_id.as_deref(), Some("unknown"));
}

#[tokio::test]
async fn unmapped_identifier_is_used_as_global_id() {
    let ctx = TenantContext::new("t1");
    let mut rule = rule(vec![Substitution::new("ids", "_IDENTITY_.globalId")]);
    rule.map_device_identifier = false;
    let mut cache = ProcessingCache::new();
    cache.insert("_IDENTITY_.globalId", texts(&["201"]));
    let identity = identity(&[]);

    let outcomes = SubstitutionEngine::reconcile(&ctx, &rule, &cache, &identity)
        .await
        .expect("reconcile");
    assert_eq!(
        outcomes[0].as_ref().expect("ok").global_id.as_deref(),
        Some("201")
    );
}

proptest! {
    #[test]
    fn equal_lengths_yield_that_many_instances(
        devices in 1usize..12,
        extra_paths in 0usize..5,
    ) {
        let mut substitutions = vec![Substitution::new("ids", DEVICE)];
        let mut cache = ProcessingCache::new();
        cache.insert(DEVICE, (0..devices).map(|i| SubstituteValue::text(format!("d{i}"))).collect());
        for p in 0..extra_paths {
            let path = format!("p{p}");
            substitutions.push(Substitution::new(path.clone(), path.clone()));
            cache.insert(path, (0..devices).map(|i| SubstituteValue::from_json(json!(i), RepairStrategy::Default)).collect());
        }
        let rule = rule(substitutions);
        let instances = reconcile_cardinality(&rule, &cache).expect("reconcile");
        prop_assert_eq!(instances.len(), devices);
        for (index, instance) in instances.iter().enumerate() {
            for p in 0..extra_paths {
                prop_assert_eq!(&instance.get(&format!("p{p}")).expect("value").value, &json!(index));
            }
        }
    }
}
