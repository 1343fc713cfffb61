use domain::{Direction, MappingRule, MappingType, Substitution, TargetApi, TenantContext};
use mapper_cache::{CacheSettings, InMemoryIdentityResolver, InMemoryInventoryProvider};
use mapper_resolve::{MappingCacheManager, ResolveError};
use mapping_contract::ValidationError;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;

fn manager() -> MappingCacheManager {
    MappingCacheManager::new(
        CacheSettings::default(),
        Arc::new(InMemoryIdentityResolver::new()),
        Arc::new(InMemoryInventoryProvider::new()),
    )
}

fn inbound(id: &str, pattern: &str, sample: &str) -> MappingRule {
    MappingRule {
        id: id.to_string(),
        name: id.to_string(),
        direction: Direction::Inbound,
        subscription_topic: pattern.to_string(),
        mapping_topic_sample: sample.to_string(),
        publish_topic: None,
        filter_mapping: None,
        filter_inventory: None,
        target_api: TargetApi::Measurement,
        mapping_type: MappingType::Json,
        target_template: json!({ "type": "c8y_Temperature" }),
        substitutions: vec![Substitution::new("_TOPIC_LEVEL_[1]", "_IDENTITY_.externalId")],
        map_device_identifier: true,
        external_id_type: "c8y_Serial".to_string(),
        active: true,
        deployed: true,
        debug: false,
    }
}

fn outbound(id: &str, api: TargetApi, filter: Option<&str>) -> MappingRule {
    MappingRule {
        direction: Direction::Outbound,
        subscription_topic: "evt/+/out".to_string(),
        mapping_topic_sample: "evt/dev/out".to_string(),
        publish_topic: Some("evt/+/out".to_string()),
        filter_mapping: filter.map(str::to_string),
        target_api: api,
        substitutions: vec![Substitution::new("_IDENTITY_.externalId", "_TOPIC_LEVEL_[1]")],
        ..inbound(id, "evt/+/out", "evt/dev/out")
    }
}

#[test]
fn unknown_tenant_is_an_error() {
    let manager = manager();
    let ctx = TenantContext::new("missing");
    let err = manager
        .resolve_inbound(&ctx, "device/us/east")
        .expect_err("unknown");
    assert!(matches!(err, ResolveError::UnknownTenant(_)));
}

#[test]
fn add_rejects_invalid_rule_with_error_list() {
    let manager = manager();
    let ctx = TenantContext::new("t1");
    manager.create_tenant("t1");

    let err = manager
        .add_mapping(&ctx, inbound("bad", "device/#", "device/us/east"))
        .expect_err("rejected");
    match err {
        ResolveError::Invalid { mapping_id, errors } => {
            assert_eq!(mapping_id, "bad");
            assert_eq!(errors, vec![ValidationError::TopicLevelCountMismatch]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!manager.contains_mapping(&ctx, "bad").expect("contains"));
}

#[test]
fn inbound_lifecycle() {
    let manager = manager();
    let ctx = TenantContext::new("t1");
    manager.create_tenant("t1");
    manager
        .add_mapping(&ctx, inbound("a", "device/+/east", "device/us/east"))
        .expect("a");
    let mut inactive = inbound("b", "device/us/east", "device/us/east");
    inactive.active = false;
    manager.add_mapping(&ctx, inactive).expect("b");

    let resolved = manager
        .resolve_inbound(&ctx, "device/us/east")
        .expect("resolve");
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, "a");
    assert_eq!(
        manager.inbound_subscriptions(&ctx).expect("subs"),
        vec!["device/+/east".to_string()]
    );

    let snapshot = manager
        .tenant(&ctx)
        .expect("tenant")
        .inbound_snapshot()
        .expect("snapshot");
    manager
        .delete_mapping(&ctx, "a")
        .expect("delete")
        .expect("removed");
    assert!(manager
        .resolve_inbound(&ctx, "device/us/east")
        .expect("resolve")
        .is_empty());
    // 已取得的快照不受后续修改影响。
    assert_eq!(snapshot.resolve_ids("device/us/east"), vec!["b", "a"]);
}

#[test]
fn rebuild_swaps_whole_tree_and_reports_rejections() {
    let manager = manager();
    let ctx = TenantContext::new("t1");
    manager.create_tenant("t1");
    manager
        .add_mapping(&ctx, inbound("old", "legacy/+", "legacy/x"))
        .expect("old");

    let rejected = manager
        .rebuild_inbound(
            &ctx,
            vec![
                inbound("new", "device/+/east", "device/us/east"),
                inbound("broken", "device/#/x", "device/a/x"),
            ],
        )
        .expect("rebuild");

    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].mapping_id, "broken");
    assert!(manager.get_mapping(&ctx, "old").expect("get").is_none());
    assert!(manager.get_mapping(&ctx, "new").expect("get").is_some());
}

#[test]
fn outbound_resolves_by_api_and_filter() {
    let manager = manager();
    let ctx = TenantContext::new("t1");
    manager.create_tenant("t1");
    manager
        .add_mapping(&ctx, outbound("o1", TargetApi::Measurement, Some("c8y_Temperature")))
        .expect("o1");
    manager
        .add_mapping(&ctx, outbound("o2", TargetApi::Measurement, None))
        .expect("o2");
    manager
        .add_mapping(&ctx, outbound("o3", TargetApi::Alarm, None))
        .expect("o3");

    let with_filter = json!({ "c8y_Temperature": { "T": { "value": 1 } } });
    let ids: Vec<String> = manager
        .resolve_outbound(&ctx, TargetApi::Measurement, &with_filter)
        .expect("resolve")
        .iter()
        .map(|rule| rule.id.clone())
        .collect();
    assert_eq!(ids, vec!["o1", "o2"]);

    let without = json!({ "other": 1 });
    let ids: Vec<String> = manager
        .resolve_outbound(&ctx, TargetApi::Measurement, &without)
        .expect("resolve")
        .iter()
        .map(|rule| rule.id.clone())
        .collect();
    assert_eq!(ids, vec!["o2"]);
}

#[test]
fn changing_direction_moves_rule_between_tables() {
    let manager = manager();
    let ctx = TenantContext::new("t1");
    manager.create_tenant("t1");
    manager
        .add_mapping(&ctx, inbound("x", "evt/+/out", "evt/dev/out"))
        .expect("inbound");
    manager
        .add_mapping(&ctx, outbound("x", TargetApi::Measurement, None))
        .expect("outbound");
    assert!(manager
        .resolve_inbound(&ctx, "evt/dev/out")
        .expect("resolve")
        .is_empty());
    assert_eq!(
        manager
            .resolve_outbound(&ctx, TargetApi::Measurement, &json!({}))
            .expect("resolve")
            .len(),
        1
    );
}

#[tokio::test]
async fn clear_and_remove_tenant_drop_caches() {
    let resolver = Arc::new(InMemoryIdentityResolver::new());
    resolver
        .register("t1", "c8y_Serial", "dev-1", "101")
        .expect("register");
    let manager = MappingCacheManager::new(
        CacheSettings::default(),
        resolver,
        Arc::new(InMemoryInventoryProvider::new()),
    );
    let ctx = TenantContext::new("t1");
    let tenant = manager.create_tenant("t1");
    manager
        .add_mapping(&ctx, inbound("a", "device/+/east", "device/us/east"))
        .expect("a");
    tenant.identity().resolve(&ctx, "c8y_Serial", "dev-1").await;
    assert_eq!(tenant.identity().cache_size(), 1);

    manager.clear_tenant(&ctx).expect("clear");
    assert_eq!(tenant.identity().cache_size(), 0);
    assert!(!manager.contains_mapping(&ctx, "a").expect("contains"));

    tenant.identity().resolve(&ctx, "c8y_Serial", "dev-1").await;
    assert_eq!(tenant.identity().cache_size(), 1);
    assert!(manager.remove_tenant("t1"));
    assert_eq!(tenant.identity().cache_size(), 0);
    assert!(!manager.remove_tenant("t1"));
    assert!(manager.tenant(&ctx).is_err());
}

#[test]
fn installed_rules_are_marked_deployed() {
    let manager = manager();
    let ctx = TenantContext::new("t1");
    manager.create_tenant("t1");
    let mut draft = inbound("a", "device/+/east", "device/us/east");
    draft.deployed = false;
    manager.add_mapping(&ctx, draft.clone()).expect("a");
    assert!(manager.get_mapping(&ctx, "a").expect("get").expect("a").deployed);
    assert_eq!(manager.resolve_inbound(&ctx, "device/us/east").expect("resolve").len(), 1);

    draft.id = "b".to_string();
    let rejected = manager.rebuild_inbound(&ctx, vec![draft]).expect("rebuild");
    assert!(rejected.is_empty());
    assert!(manager.get_mapping(&ctx, "b").expect("get").expect("b").deployed);
}

const TOPIC: &str = "device/us/east";
const RULE_SETS: [&[&str]; 3] = [&["a"], &["a", "b"], &["a", "b", "c", "d"]];

fn full_set() -> Vec<MappingRule> {
    vec![
        inbound("a", "device/+/east", TOPIC),
        inbound("b", TOPIC, TOPIC),
        inbound("c", "device/#", "device/us"),
        inbound("d", "device/+/+", TOPIC),
    ]
}

fn resolved_ids(manager: &MappingCacheManager, ctx: &TenantContext) -> Vec<String> {
    let mut ids: Vec<String> = manager
        .resolve_inbound(ctx, TOPIC)
        .expect("resolve")
        .iter()
        .map(|rule| rule.id.clone())
        .collect();
    ids.sort();
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_see_whole_rule_sets_during_writes() {
    let manager = Arc::new(manager());
    let ctx = TenantContext::new("t1");
    manager.create_tenant("t1");
    manager
        .add_mapping(&ctx, inbound("a", "device/+/east", TOPIC))
        .expect("a");
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = JoinSet::new();
    for _ in 0..4 {
        let manager = manager.clone();
        let ctx = ctx.clone();
        let stop = stop.clone();
        readers.spawn(async move {
            let mut observed = 0usize;
            loop {
                let ids = resolved_ids(&manager, &ctx);
                assert!(
                    RULE_SETS.iter().any(|set| set[..] == ids[..]),
                    "partial rule set: {ids:?}"
                );
                observed += 1;
                if stop.load(Ordering::Relaxed) {
                    break observed;
                }
                tokio::task::yield_now().await;
            }
        });
    }

    let writer = {
        let manager = manager.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let rejected = manager.rebuild_inbound(&ctx, full_set()).expect("full");
                assert!(rejected.is_empty());
                manager
                    .rebuild_inbound(&ctx, vec![inbound("a", "device/+/east", TOPIC)])
                    .expect("base");
                manager
                    .add_mapping(&ctx, inbound("b", TOPIC, TOPIC))
                    .expect("add");
                manager
                    .delete_mapping(&ctx, "b")
                    .expect("delete")
                    .expect("removed");
                tokio::task::yield_now().await;
            }
        })
    };
    writer.await.expect("writer");
    stop.store(true, Ordering::Relaxed);

    while let Some(observed) = readers.join_next().await {
        assert!(observed.expect("reader") > 0);
    }
    assert_eq!(resolved_ids(&manager, &ctx), vec!["a".to_string()]);
}
