// End-to-end pipeline tests against the in-memory store backend.
// The store's call log is the ground truth for zero-write guarantees.

use async_trait::async_trait;
use saveflow::pipeline::TimestampHook;
use saveflow::store::{MemoryStore, StoreCall};
use saveflow::{
    EntityDescriptor, EntityMetadata, ErrorKind, FieldMetadata, ForeignKeyMetadata, HookContext,
    HookDecision, HookRegistry, KeyStrategy, MetadataRegistry, PipelineResult, SaveError,
    SaveHook, SavePipeline, StoreAction,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

fn registry() -> MetadataRegistry {
    let mut registry = MetadataRegistry::new();
    registry.register(
        EntityMetadata::new("Order")
            .table("orders")
            .key("id", KeyStrategy::StoreGenerated)
            .field(FieldMetadata::new("total"))
            .concurrency_field("rowVersion"),
    );
    registry.register(
        EntityMetadata::new("OrderLine")
            .table("order_lines")
            .key("id", KeyStrategy::StoreGenerated)
            .field(FieldMetadata::new("qty"))
            .foreign_key(ForeignKeyMetadata::new("orderId", "Order").required()),
    );
    registry.register(
        EntityMetadata::new("Category")
            .table("categories")
            .key("id", KeyStrategy::StoreGenerated)
            .field(FieldMetadata::new("name"))
            .foreign_key(ForeignKeyMetadata::new("parentId", "Category")),
    );
    registry.register(
        EntityMetadata::new("Left")
            .key("id", KeyStrategy::StoreGenerated)
            .foreign_key(ForeignKeyMetadata::new("rightId", "Right")),
    );
    registry.register(
        EntityMetadata::new("Right")
            .key("id", KeyStrategy::StoreGenerated)
            .foreign_key(ForeignKeyMetadata::new("leftId", "Left")),
    );
    registry
}

fn setup() -> (Arc<MemoryStore>, SavePipeline) {
    let registry = Arc::new(registry());
    let store = Arc::new(
        MemoryStore::new(registry.clone())
            .with_sequence_start("Order", 101)
            .with_sequence_start("OrderLine", 501),
    );
    let pipeline = SavePipeline::new(registry, store.clone());
    (store, pipeline)
}

fn applies(store: &MemoryStore) -> Vec<(String, StoreAction)> {
    store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            StoreCall::Apply {
                entity_type,
                action,
            } => Some((entity_type, action)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_order_and_line_round_trip() {
    let (store, pipeline) = setup();
    let payload = json!({
        "entities": [
            {"entityType": "Order", "changeKind": "Added",
             "currentValues": {"total": 20.0}, "clientKey": -1},
            {"entityType": "OrderLine", "changeKind": "Added",
             "currentValues": {"qty": 2, "orderId": -1}, "clientKey": -2}
        ]
    });

    let result = pipeline.save_changes(&payload).await.unwrap();

    let mappings: HashMap<(String, String), Value> = result
        .key_mappings
        .iter()
        .map(|m| {
            (
                (m.entity_type.clone(), m.client_key.to_string()),
                m.server_key.clone(),
            )
        })
        .collect();
    assert_eq!(mappings[&("Order".to_string(), "-1".to_string())], json!(101));
    assert_eq!(
        mappings[&("OrderLine".to_string(), "-2".to_string())],
        json!(501)
    );

    let line = store.row("OrderLine", &json!(501)).unwrap();
    assert_eq!(line["orderId"], json!(101));
    assert_eq!(line["qty"], json!(2));

    let order = store.row("Order", &json!(101)).unwrap();
    assert_eq!(order["rowVersion"], json!(1));

    assert!(result.errors.is_empty());
    assert_eq!(result.entities.len(), 2);
    let returned_line = result
        .entities
        .iter()
        .find(|e| e.entity_type == "OrderLine")
        .unwrap();
    assert_eq!(returned_line.values["orderId"], json!(101));
}

#[tokio::test]
async fn test_key_mapping_reproduces_persisted_foreign_keys() {
    let (store, pipeline) = setup();
    let payload = json!({
        "entities": [
            {"entityType": "OrderLine", "changeKind": "Added",
             "currentValues": {"qty": 1, "orderId": -9}, "clientKey": -20},
            {"entityType": "Order", "changeKind": "Added",
             "currentValues": {"total": 8.0}, "clientKey": -9},
            {"entityType": "OrderLine", "changeKind": "Added",
             "currentValues": {"qty": 3, "orderId": -9}, "clientKey": -21}
        ]
    });

    let result = pipeline.save_changes(&payload).await.unwrap();
    let order_key = result
        .key_mappings
        .iter()
        .find(|m| m.entity_type == "Order")
        .unwrap()
        .server_key
        .clone();

    for mapping in result.key_mappings.iter().filter(|m| m.entity_type == "OrderLine") {
        let row = store.row("OrderLine", &mapping.server_key).unwrap();
        // the placeholder -9 in the payload maps exactly to the persisted FK
        assert_eq!(row["orderId"], order_key);
    }
}

#[tokio::test]
async fn test_self_reference_chain_persists_parents_first() {
    let (store, pipeline) = setup();
    let payload = json!({
        "entities": [
            {"entityType": "Category", "changeKind": "Added",
             "currentValues": {"name": "C", "parentId": -2}, "clientKey": -3},
            {"entityType": "Category", "changeKind": "Added",
             "currentValues": {"name": "B", "parentId": -1}, "clientKey": -2},
            {"entityType": "Category", "changeKind": "Added",
             "currentValues": {"name": "A"}, "clientKey": -1}
        ]
    });

    let result = pipeline.save_changes(&payload).await.unwrap();
    assert_eq!(result.entities.len(), 3);

    let names: Vec<Value> = result
        .key_mappings
        .iter()
        .map(|m| store.row("Category", &m.server_key).unwrap()["name"].clone())
        .collect();
    assert_eq!(names.len(), 3);

    // A must have been inserted before B, and B before C
    assert_eq!(
        applies(&store),
        vec![
            ("Category".to_string(), StoreAction::Insert),
            ("Category".to_string(), StoreAction::Insert),
            ("Category".to_string(), StoreAction::Insert),
        ]
    );

    let key_of = |client: i64| -> Value {
        result
            .key_mappings
            .iter()
            .find(|m| m.client_key == json!(client))
            .unwrap()
            .server_key
            .clone()
    };
    let (a, b, c) = (key_of(-1), key_of(-2), key_of(-3));
    // sequence keys are monotonic, so assignment order proves schedule order
    assert!(a.as_i64() < b.as_i64() && b.as_i64() < c.as_i64());
    assert_eq!(store.row("Category", &b).unwrap()["parentId"], a);
    assert_eq!(store.row("Category", &c).unwrap()["parentId"], b);
}

#[tokio::test]
async fn test_deletes_run_before_inserts_child_first() {
    let (store, pipeline) = setup();
    store.seed_row(
        "Order",
        json!(10),
        HashMap::from([("id".to_string(), json!(10)), ("rowVersion".to_string(), json!(1))]),
    );
    store.seed_row(
        "OrderLine",
        json!(20),
        HashMap::from([("id".to_string(), json!(20)), ("orderId".to_string(), json!(10))]),
    );

    let payload = json!({
        "entities": [
            {"entityType": "Order", "changeKind": "Deleted",
             "currentValues": {"id": 10}, "originalValues": {"rowVersion": 1}},
            {"entityType": "OrderLine", "changeKind": "Deleted",
             "currentValues": {"id": 20, "orderId": 10}},
            {"entityType": "Order", "changeKind": "Added",
             "currentValues": {"total": 5.0}, "clientKey": -1}
        ]
    });

    pipeline.save_changes(&payload).await.unwrap();

    assert_eq!(
        applies(&store),
        vec![
            ("OrderLine".to_string(), StoreAction::Delete),
            ("Order".to_string(), StoreAction::Delete),
            ("Order".to_string(), StoreAction::Insert),
        ]
    );
    assert!(store.row("Order", &json!(10)).is_none());
    assert!(store.row("Order", &json!(101)).is_some());
}

#[tokio::test]
async fn test_concurrency_conflict_reports_all_and_writes_nothing() {
    let (store, pipeline) = setup();
    store.seed_row(
        "Order",
        json!(7),
        HashMap::from([("id".to_string(), json!(7)), ("rowVersion".to_string(), json!(3))]),
    );
    store.seed_row(
        "Order",
        json!(8),
        HashMap::from([("id".to_string(), json!(8)), ("rowVersion".to_string(), json!(5))]),
    );

    let payload = json!({
        "entities": [
            {"entityType": "Order", "changeKind": "Modified",
             "currentValues": {"id": 7, "total": 1.0},
             "originalValues": {"rowVersion": 2}},
            {"entityType": "Order", "changeKind": "Modified",
             "currentValues": {"id": 8, "total": 2.0},
             "originalValues": {"rowVersion": 4}}
        ]
    });

    let err = pipeline.save_changes(&payload).await.unwrap_err();
    match &err {
        SaveError::ConcurrencyConflict(conflicts) => {
            assert_eq!(conflicts.len(), 2);
            assert!(conflicts.iter().all(|c| c.kind == ErrorKind::Concurrency));
        }
        other => panic!("expected ConcurrencyConflict, got {:?}", other),
    }

    assert!(applies(&store).is_empty());
    assert!(store.calls().contains(&StoreCall::Rollback));
    assert!(!store.calls().contains(&StoreCall::Commit));
    assert_eq!(store.row("Order", &json!(7)).unwrap()["rowVersion"], json!(3));
}

#[tokio::test]
async fn test_matching_token_allows_update_and_bumps_version() {
    let (store, pipeline) = setup();
    store.seed_row(
        "Order",
        json!(7),
        HashMap::from([
            ("id".to_string(), json!(7)),
            ("total".to_string(), json!(1.0)),
            ("rowVersion".to_string(), json!(3)),
        ]),
    );

    let payload = json!({
        "entities": [
            {"entityType": "Order", "changeKind": "Modified",
             "currentValues": {"id": 7, "total": 9.0},
             "originalValues": {"rowVersion": 3}}
        ]
    });

    let result = pipeline.save_changes(&payload).await.unwrap();
    assert_eq!(result.entities[0].values["rowVersion"], json!(4));
    assert_eq!(store.row("Order", &json!(7)).unwrap()["total"], json!(9.0));
}

struct VetoType(&'static str);

#[async_trait]
impl SaveHook for VetoType {
    fn name(&self) -> &str {
        "veto_type"
    }

    async fn before_save(
        &self,
        _ctx: &mut HookContext,
        descriptor: &mut EntityDescriptor,
    ) -> PipelineResult<HookDecision> {
        if descriptor.entity_type == self.0 {
            Ok(HookDecision::Skip)
        } else {
            Ok(HookDecision::Proceed)
        }
    }
}

#[tokio::test]
async fn test_veto_cascades_to_dependents_with_zero_writes() {
    let registry = Arc::new(registry());
    let store = Arc::new(MemoryStore::new(registry.clone()));
    let mut hooks = HookRegistry::new();
    hooks.register(Arc::new(VetoType("Order")));
    let pipeline = SavePipeline::new(registry, store.clone()).with_hooks(hooks);

    let payload = json!({
        "entities": [
            {"entityType": "Order", "changeKind": "Added",
             "currentValues": {"total": 3.0}, "clientKey": -1},
            {"entityType": "OrderLine", "changeKind": "Added",
             "currentValues": {"qty": 1, "orderId": -1}, "clientKey": -2}
        ]
    });

    let result = pipeline.save_changes(&payload).await.unwrap();

    assert!(result.entities.is_empty());
    assert!(result.key_mappings.is_empty());
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().all(|e| e.kind == ErrorKind::Validation));
    assert!(result.errors[1].message.contains("Order(-1)"));
    assert!(applies(&store).is_empty());
    assert_eq!(store.row_count("Order"), 0);
    assert_eq!(store.row_count("OrderLine"), 0);
}

struct AbortAll;

#[async_trait]
impl SaveHook for AbortAll {
    fn name(&self) -> &str {
        "abort_all"
    }

    async fn before_save(
        &self,
        _ctx: &mut HookContext,
        _descriptor: &mut EntityDescriptor,
    ) -> PipelineResult<HookDecision> {
        Ok(HookDecision::Abort("maintenance window".to_string()))
    }
}

#[tokio::test]
async fn test_hook_abort_rolls_back_whole_batch() {
    let registry = Arc::new(registry());
    let store = Arc::new(MemoryStore::new(registry.clone()));
    let mut hooks = HookRegistry::new();
    hooks.register(Arc::new(AbortAll));
    let pipeline = SavePipeline::new(registry, store.clone()).with_hooks(hooks);

    let payload = json!({
        "entities": [
            {"entityType": "Order", "changeKind": "Added",
             "currentValues": {"total": 3.0}, "clientKey": -1}
        ]
    });

    let err = pipeline.save_changes(&payload).await.unwrap_err();
    assert!(matches!(err, SaveError::Aborted(_)));
    assert!(store.calls().contains(&StoreCall::Rollback));
    assert_eq!(store.row_count("Order"), 0);
}

#[tokio::test]
async fn test_placeholder_cycle_never_reaches_the_store() {
    let (store, pipeline) = setup();
    let payload = json!({
        "entities": [
            {"entityType": "Left", "changeKind": "Added",
             "currentValues": {"rightId": -2}, "clientKey": -1},
            {"entityType": "Right", "changeKind": "Added",
             "currentValues": {"leftId": -1}, "clientKey": -2}
        ]
    });

    let err = pipeline.save_changes(&payload).await.unwrap_err();
    match &err {
        SaveError::CyclicDependency(entities) => {
            assert_eq!(entities.len(), 2);
        }
        other => panic!("expected CyclicDependency, got {:?}", other),
    }
    assert!(err.is_pre_transactional());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_empty_change_set_touches_nothing() {
    let (store, pipeline) = setup();
    let result = pipeline
        .save_changes(&json!({"entities": []}))
        .await
        .unwrap();
    assert!(result.entities.is_empty());
    assert!(result.key_mappings.is_empty());
    assert!(result.errors.is_empty());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_unchanged_rows_pass_through_untouched() {
    let (store, pipeline) = setup();
    let payload = json!({
        "entities": [
            {"entityType": "Order", "changeKind": "Unchanged",
             "currentValues": {"id": 7, "total": 1.0, "rowVersion": 2}}
        ]
    });

    let result = pipeline.save_changes(&payload).await.unwrap();
    assert_eq!(result.entities.len(), 1);
    assert_eq!(result.entities[0].values["total"], json!(1.0));
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_type_fails_before_any_store_access() {
    let (store, pipeline) = setup();
    let payload = json!({
        "entities": [{"entityType": "Widget", "changeKind": "Added", "clientKey": -1}]
    });
    let err = pipeline.save_changes(&payload).await.unwrap_err();
    assert!(matches!(err, SaveError::UnknownEntityType(_)));
    assert!(store.calls().is_empty());
}

struct FlakyCacheFlush;

#[async_trait]
impl SaveHook for FlakyCacheFlush {
    fn name(&self) -> &str {
        "cache_flush"
    }

    async fn after_save(
        &self,
        _ctx: &mut HookContext,
        _result: &saveflow::SaveResult,
    ) -> PipelineResult<()> {
        Err(SaveError::Store(anyhow::anyhow!("cache node down")))
    }
}

#[tokio::test]
async fn test_after_save_failure_is_a_warning_not_a_rollback() {
    let registry = Arc::new(registry());
    let store = Arc::new(MemoryStore::new(registry.clone()).with_sequence_start("Order", 101));
    let mut hooks = HookRegistry::new();
    hooks.register(Arc::new(FlakyCacheFlush));
    let pipeline = SavePipeline::new(registry, store.clone()).with_hooks(hooks);

    let payload = json!({
        "entities": [
            {"entityType": "Order", "changeKind": "Added",
             "currentValues": {"total": 3.0}, "clientKey": -1}
        ]
    });

    let result = pipeline.save_changes(&payload).await.unwrap();
    assert_eq!(result.entities.len(), 1);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("cache_flush"));
    assert!(store.row("Order", &json!(101)).is_some());
}

#[tokio::test]
async fn test_timestamp_hook_stamps_new_rows_end_to_end() {
    let mut registry = MetadataRegistry::new();
    registry.register(
        EntityMetadata::new("Note")
            .key("id", KeyStrategy::StoreGenerated)
            .field(FieldMetadata::new("body"))
            .field(FieldMetadata::new("createdAt"))
            .field(FieldMetadata::new("updatedAt")),
    );
    let registry = Arc::new(registry);
    let store = Arc::new(MemoryStore::new(registry.clone()));
    let mut hooks = HookRegistry::new();
    hooks.register(Arc::new(TimestampHook::new("createdAt", "updatedAt")));
    let pipeline = SavePipeline::new(registry, store.clone()).with_hooks(hooks);

    let payload = json!({
        "entities": [
            {"entityType": "Note", "changeKind": "Added",
             "currentValues": {"body": "hello"}, "clientKey": -1}
        ]
    });

    let result = pipeline.save_changes(&payload).await.unwrap();
    assert!(result.entities[0].values["createdAt"].is_i64());
    let row = store.row("Note", &json!(1)).unwrap();
    assert!(row["updatedAt"].is_i64());
}
