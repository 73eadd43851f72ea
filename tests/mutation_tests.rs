use instance_reconcile::index::{IndexCall, Query};
use instance_reconcile::{
    CollectionNames, InMemoryIndex, MutationConfig, MutationEngine, MutationOp, ReconcileError,
};
use serde_json::{Value, json};
use std::collections::HashSet;

fn keys_in_filter(query: &Query) -> Vec<u64> {
    let terms = match query {
        Query::Bool(must) => must.iter().find_map(|inner| match inner {
            Query::Terms { field, values } if field == "processInstanceKey" => Some(values),
            _ => None,
        }),
        Query::Terms { field, values } if field == "processInstanceKey" => Some(values),
        _ => None,
    };
    terms
        .map(|values| values.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

async fn seed_instance(index: &InMemoryIndex, collections: &CollectionNames, key: u64) {
    index
        .insert(
            &collections.list_view,
            key.to_string(),
            json!({"key": key, "processInstanceKey": key, "joinRelation": "processInstance",
                   "state": "ACTIVE", "incident": true}),
        )
        .await;
    index
        .insert(
            &collections.list_view,
            format!("{}-task", key),
            json!({"key": key * 10, "processInstanceKey": key, "joinRelation": "activity",
                   "activityState": "ACTIVE", "incident": true}),
        )
        .await;
    index
        .insert(
            &collections.flow_node_instance,
            format!("{}-fn", key),
            json!({"processInstanceKey": key, "state": "ACTIVE"}),
        )
        .await;
    index
        .insert(
            &collections.incident,
            format!("{}-inc", key),
            json!({"processInstanceKey": key, "state": "ACTIVE"}),
        )
        .await;
    index
        .insert(
            &collections.post_importer_queue,
            format!("{}-q", key),
            json!({"processInstanceKey": key}),
        )
        .await;
}

#[tokio::test]
async fn batches_cover_every_key_exactly_once() {
    let index = InMemoryIndex::new();
    let collections = CollectionNames::default();
    let config = MutationConfig::default().batch_size(4).unwrap();
    let keys: Vec<u64> = (100..110).collect();

    let report = MutationEngine::new(&index, &collections, &config)
        .apply(&keys)
        .await
        .unwrap();
    assert_eq!(report.batches, 3);

    let calls = index.calls().await;
    for op in MutationOp::ALL {
        assert_eq!(report.totals(op).requests, 3, "{}", op.name());
    }
    assert_eq!(calls.len(), 3 * MutationOp::ALL.len());

    let deletes: Vec<&Query> = calls
        .iter()
        .filter_map(|call| match call {
            IndexCall::DeleteByQuery { query, .. } => Some(query),
            _ => None,
        })
        .collect();
    assert_eq!(deletes.len(), 3);
    let submitted: Vec<u64> = deletes.iter().flat_map(|query| keys_in_filter(query)).collect();
    assert_eq!(submitted, keys);
    assert_eq!(submitted.iter().collect::<HashSet<_>>().len(), keys.len());

    for call in &calls {
        if let IndexCall::UpdateByQuery { query, .. } = call {
            assert!(keys_in_filter(query).len() <= 4);
        }
    }
}

#[tokio::test]
async fn documents_are_closed_across_all_collections() {
    let index = InMemoryIndex::new();
    let collections = CollectionNames::default();
    seed_instance(&index, &collections, 7).await;
    seed_instance(&index, &collections, 8).await;
    let config = MutationConfig::default();

    let report = MutationEngine::new(&index, &collections, &config)
        .apply(&[7])
        .await
        .unwrap();
    assert!(report.short_updates.is_empty());
    assert_eq!(report.totals(MutationOp::ResolveIncidents).updated, 1);
    assert_eq!(report.totals(MutationOp::DeleteQueuedImports).deleted, 1);

    let instance = index.get(&collections.list_view, "7").await.unwrap();
    assert_eq!(instance["state"], "CANCELED");
    assert_eq!(instance["incident"], false);
    assert_eq!(instance["endDate"], "2024-08-26T12:00:00.000+0000");

    let task = index.get(&collections.list_view, "7-task").await.unwrap();
    assert_eq!(task["activityState"], "TERMINATED");
    let flow_node = index.get(&collections.flow_node_instance, "7-fn").await.unwrap();
    assert_eq!(flow_node["state"], "TERMINATED");
    let incident = index.get(&collections.incident, "7-inc").await.unwrap();
    assert_eq!(incident["state"], "RESOLVED");
    assert!(index.get(&collections.post_importer_queue, "7-q").await.is_none());

    let untouched = index.get(&collections.list_view, "8").await.unwrap();
    assert_eq!(untouched["state"], "ACTIVE");
    assert!(index.get(&collections.post_importer_queue, "8-q").await.is_some());
}

#[tokio::test]
async fn short_update_is_reported_not_failed() {
    let index = InMemoryIndex::new();
    let collections = CollectionNames::default();
    seed_instance(&index, &collections, 1).await;
    let config = MutationConfig::default();

    // key 2 has no documents anywhere
    let report = MutationEngine::new(&index, &collections, &config)
        .apply(&[1, 2])
        .await
        .unwrap();

    let short_ops: Vec<MutationOp> = report.short_updates.iter().map(|short| short.op).collect();
    assert_eq!(
        short_ops,
        vec![
            MutationOp::CancelInstances,
            MutationOp::TerminateListViewFlowNodes,
            MutationOp::TerminateFlowNodes
        ]
    );
    assert!(report.short_updates.iter().all(|short| short.keys == vec![1, 2] && short.updated == 1));
    assert_eq!(report.batches, 1);
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let index = InMemoryIndex::new();
    let collections = CollectionNames::default();
    seed_instance(&index, &collections, 3).await;
    let config = MutationConfig::default();
    let engine = MutationEngine::new(&index, &collections, &config);

    engine.apply(&[3]).await.unwrap();
    let first = index.get(&collections.list_view, "3").await;
    let second_run = engine.apply(&[3]).await.unwrap();

    assert_eq!(index.get(&collections.list_view, "3").await, first);
    assert_eq!(second_run.totals(MutationOp::TerminateFlowNodes).updated, 0);
    assert_eq!(second_run.totals(MutationOp::DeleteQueuedImports).deleted, 0);
}

#[tokio::test]
async fn transport_failure_halts_after_completed_batches() {
    let index = InMemoryIndex::new();
    let collections = CollectionNames::default();
    seed_instance(&index, &collections, 1).await;
    seed_instance(&index, &collections, 2).await;
    let config = MutationConfig::default().batch_size(1).unwrap();

    index.fail_index(&collections.incident).await;
    let result = MutationEngine::new(&index, &collections, &config)
        .apply(&[1, 2])
        .await;

    assert!(matches!(result, Err(ReconcileError::Index(_))));
    let first = index.get(&collections.list_view, "1").await.unwrap();
    assert_eq!(first["state"], "CANCELED");
    let second = index.get(&collections.list_view, "2").await.unwrap();
    assert_eq!(second["state"], "ACTIVE");
}

#[tokio::test]
async fn dry_run_leaves_the_index_untouched() {
    let index = InMemoryIndex::new();
    let collections = CollectionNames::default();
    seed_instance(&index, &collections, 5).await;
    let config = MutationConfig::default().dry_run(true);

    let report = MutationEngine::new(&index, &collections, &config)
        .apply(&[5])
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.batches, 1);
    assert!(index.calls().await.is_empty());
    let instance = index.get(&collections.list_view, "5").await.unwrap();
    assert_eq!(instance["state"], "ACTIVE");
}
