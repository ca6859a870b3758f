//! Queue maintenance: coalescing local changes and reviving failed entries.

use serde_json::Value;
use tracing::debug;

use notesync_common::{EntityType, OperationKind, Result, SyncOperation};
use notesync_store::LocalStore;

/// What happened to a change handed to [`enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueueDecision {
    /// The change was appended to the queue.
    Queued {
        operation: SyncOperation,
        /// Earlier entries for the same entity that it superseded.
        superseded: usize,
    },
    /// A delete for an entity that never reached the server: the queued
    /// create (and any updates) were removed and nothing needs pushing.
    Dropped { superseded: usize },
}

/// Record a local change, coalescing with earlier entries for the same entity.
///
/// A delete removes every earlier create/update for the entity. If one of
/// them was a create, the entity only ever existed locally and the delete
/// itself is not queued.
pub async fn enqueue(
    store: &dyn LocalStore,
    operation: OperationKind,
    entity_type: EntityType,
    entity_id: &str,
    data: Value,
) -> Result<QueueDecision> {
    let mut superseded = 0;
    let mut never_pushed = false;

    if operation == OperationKind::Delete {
        let stale: Vec<SyncOperation> = store
            .sync_queue()
            .await?
            .into_iter()
            .filter(|op| op.targets(entity_type, entity_id) && op.operation != OperationKind::Delete)
            .collect();

        for op in &stale {
            store.remove_sync_operation(&op.id).await?;
            never_pushed |= op.operation == OperationKind::Create;
        }
        superseded = stale.len();

        if superseded > 0 {
            debug!(
                "Delete of {} {} superseded {} queued operation(s)",
                entity_type, entity_id, superseded
            );
        }

        if never_pushed {
            return Ok(QueueDecision::Dropped { superseded });
        }
    }

    let operation = store
        .add_to_sync_queue(operation, entity_type, entity_id, data)
        .await?;
    Ok(QueueDecision::Queued {
        operation,
        superseded,
    })
}

/// Counters from [`revive_failed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revived {
    /// Failed entries recreated with a zero retry count.
    pub requeued: usize,
    /// Failed entries dropped because a newer entry targets the same entity.
    pub discarded: usize,
}

/// Give failed entries a fresh set of retries.
///
/// Retry counts never go down in place: each failed entry is deleted and
/// recreated at the back of the queue. A failed entry with a newer entry
/// for the same entity behind it is dropped instead, so a stale payload
/// cannot overwrite a newer one.
pub async fn revive_failed(store: &dyn LocalStore) -> Result<Revived> {
    let queue = store.sync_queue().await?;
    let mut revived = Revived::default();

    for (index, op) in queue.iter().enumerate() {
        if !op.is_failed() {
            continue;
        }

        store.remove_sync_operation(&op.id).await?;

        let superseded = queue[index + 1..]
            .iter()
            .any(|later| later.targets(op.entity_type, &op.entity_id));
        if superseded {
            revived.discarded += 1;
            continue;
        }

        store
            .add_to_sync_queue(op.operation, op.entity_type, &op.entity_id, op.data.clone())
            .await?;
        revived.requeued += 1;
    }

    Ok(revived)
}

/// Delete every failed entry. Returns how many were removed.
pub async fn discard_failed(store: &dyn LocalStore) -> Result<usize> {
    let mut removed = 0;
    for op in store.sync_queue().await? {
        if op.is_failed() {
            store.remove_sync_operation(&op.id).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_common::MAX_RETRIES;
    use notesync_store::MemoryStore;
    use serde_json::json;

    async fn fail(store: &MemoryStore, op: &SyncOperation) {
        for _ in 0..MAX_RETRIES {
            store.increment_retry_count(&op.id, "HTTP 500").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_delete_supersedes_updates() {
        let store = MemoryStore::new();
        enqueue(&store, OperationKind::Update, EntityType::Note, "n2", json!({ "v": 1 }))
            .await
            .unwrap();
        enqueue(&store, OperationKind::Update, EntityType::Note, "other", json!({}))
            .await
            .unwrap();

        let decision = enqueue(&store, OperationKind::Delete, EntityType::Note, "n2", Value::Null)
            .await
            .unwrap();

        assert!(matches!(decision, QueueDecision::Queued { superseded: 1, .. }));
        let queue = store.sync_queue().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].entity_id, "other");
        assert_eq!(queue[1].operation, OperationKind::Delete);
    }

    #[tokio::test]
    async fn test_delete_after_local_create_drops_everything() {
        let store = MemoryStore::new();
        enqueue(&store, OperationKind::Create, EntityType::Note, "n3", json!({ "id": "n3" }))
            .await
            .unwrap();
        enqueue(&store, OperationKind::Update, EntityType::Note, "n3", json!({ "id": "n3" }))
            .await
            .unwrap();

        let decision = enqueue(&store, OperationKind::Delete, EntityType::Note, "n3", Value::Null)
            .await
            .unwrap();

        assert_eq!(decision, QueueDecision::Dropped { superseded: 2 });
        assert!(store.sync_queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_only_touches_same_entity_type() {
        let store = MemoryStore::new();
        enqueue(&store, OperationKind::Create, EntityType::Workspace, "x", json!({}))
            .await
            .unwrap();

        let decision = enqueue(&store, OperationKind::Delete, EntityType::Note, "x", Value::Null)
            .await
            .unwrap();

        assert!(matches!(decision, QueueDecision::Queued { superseded: 0, .. }));
        assert_eq!(store.sync_queue().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_revive_failed_recreates_entries() {
        let store = MemoryStore::new();
        let op = store
            .add_to_sync_queue(OperationKind::Update, EntityType::Note, "a", json!({ "v": 1 }))
            .await
            .unwrap();
        fail(&store, &op).await;

        let revived = revive_failed(&store).await.unwrap();

        assert_eq!(revived, Revived { requeued: 1, discarded: 0 });
        let queue = store.sync_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_ne!(queue[0].id, op.id);
        assert_eq!(queue[0].retry_count, 0);
        assert_eq!(queue[0].data, json!({ "v": 1 }));
    }

    #[tokio::test]
    async fn test_revive_failed_drops_superseded_entries() {
        let store = MemoryStore::new();
        let stale = store
            .add_to_sync_queue(OperationKind::Update, EntityType::Note, "a", json!({ "v": 1 }))
            .await
            .unwrap();
        fail(&store, &stale).await;
        store
            .add_to_sync_queue(OperationKind::Update, EntityType::Note, "a", json!({ "v": 2 }))
            .await
            .unwrap();

        let revived = revive_failed(&store).await.unwrap();

        assert_eq!(revived, Revived { requeued: 0, discarded: 1 });
        let queue = store.sync_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].data, json!({ "v": 2 }));
    }

    #[tokio::test]
    async fn test_discard_failed() {
        let store = MemoryStore::new();
        let failed = store
            .add_to_sync_queue(OperationKind::Create, EntityType::Attachment, "f", json!({}))
            .await
            .unwrap();
        fail(&store, &failed).await;
        store
            .add_to_sync_queue(OperationKind::Create, EntityType::Note, "n", json!({}))
            .await
            .unwrap();

        assert_eq!(discard_failed(&store).await.unwrap(), 1);
        assert_eq!(store.sync_queue().await.unwrap().len(), 1);
    }
}
