//! Local store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use notesync_common::{
    CachedEntity, EntityType, OfflineNote, OfflineWorkspace, OperationKind, Result, SyncOperation,
};

/// Durable client-side storage consumed by the sync engine.
///
/// Holds cached entity projections, the FIFO operation queue and a couple
/// of engine bookkeeping values. Implementations must return the queue in
/// insertion order.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Return every queued operation, oldest first, failed ones included.
    async fn sync_queue(&self) -> Result<Vec<SyncOperation>>;

    /// Append an operation to the queue.
    ///
    /// # Postconditions
    /// - The new entry has `retry_count == 0` and sorts after every existing entry
    /// - Returns the stored entry
    async fn add_to_sync_queue(
        &self,
        operation: OperationKind,
        entity_type: EntityType,
        entity_id: &str,
        data: Value,
    ) -> Result<SyncOperation>;

    /// Remove a queue entry. Removing an unknown id is not an error.
    async fn remove_sync_operation(&self, id: &str) -> Result<()>;

    /// Increment an entry's retry count and record the failure.
    ///
    /// # Errors
    /// - Entry not found
    async fn increment_retry_count(&self, id: &str, error: &str) -> Result<SyncOperation>;

    /// Point every queued operation for `from_id` at `to_id` instead.
    ///
    /// Used when the server assigns its own id to a locally created entity.
    /// Returns the number of entries changed.
    async fn retarget_operations(
        &self,
        entity_type: EntityType,
        from_id: &str,
        to_id: &str,
    ) -> Result<usize>;

    /// Get a cached entity.
    async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedEntity>>;

    /// Insert or replace a cached entity, keyed by its id.
    async fn save_entity(&self, entity_type: EntityType, entity: CachedEntity) -> Result<()>;

    /// Delete a cached entity. Deleting an unknown id is not an error.
    async fn delete_entity(&self, entity_type: EntityType, id: &str) -> Result<()>;

    /// List every cached entity of a type.
    async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>>;

    /// Time of the last fully successful sync run.
    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn set_last_sync_time(&self, time: DateTime<Utc>) -> Result<()>;

    /// Consecutive systemic sync failures, used to compute backoff delays.
    async fn backoff_attempts(&self) -> Result<u32>;

    async fn set_backoff_attempts(&self, attempts: u32) -> Result<()>;

    async fn get_note(&self, id: &str) -> Result<Option<OfflineNote>> {
        self.get_entity(EntityType::Note, id).await
    }

    async fn save_note(&self, note: OfflineNote) -> Result<()> {
        self.save_entity(EntityType::Note, note).await
    }

    async fn delete_note(&self, id: &str) -> Result<()> {
        self.delete_entity(EntityType::Note, id).await
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<OfflineWorkspace>> {
        self.get_entity(EntityType::Workspace, id).await
    }

    async fn save_workspace(&self, workspace: OfflineWorkspace) -> Result<()> {
        self.save_entity(EntityType::Workspace, workspace).await
    }
}
