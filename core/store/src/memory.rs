//! In-memory local store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::store::LocalStore;
use notesync_common::{CachedEntity, EntityType, Error, OperationKind, Result, SyncOperation};

#[derive(Debug, Default)]
struct Inner {
    queue: Vec<SyncOperation>,
    entities: HashMap<EntityType, BTreeMap<String, CachedEntity>>,
    last_sync_time: Option<DateTime<Utc>>,
    backoff_attempts: u32,
}

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn sync_queue(&self) -> Result<Vec<SyncOperation>> {
        Ok(self.read()?.queue.clone())
    }

    async fn add_to_sync_queue(
        &self,
        operation: OperationKind,
        entity_type: EntityType,
        entity_id: &str,
        data: Value,
    ) -> Result<SyncOperation> {
        let op = SyncOperation::new(operation, entity_type, entity_id, data);
        self.write()?.queue.push(op.clone());
        Ok(op)
    }

    async fn remove_sync_operation(&self, id: &str) -> Result<()> {
        self.write()?.queue.retain(|op| op.id != id);
        Ok(())
    }

    async fn increment_retry_count(&self, id: &str, error: &str) -> Result<SyncOperation> {
        let mut inner = self.write()?;
        let op = inner
            .queue
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| Error::NotFound(format!("Queue entry not found: {}", id)))?;

        op.retry_count += 1;
        op.last_error = Some(error.to_string());
        Ok(op.clone())
    }

    async fn retarget_operations(
        &self,
        entity_type: EntityType,
        from_id: &str,
        to_id: &str,
    ) -> Result<usize> {
        let mut inner = self.write()?;
        let mut changed = 0;
        for op in inner.queue.iter_mut().filter(|op| op.targets(entity_type, from_id)) {
            op.entity_id = to_id.to_string();
            changed += 1;
        }
        Ok(changed)
    }

    async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedEntity>> {
        Ok(self
            .read()?
            .entities
            .get(&entity_type)
            .and_then(|entities| entities.get(id))
            .cloned())
    }

    async fn save_entity(&self, entity_type: EntityType, entity: CachedEntity) -> Result<()> {
        self.write()?
            .entities
            .entry(entity_type)
            .or_default()
            .insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn delete_entity(&self, entity_type: EntityType, id: &str) -> Result<()> {
        if let Some(entities) = self.write()?.entities.get_mut(&entity_type) {
            entities.remove(id);
        }
        Ok(())
    }

    async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        Ok(self
            .read()?
            .entities
            .get(&entity_type)
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read()?.last_sync_time)
    }

    async fn set_last_sync_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.write()?.last_sync_time = Some(time);
        Ok(())
    }

    async fn backoff_attempts(&self) -> Result<u32> {
        Ok(self.read()?.backoff_attempts)
    }

    async fn set_backoff_attempts(&self, attempts: u32) -> Result<()> {
        self.write()?.backoff_attempts = attempts;
        Ok(())
    }
}
