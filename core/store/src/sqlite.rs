//! SQLite-backed local store.
//!
//! Persists cached notes/workspaces, the operation queue and the engine's
//! bookkeeping values so pending work survives restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::store::LocalStore;
use notesync_common::{CachedEntity, EntityType, Error, OperationKind, Result, SyncOperation};

const LAST_SYNC_KEY: &str = "last_sync_time";
const BACKOFF_KEY: &str = "backoff_attempts";

/// Local store using SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

type QueueRow = (String, String, String, String, String, u32, Option<String>, String);
type EntityRow = (String, String, Option<String>, String, Option<String>);

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(storage_err)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                operation TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                data TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entities (
                entity_type TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT,
                sync_status TEXT NOT NULL,
                last_synced_at TEXT,
                PRIMARY KEY (entity_type, id)
            );

            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_entity ON sync_queue(entity_type, entity_id);
            "#,
        )
        .map_err(storage_err)?;

        info!("Local store opened successfully");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("SQLite connection lock poisoned".to_string()))
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO sync_metadata (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn load_operation(conn: &Connection, id: &str) -> Result<Option<SyncOperation>> {
        let row = conn
            .query_row(
                r#"
                SELECT id, operation, entity_type, entity_id, data, retry_count, last_error, created_at
                FROM sync_queue WHERE id = ?1
                "#,
                [id],
                queue_row,
            )
            .optional()
            .map_err(storage_err)?;

        row.map(operation_from_row).transpose()
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn sync_queue(&self) -> Result<Vec<SyncOperation>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, operation, entity_type, entity_id, data, retry_count, last_error, created_at
                FROM sync_queue ORDER BY seq
                "#,
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([], queue_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;

        rows.into_iter().map(operation_from_row).collect()
    }

    async fn add_to_sync_queue(
        &self,
        operation: OperationKind,
        entity_type: EntityType,
        entity_id: &str,
        data: Value,
    ) -> Result<SyncOperation> {
        let op = SyncOperation::new(operation, entity_type, entity_id, data);
        debug!("Queueing {} {} {}", op.operation, op.entity_type, op.entity_id);

        self.conn()?
            .execute(
                r#"
                INSERT INTO sync_queue
                (id, operation, entity_type, entity_id, data, retry_count, last_error, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    op.id,
                    op.operation.as_str(),
                    op.entity_type.as_str(),
                    op.entity_id,
                    serde_json::to_string(&op.data)?,
                    op.retry_count,
                    op.last_error,
                    op.created_at.to_rfc3339(),
                ],
            )
            .map_err(storage_err)?;

        Ok(op)
    }

    async fn remove_sync_operation(&self, id: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM sync_queue WHERE id = ?1", [id])
            .map_err(storage_err)?;
        Ok(())
    }

    async fn increment_retry_count(&self, id: &str, error: &str) -> Result<SyncOperation> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?2 WHERE id = ?1",
                params![id, error],
            )
            .map_err(storage_err)?;

        if changed == 0 {
            return Err(Error::NotFound(format!("Queue entry not found: {}", id)));
        }

        Self::load_operation(&conn, id)?
            .ok_or_else(|| Error::NotFound(format!("Queue entry not found: {}", id)))
    }

    async fn retarget_operations(
        &self,
        entity_type: EntityType,
        from_id: &str,
        to_id: &str,
    ) -> Result<usize> {
        self.conn()?
            .execute(
                "UPDATE sync_queue SET entity_id = ?3 WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type.as_str(), from_id, to_id],
            )
            .map_err(storage_err)
    }

    async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<Option<CachedEntity>> {
        let row = self
            .conn()?
            .query_row(
                r#"
                SELECT id, data, updated_at, sync_status, last_synced_at
                FROM entities WHERE entity_type = ?1 AND id = ?2
                "#,
                params![entity_type.as_str(), id],
                entity_row,
            )
            .optional()
            .map_err(storage_err)?;

        row.map(entity_from_row).transpose()
    }

    async fn save_entity(&self, entity_type: EntityType, entity: CachedEntity) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT OR REPLACE INTO entities
                (entity_type, id, data, updated_at, sync_status, last_synced_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    entity_type.as_str(),
                    entity.id,
                    serde_json::to_string(&entity.data)?,
                    entity.updated_at.map(|t| t.to_rfc3339()),
                    entity.sync_status.as_str(),
                    entity.last_synced_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_entity(&self, entity_type: EntityType, id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM entities WHERE entity_type = ?1 AND id = ?2",
                params![entity_type.as_str(), id],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list_entities(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, data, updated_at, sync_status, last_synced_at
                FROM entities WHERE entity_type = ?1 ORDER BY id
                "#,
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([entity_type.as_str()], entity_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;

        rows.into_iter().map(entity_from_row).collect()
    }

    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_meta(LAST_SYNC_KEY)?
            .map(|value| parse_time(&value))
            .transpose()
    }

    async fn set_last_sync_time(&self, time: DateTime<Utc>) -> Result<()> {
        self.set_meta(LAST_SYNC_KEY, &time.to_rfc3339())
    }

    async fn backoff_attempts(&self) -> Result<u32> {
        match self.get_meta(BACKOFF_KEY)? {
            Some(value) => value
                .parse()
                .map_err(|e| Error::Storage(format!("Invalid backoff counter '{}': {}", value, e))),
            None => Ok(0),
        }
    }

    async fn set_backoff_attempts(&self, attempts: u32) -> Result<()> {
        self.set_meta(BACKOFF_KEY, &attempts.to_string())
    }
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Invalid timestamp '{}': {}", value, e)))
}

fn queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn operation_from_row(row: QueueRow) -> Result<SyncOperation> {
    let (id, operation, entity_type, entity_id, data, retry_count, last_error, created_at) = row;
    Ok(SyncOperation {
        id,
        operation: operation.parse()?,
        entity_type: entity_type.parse()?,
        entity_id,
        data: serde_json::from_str(&data)?,
        retry_count,
        last_error,
        created_at: parse_time(&created_at)?,
    })
}

fn entity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn entity_from_row(row: EntityRow) -> Result<CachedEntity> {
    let (id, data, updated_at, sync_status, last_synced_at) = row;
    Ok(CachedEntity {
        id,
        data: serde_json::from_str(&data)?,
        updated_at: updated_at.as_deref().map(parse_time).transpose()?,
        sync_status: sync_status.parse()?,
        last_synced_at: last_synced_at.as_deref().map(parse_time).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_common::EntitySyncStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_queue_roundtrip_keeps_order() {
        let store = SqliteStore::in_memory().unwrap();
        for id in ["a", "b", "c"] {
            store
                .add_to_sync_queue(OperationKind::Create, EntityType::Note, id, json!({ "id": id }))
                .await
                .unwrap();
        }

        let queue = store.sync_queue().await.unwrap();
        let ids: Vec<_> = queue.iter().map(|op| op.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(queue[1].data, json!({ "id": "b" }));
    }

    #[tokio::test]
    async fn test_retry_count_and_removal() {
        let store = SqliteStore::in_memory().unwrap();
        let op = store
            .add_to_sync_queue(OperationKind::Delete, EntityType::Workspace, "w1", Value::Null)
            .await
            .unwrap();

        let updated = store.increment_retry_count(&op.id, "HTTP 500").await.unwrap();
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.last_error.as_deref(), Some("HTTP 500"));

        store.remove_sync_operation(&op.id).await.unwrap();
        assert!(store.sync_queue().await.unwrap().is_empty());
        assert!(store.increment_retry_count(&op.id, "gone").await.is_err());
    }

    #[tokio::test]
    async fn test_entity_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let note = CachedEntity::from_remote(json!({
            "id": "n1",
            "title": "Standup",
            "updatedAt": "2024-05-01T08:30:00Z"
        }))
        .unwrap();
        store.save_note(note.clone()).await.unwrap();

        let loaded = store.get_note("n1").await.unwrap().unwrap();
        assert_eq!(loaded.data, note.data);
        assert_eq!(loaded.updated_at, note.updated_at);
        assert_eq!(loaded.sync_status, EntitySyncStatus::Synced);
        assert!(store.get_workspace("n1").await.unwrap().is_none());

        store.delete_note("n1").await.unwrap();
        assert!(store.list_entities(EntityType::Note).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notesync.db");
        let now = Utc::now();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set_last_sync_time(now).await.unwrap();
            store.set_backoff_attempts(3).await.unwrap();
            store
                .add_to_sync_queue(OperationKind::Update, EntityType::Note, "n1", json!({}))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.last_sync_time().await.unwrap().map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
        assert_eq!(store.backoff_attempts().await.unwrap(), 3);
        assert_eq!(store.sync_queue().await.unwrap().len(), 1);
    }
}
