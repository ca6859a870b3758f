//! Queue entries and cached entity projections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EntitySyncStatus, EntityType, OperationKind};
use crate::{Error, Result};

/// Retry count at which a queued operation is classified as failed.
pub const MAX_RETRIES: u32 = 3;

/// One pending mutation waiting to be pushed to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Unique queue entry id.
    pub id: String,
    pub operation: OperationKind,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Entity payload, opaque to the sync engine.
    pub data: Value,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// When the entry was queued.
    pub created_at: DateTime<Utc>,
}

impl SyncOperation {
    /// Create a fresh queue entry with a zero retry count.
    pub fn new(
        operation: OperationKind,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            entity_type,
            entity_id: entity_id.into(),
            data,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the entry has exhausted its automatic retries.
    pub fn is_failed(&self) -> bool {
        self.retry_count >= MAX_RETRIES
    }

    /// Whether this entry targets the given entity.
    pub fn targets(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }
}

/// Locally cached projection of a server entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub id: String,
    /// Server-side modification time, if known.
    pub updated_at: Option<DateTime<Utc>>,
    /// Full entity body as last seen or edited.
    pub data: Value,
    pub sync_status: EntitySyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Cached note.
pub type OfflineNote = CachedEntity;
/// Cached workspace.
pub type OfflineWorkspace = CachedEntity;

impl CachedEntity {
    /// Build a projection for a local edit that has not reached the server.
    pub fn pending(id: impl Into<String>, data: Value) -> Self {
        let updated_at = updated_at_of(&data);
        Self {
            id: id.into(),
            updated_at,
            data,
            sync_status: EntitySyncStatus::Pending,
            last_synced_at: None,
        }
    }

    /// Build a synced projection from a canonical server entity.
    ///
    /// # Errors
    /// - The entity has no usable `id` field
    pub fn from_remote(data: Value) -> Result<Self> {
        let id = entity_id_of(&data).ok_or_else(|| {
            Error::Serialization("Server entity is missing an 'id' field".to_string())
        })?;
        Ok(Self {
            id,
            updated_at: updated_at_of(&data),
            data,
            sync_status: EntitySyncStatus::Synced,
            last_synced_at: Some(Utc::now()),
        })
    }

    /// Mark as acknowledged by the server.
    pub fn mark_synced(&mut self) {
        self.sync_status = EntitySyncStatus::Synced;
        self.last_synced_at = Some(Utc::now());
    }

    /// Mark as locally modified.
    pub fn mark_pending(&mut self) {
        self.sync_status = EntitySyncStatus::Pending;
    }

    /// Mark as diverged from the server copy.
    pub fn mark_conflict(&mut self) {
        self.sync_status = EntitySyncStatus::Conflict;
    }

    /// Whether `other` (a server copy) is strictly newer than this one.
    ///
    /// A local copy without a timestamp counts as older.
    pub fn is_older_than(&self, other: &CachedEntity) -> bool {
        match (self.updated_at, other.updated_at) {
            (Some(local), Some(remote)) => remote > local,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }
}

/// Extract the entity id from a JSON body. Numeric ids are stringified.
pub fn entity_id_of(data: &Value) -> Option<String> {
    match data.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract `updatedAt` (RFC 3339) from a JSON body.
pub fn updated_at_of(data: &Value) -> Option<DateTime<Utc>> {
    data.get("updatedAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_operation_starts_at_zero() {
        let op = SyncOperation::new(OperationKind::Create, EntityType::Note, "n1", json!({}));
        assert_eq!(op.retry_count, 0);
        assert!(op.last_error.is_none());
        assert!(!op.is_failed());
        assert!(op.targets(EntityType::Note, "n1"));
        assert!(!op.targets(EntityType::Workspace, "n1"));
    }

    #[test]
    fn test_operation_failed_at_threshold() {
        let mut op = SyncOperation::new(OperationKind::Update, EntityType::Note, "n1", json!({}));
        op.retry_count = MAX_RETRIES - 1;
        assert!(!op.is_failed());
        op.retry_count = MAX_RETRIES;
        assert!(op.is_failed());
    }

    #[test]
    fn test_from_remote_reads_id_and_timestamp() {
        let entity = CachedEntity::from_remote(json!({
            "id": "N1-server",
            "title": "Groceries",
            "updatedAt": "2024-03-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(entity.id, "N1-server");
        assert_eq!(entity.sync_status, EntitySyncStatus::Synced);
        assert!(entity.last_synced_at.is_some());
        assert_eq!(
            entity.updated_at.unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
    }

    #[test]
    fn test_from_remote_accepts_numeric_id() {
        let entity = CachedEntity::from_remote(json!({ "id": 42 })).unwrap();
        assert_eq!(entity.id, "42");
        assert!(entity.updated_at.is_none());
    }

    #[test]
    fn test_from_remote_without_id_fails() {
        assert!(CachedEntity::from_remote(json!({ "title": "orphan" })).is_err());
    }

    #[test]
    fn test_is_older_than() {
        let old = CachedEntity::pending("a", json!({ "updatedAt": "2024-01-01T00:00:00Z" }));
        let new = CachedEntity::pending("a", json!({ "updatedAt": "2024-02-01T00:00:00Z" }));
        let undated = CachedEntity::pending("a", json!({}));

        assert!(old.is_older_than(&new));
        assert!(!new.is_older_than(&old));
        assert!(!old.is_older_than(&old.clone()));
        assert!(undated.is_older_than(&new));
        assert!(!new.is_older_than(&undated));
    }
}
