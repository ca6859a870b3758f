//! Conflict resolution.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use notesync_common::{
    updated_at_of, CachedEntity, EntitySyncStatus, EntityType, Error, OperationKind, Result,
    SyncOperation,
};
use notesync_remote::RemoteApi;
use notesync_store::LocalStore;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Keep the local copy and push it on the next run.
    Local,
    /// Replace the local copy with the server's.
    Server,
    /// Field-level merge is not supported; behaves like `Local`.
    Merge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Local => "local",
            ConflictStrategy::Server => "server",
            ConflictStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ConflictStrategy::Local),
            "server" => Ok(ConflictStrategy::Server),
            "merge" => Ok(ConflictStrategy::Merge),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict strategy '{}'",
                other
            ))),
        }
    }
}

/// Result of conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Local copy kept; an update carrying it was queued.
    KeptLocal { operation: SyncOperation },
    /// Local copy replaced by the server's.
    UsedServer {
        entity: CachedEntity,
        /// Queued local edits for the entity that were dropped.
        dropped: usize,
    },
}

/// Applies a [`ConflictStrategy`] to one cached entity.
///
/// Only local state and the queue are touched; nothing is pushed until the
/// next sync run.
pub struct ConflictResolver {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteApi>) -> Self {
        Self { store, remote }
    }

    /// Every cached note and workspace currently flagged as a conflict.
    pub async fn conflicts(&self) -> Result<Vec<(EntityType, CachedEntity)>> {
        let mut found = Vec::new();
        for entity_type in EntityType::ALL.into_iter().filter(EntityType::is_cached) {
            for entity in self.store.list_entities(entity_type).await? {
                if entity.sync_status == EntitySyncStatus::Conflict {
                    found.push((entity_type, entity));
                }
            }
        }
        Ok(found)
    }

    /// Resolve the entity using `strategy`.
    ///
    /// # Errors
    /// - `InvalidInput` for attachments, which have no local copy
    /// - `NotFound` when there is no local copy, or (for `Server`) when the
    ///   server no longer has the entity
    pub async fn resolve(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        strategy: ConflictStrategy,
    ) -> Result<Resolution> {
        if !entity_type.is_cached() {
            return Err(Error::InvalidInput(format!(
                "Cannot resolve conflicts for {} entities",
                entity_type
            )));
        }

        let local = self
            .store
            .get_entity(entity_type, entity_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {}", entity_type, entity_id)))?;

        let resolution = match strategy {
            ConflictStrategy::Local | ConflictStrategy::Merge => {
                self.keep_local(entity_type, local).await?
            }
            ConflictStrategy::Server => self.use_server(entity_type, entity_id).await?,
        };

        info!(
            "Resolved conflict on {} {} using {} strategy",
            entity_type, entity_id, strategy
        );
        Ok(resolution)
    }

    async fn keep_local(&self, entity_type: EntityType, mut local: CachedEntity) -> Result<Resolution> {
        local.mark_pending();
        let operation = self
            .store
            .add_to_sync_queue(OperationKind::Update, entity_type, &local.id, local.data.clone())
            .await?;
        self.store.save_entity(entity_type, local).await?;
        Ok(Resolution::KeptLocal { operation })
    }

    async fn use_server(&self, entity_type: EntityType, entity_id: &str) -> Result<Resolution> {
        let data = self.remote.fetch(entity_type, entity_id).await?;

        let mut dropped = 0;
        for op in self.store.sync_queue().await? {
            if op.targets(entity_type, entity_id) && op.operation != OperationKind::Delete {
                self.store.remove_sync_operation(&op.id).await?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("Dropped {} queued edit(s) for {} {}", dropped, entity_type, entity_id);
        }

        let entity = CachedEntity {
            id: entity_id.to_string(),
            updated_at: updated_at_of(&data),
            data,
            sync_status: EntitySyncStatus::Synced,
            last_synced_at: Some(Utc::now()),
        };
        self.store.save_entity(entity_type, entity.clone()).await?;
        Ok(Resolution::UsedServer { entity, dropped })
    }
}
