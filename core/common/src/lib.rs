//! Common types shared across notesync crates.
//!
//! This crate holds the error type, the entity and operation enums, and the
//! queue/projection records that the store, remote and sync crates exchange.

pub mod error;
pub mod model;
pub mod types;

pub use error::{Error, Result};
pub use model::{
    entity_id_of, updated_at_of, CachedEntity, OfflineNote, OfflineWorkspace, SyncOperation,
    MAX_RETRIES,
};
pub use types::{EntitySyncStatus, EntityType, OperationKind};
