//! Common types used throughout notesync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of entity a queued operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Note,
    Workspace,
    Attachment,
}

impl EntityType {
    /// Every entity type, in a stable order.
    pub const ALL: [EntityType; 3] = [EntityType::Note, EntityType::Workspace, EntityType::Attachment];

    /// REST resource segment for this entity type.
    pub fn resource(&self) -> &'static str {
        match self {
            EntityType::Note => "notes",
            EntityType::Workspace => "workspaces",
            EntityType::Attachment => "attachments",
        }
    }

    /// Whether the local store keeps a cached projection for this type.
    ///
    /// Attachments are pushed but never cached.
    pub fn is_cached(&self) -> bool {
        !matches!(self, EntityType::Attachment)
    }

    /// Get the string form used in storage and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Note => "note",
            EntityType::Workspace => "workspace",
            EntityType::Attachment => "attachment",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "note" => Ok(EntityType::Note),
            "workspace" => Ok(EntityType::Workspace),
            "attachment" => Ok(EntityType::Attachment),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown entity type '{}'",
                other
            ))),
        }
    }
}

/// Mutation recorded in the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation '{}'",
                other
            ))),
        }
    }
}

/// Sync status of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitySyncStatus {
    /// Matches the last server copy we saw.
    Synced,
    /// Local edits not yet acknowledged by the server.
    Pending,
    /// Local and server copies diverged; awaiting resolution.
    Conflict,
}

impl EntitySyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitySyncStatus::Synced => "synced",
            EntitySyncStatus::Pending => "pending",
            EntitySyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for EntitySyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitySyncStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "synced" => Ok(EntitySyncStatus::Synced),
            "pending" => Ok(EntitySyncStatus::Pending),
            "conflict" => Ok(EntitySyncStatus::Conflict),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown sync status '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_type_resources() {
        assert_eq!(EntityType::Note.resource(), "notes");
        assert_eq!(EntityType::Workspace.resource(), "workspaces");
        assert_eq!(EntityType::Attachment.resource(), "attachments");
    }

    #[test]
    fn test_entity_type_parse() {
        assert_eq!("workspace".parse::<EntityType>().unwrap(), EntityType::Workspace);
        assert!("folder".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_attachments_are_not_cached() {
        assert!(EntityType::Note.is_cached());
        assert!(!EntityType::Attachment.is_cached());
    }

    #[test]
    fn test_operation_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&OperationKind::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
        let kind: OperationKind = serde_json::from_str("\"update\"").unwrap();
        assert_eq!(kind, OperationKind::Update);
    }
}
