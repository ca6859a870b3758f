//! Sync status snapshots and run outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use notesync_common::SyncOperation;

/// Snapshot of the engine's state, computed on demand and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    /// End of the last run that completed without a systemic failure.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Queue entries still eligible for automatic retry.
    pub pending_operations: usize,
    /// Queue entries that reached the retry limit.
    pub failed_operations: usize,
    /// Whether an API base is set at all.
    pub backend_configured: bool,
}

impl SyncStatus {
    /// Split a queue into pending and failed counts.
    pub fn count_queue(queue: &[SyncOperation]) -> (usize, usize) {
        let failed = queue.iter().filter(|op| op.is_failed()).count();
        (queue.len() - failed, failed)
    }

    /// What a status indicator should show.
    pub fn indicator(&self) -> StatusIndicator {
        if !self.is_online {
            StatusIndicator::Offline
        } else if !self.backend_configured {
            StatusIndicator::NoBackend
        } else if self.is_syncing {
            StatusIndicator::Syncing
        } else if self.failed_operations > 0 {
            StatusIndicator::Failed
        } else if self.pending_operations > 0 {
            StatusIndicator::Pending
        } else {
            StatusIndicator::Synced
        }
    }
}

/// User-facing summary of a [`SyncStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusIndicator {
    Offline,
    /// Online, but no backend has been configured.
    NoBackend,
    Syncing,
    /// Some operations exhausted their retries.
    Failed,
    Pending,
    Synced,
}

impl fmt::Display for StatusIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusIndicator::Offline => "offline",
            StatusIndicator::NoBackend => "no backend configured",
            StatusIndicator::Syncing => "syncing",
            StatusIndicator::Failed => "sync failed",
            StatusIndicator::Pending => "pending",
            StatusIndicator::Synced => "synced",
        };
        f.write_str(label)
    }
}

/// Counters from one completed sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Queue entries applied remotely and removed.
    pub pushed: usize,
    /// Queue entries that failed this run and stay queued.
    pub failed: usize,
    /// Entities written locally by the pull phase.
    pub pulled: usize,
    /// Entities flagged as conflicts by the pull phase.
    pub conflicts: usize,
    pub duration: Duration,
}

/// Why a sync run did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
    NotConfigured,
    Unreachable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::Offline => "offline",
            SkipReason::AlreadyRunning => "a sync is already running",
            SkipReason::NotConfigured => "no backend configured",
            SkipReason::Unreachable => "backend unreachable",
        };
        f.write_str(reason)
    }
}

/// Result of asking the engine to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_common::{EntityType, OperationKind, MAX_RETRIES};
    use serde_json::Value;

    fn status() -> SyncStatus {
        SyncStatus {
            is_online: true,
            is_syncing: false,
            last_sync_time: None,
            pending_operations: 0,
            failed_operations: 0,
            backend_configured: true,
        }
    }

    #[test]
    fn test_count_queue() {
        let mut failed = SyncOperation::new(OperationKind::Update, EntityType::Note, "a", Value::Null);
        failed.retry_count = MAX_RETRIES;
        let pending = SyncOperation::new(OperationKind::Create, EntityType::Note, "b", Value::Null);
        let retried = SyncOperation {
            retry_count: 2,
            ..pending.clone()
        };

        assert_eq!(SyncStatus::count_queue(&[failed, pending, retried]), (2, 1));
        assert_eq!(SyncStatus::count_queue(&[]), (0, 0));
    }

    #[test]
    fn test_indicator_priority() {
        assert_eq!(status().indicator(), StatusIndicator::Synced);

        let pending = SyncStatus {
            pending_operations: 2,
            ..status()
        };
        assert_eq!(pending.indicator(), StatusIndicator::Pending);

        let failed = SyncStatus {
            failed_operations: 1,
            ..pending.clone()
        };
        assert_eq!(failed.indicator(), StatusIndicator::Failed);

        let syncing = SyncStatus {
            is_syncing: true,
            ..failed.clone()
        };
        assert_eq!(syncing.indicator(), StatusIndicator::Syncing);

        let unconfigured = SyncStatus {
            backend_configured: false,
            ..syncing.clone()
        };
        assert_eq!(unconfigured.indicator(), StatusIndicator::NoBackend);

        let offline = SyncStatus {
            is_online: false,
            ..unconfigured
        };
        assert_eq!(offline.indicator(), StatusIndicator::Offline);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let json = serde_json::to_value(status()).unwrap();
        assert_eq!(json["pendingOperations"], 0);
        assert_eq!(json["isOnline"], true);
        assert!(json["lastSyncTime"].is_null());
    }
}
