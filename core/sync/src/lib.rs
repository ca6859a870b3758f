//! notesync sync engine
//!
//! This module keeps a local-first note store converged with the backend:
//! - A FIFO queue of local mutations drained to the REST API in order
//! - A pull phase that brings server notes and workspaces into the store
//! - Per-operation retry counts and run-level exponential backoff
//! - Single-flight runs triggered manually, at startup, on reconnect
//!   and by backoff timers
//! - Status snapshots published to listeners
//! - Conflict resolution (local, server, merge)

pub mod availability;
pub mod broadcast;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use availability::{Availability, AvailabilityProber};
pub use broadcast::{Listener, StatusBroadcaster, Subscription};
pub use config::SyncConfig;
pub use conflict::{ConflictResolver, ConflictStrategy, Resolution};
pub use connectivity::ConnectivityMonitor;
pub use engine::{BackgroundTask, SyncEngine, SyncEngineBuilder, Trigger};
pub use queue::{QueueDecision, Revived};
pub use retry::BackoffPolicy;
pub use scheduler::{Job, ManualScheduler, ScheduledTask, Scheduler, TokioScheduler};
pub use state::{SkipReason, StatusIndicator, SyncOutcome, SyncReport, SyncStatus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _backoff = BackoffPolicy::default();
        let _broadcaster = StatusBroadcaster::new();
        let _connectivity = ConnectivityMonitor::default();
        let _scheduler = ManualScheduler::new();
    }
}
