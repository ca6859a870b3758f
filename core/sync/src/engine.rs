//! Core sync engine that orchestrates all sync operations.

use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chrono::Utc;
use serde_json::Value;

use notesync_common::{
    CachedEntity, EntitySyncStatus, EntityType, Error, OperationKind, Result, SyncOperation,
};
use notesync_remote::RemoteApi;
use notesync_store::LocalStore;

use crate::availability::AvailabilityProber;
use crate::broadcast::{StatusBroadcaster, Subscription};
use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, ConflictStrategy, Resolution};
use crate::connectivity::ConnectivityMonitor;
use crate::queue::{self, QueueDecision, Revived};
use crate::scheduler::{Job, ScheduledTask, Scheduler, TokioScheduler};
use crate::state::{SkipReason, SyncOutcome, SyncReport, SyncStatus};

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// `force_sync` from the host.
    Manual,
    /// Backend reported reachable when the engine started.
    Startup,
    /// Connectivity came back.
    Reconnect,
    /// Backoff timer after a failed run.
    Backoff,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::Manual => "manual",
            Trigger::Startup => "startup",
            Trigger::Reconnect => "reconnect",
            Trigger::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Holds the single-flight flag for the duration of a run.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
    connectivity: Option<Arc<ConnectivityMonitor>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl SyncEngineBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a connectivity monitor driven by the host. Defaults to one
    /// that starts online.
    pub fn connectivity(mut self, connectivity: Arc<ConnectivityMonitor>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Timer used for backoff retries. Defaults to [`TokioScheduler`].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Arc<SyncEngine> {
        let prober = AvailabilityProber::new(self.remote.clone(), self.config.probe_timeout);
        let resolver = ConflictResolver::new(self.store.clone(), self.remote.clone());

        Arc::new_cyclic(|this| SyncEngine {
            store: self.store,
            remote: self.remote,
            config: self.config,
            connectivity: self
                .connectivity
                .unwrap_or_else(|| Arc::new(ConnectivityMonitor::default())),
            scheduler: self.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler)),
            prober,
            resolver,
            broadcaster: StatusBroadcaster::new(),
            syncing: AtomicBool::new(false),
            pending_retry: Mutex::new(None),
            this: this.clone(),
        })
    }
}

/// Sync orchestrator.
///
/// Drains the local operation queue to the backend, pulls server state
/// into the local store, and retries with exponential backoff after
/// systemic failures. At most one run is active at a time; concurrent
/// triggers are dropped.
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
    connectivity: Arc<ConnectivityMonitor>,
    scheduler: Arc<dyn Scheduler>,
    prober: AvailabilityProber,
    resolver: ConflictResolver,
    broadcaster: StatusBroadcaster,
    /// Single-flight lock.
    syncing: AtomicBool,
    /// At most one backoff timer is pending.
    pending_retry: Mutex<Option<Box<dyn ScheduledTask>>>,
    this: Weak<SyncEngine>,
}

impl SyncEngine {
    /// Start building an engine over a store and a backend.
    pub fn builder(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteApi>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            remote,
            config: SyncConfig::default(),
            connectivity: None,
            scheduler: None,
        }
    }

    /// Build an engine with default configuration, connectivity and timers.
    pub fn new(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteApi>) -> Arc<Self> {
        Self::builder(store, remote).build()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The connectivity monitor the engine follows.
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Compose a status snapshot. Has no side effects.
    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let queue = self.store.sync_queue().await?;
        let (pending_operations, failed_operations) = SyncStatus::count_queue(&queue);

        Ok(SyncStatus {
            is_online: self.connectivity.is_online(),
            is_syncing: self.is_syncing(),
            last_sync_time: self.store.last_sync_time().await?,
            pending_operations,
            failed_operations,
            backend_configured: self.remote.is_configured(),
        })
    }

    /// Register a status listener. Dropping the subscription removes it.
    pub fn add_sync_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(listener)
    }

    /// Publish a fresh snapshot to every listener.
    pub async fn notify(&self) {
        match self.sync_status().await {
            Ok(status) => self.broadcaster.publish(&status),
            Err(e) => warn!("Failed to compute sync status: {}", e),
        }
    }

    /// Run a sync now.
    ///
    /// Permanently failed operations get a fresh set of retries first.
    ///
    /// # Errors
    /// - `Offline` when connectivity is down
    /// - Any error that aborted the run; a backoff retry is scheduled
    pub async fn force_sync(&self) -> Result<SyncOutcome> {
        if !self.connectivity.is_online() {
            return Err(Error::Offline);
        }
        self.run(Trigger::Manual).await
    }

    /// Queue a local change for the next run.
    ///
    /// Does not touch the cached projection except when a delete cancels an
    /// entity that never reached the server, in which case the projection
    /// is dropped too.
    pub async fn queue_change(
        &self,
        operation: OperationKind,
        entity_type: EntityType,
        entity_id: &str,
        data: Value,
    ) -> Result<QueueDecision> {
        let decision = queue::enqueue(self.store.as_ref(), operation, entity_type, entity_id, data).await?;

        if matches!(decision, QueueDecision::Dropped { .. }) && entity_type.is_cached() {
            self.store.delete_entity(entity_type, entity_id).await?;
            debug!("{} {} never reached the server, dropped locally", entity_type, entity_id);
        }

        self.notify().await;
        Ok(decision)
    }

    /// Apply a local edit to the cache and queue it.
    ///
    /// Creates and updates store the payload as a pending projection;
    /// deletes remove the projection right away.
    pub async fn apply_local_change(
        &self,
        operation: OperationKind,
        entity_type: EntityType,
        entity_id: &str,
        data: Value,
    ) -> Result<QueueDecision> {
        if entity_type.is_cached() {
            match operation {
                OperationKind::Create | OperationKind::Update => {
                    let mut entity = CachedEntity::pending(entity_id, data.clone());
                    if entity.updated_at.is_none() {
                        if let Some(existing) = self.store.get_entity(entity_type, entity_id).await? {
                            entity.updated_at = existing.updated_at;
                        }
                    }
                    self.store.save_entity(entity_type, entity).await?;
                }
                OperationKind::Delete => {
                    self.store.delete_entity(entity_type, entity_id).await?;
                }
            }
        }

        self.queue_change(operation, entity_type, entity_id, data).await
    }

    /// Cached entities currently flagged as conflicts.
    pub async fn conflicts(&self) -> Result<Vec<(EntityType, CachedEntity)>> {
        self.resolver.conflicts().await
    }

    /// Resolve a conflicted entity. Never runs a sync.
    pub async fn resolve_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        strategy: ConflictStrategy,
    ) -> Result<Resolution> {
        let resolution = self.resolver.resolve(entity_type, entity_id, strategy).await?;
        self.notify().await;
        Ok(resolution)
    }

    /// Give permanently failed operations a fresh set of retries.
    pub async fn retry_failed(&self) -> Result<Revived> {
        let revived = queue::revive_failed(self.store.as_ref()).await?;
        info!(
            "Requeued {} failed operation(s), discarded {} superseded",
            revived.requeued, revived.discarded
        );
        self.notify().await;
        Ok(revived)
    }

    /// Remove permanently failed operations.
    pub async fn discard_failed(&self) -> Result<usize> {
        let removed = queue::discard_failed(self.store.as_ref()).await?;
        info!("Discarded {} failed operation(s)", removed);
        self.notify().await;
        Ok(removed)
    }

    /// Follow connectivity in the background.
    ///
    /// Syncs once at start (backing off while the backend does not answer),
    /// then on every offline to online transition. Publishes status on
    /// every connectivity change.
    pub fn start(self: &Arc<Self>) -> BackgroundTask {
        let engine = self.clone();
        let mut rx = self.connectivity.subscribe();

        let handle = tokio::spawn(async move {
            let mut online = *rx.borrow_and_update();
            engine.startup().await;

            while rx.changed().await.is_ok() {
                let now_online = *rx.borrow_and_update();
                engine.notify().await;

                if now_online && !online {
                    engine.prober.invalidate();
                    engine.run_logged(Trigger::Reconnect).await;
                }
                online = now_online;
            }
        });

        BackgroundTask {
            handle,
            engine: Arc::downgrade(self),
        }
    }

    async fn startup(&self) {
        self.notify().await;

        if !self.connectivity.is_online() {
            info!("Starting offline, waiting for connectivity");
            return;
        }

        self.run_logged(Trigger::Startup).await;
    }

    // Boxed: backoff jobs call back into `run`, which schedules them.
    fn run_logged(&self, trigger: Trigger) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match self.run(trigger).await {
                Ok(SyncOutcome::Completed(_)) => {}
                Ok(SyncOutcome::Skipped(reason)) => {
                    debug!("Sync ({}) skipped: {}", trigger, reason)
                }
                // Already logged and scheduled for retry.
                Err(_) => {}
            }
        })
    }

    /// One sync run: drain, then pull.
    async fn run(&self, trigger: Trigger) -> Result<SyncOutcome> {
        if !self.connectivity.is_online() {
            return Ok(SyncOutcome::Skipped(SkipReason::Offline));
        }

        let Some(guard) = RunGuard::acquire(&self.syncing) else {
            debug!("Sync ({}) requested while another run is active", trigger);
            return Ok(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        if !self.remote.is_configured() {
            return Ok(SyncOutcome::Skipped(SkipReason::NotConfigured));
        }

        if !self.prober.ensure_reachable().await {
            // Unreachable counts as a systemic failure and backs off.
            drop(guard);
            if let Err(e) = self.schedule_backoff().await {
                error!("Failed to schedule sync retry: {}", e);
            }
            return Ok(SyncOutcome::Skipped(SkipReason::Unreachable));
        }

        info!("Starting sync ({}) against {}", trigger, self.remote.name());
        self.notify().await;

        let start = Instant::now();
        let mut report = SyncReport::default();
        let result = self.execute(trigger, &mut report).await;
        report.duration = start.elapsed();

        match result {
            Ok(()) => {
                let finished = self.record_success().await;
                drop(guard);
                self.notify().await;
                finished?;

                info!(
                    "Sync completed in {:?}: {} pushed, {} failed, {} pulled, {} conflicts",
                    report.duration, report.pushed, report.failed, report.pulled, report.conflicts
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                error!("Sync ({}) failed after {:?}: {}", trigger, report.duration, e);
                if e.is_systemic() {
                    self.prober.invalidate();
                }
                drop(guard);
                self.notify().await;

                if let Err(backoff_err) = self.schedule_backoff().await {
                    error!("Failed to schedule sync retry: {}", backoff_err);
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, trigger: Trigger, report: &mut SyncReport) -> Result<()> {
        // Only an explicit sync gives permanently failed entries another go.
        if trigger == Trigger::Manual {
            let revived = queue::revive_failed(self.store.as_ref()).await?;
            if revived.requeued + revived.discarded > 0 {
                info!(
                    "Manual sync requeued {} failed operation(s), discarded {} superseded",
                    revived.requeued, revived.discarded
                );
            }
        }

        self.drain(report).await?;
        self.pull(report).await
    }

    async fn record_success(&self) -> Result<()> {
        self.cancel_pending_retry();
        self.store.set_last_sync_time(Utc::now()).await?;
        self.store.set_backoff_attempts(0).await
    }

    /// Push queued operations in order. Entries are re-read after each
    /// push so that retargeted ids are picked up.
    ///
    /// Entries for one entity go out strictly in order: once an entry fails
    /// (now or permanently) the entity's later entries wait for a later run.
    async fn drain(&self, report: &mut SyncReport) -> Result<()> {
        let mut attempted = HashSet::new();
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();

        loop {
            let mut next = None;
            for op in self.store.sync_queue().await? {
                if attempted.contains(&op.id) {
                    continue;
                }
                let key = (op.entity_type, op.entity_id.clone());
                if blocked.contains(&key) {
                    continue;
                }
                if op.is_failed() {
                    blocked.insert(key);
                    continue;
                }
                next = Some(op);
                break;
            }

            let Some(op) = next else {
                return Ok(());
            };
            attempted.insert(op.id.clone());

            match self.dispatch(&op).await {
                Ok(()) => {
                    self.store.remove_sync_operation(&op.id).await?;
                    report.pushed += 1;
                }
                Err(e) if e.is_systemic() => return Err(e),
                Err(e) => {
                    let updated = self.store.increment_retry_count(&op.id, &e.to_string()).await?;
                    warn!(
                        "Failed to {} {} {} (attempt {}): {}",
                        op.operation, op.entity_type, op.entity_id, updated.retry_count, e
                    );
                    report.failed += 1;
                    blocked.insert((op.entity_type, op.entity_id.clone()));
                }
            }
        }
    }

    async fn dispatch(&self, op: &SyncOperation) -> Result<()> {
        debug!("Pushing {} {} {}", op.operation, op.entity_type, op.entity_id);

        match op.operation {
            OperationKind::Create => self.push_create(op).await,
            OperationKind::Update => {
                match self.remote.update(op.entity_type, &op.entity_id, &op.data).await {
                    Ok(ack) => self.apply_ack(op, ack).await,
                    Err(e) if e.is_not_found() => {
                        debug!("{} {} missing on server, creating it", op.entity_type, op.entity_id);
                        self.push_create(op).await
                    }
                    Err(e) => Err(e),
                }
            }
            OperationKind::Delete => {
                match self.remote.delete(op.entity_type, &op.entity_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!("{} {} already deleted on server", op.entity_type, op.entity_id);
                    }
                    Err(e) => return Err(e),
                }
                if op.entity_type.is_cached() {
                    self.store.delete_entity(op.entity_type, &op.entity_id).await?;
                }
                Ok(())
            }
        }
    }

    async fn push_create(&self, op: &SyncOperation) -> Result<()> {
        let body = with_id(op.data.clone(), &op.entity_id);
        let ack = self.remote.create(op.entity_type, &body).await?;
        self.apply_ack(op, ack).await
    }

    /// Overwrite the local projection with the server's acknowledgement.
    async fn apply_ack(&self, op: &SyncOperation, ack: Value) -> Result<()> {
        if !op.entity_type.is_cached() {
            return Ok(());
        }

        let entity = match ack {
            // Empty body: the server accepted the payload as sent.
            Value::Null => {
                if let Some(mut local) = self.store.get_entity(op.entity_type, &op.entity_id).await? {
                    local.mark_synced();
                    self.store.save_entity(op.entity_type, local).await?;
                }
                return Ok(());
            }
            Value::Object(_) => CachedEntity::from_remote(with_id(ack, &op.entity_id))?,
            other => {
                return Err(Error::Serialization(format!(
                    "Unexpected response body for {} {}: {}",
                    op.entity_type, op.entity_id, other
                )))
            }
        };

        if entity.id != op.entity_id {
            self.store.delete_entity(op.entity_type, &op.entity_id).await?;
            let moved = self
                .store
                .retarget_operations(op.entity_type, &op.entity_id, &entity.id)
                .await?;
            info!(
                "Server assigned id {} to {} {} ({} queued operation(s) retargeted)",
                entity.id, op.entity_type, op.entity_id, moved
            );
        }

        self.store.save_entity(op.entity_type, entity).await
    }

    /// Bring server notes and workspaces into the local store.
    async fn pull(&self, report: &mut SyncReport) -> Result<()> {
        for entity_type in EntityType::ALL.into_iter().filter(EntityType::is_cached) {
            let items = self.remote.list(entity_type).await?;
            debug!("Pulled {} {} entities", items.len(), entity_type);

            for item in items {
                let remote = match CachedEntity::from_remote(item) {
                    Ok(entity) => entity,
                    Err(e) => {
                        warn!("Skipping server {}: {}", entity_type, e);
                        continue;
                    }
                };

                let Some(mut local) = self.store.get_entity(entity_type, &remote.id).await? else {
                    self.store.save_entity(entity_type, remote).await?;
                    report.pulled += 1;
                    continue;
                };

                if !local.is_older_than(&remote) {
                    continue;
                }

                if self.config.detect_conflicts && local.sync_status != EntitySyncStatus::Synced {
                    if local.sync_status == EntitySyncStatus::Pending {
                        info!("Conflict on {} {}: server copy is newer", entity_type, local.id);
                        local.mark_conflict();
                        self.store.save_entity(entity_type, local).await?;
                        report.conflicts += 1;
                    }
                    continue;
                }

                self.store.save_entity(entity_type, remote).await?;
                report.pulled += 1;
            }
        }
        Ok(())
    }

    fn pending_retry(&self) -> MutexGuard<'_, Option<Box<dyn ScheduledTask>>> {
        self.pending_retry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_pending_retry(&self) {
        if let Some(task) = self.pending_retry().take() {
            task.cancel();
        }
    }

    /// Schedule the next automatic retry and bump the backoff counter.
    async fn schedule_backoff(&self) -> Result<()> {
        let attempts = self.store.backoff_attempts().await?;
        let delay = self.config.backoff.delay_for_attempt(attempts);
        self.store.set_backoff_attempts(attempts.saturating_add(1)).await?;

        let engine = self.this.clone();
        let job: Job = Box::pin(async move {
            if let Some(engine) = engine.upgrade() {
                engine.run_logged(Trigger::Backoff).await;
            }
        });

        let mut pending = self.pending_retry();
        if let Some(previous) = pending.take() {
            previous.cancel();
        }
        *pending = Some(self.scheduler.schedule(delay, job));

        warn!("Retrying sync in {:?} (attempt {})", delay, attempts + 1);
        Ok(())
    }
}

/// Ensure an entity body carries its id.
fn with_id(data: Value, id: &str) -> Value {
    match data {
        Value::Object(mut map) => {
            map.entry("id").or_insert_with(|| Value::String(id.to_string()));
            Value::Object(map)
        }
        Value::Null => serde_json::json!({ "id": id }),
        other => other,
    }
}

/// Handle to the task started by [`SyncEngine::start`].
///
/// Stops the task and cancels any pending retry on shutdown or drop.
pub struct BackgroundTask {
    handle: JoinHandle<()>,
    engine: Weak<SyncEngine>,
}

impl BackgroundTask {
    pub fn shutdown(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(engine) = self.engine.upgrade() {
            engine.cancel_pending_retry();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_guard_is_exclusive() {
        let flag = AtomicBool::new(false);

        let guard = RunGuard::acquire(&flag).unwrap();
        assert!(RunGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(RunGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_with_id_only_fills_missing_id() {
        assert_eq!(with_id(json!({ "title": "x" }), "n1"), json!({ "id": "n1", "title": "x" }));
        assert_eq!(with_id(json!({ "id": "keep" }), "n1"), json!({ "id": "keep" }));
        assert_eq!(with_id(Value::Null, "n1"), json!({ "id": "n1" }));
    }

    #[test]
    fn test_trigger_display() {
        assert_eq!(Trigger::Backoff.to_string(), "backoff");
        assert_eq!(Trigger::Reconnect.to_string(), "reconnect");
    }
}
