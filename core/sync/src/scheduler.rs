//! Delayed job scheduling for backoff retries.
//!
//! The engine never sleeps on its own; it hands a job and a delay to a
//! [`Scheduler`]. [`TokioScheduler`] runs jobs on the tokio runtime, and
//! [`ManualScheduler`] only records them so tests can fire them on demand.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Work to run once a delay elapses.
pub type Job = BoxFuture<'static, ()>;

/// Handle to a scheduled job.
pub trait ScheduledTask: Send + Sync {
    /// Prevent the job from running if it has not started yet.
    fn cancel(&self);
}

/// Schedule-after-delay primitive.
pub trait Scheduler: Send + Sync {
    /// Run `job` after `delay`.
    fn schedule(&self, delay: Duration, job: Job) -> Box<dyn ScheduledTask>;
}

/// Scheduler backed by tokio timers.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

struct TokioTask {
    timer: JoinHandle<()>,
}

impl ScheduledTask for TokioTask {
    fn cancel(&self) {
        self.timer.abort();
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, job: Job) -> Box<dyn ScheduledTask> {
        debug!("Scheduling job in {:?}", delay);
        // The job gets its own task so cancelling the timer after it fired
        // never aborts a job that is already running.
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(job);
        });
        Box::new(TokioTask { timer })
    }
}

struct ManualEntry {
    delay: Duration,
    job: Option<Job>,
    cancelled: Arc<AtomicBool>,
}

struct ManualTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask for ManualTask {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Scheduler that never fires on its own.
///
/// Records every scheduled delay; [`ManualScheduler::fire_next`] runs the
/// oldest job that is neither cancelled nor already fired.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<ManualEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every delay ever scheduled, in order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.entries().iter().map(|e| e.delay).collect()
    }

    /// Delays of jobs still waiting to fire.
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.entries()
            .iter()
            .filter(|e| e.job.is_some() && !e.cancelled.load(Ordering::SeqCst))
            .map(|e| e.delay)
            .collect()
    }

    /// Number of jobs cancelled before firing.
    pub fn cancelled_count(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Run the oldest pending job to completion. Returns false if none.
    pub async fn fire_next(&self) -> bool {
        let job = {
            let mut entries = self.entries();
            entries
                .iter_mut()
                .find(|e| e.job.is_some() && !e.cancelled.load(Ordering::SeqCst))
                .and_then(|e| e.job.take())
        };

        match job {
            Some(job) => {
                job.await;
                true
            }
            None => false,
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, job: Job) -> Box<dyn ScheduledTask> {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.entries().push(ManualEntry {
            delay,
            job: Some(job),
            cancelled: cancelled.clone(),
        });
        Box::new(ManualTask { cancelled })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn counting_job(counter: &Arc<AtomicU32>) -> Job {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_runs_after_delay() {
        let counter = Arc::new(AtomicU32::new(0));
        let _task = TokioScheduler.schedule(Duration::from_secs(30), counting_job(&counter));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = TokioScheduler.schedule(Duration::from_secs(30), counting_job(&counter));
        task.cancel();

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_scheduler_fires_in_order() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        let first = scheduler.schedule(Duration::from_secs(30), counting_job(&counter));
        scheduler.schedule(Duration::from_secs(60), counting_job(&counter));
        first.cancel();

        assert_eq!(
            scheduler.scheduled_delays(),
            vec![Duration::from_secs(30), Duration::from_secs(60)]
        );
        assert_eq!(scheduler.pending_delays(), vec![Duration::from_secs(60)]);
        assert_eq!(scheduler.cancelled_count(), 1);

        assert!(scheduler.fire_next().await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!scheduler.fire_next().await);
        assert!(scheduler.pending_delays().is_empty());
    }
}
