//! Backend reachability probing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use notesync_remote::RemoteApi;

/// Last known reachability of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Not probed yet, or invalidated by a transport failure.
    Unknown,
    Reachable,
    Unreachable,
}

impl Availability {
    fn to_u8(self) -> u8 {
        match self {
            Availability::Unknown => 0,
            Availability::Reachable => 1,
            Availability::Unreachable => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Availability::Reachable,
            2 => Availability::Unreachable,
            _ => Availability::Unknown,
        }
    }
}

/// Checks whether the backend answers, independent of raw connectivity.
pub struct AvailabilityProber {
    remote: Arc<dyn RemoteApi>,
    timeout: Duration,
    state: AtomicU8,
}

impl AvailabilityProber {
    pub fn new(remote: Arc<dyn RemoteApi>, timeout: Duration) -> Self {
        Self {
            remote,
            timeout,
            state: AtomicU8::new(Availability::Unknown.to_u8()),
        }
    }

    pub fn availability(&self) -> Availability {
        Availability::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, availability: Availability) {
        self.state.store(availability.to_u8(), Ordering::SeqCst);
    }

    /// Forget the last result so the next run probes again.
    pub fn invalidate(&self) {
        self.set(Availability::Unknown);
    }

    /// Probe `GET /health`, giving up after the configured timeout.
    pub async fn probe(&self) -> bool {
        if !self.remote.is_configured() {
            debug!("No backend configured, skipping probe");
            self.set(Availability::Unreachable);
            return false;
        }

        let reachable = match tokio::time::timeout(self.timeout, self.remote.health()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Backend health check failed: {}", e);
                false
            }
            Err(_) => {
                warn!("Backend health check timed out after {:?}", self.timeout);
                false
            }
        };

        self.set(if reachable {
            Availability::Reachable
        } else {
            Availability::Unreachable
        });
        reachable
    }

    /// Reachable without probing when already known-good, else probe.
    pub async fn ensure_reachable(&self) -> bool {
        if self.availability() == Availability::Reachable {
            return true;
        }
        self.probe().await
    }
}
