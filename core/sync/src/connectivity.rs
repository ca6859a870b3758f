//! Network connectivity signal.

use tokio::sync::watch;
use tracing::info;

/// Holds the online/offline flag and lets observers follow transitions.
///
/// The host (a browser bridge, an OS network listener, a CLI flag) calls
/// [`set_online`](Self::set_online); the engine subscribes to changes.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update connectivity. Returns true if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
        changed
    }

    /// Observe connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
