//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::BackoffPolicy;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on the `GET /health` availability probe.
    pub probe_timeout: Duration,
    /// Delays between automatic retries after systemic failures.
    pub backoff: BackoffPolicy,
    /// Flag pending local copies that are older than the server copy as
    /// conflicts during pull, instead of overwriting them.
    pub detect_conflicts: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            detect_conflicts: false,
        }
    }
}

impl SyncConfig {
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_conflict_detection(mut self, enabled: bool) -> Self {
        self.detect_conflicts = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert!(!config.detect_conflicts);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{ "detect_conflicts": true }"#).unwrap();
        assert!(config.detect_conflicts);
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
    }
}
