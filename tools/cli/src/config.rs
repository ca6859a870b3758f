//! CLI configuration file and environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use notesync_remote::RemoteConfig;
use notesync_sync::SyncConfig;

/// Environment variable overriding `api_base`.
pub const API_BASE_ENV: &str = "NOTESYNC_API_BASE";
/// Environment variable overriding `token`.
pub const TOKEN_ENV: &str = "NOTESYNC_TOKEN";

const APP_DIR: &str = "notesync";
const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "notesync.db";

/// Settings read from `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub api_base: Option<String>,
    pub token: Option<String>,
    /// Where the local database lives. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    pub sync: SyncConfig,
}

impl CliConfig {
    /// `<data dir>/notesync/config.json`, if the platform has a data directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load the config file.
    ///
    /// An explicitly given path must exist; a missing default file yields
    /// the default config.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply `NOTESYNC_API_BASE` / `NOTESYNC_TOKEN` from the environment.
    pub fn with_env(self) -> Self {
        self.with_overrides(std::env::var(API_BASE_ENV).ok(), std::env::var(TOKEN_ENV).ok())
    }

    /// Replace connection settings with any non-empty override.
    pub fn with_overrides(mut self, api_base: Option<String>, token: Option<String>) -> Self {
        if let Some(api_base) = api_base.filter(|v| !v.trim().is_empty()) {
            self.api_base = Some(api_base);
        }
        if let Some(token) = token.filter(|v| !v.trim().is_empty()) {
            self.token = Some(token);
        }
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE)
    }

    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            api_base: self.api_base.clone(),
            token: self.token.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "api_base": "https://notes.example.com/api",
                "data_dir": "/tmp/notesync-test",
                "sync": { "detect_conflicts": true }
            }"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();

        assert_eq!(config.api_base.as_deref(), Some("https://notes.example.com/api"));
        assert!(config.token.is_none());
        assert_eq!(config.database_path(), PathBuf::from("/tmp/notesync-test/notesync.db"));
        assert!(config.sync.detect_conflicts);
        assert_eq!(config.sync.probe_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(CliConfig::load(Some(&dir.path().join("absent.json"))).is_err());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = CliConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let config = CliConfig {
            api_base: Some("https://old.example.com".to_string()),
            token: Some("old".to_string()),
            ..Default::default()
        }
        .with_overrides(Some("https://new.example.com".to_string()), Some(" ".to_string()));

        let remote = config.remote_config();
        assert_eq!(remote.api_base.as_deref(), Some("https://new.example.com"));
        assert_eq!(remote.token.as_deref(), Some("old"));
    }
}
