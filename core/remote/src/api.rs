//! Remote API trait definition.

use async_trait::async_trait;
use serde_json::Value;

use notesync_common::{EntityType, Result};

/// Backend REST surface consumed by the sync engine.
///
/// Every method maps to one HTTP request against `{apiBase}/{resource}`.
/// Error semantics are shared by all implementations:
/// - transport failures map to `Error::Network` (systemic)
/// - 404 maps to `Error::NotFound`
/// - any other non-success status maps to `Error::Api`
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Get the backend name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Whether an API base is configured at all.
    fn is_configured(&self) -> bool {
        true
    }

    /// Liveness probe (`GET /health`). Any 2xx is healthy.
    async fn health(&self) -> Result<()>;

    /// Full list pull (`GET /{resource}`).
    async fn list(&self, entity_type: EntityType) -> Result<Vec<Value>>;

    /// Single entity fetch (`GET /{resource}/{id}`).
    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<Value>;

    /// Create (`POST /{resource}`).
    ///
    /// # Postconditions
    /// - Returns the canonical server entity, which may carry a new id
    async fn create(&self, entity_type: EntityType, data: &Value) -> Result<Value>;

    /// Update (`PUT /{resource}/{id}`).
    ///
    /// Returns the server entity, or `Value::Null` when the backend sent no body.
    async fn update(&self, entity_type: EntityType, id: &str, data: &Value) -> Result<Value>;

    /// Delete (`DELETE /{resource}/{id}`).
    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()>;
}
