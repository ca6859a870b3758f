//! In-memory backend for testing.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::api::RemoteApi;
use notesync_common::{entity_id_of, EntityType, Error, Result};

#[derive(Debug, Default)]
struct State {
    entities: HashMap<EntityType, BTreeMap<String, Value>>,
    /// Statuses to answer the next mutating requests with, in order.
    failures: VecDeque<u16>,
    requests: Vec<String>,
    id_suffix: Option<String>,
    health_delay: Option<Duration>,
}

/// In-memory stand-in for the notes backend.
///
/// Behaves like the REST API: creates stamp `updatedAt`, unknown ids answer
/// 404, and every call is recorded as `"METHOD resource[/id]"`. Outages and
/// per-request failures can be injected. Clones share the same server.
#[derive(Debug, Clone, Default)]
pub struct MemoryApi {
    state: Arc<Mutex<State>>,
    unreachable: Arc<AtomicBool>,
    flaky: Arc<AtomicBool>,
}

impl MemoryApi {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `suffix` to client-supplied ids on create, the way a server
    /// that assigns its own ids would.
    pub fn with_id_suffix(self, suffix: impl Into<String>) -> Self {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .id_suffix = Some(suffix.into());
        self
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("Memory backend lock poisoned".to_string()))
    }

    /// Simulate a transport outage: every request fails with a network error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Let `GET /health` succeed while every other request fails with a
    /// network error, like a backend whose load balancer answers but whose
    /// application servers are down.
    pub fn set_flaky(&self, flaky: bool) {
        self.flaky.store(flaky, Ordering::SeqCst);
    }

    /// Answer the next create/update/delete with `status` instead of handling it.
    pub fn fail_next(&self, status: u16) -> Result<()> {
        self.state()?.failures.push_back(status);
        Ok(())
    }

    /// Make `GET /health` take this long before answering.
    pub fn set_health_delay(&self, delay: Duration) -> Result<()> {
        self.state()?.health_delay = Some(delay);
        Ok(())
    }

    /// Seed or overwrite a server entity. The body must carry an `id`.
    pub fn insert(&self, entity_type: EntityType, entity: Value) -> Result<()> {
        let id = entity_id_of(&entity)
            .ok_or_else(|| Error::InvalidInput("Entity is missing an 'id' field".to_string()))?;
        self.state()?
            .entities
            .entry(entity_type)
            .or_default()
            .insert(id, entity);
        Ok(())
    }

    /// Remove a server entity, as another device would.
    pub fn remove(&self, entity_type: EntityType, id: &str) -> Result<Option<Value>> {
        Ok(self
            .state()?
            .entities
            .get_mut(&entity_type)
            .and_then(|entities| entities.remove(id)))
    }

    /// Get a server entity.
    pub fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Value>> {
        Ok(self
            .state()?
            .entities
            .get(&entity_type)
            .and_then(|entities| entities.get(id))
            .cloned())
    }

    /// Number of server entities of a type.
    pub fn count(&self, entity_type: EntityType) -> Result<usize> {
        Ok(self
            .state()?
            .entities
            .get(&entity_type)
            .map_or(0, BTreeMap::len))
    }

    /// Every request received so far.
    pub fn requests(&self) -> Result<Vec<String>> {
        Ok(self.state()?.requests.clone())
    }

    /// Number of requests whose method matches.
    pub fn request_count(&self, method: &str) -> Result<usize> {
        let prefix = format!("{} ", method);
        Ok(self
            .state()?
            .requests
            .iter()
            .filter(|r| r.starts_with(&prefix))
            .count())
    }

    /// Record the request and apply outage / injected failure rules.
    fn begin(&self, request: String, mutating: bool) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state()?;
        let is_health = request == "GET health";
        state.requests.push(request);

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Network("Connection refused".to_string()));
        }

        if !is_health && self.flaky.load(Ordering::SeqCst) {
            return Err(Error::Network("Connection reset by peer".to_string()));
        }

        if mutating {
            if let Some(status) = state.failures.pop_front() {
                return Err(if status == 404 {
                    Error::NotFound("Resource not found".to_string())
                } else {
                    Error::Api {
                        status,
                        message: "Injected failure".to_string(),
                    }
                });
            }
        }

        Ok(state)
    }
}

fn now_stamp() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[async_trait]
impl RemoteApi for MemoryApi {
    fn name(&self) -> &str {
        "memory"
    }

    async fn health(&self) -> Result<()> {
        let delay = {
            let state = self.begin("GET health".to_string(), false)?;
            state.health_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Value>> {
        let state = self.begin(format!("GET {}", entity_type.resource()), false)?;
        Ok(state
            .entities
            .get(&entity_type)
            .map(|entities| entities.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<Value> {
        let state = self.begin(format!("GET {}/{}", entity_type.resource(), id), false)?;
        state
            .entities
            .get(&entity_type)
            .and_then(|entities| entities.get(id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} {} not found", entity_type, id)))
    }

    async fn create(&self, entity_type: EntityType, data: &Value) -> Result<Value> {
        let mut state = self.begin(format!("POST {}", entity_type.resource()), true)?;

        let id = match (entity_id_of(data), &state.id_suffix) {
            (Some(id), Some(suffix)) => format!("{}{}", id, suffix),
            (Some(id), None) => id,
            (None, _) => Uuid::new_v4().to_string(),
        };

        let mut entity = match data {
            Value::Object(map) => Value::Object(map.clone()),
            _ => Value::Object(serde_json::Map::new()),
        };
        entity["id"] = Value::String(id.clone());
        entity["updatedAt"] = now_stamp();

        state
            .entities
            .entry(entity_type)
            .or_default()
            .insert(id, entity.clone());
        Ok(entity)
    }

    async fn update(&self, entity_type: EntityType, id: &str, data: &Value) -> Result<Value> {
        let mut state = self.begin(format!("PUT {}/{}", entity_type.resource(), id), true)?;

        let existing = state
            .entities
            .get_mut(&entity_type)
            .and_then(|entities| entities.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{} {} not found", entity_type, id)))?;

        if let (Value::Object(target), Value::Object(fields)) = (&mut *existing, data) {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        existing["id"] = Value::String(id.to_string());
        existing["updatedAt"] = now_stamp();
        Ok(existing.clone())
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        let mut state = self.begin(format!("DELETE {}/{}", entity_type.resource(), id), true)?;
        state
            .entities
            .get_mut(&entity_type)
            .and_then(|entities| entities.remove(id))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{} {} not found", entity_type, id)))
    }
}
