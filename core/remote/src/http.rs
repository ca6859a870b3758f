//! HTTP client for the notes backend.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use notesync_common::{EntityType, Error, Result};

use crate::api::RemoteApi;

/// Characters left unescaped in entity ids placed in a URL path.
const ID_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Default user agent sent with every request.
const USER_AGENT: &str = concat!("notesync/", env!("CARGO_PKG_VERSION"));

/// Connection settings for the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// API base URL, e.g. `https://notes.example.com/api`. `None` means no
    /// backend is configured.
    pub api_base: Option<String>,
    /// Bearer token attached to every request when present.
    #[serde(default)]
    pub token: Option<String>,
}

impl RemoteConfig {
    /// Config pointing at the given base URL.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: Some(api_base.into()),
            token: None,
        }
    }

    /// Set the bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Backend client over reqwest.
pub struct HttpApi {
    http: Client,
    base: Option<Url>,
    token: Option<String>,
}

impl HttpApi {
    /// Create a new HTTP client.
    ///
    /// # Errors
    /// - `api_base` is not a valid absolute URL
    /// - The HTTP client could not be built
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let base = config
            .api_base
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                Url::parse(s).map_err(|e| Error::InvalidInput(format!("Invalid API base '{}': {}", s, e)))
            })
            .transpose()?;

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base,
            token: config.token.filter(|t| !t.is_empty()),
        })
    }

    /// Build `{apiBase}/{segments...}`.
    fn url(&self, segments: &[&str]) -> Result<String> {
        let base = self.base.as_ref().ok_or(Error::NotConfigured)?;
        Ok(join_url(base, segments))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        debug!("{} {}", method, url);
        let request = self
            .http
            .request(method, url)
            .header(header::ACCEPT, "application/json");

        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Request failed: {}", e)))
    }

    /// Map non-success statuses to errors and decode the JSON body.
    ///
    /// An empty body decodes to `Value::Null`.
    async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        check_status(status, &response_text(response, status).await?)
    }
}

async fn response_text(response: reqwest::Response, status: StatusCode) -> Result<String> {
    response
        .text()
        .await
        .map_err(|e| Error::Network(format!("Failed to read {} response: {}", status, e)))
}

/// Classify a status/body pair the way every endpoint expects.
pub(crate) fn check_status(status: StatusCode, body: &str) -> Result<Value> {
    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(body)
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
    } else if status == StatusCode::NOT_FOUND {
        Err(Error::NotFound("Resource not found".to_string()))
    } else {
        Err(Error::Api {
            status: status.as_u16(),
            message: body.trim().to_string(),
        })
    }
}

pub(crate) fn join_url(base: &Url, segments: &[&str]) -> String {
    let mut url = base.as_str().trim_end_matches('/').to_string();
    for segment in segments {
        url.push('/');
        url.extend(utf8_percent_encode(segment, ID_ENCODE_SET));
    }
    url
}

/// Accept either a bare array or an object wrapping one (`{"data": [...]}`).
fn list_items(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("data").or_else(|| map.remove("items")) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(Error::Serialization(
                "List response is not an array".to_string(),
            )),
        },
        Value::Null => Ok(Vec::new()),
        _ => Err(Error::Serialization(
            "List response is not an array".to_string(),
        )),
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    fn name(&self) -> &str {
        "http"
    }

    fn is_configured(&self) -> bool {
        self.base.is_some()
    }

    async fn health(&self) -> Result<()> {
        let url = self.url(&["health"])?;
        let response = self.send(self.request(Method::GET, &url)).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Api {
                status: status.as_u16(),
                message: "Health check failed".to_string(),
            })
        }
    }

    async fn list(&self, entity_type: EntityType) -> Result<Vec<Value>> {
        let url = self.url(&[entity_type.resource()])?;
        let response = self.send(self.request(Method::GET, &url)).await?;
        list_items(self.handle_response(response).await?)
    }

    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<Value> {
        let url = self.url(&[entity_type.resource(), id])?;
        let response = self.send(self.request(Method::GET, &url)).await?;
        self.handle_response(response).await
    }

    async fn create(&self, entity_type: EntityType, data: &Value) -> Result<Value> {
        let url = self.url(&[entity_type.resource()])?;
        let response = self
            .send(self.request(Method::POST, &url).json(data))
            .await?;
        self.handle_response(response).await
    }

    async fn update(&self, entity_type: EntityType, id: &str, data: &Value) -> Result<Value> {
        let url = self.url(&[entity_type.resource(), id])?;
        let response = self.send(self.request(Method::PUT, &url).json(data)).await?;
        self.handle_response(response).await
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<()> {
        let url = self.url(&[entity_type.resource(), id])?;
        let response = self.send(self.request(Method::DELETE, &url)).await?;
        self.handle_response(response).await.map(|_| ())
    }
}
