//! External data providers
//!
//! Every provider is a network collaborator behind one trait: given query
//! parameters, return a JSON payload. The pipeline treats all of them the
//! same way, including the sandboxed code-execution service, which is just
//! another suspension-point call with the same timeout semantics.

use crate::error::PipelineError;
use crate::Result;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const MARKET_DATA: &str = "market_data";
pub const NEWS: &str = "news";
pub const DOCS: &str = "docs";
pub const SANDBOX: &str = "sandbox";

/// Trait for a single external data provider.
#[async_trait::async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// TTL the provider declares for its responses. Zero disables caching
    /// for this provider entirely.
    fn cache_ttl(&self) -> Duration;

    async fn fetch(&self, params: &Value) -> Result<Value>;
}

/// Registry for looking up providers by name.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ContextProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn ContextProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ContextProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared HTTP plumbing for the provider gateway.
#[derive(Clone)]
pub struct ProviderHttpClient {
    client: Client,
    base_url: String,
}

impl ProviderHttpClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                PipelineError::ProviderUnavailable(format!("request failed for {}: {}", path, e))
            })?;

        let status = response.status();
        let body = response.json::<Value>().await.map_err(|e| {
            PipelineError::ProviderUnavailable(format!("invalid JSON from {}: {}", path, e))
        })?;

        if !status.is_success() {
            return Err(PipelineError::ProviderUnavailable(format!(
                "{} returned {}: {}",
                path, status, body
            )));
        }

        Ok(body)
    }
}

/// Live quote lookup. Short TTL: prices go stale quickly.
pub struct MarketDataProvider {
    http: ProviderHttpClient,
    ttl: Duration,
}

impl MarketDataProvider {
    pub fn new(http: ProviderHttpClient, ttl: Duration) -> Self {
        Self { http, ttl }
    }
}

#[async_trait::async_trait]
impl ContextProvider for MarketDataProvider {
    fn name(&self) -> &'static str {
        MARKET_DATA
    }

    fn cache_ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch(&self, params: &Value) -> Result<Value> {
        let symbol = params
            .get("symbol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipelineError::ProviderUnavailable("market_data requires a symbol".to_string())
            })?;

        self.http
            .post_json("/api/v1/quote", &json!({ "symbol": symbol }))
            .await
    }
}

/// Headlines for a query or symbol.
pub struct NewsProvider {
    http: ProviderHttpClient,
    ttl: Duration,
}

impl NewsProvider {
    pub fn new(http: ProviderHttpClient, ttl: Duration) -> Self {
        Self { http, ttl }
    }
}

#[async_trait::async_trait]
impl ContextProvider for NewsProvider {
    fn name(&self) -> &'static str {
        NEWS
    }

    fn cache_ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch(&self, params: &Value) -> Result<Value> {
        self.http.post_json("/api/v1/news/search", params).await
    }
}

/// Documentation snippet lookup.
pub struct DocsProvider {
    http: ProviderHttpClient,
    ttl: Duration,
}

impl DocsProvider {
    pub fn new(http: ProviderHttpClient, ttl: Duration) -> Self {
        Self { http, ttl }
    }
}

#[async_trait::async_trait]
impl ContextProvider for DocsProvider {
    fn name(&self) -> &'static str {
        DOCS
    }

    fn cache_ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch(&self, params: &Value) -> Result<Value> {
        self.http.post_json("/api/v1/docs/search", params).await
    }
}

/// Sandboxed code execution. Sends source + language, receives the
/// collected stdout/stderr chunks and a completion marker. Results are
/// never cached.
pub struct SandboxProvider {
    http: ProviderHttpClient,
}

impl SandboxProvider {
    pub fn new(http: ProviderHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl ContextProvider for SandboxProvider {
    fn name(&self) -> &'static str {
        SANDBOX
    }

    fn cache_ttl(&self) -> Duration {
        Duration::ZERO
    }

    async fn fetch(&self, params: &Value) -> Result<Value> {
        let source = params
            .get("source")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipelineError::ProviderUnavailable("sandbox requires source code".to_string())
            })?;
        let language = params
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("python");

        let result = self
            .http
            .post_json(
                "/api/v1/execute",
                &json!({ "source": source, "language": language }),
            )
            .await?;

        // The execution service terminates its chunk stream with a marker;
        // anything without one is a truncated run.
        if result.get("completed").is_none() {
            warn!("sandbox response missing completion marker");
            return Err(PipelineError::ProviderUnavailable(
                "sandbox run did not complete".to_string(),
            ));
        }

        Ok(result)
    }
}

/// Fixed-payload provider for the demo binary and tests.
pub struct StaticProvider {
    name: &'static str,
    ttl: Duration,
    payload: Value,
}

impl StaticProvider {
    pub fn new(name: &'static str, ttl: Duration, payload: Value) -> Self {
        Self { name, ttl, payload }
    }
}

#[async_trait::async_trait]
impl ContextProvider for StaticProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn cache_ttl(&self) -> Duration {
        self.ttl
    }

    async fn fetch(&self, _params: &Value) -> Result<Value> {
        Ok(self.payload.clone())
    }
}

/// Registry preloaded with static payloads for offline runs.
pub fn create_demo_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    registry.register(Arc::new(StaticProvider::new(
        MARKET_DATA,
        Duration::from_secs(30),
        json!({ "symbol": "AAPL", "price": 190.12, "change_percent": 0.8 }),
    )));
    registry.register(Arc::new(StaticProvider::new(
        NEWS,
        Duration::from_secs(300),
        json!([{ "title": "Markets drift sideways ahead of earnings", "source": "demo-wire" }]),
    )));
    registry.register(Arc::new(StaticProvider::new(
        DOCS,
        Duration::from_secs(3600),
        json!([{ "snippet": "See the language reference for error handling patterns." }]),
    )));

    registry
}
