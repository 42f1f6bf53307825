//! Service registries queried by the dynamic resolver.
//!
//! A registry answers one question: which routes does a service currently
//! have? [`HttpRegistry`] asks a registry server over HTTP, while
//! [`MemoryRegistry`] keeps registrations in-process and is handy for
//! embedding and tests.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use microrpc_common::protocol::{Result, RpcError};
use tokio::sync::RwLock;
use tracing::debug;

use crate::route::Route;

/// Default timeout for a single registry query.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(3);

/// Source of truth for service routes.
#[async_trait]
pub trait Registry: Send + Sync + fmt::Debug {
    /// Returns the routes of `service`. An unknown service yields an empty list.
    async fn get_service(&self, service: &str) -> Result<Vec<Route>>;
}

/// Registry reached over HTTP.
///
/// `GET {base_url}/v1/services/{service}` must answer with a JSON array of
/// `{"service": ..., "address": ...}` objects. A 404 means the service has
/// no routes.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base_url: reqwest::Url,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REGISTRY_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(RpcError::InvalidConfig("registry address is empty".to_string()));
        }
        let base_url = reqwest::Url::parse(&base_url).map_err(|e| {
            RpcError::InvalidConfig(format!("invalid registry address '{}': {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(RpcError::InvalidConfig(format!(
                "registry address '{}' cannot be a base URL",
                base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// `{base}/v1/services/{service}`, with `service` percent-encoded as a
    /// single path segment.
    fn service_url(&self, service: &str) -> Result<reqwest::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                RpcError::InvalidConfig(format!(
                    "registry address '{}' cannot be a base URL",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(["v1", "services", service]);
        Ok(url)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn get_service(&self, service: &str) -> Result<Vec<Route>> {
        let url = self.service_url(service)?;
        debug!(url = %url, "querying registry");

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| RpcError::Unavailable(format!("registry request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(RpcError::Unavailable(format!(
                "registry error: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let routes: Vec<Route> = response
            .json()
            .await
            .map_err(|e| RpcError::Unavailable(format!("invalid registry response: {}", e)))?;

        Ok(routes.into_iter().filter(|r| r.service == service).collect())
    }
}

/// In-process registry.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: RwLock<HashMap<String, Vec<Route>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, route: Route) {
        let mut services = self.services.write().await;
        let routes = services.entry(route.service.clone()).or_default();
        if !routes.contains(&route) {
            routes.push(route);
        }
    }

    pub async fn deregister(&self, route: &Route) {
        let mut services = self.services.write().await;
        if let Some(routes) = services.get_mut(&route.service) {
            routes.retain(|r| r != route);
            if routes.is_empty() {
                services.remove(&route.service);
            }
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_service(&self, service: &str) -> Result<Vec<Route>> {
        Ok(self
            .services
            .read()
            .await
            .get(service)
            .cloned()
            .unwrap_or_default())
    }
}
