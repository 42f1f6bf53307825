//! Client configuration.
//!
//! A [`ClientConfig`] is plain serde data: it can be loaded from a JSON file,
//! overridden from `MICRORPC_*` environment variables and then handed to
//! [`Client::from_config`](crate::Client::from_config).
//!
//! ```json
//! {
//!   "service_name": "frontend",
//!   "resolver": { "kind": "static", "endpoints": "users=10.0.0.1:9000" },
//!   "pool": { "size": 10, "ttl_secs": 30 },
//!   "selector": "random",
//!   "request_timeout_ms": 2000
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use microrpc_common::protocol::{Result, RpcError};
use microrpc_common::transport::{Codec, DialOptions, DEFAULT_MAX_MSG_SIZE};
use microrpc_resolver::{ResolverConfig, SelectorPolicy};
use serde::{Deserialize, Serialize};

use crate::options::CallOptions;
use crate::pool::PoolConfig;

pub const ENV_RESOLVER: &str = "MICRORPC_RESOLVER";
pub const ENV_ENDPOINTS: &str = "MICRORPC_ENDPOINTS";
pub const ENV_ROUTES_FILE: &str = "MICRORPC_ROUTES_FILE";
pub const ENV_REGISTRY: &str = "MICRORPC_REGISTRY";
pub const ENV_POOL_SIZE: &str = "MICRORPC_POOL_SIZE";
pub const ENV_POOL_TTL_SECS: &str = "MICRORPC_POOL_TTL_SECS";
pub const ENV_SELECTOR: &str = "MICRORPC_SELECTOR";
pub const ENV_CONTENT_TYPE: &str = "MICRORPC_CONTENT_TYPE";

/// Address used when a service has no route and fallback is enabled.
pub const DEFAULT_FALLBACK_ADDRESS: &str = ":9090";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name of the calling service, sent as `x-rpc-from-service`.
    pub service_name: Option<String>,
    pub resolver: ResolverConfig,
    pub pool: PoolConfig,
    pub selector: SelectorPolicy,
    pub content_type: String,
    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
    pub request_timeout_ms: u64,
    pub retry_budget_ms: u64,
    pub dial_timeout_ms: u64,
    /// Used instead of failing when a service has no route. `None` turns
    /// the fallback off.
    pub fallback_address: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            resolver: ResolverConfig::default(),
            pool: PoolConfig::default(),
            selector: SelectorPolicy::default(),
            content_type: Codec::default().content_type(),
            max_recv_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_send_msg_size: DEFAULT_MAX_MSG_SIZE,
            request_timeout_ms: 5_000,
            retry_budget_ms: 1_000,
            dial_timeout_ms: 5_000,
            fallback_address: Some(DEFAULT_FALLBACK_ADDRESS.to_string()),
        }
    }
}

impl ClientConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RpcError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ClientConfig = serde_json::from_str(&content).map_err(|e| {
            RpcError::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Overrides fields from `lookup`, which maps a `MICRORPC_*` name to its
    /// value.
    pub fn apply_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let kind = lookup(ENV_RESOLVER)
            .map(|k| k.trim().to_ascii_lowercase())
            .unwrap_or_else(|| self.resolver.kind().to_string());

        self.resolver = match kind.as_str() {
            "static" => {
                let endpoints = match (lookup(ENV_ENDPOINTS), &self.resolver) {
                    (Some(endpoints), _) => endpoints,
                    (None, ResolverConfig::Static { endpoints }) => endpoints.clone(),
                    (None, _) => String::new(),
                };
                ResolverConfig::Static { endpoints }
            }
            "file" => {
                let path = match (lookup(ENV_ROUTES_FILE), &self.resolver) {
                    (Some(path), _) => PathBuf::from(path),
                    (None, ResolverConfig::File { path }) => path.clone(),
                    (None, _) => {
                        return Err(RpcError::InvalidConfig(format!(
                            "{} is required for the file resolver",
                            ENV_ROUTES_FILE
                        )))
                    }
                };
                ResolverConfig::File { path }
            }
            "dynamic" => match (lookup(ENV_REGISTRY), &self.resolver) {
                (Some(registry), ResolverConfig::Dynamic {
                    poll_interval_secs,
                    error_interval_secs,
                    ..
                }) => ResolverConfig::Dynamic {
                    registry,
                    poll_interval_secs: *poll_interval_secs,
                    error_interval_secs: *error_interval_secs,
                },
                (Some(registry), _) => ResolverConfig::Dynamic {
                    registry,
                    poll_interval_secs: 5,
                    error_interval_secs: 10,
                },
                (None, current @ ResolverConfig::Dynamic { .. }) => current.clone(),
                (None, _) => {
                    return Err(RpcError::InvalidConfig(format!(
                        "{} is required for the dynamic resolver",
                        ENV_REGISTRY
                    )))
                }
            },
            other => {
                return Err(RpcError::InvalidConfig(format!(
                    "unknown resolver '{}'",
                    other
                )))
            }
        };

        if let Some(val) = lookup(ENV_POOL_SIZE) {
            self.pool.size = parse_number(ENV_POOL_SIZE, &val)?;
        }
        if let Some(val) = lookup(ENV_POOL_TTL_SECS) {
            self.pool.ttl_secs = parse_number(ENV_POOL_TTL_SECS, &val)?;
        }
        if let Some(val) = lookup(ENV_SELECTOR) {
            self.selector = val.parse()?;
        }
        if let Some(val) = lookup(ENV_CONTENT_TYPE) {
            self.content_type = if val.contains('/') {
                val.trim().to_string()
            } else {
                Codec::from_subtype(&val)?.content_type()
            };
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        Codec::from_content_type(&self.content_type)?;
        if self.max_recv_msg_size == 0 || self.max_send_msg_size == 0 {
            return Err(RpcError::InvalidConfig(
                "message size limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dial_options(&self) -> DialOptions {
        DialOptions {
            connect_timeout: Duration::from_millis(self.dial_timeout_ms),
            max_recv_msg_size: self.max_recv_msg_size,
            max_send_msg_size: self.max_send_msg_size,
        }
    }

    /// The call options every call starts from.
    pub fn call_defaults(&self) -> CallOptions {
        let subtype = Codec::from_content_type(&self.content_type)
            .unwrap_or_default()
            .subtype();
        CallOptions::default()
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_retry_budget(Duration::from_millis(self.retry_budget_ms))
            .with_max_recv_msg_size(self.max_recv_msg_size)
            .with_max_send_msg_size(self.max_send_msg_size)
            .with_content_subtype(subtype)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RpcError::InvalidConfig(format!("{} must be a number, got '{}'", name, value)))
}
