use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use microrpc_common::protocol::{Result, RpcError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backends::{DynamicResolver, FileResolver, StaticResolver};
use crate::registry::HttpRegistry;
use crate::route::{LookupOptions, Route};
use crate::table::Table;
use crate::watcher::WatchConfig;

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_error_interval_secs() -> u64 {
    10
}

/// Which backend to build and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolverConfig {
    Static {
        #[serde(default)]
        endpoints: String,
    },
    File {
        path: PathBuf,
    },
    Dynamic {
        registry: String,
        #[serde(default = "default_poll_interval_secs")]
        poll_interval_secs: u64,
        #[serde(default = "default_error_interval_secs")]
        error_interval_secs: u64,
    },
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig::Static {
            endpoints: String::new(),
        }
    }
}

impl ResolverConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolverConfig::Static { .. } => "static",
            ResolverConfig::File { .. } => "file",
            ResolverConfig::Dynamic { .. } => "dynamic",
        }
    }
}

/// Maps service names to routes.
#[derive(Debug)]
pub enum Resolver {
    Static(StaticResolver),
    File(FileResolver),
    Dynamic(DynamicResolver),
}

impl Resolver {
    /// Builds the configured backend. `own_routes` are the endpoints this
    /// process serves; only the file backend registers them.
    pub async fn from_config(config: &ResolverConfig, own_routes: Vec<Route>) -> Result<Self> {
        let resolver = match config {
            ResolverConfig::Static { endpoints } => {
                Resolver::Static(StaticResolver::from_endpoints(endpoints)?)
            }
            ResolverConfig::File { path } => {
                Resolver::File(FileResolver::open(path.clone(), own_routes).await?)
            }
            ResolverConfig::Dynamic {
                registry,
                poll_interval_secs,
                error_interval_secs,
            } => {
                if *poll_interval_secs == 0 || *error_interval_secs == 0 {
                    return Err(RpcError::InvalidConfig(
                        "registry poll intervals must be positive".to_string(),
                    ));
                }
                let registry = Arc::new(HttpRegistry::new(registry.clone())?);
                Resolver::Dynamic(DynamicResolver::new(
                    registry,
                    WatchConfig {
                        interval: Duration::from_secs(*poll_interval_secs),
                        error_interval: Duration::from_secs(*error_interval_secs),
                    },
                ))
            }
        };
        info!(kind = config.kind(), "resolver ready");
        Ok(resolver)
    }

    /// Routes of `service` after applying `opts`. Fails with
    /// [`RpcError::RouteNotFound`] when none remain.
    pub async fn lookup(&self, service: &str, opts: &LookupOptions) -> Result<Vec<Route>> {
        let routes = match self {
            Resolver::Static(r) => r.lookup(service).await,
            Resolver::File(r) => r.lookup(service).await?,
            Resolver::Dynamic(r) => r.lookup(service).await?,
        };
        let routes = opts.apply(routes);
        if routes.is_empty() {
            return Err(RpcError::RouteNotFound(service.to_string()));
        }
        Ok(routes)
    }

    pub fn table(&self) -> &Arc<Table> {
        match self {
            Resolver::Static(r) => r.table(),
            Resolver::File(r) => r.table(),
            Resolver::Dynamic(r) => r.table(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Resolver::Static(_) => "static",
            Resolver::File(_) => "file",
            Resolver::Dynamic(_) => "dynamic",
        }
    }

    /// Stops background work. Only the dynamic backend has any.
    pub fn close(&self) {
        if let Resolver::Dynamic(r) = self {
            r.close();
        }
    }
}

impl From<StaticResolver> for Resolver {
    fn from(r: StaticResolver) -> Self {
        Resolver::Static(r)
    }
}

impl From<FileResolver> for Resolver {
    fn from(r: FileResolver) -> Self {
        Resolver::File(r)
    }
}

impl From<DynamicResolver> for Resolver {
    fn from(r: DynamicResolver) -> Self {
        Resolver::Dynamic(r)
    }
}
