use std::collections::HashMap;
use std::sync::Arc;

use microrpc_common::protocol::{Result, RpcError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::registry::Registry;
use crate::route::Route;
use crate::table::Table;
use crate::watcher::{WatchConfig, Watcher};

/// Routes discovered from a [`Registry`].
///
/// The first lookup of a service asks the registry, seeds the table and
/// starts a [`Watcher`] for that service. Later lookups read the table only.
#[derive(Debug)]
pub struct DynamicResolver {
    registry: Arc<dyn Registry>,
    table: Arc<Table>,
    config: WatchConfig,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DynamicResolver {
    pub fn new(registry: Arc<dyn Registry>, config: WatchConfig) -> Self {
        Self {
            registry,
            table: Arc::new(Table::new()),
            config,
            watchers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub async fn lookup(&self, service: &str) -> Result<Vec<Route>> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Unavailable("resolver closed".to_string()));
        }

        let watched = self.watchers.lock().await.contains_key(service);
        if !watched {
            self.watch(service).await?;
        }

        Ok(self.table.find(service).await)
    }

    /// Services that currently have a watcher.
    pub async fn watched_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.watchers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops every watcher. Lookups fail afterwards.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn watch(&self, service: &str) -> Result<()> {
        // The registry is queried without holding the lock; a concurrent
        // first lookup may query too, but only one watcher is kept.
        let routes = self.registry.get_service(service).await?;

        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(service) {
            return Ok(());
        }
        self.table.replace(service, routes).await;

        let watcher = Watcher::new(
            service,
            self.registry.clone(),
            self.table.clone(),
            self.config.clone(),
            self.shutdown.child_token(),
        );
        watchers.insert(service.to_string(), watcher.spawn());
        info!(service = %service, "watching registry");
        Ok(())
    }
}

impl Drop for DynamicResolver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
