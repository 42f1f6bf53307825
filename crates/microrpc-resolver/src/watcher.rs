use std::sync::Arc;
use std::time::Duration;

use microrpc_common::protocol::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::table::Table;

/// Polling configuration for registry watchers.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Delay between successful polls.
    pub interval: Duration,
    /// Delay after a failed poll.
    pub error_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            error_interval: Duration::from_secs(10),
        }
    }
}

/// Keeps one service's table entries in sync with a registry.
pub struct Watcher {
    service: String,
    registry: Arc<dyn Registry>,
    table: Arc<Table>,
    config: WatchConfig,
    shutdown: CancellationToken,
}

impl Watcher {
    pub fn new(
        service: impl Into<String>,
        registry: Arc<dyn Registry>,
        table: Arc<Table>,
        config: WatchConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service: service.into(),
            registry,
            table,
            config,
            shutdown,
        }
    }

    /// Starts the watcher task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Poll loop. The table was seeded by the caller, so the first poll
    /// waits one interval.
    async fn run(self) {
        let mut delay = self.config.interval;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            delay = match self.poll_once().await {
                Ok(count) => {
                    debug!(service = %self.service, routes = count, "registry poll");
                    self.config.interval
                }
                Err(e) => {
                    warn!(service = %self.service, error = %e, "registry poll failed");
                    self.config.error_interval
                }
            };
        }

        debug!(service = %self.service, "watcher stopped");
    }

    /// Queries the registry once and replaces the service's routes.
    pub async fn poll_once(&self) -> Result<usize> {
        let routes = self.registry.get_service(&self.service).await?;
        let count = routes.len();
        self.table.replace(&self.service, routes).await;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::route::Route;

    #[tokio::test]
    async fn test_poll_once_replaces_routes() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.register(Route::new("users", "a:1")).await;
        let table = Arc::new(Table::from_routes(vec![Route::new("users", "stale:1")]));

        let watcher = Watcher::new(
            "users",
            registry.clone(),
            table.clone(),
            WatchConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(watcher.poll_once().await.unwrap(), 1);
        assert_eq!(table.find("users").await, vec![Route::new("users", "a:1")]);
    }

    #[tokio::test]
    async fn test_watcher_picks_up_changes_and_stops() {
        let registry = Arc::new(MemoryRegistry::new());
        let table = Arc::new(Table::new());
        let shutdown = CancellationToken::new();

        let handle = Watcher::new(
            "users",
            registry.clone(),
            table.clone(),
            WatchConfig {
                interval: Duration::from_millis(20),
                error_interval: Duration::from_millis(20),
            },
            shutdown.clone(),
        )
        .spawn();

        registry.register(Route::new("users", "a:1")).await;
        let mut found = false;
        for _ in 0..50 {
            if !table.find("users").await.is_empty() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
