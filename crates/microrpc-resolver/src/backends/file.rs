//! Route table persisted to a JSON file shared between processes.
//!
//! The file holds a JSON array of `{"service", "address"}` objects. Every
//! process that opens it registers its own endpoints, reads the table back
//! whenever the file changed on disk, and writes it out after each mutation
//! by writing a sibling temp file and renaming it over the original.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::SystemTime;

use microrpc_common::protocol::{Result, RpcError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::route::Route;
use crate::table::Table;

/// What the file looked like when it was last read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

/// Writes retried this many times when another process keeps changing the file.
const MAX_WRITE_ATTEMPTS: usize = 5;

#[derive(Debug)]
pub struct FileResolver {
    path: PathBuf,
    table: Arc<Table>,
    own_routes: Vec<Route>,
    /// Also serializes reloads and writes within this process.
    stamp: Mutex<Option<FileStamp>>,
}

impl FileResolver {
    /// Loads `path` (a missing file is an empty table), then registers
    /// `own_routes` and writes the table back.
    pub async fn open(path: impl Into<PathBuf>, own_routes: Vec<Route>) -> Result<Self> {
        let resolver = Self {
            path: path.into(),
            table: Arc::new(Table::new()),
            own_routes,
            stamp: Mutex::new(None),
        };

        if resolver.own_routes.is_empty() {
            let mut stamp = resolver.stamp.lock().await;
            resolver.refresh(&mut stamp).await?;
        } else {
            let own = resolver.own_routes.clone();
            resolver
                .mutate(|routes| {
                    let mut changed = false;
                    for route in &own {
                        changed |= insert(routes, route.clone());
                    }
                    changed
                })
                .await?;
            info!(
                path = %resolver.path.display(),
                routes = resolver.own_routes.len(),
                "self-registered endpoints"
            );
        }

        Ok(resolver)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn own_routes(&self) -> &[Route] {
        &self.own_routes
    }

    /// Routes of `service`, re-reading the file first if it changed.
    pub async fn lookup(&self, service: &str) -> Result<Vec<Route>> {
        {
            let mut stamp = self.stamp.lock().await;
            self.refresh(&mut stamp).await?;
        }
        Ok(self.table.find(service).await)
    }

    pub async fn list(&self) -> Result<Vec<Route>> {
        {
            let mut stamp = self.stamp.lock().await;
            self.refresh(&mut stamp).await?;
        }
        Ok(self.table.list().await)
    }

    /// Adds a route and persists. Returns `false` if it already existed.
    pub async fn create(&self, route: Route) -> Result<bool> {
        self.mutate(|routes| insert(routes, route.clone())).await
    }

    pub async fn update(&self, route: Route) -> Result<()> {
        self.mutate(|routes| insert(routes, route.clone())).await?;
        Ok(())
    }

    /// Removes a route and persists. Returns `false` if it was not present.
    pub async fn delete(&self, route: &Route) -> Result<bool> {
        self.mutate(|routes| remove(routes, route)).await
    }

    /// Removes the routes registered by [`FileResolver::open`].
    pub async fn deregister_self(&self) -> Result<()> {
        if self.own_routes.is_empty() {
            return Ok(());
        }
        self.mutate(|routes| {
            let before = routes.len();
            routes.retain(|r| !self.own_routes.contains(r));
            routes.len() != before
        })
        .await?;
        info!(path = %self.path.display(), "deregistered endpoints");
        Ok(())
    }

    async fn refresh(&self, stamp: &mut Option<FileStamp>) -> Result<()> {
        let current = read_stamp(&self.path).await?;
        if current == *stamp {
            return Ok(());
        }
        let routes = read_routes(&self.path).await?;
        debug!(path = %self.path.display(), routes = routes.len(), "reloaded route table");
        self.table.reset(routes).await;
        *stamp = current;
        Ok(())
    }

    /// Applies `apply` to the freshest file contents and writes the result
    /// back. Returns what `apply` returned; nothing is written when it
    /// reports no change.
    ///
    /// Writers in this process are serialized per path. A write by another
    /// process that lands between reading and renaming is detected through
    /// the file stamp, and `apply` is re-run on the new contents.
    async fn mutate<F>(&self, mut apply: F) -> Result<bool>
    where
        F: FnMut(&mut Vec<Route>) -> bool,
    {
        let path_lock = path_lock(&self.path);
        let _writer = path_lock.lock().await;
        let mut stamp = self.stamp.lock().await;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            self.refresh(&mut stamp).await?;
            let mut routes = self.table.list().await;
            if !apply(&mut routes) {
                return Ok(false);
            }
            routes.sort();

            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let tmp = temp_path(&self.path);
            tokio::fs::write(&tmp, serde_json::to_vec_pretty(&routes)?).await?;

            if read_stamp(&self.path).await? != *stamp {
                debug!(path = %self.path.display(), "route file changed during write, retrying");
                let _ = tokio::fs::remove_file(&tmp).await;
                continue;
            }
            tokio::fs::rename(&tmp, &self.path).await?;

            self.table.reset(routes.iter().cloned()).await;
            *stamp = read_stamp(&self.path).await?;
            debug!(path = %self.path.display(), routes = routes.len(), "persisted route table");
            return Ok(true);
        }

        Err(RpcError::Unavailable(format!(
            "route file {} kept changing while writing",
            self.path.display()
        )))
    }
}

fn insert(routes: &mut Vec<Route>, route: Route) -> bool {
    if routes.contains(&route) {
        return false;
    }
    routes.push(route);
    true
}

fn remove(routes: &mut Vec<Route>, route: &Route) -> bool {
    let before = routes.len();
    routes.retain(|r| r != route);
    routes.len() != before
}

/// One async lock per route file path, shared by every resolver in the
/// process.
fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    locks.entry(path.to_path_buf()).or_default().clone()
}

/// Sibling temp file unique to this process and write.
fn temp_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let mut name = std::ffi::OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

async fn read_stamp(path: &Path) -> Result<Option<FileStamp>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta.modified()?,
            len: meta.len(),
        })),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_routes(path: &Path) -> Result<Vec<Route>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&data)?)
}
