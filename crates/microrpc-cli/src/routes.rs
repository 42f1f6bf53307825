use std::path::Path;

use anyhow::Result;
use microrpc_resolver::{FileResolver, Route};

/// Every route in the file, sorted by service then address.
pub async fn list(path: &Path) -> Result<Vec<Route>> {
    let resolver = FileResolver::open(path, Vec::new()).await?;
    Ok(resolver.list().await?)
}

/// Returns `false` if the route was already present.
pub async fn add(path: &Path, route: Route) -> Result<bool> {
    let resolver = FileResolver::open(path, Vec::new()).await?;
    Ok(resolver.create(route).await?)
}

/// Returns `false` if the route was not present.
pub async fn remove(path: &Path, route: &Route) -> Result<bool> {
    let resolver = FileResolver::open(path, Vec::new()).await?;
    Ok(resolver.delete(route).await?)
}
