//! In-memory route table shared by all resolver backends.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::route::Route;

/// Service name to routes. Routes of one service keep insertion order so
/// selection over them is deterministic.
#[derive(Debug, Default)]
pub struct Table {
    routes: RwLock<HashMap<String, Vec<Route>>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from a route list, dropping duplicate pairs.
    pub fn from_routes(routes: impl IntoIterator<Item = Route>) -> Self {
        let mut map: HashMap<String, Vec<Route>> = HashMap::new();
        for route in routes {
            let entry = map.entry(route.service.clone()).or_default();
            if !entry.contains(&route) {
                entry.push(route);
            }
        }
        Self {
            routes: RwLock::new(map),
        }
    }

    /// Adds a route. Returns `false` when the pair was already present.
    pub async fn create(&self, route: Route) -> bool {
        let mut routes = self.routes.write().await;
        insert(&mut routes, route)
    }

    /// Inserts or refreshes a route.
    pub async fn update(&self, route: Route) {
        let mut routes = self.routes.write().await;
        let entry = routes.entry(route.service.clone()).or_default();
        match entry.iter_mut().find(|r| **r == route) {
            Some(existing) => *existing = route,
            None => entry.push(route),
        }
    }

    /// Removes a route. Returns `false` when it was not present.
    pub async fn delete(&self, route: &Route) -> bool {
        let mut routes = self.routes.write().await;
        let Some(entry) = routes.get_mut(&route.service) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|r| r != route);
        let removed = entry.len() != before;
        if entry.is_empty() {
            routes.remove(&route.service);
        }
        removed
    }

    /// Routes registered for `service`.
    pub async fn find(&self, service: &str) -> Vec<Route> {
        self.routes
            .read()
            .await
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Every route, ordered by service then address.
    pub async fn list(&self) -> Vec<Route> {
        let mut all: Vec<Route> = self.routes.read().await.values().flatten().cloned().collect();
        all.sort();
        all
    }

    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Makes `routes` the complete route set of `service`. Routes naming a
    /// different service are ignored.
    pub async fn replace(&self, service: &str, routes: Vec<Route>) {
        let mut table = self.routes.write().await;
        let fresh: Vec<Route> = routes.into_iter().filter(|r| r.service == service).collect();
        if let Some(entry) = table.get_mut(service) {
            entry.retain(|r| fresh.contains(r));
        }
        for route in fresh {
            insert(&mut table, route);
        }
        if table.get(service).is_some_and(|entry| entry.is_empty()) {
            table.remove(service);
        }
    }

    /// Replaces the whole table content.
    pub async fn reset(&self, routes: impl IntoIterator<Item = Route>) {
        let fresh = Table::from_routes(routes).routes.into_inner();
        *self.routes.write().await = fresh;
    }

    /// Number of routes across all services.
    pub async fn len(&self) -> usize {
        self.routes.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn insert(routes: &mut HashMap<String, Vec<Route>>, route: Route) -> bool {
    let entry = routes.entry(route.service.clone()).or_default();
    if entry.contains(&route) {
        return false;
    }
    entry.push(route);
    true
}
