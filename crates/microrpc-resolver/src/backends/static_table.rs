use std::sync::Arc;

use microrpc_common::protocol::Result;

use crate::route::{parse_endpoints, Route};
use crate::table::Table;

/// Routes fixed at construction time.
#[derive(Debug, Default)]
pub struct StaticResolver {
    table: Arc<Table>,
}

impl StaticResolver {
    pub fn new(routes: impl IntoIterator<Item = Route>) -> Self {
        Self {
            table: Arc::new(Table::from_routes(routes)),
        }
    }

    /// Builds the table from a `service=address,...` list.
    pub fn from_endpoints(endpoints: &str) -> Result<Self> {
        Ok(Self::new(parse_endpoints(endpoints)?))
    }

    pub async fn lookup(&self, service: &str) -> Vec<Route> {
        self.table.find(service).await
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_by_service() {
        let resolver =
            StaticResolver::from_endpoints("users=10.0.0.1:9000,orders=10.0.0.2:9000").unwrap();
        assert_eq!(
            resolver.lookup("users").await,
            vec![Route::new("users", "10.0.0.1:9000")]
        );
        assert!(resolver.lookup("billing").await.is_empty());
    }

    #[test]
    fn test_malformed_endpoints_rejected() {
        assert!(StaticResolver::from_endpoints("users").is_err());
    }
}
