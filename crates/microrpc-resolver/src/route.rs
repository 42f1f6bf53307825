use std::fmt;
use std::str::FromStr;

use microrpc_common::protocol::{Result, RpcError};
use serde::{Deserialize, Serialize};

/// Delimiter between entries of a static endpoint list.
pub const ENDPOINT_DELIMITER: char = ',';

/// A reachable endpoint of a logical service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Route {
    pub service: String,
    pub address: String,
}

impl Route {
    pub fn new(service: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.service, self.address)
    }
}

impl FromStr for Route {
    type Err = RpcError;

    /// Parses a `service=address` entry.
    fn from_str(s: &str) -> Result<Self> {
        let (service, address) = s.split_once('=').ok_or_else(|| {
            RpcError::InvalidConfig(format!("endpoint '{}' is not of the form service=address", s))
        })?;
        let (service, address) = (service.trim(), address.trim());
        if service.is_empty() || address.is_empty() {
            return Err(RpcError::InvalidConfig(format!(
                "endpoint '{}' has an empty service or address",
                s
            )));
        }
        Ok(Route::new(service, address))
    }
}

/// Parses a delimited endpoint list such as `users=10.0.0.1:9000,orders=10.0.0.2:9000`.
///
/// Empty entries (e.g. a trailing delimiter) are skipped.
pub fn parse_endpoints(list: &str) -> Result<Vec<Route>> {
    list.split(ENDPOINT_DELIMITER)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(Route::from_str)
        .collect()
}

/// Options applied to every lookup after the backend produced its routes.
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// Address wildcard; `*` matches any run of characters.
    pub filter: Option<String>,
}

impl LookupOptions {
    pub fn with_filter(mut self, pattern: impl Into<String>) -> Self {
        self.filter = Some(pattern.into());
        self
    }

    /// Keeps the routes whose address matches the filter.
    pub fn apply(&self, routes: Vec<Route>) -> Vec<Route> {
        match &self.filter {
            Some(pattern) => routes
                .into_iter()
                .filter(|r| wildcard_match(pattern, &r.address))
                .collect(),
            None => routes,
        }
    }
}

/// Glob-style match supporting only `*`.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_t = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
