//! Call metadata (headers) carried on every request.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Content type header.
pub const CONTENT_TYPE: &str = "content-type";
/// Target service name injected by the client.
pub const SERVICE_HEADER: &str = "x-rpc-service";
/// Name of the calling service, when the caller is itself a service.
pub const FROM_SERVICE_HEADER: &str = "x-rpc-from-service";
/// Forwarded request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Case-insensitive header map. Keys are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header, replacing any previous value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    /// Inserts only if the key is absent.
    pub fn insert_default(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .entry(key.as_ref().to_ascii_lowercase())
            .or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    /// Copies every entry of `other` over this map.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Metadata::new();
        for (k, v) in iter {
            md.insert(k, v);
        }
        md
    }
}
