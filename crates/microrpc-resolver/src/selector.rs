use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use microrpc_common::protocol::{Result, RpcError};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Strategy used to spread calls over a service's addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorPolicy {
    #[default]
    RoundRobin,
    Random,
}

impl FromStr for SelectorPolicy {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(SelectorPolicy::RoundRobin),
            "random" => Ok(SelectorPolicy::Random),
            other => Err(RpcError::InvalidConfig(format!(
                "unknown selector policy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for SelectorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorPolicy::RoundRobin => f.write_str("round_robin"),
            SelectorPolicy::Random => f.write_str("random"),
        }
    }
}

/// Builds a [`Next`] picker over an address list.
///
/// Pickers made by [`Selector::select_for`] share one round-robin position
/// per service, so successive calls to the same service rotate through its
/// addresses. Clones of a selector share those positions.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    policy: SelectorPolicy,
    positions: Arc<Mutex<HashMap<String, Arc<AtomicUsize>>>>,
}

impl Selector {
    pub fn new(policy: SelectorPolicy) -> Self {
        Self {
            policy,
            positions: Arc::default(),
        }
    }

    pub fn policy(&self) -> SelectorPolicy {
        self.policy
    }

    /// Picker with its own position starting at the first address.
    ///
    /// Fails with [`RpcError::NotAvailable`] when `addresses` is empty.
    pub fn select(&self, addresses: Vec<String>) -> Result<Next> {
        self.build(addresses, Arc::new(AtomicUsize::new(0)))
    }

    /// Picker that continues the round-robin position left by earlier
    /// selections for `service`.
    ///
    /// Fails with [`RpcError::NotAvailable`] when `addresses` is empty.
    pub fn select_for(&self, service: &str, addresses: Vec<String>) -> Result<Next> {
        let counter = {
            let mut positions = self
                .positions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            positions.entry(service.to_string()).or_default().clone()
        };
        self.build(addresses, counter)
    }

    fn build(&self, addresses: Vec<String>, counter: Arc<AtomicUsize>) -> Result<Next> {
        if addresses.is_empty() {
            return Err(RpcError::NotAvailable);
        }
        Ok(Next {
            addresses: addresses.into(),
            policy: self.policy,
            counter,
        })
    }
}

/// Yields one address per call. Clones share the round-robin position.
#[derive(Debug, Clone)]
pub struct Next {
    addresses: Arc<[String]>,
    policy: SelectorPolicy,
    counter: Arc<AtomicUsize>,
}

impl Next {
    pub fn next(&self) -> String {
        if self.addresses.len() == 1 {
            return self.addresses[0].clone();
        }
        let index = match self.policy {
            SelectorPolicy::RoundRobin => {
                self.counter.fetch_add(1, Ordering::Relaxed) % self.addresses.len()
            }
            SelectorPolicy::Random => rand::thread_rng().gen_range(0..self.addresses.len()),
        };
        self.addresses[index].clone()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}
