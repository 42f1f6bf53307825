//! Service name to address resolution.
//!
//! A [`Resolver`] looks up the [`Route`]s of a service in a [`Table`] kept
//! current by one of three backends (static list, shared JSON file, or a
//! polled [`Registry`]). A [`Selector`] then picks addresses out of the
//! result for each call.

pub mod backends;
pub mod registry;
pub mod resolver;
pub mod route;
pub mod selector;
pub mod table;
pub mod watcher;

pub use backends::{DynamicResolver, FileResolver, StaticResolver};
pub use registry::{HttpRegistry, MemoryRegistry, Registry};
pub use resolver::{Resolver, ResolverConfig};
pub use route::{parse_endpoints, LookupOptions, Route};
pub use selector::{Next, Selector, SelectorPolicy};
pub use table::Table;
pub use watcher::{WatchConfig, Watcher};
