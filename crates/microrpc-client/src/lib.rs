pub mod backoff;
pub mod client;
pub mod config;
pub mod options;
pub mod pool;
pub mod stream;

pub use backoff::Backoff;
pub use client::Client;
pub use config::ClientConfig;
pub use options::CallOptions;
pub use pool::{Pool, PoolConfig, PoolConn, PoolStats};
pub use stream::Stream;
