//! # microrpc
//!
//! Client runtime for calling services by name.
//!
//! A [`Client`] resolves a service name to addresses through a
//! [`Resolver`], picks one with a [`Selector`], checks a multiplexed
//! connection out of its [`Pool`] and runs the call, retrying with
//! [`Backoff`] until the call's retry budget is spent or its [`Context`]
//! is done.
//!
//! ```no_run
//! use microrpc::{CallOptions, Client, ClientConfig, Context, ResolverConfig};
//! use serde_json::{json, Value};
//!
//! # async fn run() -> microrpc::Result<()> {
//! let config = ClientConfig {
//!     resolver: ResolverConfig::Static {
//!         endpoints: "users=127.0.0.1:9000".to_string(),
//!     },
//!     ..ClientConfig::default()
//! };
//! let client = Client::from_config(config).await?;
//! let user: Value = client
//!     .call(&Context::background(), "users", "Users.Get", &json!({"id": 1}), CallOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub use microrpc_client as client;
pub use microrpc_common as common;
pub use microrpc_resolver as resolver;

pub use microrpc_client::{
    Backoff, CallOptions, Client, ClientConfig, Pool, PoolConfig, PoolConn, PoolStats, Stream,
};
pub use microrpc_common::protocol::{Metadata, Result, RpcError};
pub use microrpc_common::Context;
pub use microrpc_resolver::{
    LookupOptions, Resolver, ResolverConfig, Route, Selector, SelectorPolicy, Table,
};
