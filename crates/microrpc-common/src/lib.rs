//! microrpc common types and transport
//!
//! Shared by the resolver, client and CLI crates:
//!
//! - [`protocol`] - error taxonomy, call metadata and wire frames
//! - [`context`] - cancellation, deadlines and request-scoped metadata
//! - [`transport`] - multiplexed TCP connections, the serving side and codecs

pub mod context;
pub mod protocol;
pub mod transport;

pub use context::Context;
pub use protocol::*;
