//! # microrpc CLI
//!
//! Command-line tooling around the microrpc client runtime.
//!
//! ## Key Commands
//!
//! - `microrpc call`: call a service through a configured client (raw JSON
//!   on stdout, suitable for piping)
//! - `microrpc routes`: list, add and remove routes in a shared routes file
//! - `microrpc serve`: run an echo service that registers itself in a
//!   routes file while it is up

pub mod routes;
pub mod serve;
