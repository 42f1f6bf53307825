//! Resolver backends.

pub mod dynamic;
pub mod file;
pub mod static_table;

pub use dynamic::DynamicResolver;
pub use file::FileResolver;
pub use static_table::StaticResolver;
