//! Calendar source adapters and their registry

pub mod ports;
pub mod registry;

pub use ports::{SourceAdapter, SourceResult};
pub use registry::SourceRegistry;
