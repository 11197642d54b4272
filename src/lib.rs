//! rtgeom - Ray tracing acceleration structure residency and streaming

pub mod core;
pub mod gpu;
pub mod build;
pub mod streaming;
pub mod manager;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{GeometryManager, ManagerConfig};
