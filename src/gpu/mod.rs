//! GPU-side collaborators
//!
//! The manager never talks to a graphics API directly. It records work onto a
//! [`CommandList`] and asks a [`RayTracingDevice`] for size estimates; the
//! geometry objects it tracks are owned by callers.

pub mod device;
pub mod geometry;
pub mod batch;

pub use device::{BuildParams, CommandList, GpuGeometry, GpuGeometryRef, RayTracingDevice};
pub use geometry::{GeometryInitializer, GeometrySegment, InitializerType, RayTracingGeometry};
pub use batch::{ResourceReplace, ResourceReplaceBatch};
