//! Device and command list contracts

use std::fmt;
use std::sync::Arc;

use crate::build::BuildMode;
use crate::gpu::batch::ResourceReplace;
use crate::gpu::geometry::GeometryInitializer;

/// A GPU acceleration structure object created by the device
pub trait GpuGeometry: Send + Sync + fmt::Debug {
    /// Whether the device stores this structure compressed, which forces a
    /// rebuild even when offline build data was supplied.
    fn is_compressed(&self) -> bool {
        false
    }
}

/// Shared reference to a device geometry object
pub type GpuGeometryRef = Arc<dyn GpuGeometry>;

/// One entry of a batched acceleration structure build
#[derive(Clone, Debug)]
pub struct BuildParams {
    pub geometry: GpuGeometryRef,
    pub mode: BuildMode,
    pub primitive_count: u32,
}

/// Device-wide queries that need no command list
pub trait RayTracingDevice: Send + Sync {
    /// Size in bytes of the acceleration structure an initializer produces
    fn calc_geometry_size(&self, initializer: &GeometryInitializer) -> u64;
}

/// Recorder for GPU work. Nothing recorded here blocks the caller.
pub trait CommandList {
    fn create_geometry(&mut self, initializer: &GeometryInitializer) -> GpuGeometryRef;

    /// Move backing buffers between geometry objects as one batch
    fn replace_resources(&mut self, batch: Vec<ResourceReplace>);

    fn build_acceleration_structures(&mut self, params: &[BuildParams]);
}
