//! Test doubles for the GPU and storage collaborators

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::types::{FrameNumber, GroupHandle, Result};
use crate::gpu::batch::ResourceReplace;
use crate::gpu::device::{BuildParams, CommandList, GpuGeometry, GpuGeometryRef, RayTracingDevice};
use crate::gpu::geometry::{GeometryInitializer, InitializerType, RayTracingGeometry};
use crate::manager::{CachedStateProxy, GeometryManager, ManagerConfig};
use crate::streaming::bulk_data::{slice_range, BulkData, IoRequest, IoStatus, StreamableData};
use crate::streaming::payload::encode_offline_payload;

#[derive(Debug)]
pub struct MockGpuGeometry {
    pub compressed: bool,
}

impl GpuGeometry for MockGpuGeometry {
    fn is_compressed(&self) -> bool {
        self.compressed
    }
}

/// Records everything submitted to it
#[derive(Debug, Default)]
pub struct MockCommandList {
    pub created: Vec<GeometryInitializer>,
    pub replaced: Vec<Vec<ResourceReplace>>,
    pub builds: Vec<Vec<BuildParams>>,
    /// Report created streaming sources as compressed
    pub compress: bool,
}

impl MockCommandList {
    /// Total acceleration structures built across all dispatches
    pub fn built_count(&self) -> usize {
        self.builds.iter().map(Vec::len).sum()
    }
}

impl CommandList for MockCommandList {
    fn create_geometry(&mut self, initializer: &GeometryInitializer) -> GpuGeometryRef {
        self.created.push(initializer.clone());
        Arc::new(MockGpuGeometry {
            compressed: self.compress && initializer.kind == InitializerType::StreamingSource,
        })
    }

    fn replace_resources(&mut self, batch: Vec<ResourceReplace>) {
        self.replaced.push(batch);
    }

    fn build_acceleration_structures(&mut self, params: &[BuildParams]) {
        self.builds.push(params.to_vec());
    }
}

/// Sizes by debug name, falling back to the primitive count
#[derive(Debug, Default)]
pub struct MockDevice {
    sizes: HashMap<String, u64>,
}

impl MockDevice {
    pub fn with_sizes(sizes: &[(&str, u64)]) -> Arc<Self> {
        Arc::new(Self {
            sizes: sizes.iter().map(|(name, size)| (name.to_string(), *size)).collect(),
        })
    }
}

impl RayTracingDevice for MockDevice {
    fn calc_geometry_size(&self, initializer: &GeometryInitializer) -> u64 {
        self.sizes
            .get(&initializer.debug_name)
            .copied()
            .unwrap_or(initializer.total_primitive_count as u64)
    }
}

/// Counts cached state invalidations
#[derive(Debug, Default)]
pub struct CountingProxy {
    calls: AtomicUsize,
}

impl CountingProxy {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CachedStateProxy for CountingProxy {
    fn update_cached_ray_tracing_state(&self, _group: GroupHandle) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared switches controlling [`ScriptedBulkData`] reads
#[derive(Debug, Default)]
pub struct ReadScript {
    /// Reads report completion only while set
    pub complete: AtomicBool,
    /// Upcoming reads that fail
    pub failures: AtomicUsize,
    /// Reads issued so far
    pub reads: AtomicUsize,
}

impl ReadScript {
    pub fn set_complete(&self, complete: bool) {
        self.complete.store(complete, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// Bulk data whose asynchronous reads are driven by a [`ReadScript`]
#[derive(Debug)]
pub struct ScriptedBulkData {
    bytes: Vec<u8>,
    pub script: Arc<ReadScript>,
}

impl ScriptedBulkData {
    /// Bulk blob holding `payload` as an offline payload at offset 0
    pub fn with_payload(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            bytes: encode_offline_payload(payload),
            script: Arc::new(ReadScript::default()),
        })
    }

    /// Range covering the whole blob
    pub fn streamable(self: &Arc<Self>) -> StreamableData {
        StreamableData::new(self.clone(), 0, self.bytes.len() as u64)
    }
}

impl BulkData for ScriptedBulkData {
    fn file_exists(&self) -> bool {
        true
    }

    fn is_loaded(&self) -> bool {
        false
    }

    fn can_load_from_disk(&self) -> bool {
        true
    }

    fn read_loaded(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        slice_range(&self.bytes, offset, size)
    }

    fn scatter_gather_read(&self, offset: u64, size: u64) -> Box<dyn IoRequest> {
        self.script.reads.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .script
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        Box::new(ScriptedIoRequest {
            script: self.script.clone(),
            fail,
            data: slice_range(&self.bytes, offset, size).ok(),
        })
    }
}

#[derive(Debug)]
struct ScriptedIoRequest {
    script: Arc<ReadScript>,
    fail: bool,
    data: Option<Vec<u8>>,
}

impl IoRequest for ScriptedIoRequest {
    fn poll(&mut self) -> IoStatus {
        if !self.script.complete.load(Ordering::SeqCst) {
            IoStatus::Pending
        } else if self.fail || self.data.is_none() {
            IoStatus::Failed
        } else {
            IoStatus::Ok
        }
    }

    fn take_data(&mut self) -> Option<Vec<u8>> {
        if self.fail {
            None
        } else {
            self.data.take()
        }
    }
}

/// Primitive count used by the geometry helpers
pub const TEST_PRIMITIVES: u32 = 10;

/// Ungrouped geometry
pub fn geometry(name: &str, kind: InitializerType) -> Arc<RayTracingGeometry> {
    Arc::new(RayTracingGeometry::new(GeometryInitializer::with_primitives(
        name,
        kind,
        TEST_PRIMITIVES,
    )))
}

/// Geometry in `lod` of `group`
pub fn lod_geometry(name: &str, kind: InitializerType, group: GroupHandle, lod: u8) -> Arc<RayTracingGeometry> {
    Arc::new(RayTracingGeometry::in_group(
        GeometryInitializer::with_primitives(name, kind, TEST_PRIMITIVES),
        group,
        lod,
    ))
}

/// Manager over a [`MockDevice`] with the given sizes
pub fn manager(config: ManagerConfig, sizes: &[(&str, u64)]) -> GeometryManager {
    GeometryManager::new(config, MockDevice::with_sizes(sizes))
}

/// Budgeted residency with no always-resident LODs
pub fn reference_based(budget: u64) -> ManagerConfig {
    ManagerConfig {
        use_reference_based_residency: true,
        resident_geometry_memory_pool_size: budget,
        num_always_resident_lods: 0,
        ..Default::default()
    }
}

/// Mark `referenced` and tick one rendered frame
pub fn render_frame(
    manager: &GeometryManager,
    cmd: &mut MockCommandList,
    frame: FrameNumber,
    referenced: &[&Arc<RayTracingGeometry>],
) {
    manager.pre_render();
    for geometry in referenced {
        manager.add_referenced_geometry(geometry);
    }
    manager.tick(cmd, frame);
}
