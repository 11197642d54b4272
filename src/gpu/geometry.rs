//! Ray tracing geometry objects owned by callers

use std::sync::{Arc, Mutex};

use crate::core::sync::lock;
use crate::core::types::{BuildRequestIndex, GeometryHandle, GroupHandle};
use crate::gpu::batch::ResourceReplaceBatch;
use crate::gpu::device::{CommandList, GpuGeometryRef};

/// What a geometry initializer describes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InitializerType {
    /// Built from vertex/index buffers, no streaming phase
    #[default]
    Rendering,
    /// Final geometry whose build data streams in later
    StreamingDestination,
    /// Intermediate object carrying streamed data into a destination
    StreamingSource,
}

/// One vertex/index range of a geometry
#[derive(Clone, Debug, Default)]
pub struct GeometrySegment {
    /// Opaque vertex buffer id, `None` until the owner uploads it
    pub vertex_buffer: Option<u64>,
    pub num_primitives: u32,
}

/// Everything the device needs to create a geometry
#[derive(Clone, Debug, Default)]
pub struct GeometryInitializer {
    pub debug_name: String,
    pub kind: InitializerType,
    pub segments: Vec<GeometrySegment>,
    pub total_primitive_count: u32,
    pub allow_update: bool,
    /// Prebuilt acceleration structure data, if any
    pub offline_data: Option<Arc<[u8]>>,
}

impl GeometryInitializer {
    /// Shorthand for a single-segment geometry with a valid vertex buffer
    pub fn with_primitives(debug_name: impl Into<String>, kind: InitializerType, primitives: u32) -> Self {
        Self {
            debug_name: debug_name.into(),
            kind,
            segments: vec![GeometrySegment {
                vertex_buffer: Some(0),
                num_primitives: primitives,
            }],
            total_primitive_count: primitives,
            allow_update: false,
            offline_data: None,
        }
    }

    /// True when there is at least one segment and every segment has a vertex buffer
    pub fn has_valid_segments(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| s.vertex_buffer.is_some())
    }
}

#[derive(Debug)]
struct GeometryState {
    initializer: GeometryInitializer,
    gpu: Option<GpuGeometryRef>,
    evicted: bool,
    requires_build: bool,
    build_request: Option<BuildRequestIndex>,
    handle: Option<GeometryHandle>,
    raw_data: Vec<u8>,
}

/// A ray tracing geometry and its GPU acceleration structure.
///
/// Callers own these (usually behind an `Arc`) and register them with the
/// [`GeometryManager`](crate::manager::GeometryManager), which then decides when
/// the GPU object exists. LOD placement is fixed at construction.
#[derive(Debug)]
pub struct RayTracingGeometry {
    group: Option<GroupHandle>,
    lod_index: u8,
    state: Mutex<GeometryState>,
}

impl RayTracingGeometry {
    /// Create a geometry that is not part of any LOD group
    pub fn new(initializer: GeometryInitializer) -> Self {
        Self::with_group(initializer, None, 0)
    }

    /// Create a geometry occupying `lod_index` of `group`
    pub fn in_group(initializer: GeometryInitializer, group: GroupHandle, lod_index: u8) -> Self {
        Self::with_group(initializer, Some(group), lod_index)
    }

    fn with_group(initializer: GeometryInitializer, group: Option<GroupHandle>, lod_index: u8) -> Self {
        Self {
            group,
            lod_index,
            state: Mutex::new(GeometryState {
                initializer,
                gpu: None,
                evicted: false,
                requires_build: false,
                build_request: None,
                handle: None,
                raw_data: Vec::new(),
            }),
        }
    }

    pub fn group(&self) -> Option<GroupHandle> {
        self.group
    }

    pub fn lod_index(&self) -> u8 {
        self.lod_index
    }

    /// Handle assigned at registration
    pub fn handle(&self) -> Option<GeometryHandle> {
        lock(&self.state).handle
    }

    pub fn initializer(&self) -> GeometryInitializer {
        lock(&self.state).initializer.clone()
    }

    /// Replace the initializer. Call `refresh_registered_geometry` afterwards so
    /// the manager picks up the new size.
    pub fn set_initializer(&self, initializer: GeometryInitializer) {
        lock(&self.state).initializer = initializer;
    }

    pub fn kind(&self) -> InitializerType {
        lock(&self.state).initializer.kind
    }

    pub fn primitive_count(&self) -> u32 {
        lock(&self.state).initializer.total_primitive_count
    }

    /// Whether a GPU object currently exists
    pub fn is_valid(&self) -> bool {
        lock(&self.state).gpu.is_some()
    }

    pub fn is_evicted(&self) -> bool {
        lock(&self.state).evicted
    }

    /// Valid and not evicted
    pub fn is_resident(&self) -> bool {
        let state = lock(&self.state);
        state.gpu.is_some() && !state.evicted
    }

    pub fn requires_build(&self) -> bool {
        lock(&self.state).requires_build
    }

    pub fn has_pending_build_request(&self) -> bool {
        lock(&self.state).build_request.is_some()
    }

    pub fn build_request(&self) -> Option<BuildRequestIndex> {
        lock(&self.state).build_request
    }

    pub fn gpu(&self) -> Option<GpuGeometryRef> {
        lock(&self.state).gpu.clone()
    }

    /// Offline data deserialized by the last completed stream-in
    pub fn raw_data(&self) -> Vec<u8> {
        lock(&self.state).raw_data.clone()
    }

    pub(crate) fn set_handle(&self, handle: Option<GeometryHandle>) {
        lock(&self.state).handle = handle;
    }

    pub(crate) fn set_build_request(&self, index: Option<BuildRequestIndex>) {
        lock(&self.state).build_request = index;
    }

    pub(crate) fn take_build_request(&self) -> Option<BuildRequestIndex> {
        lock(&self.state).build_request.take()
    }

    pub(crate) fn set_evicted_flag(&self, evicted: bool) {
        lock(&self.state).evicted = evicted;
    }

    pub(crate) fn set_raw_data(&self, raw_data: Vec<u8>) {
        lock(&self.state).raw_data = raw_data;
    }

    /// Drop the GPU object and mark evicted. Returns a pending build request
    /// that the caller must remove from the build queue.
    pub(crate) fn evict(&self) -> Option<BuildRequestIndex> {
        let mut state = lock(&self.state);
        state.gpu = None;
        state.evicted = true;
        state.requires_build = false;
        state.build_request.take()
    }

    /// Clear the evicted flag and create the GPU object if missing.
    ///
    /// Streaming destinations get an empty placeholder which a later stream-in
    /// fills; everything else is created from its initializer and needs a build.
    pub(crate) fn make_resident(&self, cmd: &mut dyn CommandList) {
        let mut state = lock(&self.state);
        state.evicted = false;

        if state.gpu.is_some() {
            return;
        }

        let gpu = cmd.create_geometry(&state.initializer);
        if state.initializer.kind != InitializerType::StreamingDestination {
            state.requires_build = state.initializer.offline_data.is_none() || gpu.is_compressed();
        }
        state.gpu = Some(gpu);
    }

    /// Release the GPU resources of a LOD that went out of range.
    /// Returns a pending build request that must be removed.
    pub(crate) fn release_for_streaming(&self, batch: &mut ResourceReplaceBatch) -> Option<BuildRequestIndex> {
        let mut state = lock(&self.state);
        if let Some(gpu) = state.gpu.take() {
            batch.enqueue(gpu, None);
        }
        state.requires_build = false;
        state.raw_data.clear();
        state.build_request.take()
    }

    /// Hand the intermediate object's buffers to this geometry
    pub(crate) fn init_for_streaming(
        &self,
        intermediate: GpuGeometryRef,
        requires_build: bool,
        batch: &mut ResourceReplaceBatch,
    ) {
        let mut state = lock(&self.state);
        match &state.gpu {
            Some(dst) => batch.enqueue(dst.clone(), Some(intermediate)),
            None => state.gpu = Some(intermediate),
        }
        state.requires_build = requires_build;
    }

    /// Consume the "needs build" flag if a build request should be issued now
    pub(crate) fn take_build_requirement(&self) -> bool {
        let mut state = lock(&self.state);
        if state.requires_build && state.gpu.is_some() && state.build_request.is_none() {
            state.requires_build = false;
            true
        } else {
            false
        }
    }
}
