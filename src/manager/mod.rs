//! Ray tracing geometry residency manager
//!
//! [`GeometryManager`] tracks every registered ray tracing geometry, decides
//! which ones hold GPU memory, streams their offline build data in and
//! schedules acceleration structure builds under a primitive budget.
//!
//! Two locks guard disjoint state and are never held at the same time:
//! - the main lock covers the geometry and group tables, residency sets,
//!   streaming ring and configuration
//! - the build lock covers the build request queue
//!
//! Work that crosses from one to the other is collected while holding the
//! first and applied after releasing it. Proxy callbacks run with no lock held.

pub mod config;
pub mod registry;
pub mod residency;
pub mod stats;
pub mod stream_in;

use std::sync::{Arc, Mutex};

use crate::build::{BuildDispatch, BuildMode, BuildPriority, BuildQueue};
use crate::core::sync::lock;
use crate::core::types::{BuildRequestIndex, FrameNumber, GeometryHandle, GroupHandle, Result};
use crate::gpu::device::{CommandList, RayTracingDevice};
use crate::gpu::geometry::RayTracingGeometry;
use crate::streaming::bulk_data::StreamableData;

pub use config::ManagerConfig;
pub use registry::{CachedStateProxy, GeometryStatus};
pub use stats::GeometryManagerStats;

use registry::{DeferredWork, ResidencyState};

type ProxyNotifications = Vec<(GroupHandle, Arc<dyn CachedStateProxy>)>;

/// Central registry for ray tracing geometry residency and builds.
///
/// All methods take `&self`; the manager is meant to be shared (e.g. behind an
/// `Arc`) between the render thread and scene traversal workers. Only
/// [`add_referenced_geometry`](Self::add_referenced_geometry) and
/// [`add_referenced_geometry_groups`](Self::add_referenced_geometry_groups) are
/// expected from worker threads, and never concurrently with [`tick`](Self::tick).
pub struct GeometryManager {
    main: Mutex<ResidencyState>,
    builds: Mutex<BuildQueue>,
}

impl GeometryManager {
    /// Create a manager
    ///
    /// # Arguments
    /// * `config` - Initial settings; the streaming ring capacity is fixed here
    /// * `device` - Size queries for acceleration structures
    pub fn new(config: ManagerConfig, device: Arc<dyn RayTracingDevice>) -> Self {
        log::info!(
            "Ray tracing geometry manager: enabled {}, reference based residency {}, budget {} bytes, {} streaming slots",
            config.ray_tracing_enabled,
            config.use_reference_based_residency,
            config.resident_geometry_memory_pool_size,
            config.max_pending_streaming_requests
        );

        let builds = BuildQueue::new(
            config.max_built_primitives_per_frame,
            config.pending_build_priority_boost_per_frame,
        );

        Self {
            main: Mutex::new(ResidencyState::new(config, device)),
            builds: Mutex::new(builds),
        }
    }

    /// Run `f` under the main lock, then apply its deferred work unlocked
    fn with_state<R>(&self, f: impl FnOnce(&mut ResidencyState, &mut DeferredWork) -> R) -> R {
        let mut work = DeferredWork::default();

        let (result, notifications) = {
            let mut state = lock(&self.main);
            let result = f(&mut state, &mut work);
            if work.is_empty() {
                return result;
            }
            let notifications = state.proxies_for(&work.notify_groups);
            (result, notifications)
        };

        self.apply_build_work(&mut work);
        notify(notifications);
        result
    }

    fn apply_build_work(&self, work: &mut DeferredWork) {
        if work.build_removals.is_empty() && work.build_requests.is_empty() {
            return;
        }

        let mut queue = lock(&self.builds);
        for index in work.build_removals.drain(..) {
            queue.remove(index);
        }
        for geometry in work.build_requests.drain(..) {
            // Evicted again before the lock switch
            if geometry.is_valid() && !geometry.has_pending_build_request() {
                queue.request(geometry, BuildPriority::Normal, BuildMode::Build);
            }
        }
    }

    // -- Configuration -------------------------------------------------------

    pub fn config(&self) -> ManagerConfig {
        lock(&self.main).config.clone()
    }

    /// Toggle ray tracing. Takes effect on the next tick.
    pub fn set_ray_tracing_enabled(&self, enabled: bool) {
        let mut state = lock(&self.main);
        if state.config.ray_tracing_enabled != enabled {
            log::info!("Ray tracing {}", if enabled { "enabled" } else { "disabled" });
            state.config.ray_tracing_enabled = enabled;
            state.enable_changed = true;
        }
    }

    /// Switch between budgeted and all-resident residency. Takes effect on the next tick.
    pub fn set_use_reference_based_residency(&self, enabled: bool) {
        let mut state = lock(&self.main);
        if state.config.use_reference_based_residency != enabled {
            log::info!("Reference based residency {}", if enabled { "enabled" } else { "disabled" });
            state.config.use_reference_based_residency = enabled;
            state.enable_changed = true;
        }
    }

    pub fn set_resident_memory_budget(&self, bytes: u64) {
        let mut state = lock(&self.main);
        log::info!("Ray tracing geometry budget set to {} bytes", bytes);
        state.config.resident_geometry_memory_pool_size = bytes;
    }

    /// Change how many lowest-detail LODs per group stay resident. The
    /// always-resident set is rebuilt on the next tick.
    pub fn set_num_always_resident_lods(&self, count: u32) {
        let mut state = lock(&self.main);
        if state.config.num_always_resident_lods != count {
            state.config.num_always_resident_lods = count;
            state.refresh_always_resident = true;
        }
    }

    pub fn set_max_built_primitives_per_frame(&self, max: i64) {
        lock(&self.main).config.max_built_primitives_per_frame = max;
        lock(&self.builds).set_max_built_primitives_per_frame(max);
    }

    pub fn set_pending_build_priority_boost_per_frame(&self, boost: f32) {
        lock(&self.main).config.pending_build_priority_boost_per_frame = boost;
        lock(&self.builds).set_boost_per_frame(boost);
    }

    // -- Groups ----------------------------------------------------------------

    /// Register a LOD group. The caller owns one reference.
    pub fn register_group(&self, lod_count: usize, current_first_lod: u8) -> GroupHandle {
        lock(&self.main).register_group(lod_count, current_first_lod)
    }

    /// Drop the caller's reference. The group goes away once its geometries
    /// and proxies are gone too.
    pub fn release_group(&self, group: GroupHandle) -> Result<()> {
        lock(&self.main).release_group_reference(group)
    }

    pub fn set_group_current_first_lod(
        &self,
        cmd: &mut dyn CommandList,
        group: GroupHandle,
        first_lod: u8,
    ) -> Result<()> {
        self.with_state(|state, work| state.set_group_current_first_lod(cmd, group, first_lod, work))
    }

    pub fn register_proxy_with_cached_state(
        &self,
        group: GroupHandle,
        proxy: Arc<dyn CachedStateProxy>,
    ) -> Result<()> {
        lock(&self.main).register_proxy(group, proxy)
    }

    pub fn unregister_proxy_with_cached_state(
        &self,
        group: GroupHandle,
        proxy: &Arc<dyn CachedStateProxy>,
    ) -> Result<()> {
        lock(&self.main).unregister_proxy(group, proxy)
    }

    /// Tell every proxy of `group` its cached ray tracing state may be stale
    pub fn request_update_cached_render_state(&self, group: GroupHandle) {
        let notifications = lock(&self.main).proxies_for(&[group]);
        notify(notifications);
    }

    // -- Geometries --------------------------------------------------------------

    /// Register a geometry, placing it in its group's LOD slot
    pub fn register_geometry(&self, geometry: &Arc<RayTracingGeometry>) -> Result<GeometryHandle> {
        self.with_state(|state, work| state.register_geometry(geometry, work))
    }

    /// Unregister a geometry. Any in-flight read for it is discarded.
    pub fn release_geometry(&self, handle: GeometryHandle) -> Result<()> {
        self.with_state(|state, work| state.release_geometry(handle, work))
    }

    /// Attach the bulk data range holding the geometry's offline build data
    pub fn set_streaming_data(&self, geometry: &RayTracingGeometry, data: StreamableData) -> Result<()> {
        lock(&self.main).set_streaming_data(geometry, data)
    }

    /// Re-read size and residency of a geometry after its initializer changed
    pub fn refresh_registered_geometry(&self, handle: GeometryHandle) {
        lock(&self.main).refresh(handle, true);
    }

    /// Stream in one geometry now. Returns `false` when the streaming ring is
    /// full; the request is then not remembered.
    pub fn request_stream_in(&self, cmd: &mut dyn CommandList, handle: GeometryHandle) -> bool {
        self.with_state(|state, work| state.request_stream_in(cmd, handle, work))
    }

    pub fn process_completed_streaming_requests(&self, cmd: &mut dyn CommandList) {
        self.with_state(|state, work| state.process_completed_streaming_requests(cmd, work));
    }

    // -- Frame ---------------------------------------------------------------------

    /// Mark that a frame is being rendered; references gathered until the next
    /// [`tick`](Self::tick) count for it.
    pub fn pre_render(&self) {
        lock(&self.main).rendered_frame = true;
    }

    /// Mark geometry used by the current frame (reference based residency only)
    pub fn add_referenced_geometry(&self, geometry: &RayTracingGeometry) {
        lock(&self.main).add_referenced_geometry(geometry);
    }

    /// Mark whole groups used by the current frame (reference based residency only)
    pub fn add_referenced_geometry_groups(&self, groups: impl IntoIterator<Item = GroupHandle>) {
        lock(&self.main).add_referenced_groups(groups);
    }

    /// Update residency for `frame`. Call once per rendered frame.
    pub fn tick(&self, cmd: &mut dyn CommandList, frame: FrameNumber) {
        self.with_state(|state, work| state.tick(cmd, frame, work));
    }

    // -- Builds ----------------------------------------------------------------------

    pub fn request_build(
        &self,
        geometry: &Arc<RayTracingGeometry>,
        priority: BuildPriority,
        mode: BuildMode,
    ) -> BuildRequestIndex {
        lock(&self.builds).request(geometry.clone(), priority, mode)
    }

    /// Drop a request that has not been serviced
    pub fn remove_build_request(&self, index: BuildRequestIndex) {
        if !lock(&self.builds).remove(index) {
            log::warn!("Removing unknown build request {}", index);
        }
    }

    pub fn boost_priority(&self, index: BuildRequestIndex, amount: f32) {
        if !lock(&self.builds).boost(index, amount) {
            log::warn!("Boosting unknown build request {}", index);
        }
    }

    /// Dispatch this frame's builds onto `cmd`
    pub fn process_build_requests(&self, cmd: &mut dyn CommandList, build_all: bool) {
        let dispatch = lock(&self.builds).process(build_all);
        self.submit_builds(cmd, dispatch);
    }

    /// Build any of `geometries` that has a pending request, ignoring the budget
    pub fn force_build_if_pending(&self, cmd: &mut dyn CommandList, geometries: &[Arc<RayTracingGeometry>]) {
        let dispatch = lock(&self.builds).force_pending(geometries);
        self.submit_builds(cmd, dispatch);
    }

    fn submit_builds(&self, cmd: &mut dyn CommandList, dispatch: BuildDispatch) {
        if dispatch.is_empty() {
            return;
        }

        log::trace!(
            "Building {} acceleration structures ({} primitives)",
            dispatch.params.len(),
            dispatch.primitive_count()
        );
        cmd.build_acceleration_structures(&dispatch.params);

        let notifications = lock(&self.main).proxies_for(&dispatch.groups);
        notify(notifications);
    }

    // -- Queries ---------------------------------------------------------------------

    pub fn stats(&self) -> GeometryManagerStats {
        let mut stats = {
            let state = lock(&self.main);
            GeometryManagerStats {
                geometry_count: state.geometries.len(),
                group_count: state.groups.len(),
                resident_bytes: state.total_resident_size,
                always_resident_bytes: state.total_always_resident_size,
                requested_bytes: state.requested_size,
                budget_overrun_bytes: state.overrun.overrun_bytes(),
                consecutive_overrun_frames: state.overrun.consecutive_frames(),
                evicted_last_tick: state.evicted_last_tick,
                made_resident_last_tick: state.made_resident_last_tick,
                pending_streaming_requests: state.pending_streaming.len(),
                in_flight_streaming_requests: state.ring.in_flight(),
                ..Default::default()
            }
        };

        let queue = lock(&self.builds);
        stats.pending_builds = queue.len();
        stats.pending_build_primitives = queue.pending_primitives();
        stats
    }

    pub fn is_geometry_referenced(&self, geometry: &RayTracingGeometry) -> bool {
        let state = lock(&self.main);
        state.lookup(geometry).is_some_and(|h| state.referenced.contains(&h))
    }

    pub fn is_geometry_group_referenced(&self, group: GroupHandle) -> bool {
        lock(&self.main).referenced_groups.contains(&group)
    }

    /// Whether the geometry is in the resident set
    pub fn is_resident(&self, handle: GeometryHandle) -> bool {
        lock(&self.main).resident.contains(&handle)
    }

    pub fn is_always_resident(&self, handle: GeometryHandle) -> bool {
        lock(&self.main).always_resident.contains(&handle)
    }

    pub fn is_evictable(&self, handle: GeometryHandle) -> bool {
        lock(&self.main).evictable.contains(&handle)
    }

    pub fn is_pending_streaming(&self, handle: GeometryHandle) -> bool {
        lock(&self.main).pending_streaming.contains(&handle)
    }

    pub fn geometry_status(&self, handle: GeometryHandle) -> Option<GeometryStatus> {
        lock(&self.main).geometries.get(handle).map(|e| e.status)
    }

    pub fn geometry_size(&self, handle: GeometryHandle) -> Option<u64> {
        lock(&self.main).geometries.get(handle).map(|e| e.size)
    }

    pub fn last_referenced_frame(&self, handle: GeometryHandle) -> Option<FrameNumber> {
        lock(&self.main).geometries.get(handle).map(|e| e.last_referenced_frame)
    }

    /// Reference count of a group, `None` once destroyed
    pub fn group_references(&self, group: GroupHandle) -> Option<u32> {
        lock(&self.main).groups.get(group).map(|g| g.num_references)
    }

    /// Geometry occupying `lod` of `group`
    pub fn group_lod(&self, group: GroupHandle, lod: u8) -> Option<GeometryHandle> {
        lock(&self.main).groups.get(group)?.handles.get(lod as usize).copied().flatten()
    }

    pub fn build_request_priority(&self, index: BuildRequestIndex) -> Option<f32> {
        lock(&self.builds).priority(index)
    }
}

impl Drop for GeometryManager {
    fn drop(&mut self) {
        let pending_builds = lock(&self.builds).len();
        let state = lock(&self.main);

        if pending_builds > 0 {
            log::warn!("Geometry manager dropped with {} pending build requests", pending_builds);
        }
        if !state.geometries.is_empty() || !state.groups.is_empty() {
            log::warn!(
                "Geometry manager dropped with {} geometries and {} groups still registered",
                state.geometries.len(),
                state.groups.len()
            );
        }
    }
}

fn notify(notifications: ProxyNotifications) {
    for (group, proxy) in notifications {
        proxy.update_cached_ray_tracing_state(group);
    }
}
