//! Build request queue and budgeted executor

use std::sync::Arc;

use rayon::slice::ParallelSliceMut;

use crate::core::table::HandleTable;
use crate::core::types::{BuildRequestIndex, GroupHandle};
use crate::gpu::device::BuildParams;
use crate::gpu::geometry::RayTracingGeometry;

/// Requests at or above this priority are built regardless of budget
pub const IMMEDIATE_BUILD_PRIORITY: f32 = 1.0;

/// Sorting more requests than this uses rayon
const PARALLEL_SORT_THRESHOLD: usize = 4096;

/// Urgency class of a build request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildPriority {
    Immediate,
    High,
    Normal,
    Low,
}

impl BuildPriority {
    /// Starting value of the float priority
    pub fn initial_value(self) -> f32 {
        match self {
            BuildPriority::Immediate => IMMEDIATE_BUILD_PRIORITY,
            BuildPriority::High => 0.5,
            BuildPriority::Normal => 0.24,
            BuildPriority::Low => 0.01,
        }
    }
}

/// Full build or refit of an existing structure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildMode {
    #[default]
    Build,
    Update,
}

/// A pending acceleration structure build
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub owner: Arc<RayTracingGeometry>,
    /// Higher wins
    pub priority: f32,
    pub mode: BuildMode,
    pub primitive_count: u32,
}

/// Builds selected by one dispatch pass
#[derive(Debug, Default)]
pub struct BuildDispatch {
    pub params: Vec<BuildParams>,
    /// Groups whose proxies must refresh cached ray tracing state
    pub groups: Vec<GroupHandle>,
}

impl BuildDispatch {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn primitive_count(&self) -> u64 {
        self.params.iter().map(|p| p.primitive_count as u64).sum()
    }
}

/// Sparse queue of build requests with a per-frame primitive budget
#[derive(Debug)]
pub struct BuildQueue {
    requests: HandleTable<BuildRequestIndex, BuildRequest>,
    /// `<= 0` disables the budget
    max_built_primitives_per_frame: i64,
    boost_per_frame: f32,
    pending_primitives: u64,
}

impl BuildQueue {
    pub fn new(max_built_primitives_per_frame: i64, boost_per_frame: f32) -> Self {
        Self {
            requests: HandleTable::new(),
            max_built_primitives_per_frame,
            boost_per_frame,
            pending_primitives: 0,
        }
    }

    pub fn set_max_built_primitives_per_frame(&mut self, max: i64) {
        self.max_built_primitives_per_frame = max;
    }

    pub fn set_boost_per_frame(&mut self, boost: f32) {
        self.boost_per_frame = boost;
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Sum of primitive counts over pending requests
    pub fn pending_primitives(&self) -> u64 {
        self.pending_primitives
    }

    pub fn get(&self, index: BuildRequestIndex) -> Option<&BuildRequest> {
        self.requests.get(index)
    }

    pub fn priority(&self, index: BuildRequestIndex) -> Option<f32> {
        self.requests.get(index).map(|r| r.priority)
    }

    /// Queue a build and record the request index on the geometry
    pub fn request(
        &mut self,
        owner: Arc<RayTracingGeometry>,
        priority: BuildPriority,
        mode: BuildMode,
    ) -> BuildRequestIndex {
        let primitive_count = owner.primitive_count();
        let index = self.requests.insert(BuildRequest {
            owner: owner.clone(),
            priority: priority.initial_value(),
            mode,
            primitive_count,
        });
        owner.set_build_request(Some(index));
        self.pending_primitives += primitive_count as u64;

        log::trace!("Queued {:?} build {} ({} primitives)", priority, index, primitive_count);
        index
    }

    /// Drop a request that has not been serviced yet
    pub fn remove(&mut self, index: BuildRequestIndex) -> bool {
        let Some(request) = self.requests.remove(index) else {
            return false;
        };
        self.pending_primitives -= request.primitive_count as u64;
        if request.owner.build_request() == Some(index) {
            request.owner.set_build_request(None);
        }
        true
    }

    pub fn boost(&mut self, index: BuildRequestIndex, amount: f32) -> bool {
        match self.requests.get_mut(index) {
            Some(request) => {
                request.priority += amount;
                true
            }
            None => false,
        }
    }

    /// Select this frame's builds.
    ///
    /// Without a budget everything is dispatched. Otherwise requests are taken
    /// in descending priority while the accumulated primitive count is under
    /// budget (or unconditionally at immediate priority, or when `build_all`);
    /// the rest stay queued with their priority boosted.
    pub fn process(&mut self, build_all: bool) -> BuildDispatch {
        let mut dispatch = BuildDispatch::default();

        if self.requests.is_empty() {
            return dispatch;
        }

        if self.max_built_primitives_per_frame <= 0 {
            for index in self.requests.keys() {
                self.dispatch(index, &mut dispatch);
            }
            debug_assert!(self.requests.is_empty());
            return dispatch;
        }

        let mut sorted: Vec<(BuildRequestIndex, f32)> =
            self.requests.iter().map(|(index, r)| (index, r.priority)).collect();

        // Stable, so equal priorities keep queue order
        if sorted.len() >= PARALLEL_SORT_THRESHOLD {
            sorted.par_sort_by(|a, b| b.1.total_cmp(&a.1));
        } else {
            sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        }

        let budget = self.max_built_primitives_per_frame as u64;
        let mut built = 0u64;
        let mut boosted = 0usize;

        for (index, priority) in sorted {
            if build_all || built < budget || priority >= IMMEDIATE_BUILD_PRIORITY {
                built += self.dispatch(index, &mut dispatch) as u64;
            } else if let Some(request) = self.requests.get_mut(index) {
                request.priority += self.boost_per_frame;
                boosted += 1;
            }
        }

        log::trace!(
            "Build pass: {} dispatched ({} primitives, budget {}), {} deferred",
            dispatch.params.len(),
            built,
            budget,
            boosted
        );

        dispatch
    }

    /// Dispatch the pending builds of `geometries`, ignoring the budget
    pub fn force_pending(&mut self, geometries: &[Arc<RayTracingGeometry>]) -> BuildDispatch {
        let mut dispatch = BuildDispatch::default();
        for geometry in geometries {
            if let Some(index) = geometry.build_request() {
                self.dispatch(index, &mut dispatch);
            }
        }
        dispatch
    }

    /// Move one request into the dispatch. Returns its primitive count.
    fn dispatch(&mut self, index: BuildRequestIndex, dispatch: &mut BuildDispatch) -> u32 {
        let Some(request) = self.requests.remove(index) else {
            return 0;
        };
        self.pending_primitives -= request.primitive_count as u64;

        // Owner was evicted or released and no longer expects this build
        if request.owner.build_request() != Some(index) {
            log::trace!("Dropping stale build request {}", index);
            return 0;
        }
        request.owner.take_build_request();

        // Queued after an eviction that raced the request
        let gpu = match request.owner.gpu() {
            Some(gpu) if !request.owner.is_evicted() => gpu,
            _ => {
                log::warn!("Skipping build request {} for evicted geometry", index);
                return 0;
            }
        };

        if let Some(group) = request.owner.group() {
            if !dispatch.groups.contains(&group) {
                dispatch.groups.push(group);
            }
        }

        dispatch.params.push(BuildParams {
            geometry: gpu,
            mode: request.mode,
            primitive_count: request.primitive_count,
        });

        request.primitive_count
    }
}
