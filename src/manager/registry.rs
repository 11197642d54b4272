//! Geometry and group tables
//!
//! All of this lives behind the manager's main lock. Methods here never touch
//! the build queue or call proxies; anything that must happen there is pushed
//! onto a [`DeferredWork`] and applied by the manager once the lock is gone.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::core::error::Error;
use crate::core::table::HandleTable;
use crate::core::types::{BuildRequestIndex, FrameNumber, GeometryHandle, GroupHandle, Result};
use crate::gpu::batch::ResourceReplaceBatch;
use crate::gpu::device::{CommandList, RayTracingDevice};
use crate::gpu::geometry::{InitializerType, RayTracingGeometry};
use crate::manager::config::ManagerConfig;
use crate::manager::stats::OverrunTracker;
use crate::streaming::bulk_data::StreamableData;
use crate::streaming::ring::StreamingRing;

/// Renderer-side object caching ray tracing state derived from a group
pub trait CachedStateProxy: Send + Sync {
    /// The group's residency or build state changed
    fn update_cached_ray_tracing_state(&self, group: GroupHandle);
}

/// Streaming progress of a registered geometry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GeometryStatus {
    #[default]
    StreamedOut,
    Streaming,
    StreamedIn,
}

/// Per-geometry bookkeeping
#[derive(Debug)]
pub(crate) struct RegisteredGeometry {
    pub geometry: Arc<RayTracingGeometry>,
    /// Acceleration structure bytes, from the initializer
    pub size: u64,
    pub last_referenced_frame: FrameNumber,
    pub status: GeometryStatus,
    pub streamable: Option<StreamableData>,
    /// Ring slot of the in-flight read
    pub streaming_request: Option<usize>,
}

/// One slot per LOD plus the owners keeping the group alive
pub(crate) struct GeometryGroup {
    pub handles: Vec<Option<GeometryHandle>>,
    /// Creator + registered members + registered proxies
    pub num_references: u32,
    pub current_first_lod: u8,
    pub proxies: Vec<Arc<dyn CachedStateProxy>>,
}

impl GeometryGroup {
    pub fn lod_count(&self) -> usize {
        self.handles.len()
    }
}

/// Whether `lod` is among the `always_resident` lowest-detail LODs
pub(crate) fn is_always_resident_lod(lod: u8, lod_count: usize, always_resident: u32) -> bool {
    lod as usize >= lod_count.saturating_sub(always_resident as usize)
}

/// Work that crosses into the build lock or out to proxies
#[derive(Debug, Default)]
pub(crate) struct DeferredWork {
    pub build_removals: Vec<BuildRequestIndex>,
    pub build_requests: Vec<Arc<RayTracingGeometry>>,
    pub notify_groups: Vec<GroupHandle>,
}

impl DeferredWork {
    pub fn remove_build(&mut self, index: Option<BuildRequestIndex>) {
        if let Some(index) = index {
            self.build_removals.push(index);
        }
    }

    pub fn notify(&mut self, group: Option<GroupHandle>) {
        if let Some(group) = group {
            if !self.notify_groups.contains(&group) {
                self.notify_groups.push(group);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.build_removals.is_empty() && self.build_requests.is_empty() && self.notify_groups.is_empty()
    }
}

/// Everything guarded by the main lock
pub(crate) struct ResidencyState {
    pub(super) config: ManagerConfig,
    pub(super) device: Arc<dyn RayTracingDevice>,
    pub(super) geometries: HandleTable<GeometryHandle, RegisteredGeometry>,
    pub(super) groups: HandleTable<GroupHandle, GeometryGroup>,

    pub(super) resident: HashSet<GeometryHandle>,
    pub(super) always_resident: HashSet<GeometryHandle>,
    pub(super) evictable: HashSet<GeometryHandle>,
    /// Ordered so retries go out in registration order
    pub(super) pending_streaming: BTreeSet<GeometryHandle>,
    pub(super) referenced: HashSet<GeometryHandle>,
    pub(super) referenced_groups: HashSet<GroupHandle>,

    pub(super) total_resident_size: u64,
    pub(super) total_always_resident_size: u64,
    pub(super) requested_size: u64,

    pub(super) ring: StreamingRing,

    pub(super) rendered_frame: bool,
    pub(super) enable_changed: bool,
    pub(super) refresh_always_resident: bool,
    pub(super) last_tick_frame: Option<FrameNumber>,

    pub(super) overrun: OverrunTracker,
    pub(super) evicted_last_tick: usize,
    pub(super) made_resident_last_tick: usize,
}

impl ResidencyState {
    pub fn new(config: ManagerConfig, device: Arc<dyn RayTracingDevice>) -> Self {
        let ring = StreamingRing::new(config.max_pending_streaming_requests);
        Self {
            config,
            device,
            geometries: HandleTable::new(),
            groups: HandleTable::new(),
            resident: HashSet::new(),
            always_resident: HashSet::new(),
            evictable: HashSet::new(),
            pending_streaming: BTreeSet::new(),
            referenced: HashSet::new(),
            referenced_groups: HashSet::new(),
            total_resident_size: 0,
            total_always_resident_size: 0,
            requested_size: 0,
            ring,
            rendered_frame: false,
            enable_changed: false,
            refresh_always_resident: false,
            last_tick_frame: None,
            overrun: OverrunTracker::default(),
            evicted_last_tick: 0,
            made_resident_last_tick: 0,
        }
    }

    pub fn budget(&self) -> u64 {
        self.config.resident_geometry_memory_pool_size
    }

    // -- Groups --------------------------------------------------------------

    pub fn register_group(&mut self, lod_count: usize, current_first_lod: u8) -> GroupHandle {
        // First LOD == lod_count means every LOD is out of range
        let max_first_lod = u8::try_from(lod_count).unwrap_or(u8::MAX);
        if current_first_lod > max_first_lod {
            log::warn!(
                "First LOD {} out of range for a group with {} LODs, clamping",
                current_first_lod,
                lod_count
            );
        }
        let current_first_lod = current_first_lod.min(max_first_lod);

        let handle = self.groups.insert(GeometryGroup {
            handles: vec![None; lod_count],
            num_references: 1,
            current_first_lod,
            proxies: Vec::new(),
        });
        log::trace!("Registered {} with {} LODs", handle, lod_count);
        handle
    }

    /// Drop one reference; the group is destroyed when none remain
    pub fn release_group_reference(&mut self, handle: GroupHandle) -> Result<()> {
        let Some(group) = self.groups.get_mut(handle) else {
            log::error!("Releasing unknown geometry group {}", handle);
            return Err(Error::InvalidGroupHandle(handle));
        };

        group.num_references = group.num_references.saturating_sub(1);
        if group.num_references > 0 {
            return Ok(());
        }

        if group.handles.iter().any(Option::is_some) || !group.proxies.is_empty() {
            // Refcount went out of sync with the members; keep the row so
            // the remaining members stay valid.
            group.num_references = 1;
            log::error!(
                "All geometries and proxies of {} must be unregistered before releasing it",
                handle
            );
            return Err(Error::GroupNotEmpty(handle));
        }

        self.groups.remove(handle);
        self.referenced_groups.remove(&handle);
        log::trace!("Released {}", handle);
        Ok(())
    }

    pub fn register_proxy(&mut self, handle: GroupHandle, proxy: Arc<dyn CachedStateProxy>) -> Result<()> {
        let Some(group) = self.groups.get_mut(handle) else {
            log::error!("Registering proxy with unknown geometry group {}", handle);
            return Err(Error::InvalidGroupHandle(handle));
        };

        if group.proxies.iter().any(|p| Arc::ptr_eq(p, &proxy)) {
            log::error!("Proxy registered twice with {}", handle);
            return Err(Error::ProxyAlreadyRegistered(handle));
        }

        group.proxies.push(proxy);
        group.num_references += 1;
        Ok(())
    }

    pub fn unregister_proxy(&mut self, handle: GroupHandle, proxy: &Arc<dyn CachedStateProxy>) -> Result<()> {
        let Some(group) = self.groups.get_mut(handle) else {
            log::error!("Unregistering proxy from unknown geometry group {}", handle);
            return Err(Error::InvalidGroupHandle(handle));
        };

        let Some(position) = group.proxies.iter().position(|p| Arc::ptr_eq(p, proxy)) else {
            log::error!("Proxy is not registered with {}", handle);
            return Err(Error::ProxyNotRegistered(handle));
        };

        group.proxies.swap_remove(position);
        self.release_group_reference(handle)
    }

    /// Proxies to call for each group, collected so they can run unlocked
    pub fn proxies_for(&self, groups: &[GroupHandle]) -> Vec<(GroupHandle, Arc<dyn CachedStateProxy>)> {
        groups
            .iter()
            .filter_map(|&handle| self.groups.get(handle).map(|group| (handle, group)))
            .flat_map(|(handle, group)| group.proxies.iter().map(move |proxy| (handle, proxy.clone())))
            .collect()
    }

    // -- Geometries ----------------------------------------------------------

    /// Handle of `geometry` if it is registered
    pub fn lookup(&self, geometry: &RayTracingGeometry) -> Option<GeometryHandle> {
        let handle = geometry.handle()?;
        let entry = self.geometries.get(handle)?;
        std::ptr::eq(Arc::as_ptr(&entry.geometry), geometry).then_some(handle)
    }

    pub fn register_geometry(
        &mut self,
        geometry: &Arc<RayTracingGeometry>,
        work: &mut DeferredWork,
    ) -> Result<GeometryHandle> {
        if let Some(existing) = self.lookup(geometry) {
            log::error!("Geometry already registered as {}", existing);
            return Err(Error::AlreadyRegistered(existing));
        }

        let enabled = self.config.ray_tracing_enabled;
        let reference_based = self.config.use_reference_based_residency;
        let lod = geometry.lod_index();

        let mut always_resident = false;
        let mut in_range = true;

        if let Some(group_handle) = geometry.group() {
            let Some(group) = self.groups.get(group_handle) else {
                log::error!("Geometry registered with unknown {}", group_handle);
                return Err(Error::InvalidGroupHandle(group_handle));
            };

            let Some(slot) = group.handles.get(lod as usize) else {
                log::error!("LOD {} out of range for {} ({} LODs)", lod, group_handle, group.lod_count());
                return Err(Error::InvalidLodIndex {
                    group: group_handle,
                    lod,
                    lod_count: group.lod_count(),
                });
            };

            if let Some(occupant) = *slot {
                log::error!("LOD {} of {} already holds {}", lod, group_handle, occupant);
                return Err(Error::LodSlotOccupied {
                    group: group_handle,
                    lod,
                    occupant,
                });
            }

            always_resident =
                is_always_resident_lod(lod, group.lod_count(), self.config.num_always_resident_lods);
            in_range = lod >= group.current_first_lod;
        }

        let handle = self.geometries.insert(RegisteredGeometry {
            geometry: geometry.clone(),
            size: 0,
            last_referenced_frame: 0,
            status: GeometryStatus::StreamedOut,
            streamable: None,
            streaming_request: None,
        });
        geometry.set_handle(Some(handle));

        if let Some(group_handle) = geometry.group() {
            if let Some(group) = self.groups.get_mut(group_handle) {
                group.handles[lod as usize] = Some(handle);
                group.num_references += 1;
            }
            if always_resident {
                self.always_resident.insert(handle);
            }
        }

        let wants_residency = enabled && (!reference_based || always_resident);
        if wants_residency {
            geometry.set_evicted_flag(false);
            if in_range {
                self.pending_streaming.insert(handle);
            }
        } else if geometry.is_valid() {
            work.remove_build(geometry.evict());
        } else {
            geometry.set_evicted_flag(true);
        }

        self.refresh(handle, true);

        log::trace!(
            "Registered {} (lod {}, always resident {}, {} bytes)",
            handle,
            lod,
            always_resident,
            self.geometries.get(handle).map_or(0, |g| g.size)
        );

        Ok(handle)
    }

    pub fn release_geometry(&mut self, handle: GeometryHandle, work: &mut DeferredWork) -> Result<()> {
        let Some(entry) = self.geometries.remove(handle) else {
            log::error!("Releasing unknown or already released {}", handle);
            return Err(Error::InvalidGeometryHandle(handle));
        };

        if let Some(slot) = entry.streaming_request {
            self.ring.cancel(slot, handle);
        }

        let geometry = &entry.geometry;
        if let Some(group_handle) = geometry.group() {
            if let Some(group) = self.groups.get_mut(group_handle) {
                match group.handles.get_mut(geometry.lod_index() as usize) {
                    Some(slot) if *slot == Some(handle) => *slot = None,
                    _ => log::warn!(
                        "LOD {} of {} does not hold {} on release",
                        geometry.lod_index(),
                        group_handle,
                        handle
                    ),
                }
            }
            if let Err(e) = self.release_group_reference(group_handle) {
                log::error!("Group reference of {} not released: {}", handle, e);
            }
        }

        if self.resident.remove(&handle) {
            self.total_resident_size -= entry.size;
        }
        if self.always_resident.remove(&handle) {
            self.total_always_resident_size -= entry.size;
        }
        self.evictable.remove(&handle);
        self.referenced.remove(&handle);
        self.pending_streaming.remove(&handle);

        work.remove_build(geometry.take_build_request());
        geometry.set_handle(None);

        log::trace!("Released {}", handle);
        Ok(())
    }

    pub fn set_streaming_data(&mut self, geometry: &RayTracingGeometry, data: StreamableData) -> Result<()> {
        let Some(handle) = self.lookup(geometry) else {
            log::error!("Streaming data can only be set on registered geometry");
            return Err(Error::NotRegistered);
        };

        if let Some(entry) = self.geometries.get_mut(handle) {
            entry.streamable = Some(data);
        }
        Ok(())
    }

    /// Move the group's first in-range LOD.
    ///
    /// Raising it releases the GPU resources of LODs that fell out of range;
    /// lowering it queues the LODs that came back (legacy residency only).
    pub fn set_group_current_first_lod(
        &mut self,
        cmd: &mut dyn CommandList,
        handle: GroupHandle,
        new_first_lod: u8,
        work: &mut DeferredWork,
    ) -> Result<()> {
        let Some(group) = self.groups.get(handle) else {
            log::error!("Setting first LOD of unknown geometry group {}", handle);
            return Err(Error::InvalidGroupHandle(handle));
        };

        if new_first_lod as usize > group.lod_count() {
            log::error!("First LOD {} out of range for {}", new_first_lod, handle);
            return Err(Error::InvalidLodIndex {
                group: handle,
                lod: new_first_lod,
                lod_count: group.lod_count(),
            });
        }

        let old_first_lod = group.current_first_lod.min(u8::try_from(group.lod_count()).unwrap_or(u8::MAX));

        if new_first_lod > old_first_lod {
            let released: Vec<GeometryHandle> = group.handles[old_first_lod as usize..new_first_lod as usize]
                .iter()
                .flatten()
                .copied()
                .collect();

            let mut batch = ResourceReplaceBatch::with_capacity(released.len());
            let mut refreshed = Vec::with_capacity(released.len());

            for geometry_handle in released {
                // Some LODs are stripped and never registered
                let Some(entry) = self.geometries.get(geometry_handle) else {
                    continue;
                };
                if !entry.geometry.is_evicted() {
                    work.remove_build(entry.geometry.release_for_streaming(&mut batch));
                    refreshed.push(geometry_handle);
                }
            }

            batch.submit(cmd);
            for geometry_handle in refreshed {
                self.refresh(geometry_handle, false);
            }
            work.notify(Some(handle));
        } else if self.config.ray_tracing_enabled && !self.config.use_reference_based_residency {
            for geometry_handle in group.handles[new_first_lod as usize..old_first_lod as usize]
                .iter()
                .flatten()
            {
                self.pending_streaming.insert(*geometry_handle);
            }
        }

        if let Some(group) = self.groups.get_mut(handle) {
            group.current_first_lod = new_first_lod;
        }

        log::trace!("{} first LOD {} -> {}", handle, old_first_lod, new_first_lod);
        Ok(())
    }

    /// Recompute size and residency set membership of one geometry.
    ///
    /// `restream` forces a streaming destination back to `StreamedOut`, as
    /// needed after its initializer changed. Geometry that is no longer
    /// resident always goes back to `StreamedOut`. Stale handles are ignored.
    pub fn refresh(&mut self, handle: GeometryHandle, restream: bool) {
        let Some(entry) = self.geometries.get_mut(handle) else {
            return;
        };

        let geometry = entry.geometry.clone();
        let initializer = geometry.initializer();
        let old_size = entry.size;

        // The GPU object may not exist yet, so size comes from the initializer
        entry.size = if initializer.has_valid_segments() {
            self.device.calc_geometry_size(&initializer)
        } else {
            0
        };
        let new_size = entry.size;

        if self.always_resident.contains(&handle) {
            self.total_always_resident_size = self.total_always_resident_size - old_size + new_size;
        }

        let resident = geometry.is_resident();

        if resident {
            if !self.resident.insert(handle) {
                self.total_resident_size -= old_size;
            }
            self.total_resident_size += new_size;

            let evictable = match geometry.group().and_then(|g| self.groups.get(g)) {
                Some(group) => !is_always_resident_lod(
                    geometry.lod_index(),
                    group.lod_count(),
                    self.config.num_always_resident_lods,
                ),
                // Ungrouped geometry (e.g. dynamic) is always evictable
                None => true,
            };
            if evictable {
                self.evictable.insert(handle);
            } else {
                self.evictable.remove(&handle);
            }
        } else {
            if self.resident.remove(&handle) {
                self.total_resident_size -= old_size;
            }
            self.evictable.remove(&handle);
        }

        assert!(
            !self.always_resident.contains(&handle)
                || !geometry.is_evicted()
                || !self.config.ray_tracing_enabled
                || self.enable_changed,
            "Always resident ray tracing geometry {} was evicted",
            handle
        );

        if initializer.kind == InitializerType::StreamingDestination && (restream || !resident) {
            if let Some(entry) = self.geometries.get_mut(handle) {
                if let Some(slot) = entry.streaming_request.take() {
                    self.ring.cancel(slot, handle);
                }
                entry.status = GeometryStatus::StreamedOut;
            }
        }
    }

    // -- Residency transitions -------------------------------------------------

    /// Create the GPU object if needed and queue a build when one is required
    pub fn make_resident(&mut self, handle: GeometryHandle, cmd: &mut dyn CommandList, work: &mut DeferredWork) {
        let Some(entry) = self.geometries.get(handle) else {
            return;
        };
        let geometry = entry.geometry.clone();

        geometry.make_resident(cmd);
        self.refresh(handle, false);

        if geometry.take_build_requirement() {
            work.build_requests.push(geometry);
        }
        self.made_resident_last_tick += 1;
    }

    pub fn evict(&mut self, handle: GeometryHandle, work: &mut DeferredWork) {
        let Some(entry) = self.geometries.get(handle) else {
            return;
        };
        let geometry = entry.geometry.clone();

        work.remove_build(geometry.evict());
        work.notify(geometry.group());
        self.refresh(handle, false);
        self.evicted_last_tick += 1;
    }

    // -- References ------------------------------------------------------------

    pub fn add_referenced_geometry(&mut self, geometry: &RayTracingGeometry) {
        if !self.config.use_reference_based_residency {
            return;
        }
        if let Some(handle) = self.lookup(geometry) {
            self.referenced.insert(handle);
        }
    }

    pub fn add_referenced_groups(&mut self, groups: impl IntoIterator<Item = GroupHandle>) {
        if self.config.use_reference_based_residency {
            self.referenced_groups.extend(groups);
        } else if groups.into_iter().next().is_some() {
            log::warn!("Referenced geometry groups are only tracked with reference based residency");
        }
    }

    /// Whether `geometry` sits in one of the always-resident LODs of its group
    pub fn is_always_resident_geometry(&self, geometry: &RayTracingGeometry) -> bool {
        geometry
            .group()
            .and_then(|g| self.groups.get(g))
            .is_some_and(|group| {
                is_always_resident_lod(geometry.lod_index(), group.lod_count(), self.config.num_always_resident_lods)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TableKey;
    use crate::gpu::geometry::{GeometryInitializer, GeometrySegment};
    use crate::manager::GeometryManager;
    use crate::testing::{
        geometry, lod_geometry, manager, reference_based, render_frame, CountingProxy, MockCommandList,
    };

    #[test]
    fn test_always_resident_lod() {
        // Three LODs, lowest detail is the last one
        assert!(!is_always_resident_lod(0, 3, 1));
        assert!(!is_always_resident_lod(1, 3, 1));
        assert!(is_always_resident_lod(2, 3, 1));

        assert!(is_always_resident_lod(1, 3, 2));
        assert!(!is_always_resident_lod(2, 3, 0));

        // More always-resident LODs than the group has
        assert!(is_always_resident_lod(0, 2, 5));
    }

    #[test]
    fn test_deferred_work_dedupes_groups() {
        let mut work = DeferredWork::default();
        assert!(work.is_empty());

        let group = GroupHandle::from_index(1);
        work.notify(Some(group));
        work.notify(Some(group));
        work.notify(None);
        assert_eq!(work.notify_groups, vec![group]);

        work.remove_build(None);
        assert!(work.build_removals.is_empty());
        assert!(!work.is_empty());
    }

    fn legacy() -> GeometryManager {
        manager(ManagerConfig::default(), &[("lod0", 10), ("lod1", 20), ("lod2", 40)])
    }

    #[test]
    fn test_lod_slot_exclusive() {
        let manager = legacy();
        let group = manager.register_group(3, 0);

        let first = lod_geometry("lod0", InitializerType::Rendering, group, 0);
        let second = lod_geometry("lod0", InitializerType::Rendering, group, 0);

        let handle = manager.register_geometry(&first).unwrap();
        let err = manager.register_geometry(&second).unwrap_err();
        assert!(matches!(err, Error::LodSlotOccupied { lod: 0, occupant, .. } if occupant == handle));
        assert_eq!(manager.group_lod(group, 0), Some(handle));

        manager.release_geometry(handle).unwrap();
        let replacement = manager.register_geometry(&second).unwrap();
        assert_eq!(manager.group_lod(group, 0), Some(replacement));
    }

    #[test]
    fn test_invalid_lod_and_group() {
        let manager = legacy();
        let group = manager.register_group(2, 0);

        let out_of_range = lod_geometry("lod0", InitializerType::Rendering, group, 2);
        assert!(matches!(
            manager.register_geometry(&out_of_range),
            Err(Error::InvalidLodIndex { lod: 2, lod_count: 2, .. })
        ));

        let orphan = lod_geometry("lod0", InitializerType::Rendering, GroupHandle::from_index(9), 0);
        assert!(matches!(manager.register_geometry(&orphan), Err(Error::InvalidGroupHandle(_))));

        // Nothing leaked into the table
        assert_eq!(manager.stats().geometry_count, 0);
    }

    #[test]
    fn test_register_twice() {
        let manager = legacy();
        let mesh = geometry("mesh", InitializerType::Rendering);

        let handle = manager.register_geometry(&mesh).unwrap();
        assert_eq!(mesh.handle(), Some(handle));
        assert!(matches!(manager.register_geometry(&mesh), Err(Error::AlreadyRegistered(h)) if h == handle));
    }

    #[test]
    fn test_double_release() {
        let manager = legacy();
        let mesh = geometry("mesh", InitializerType::Rendering);
        let handle = manager.register_geometry(&mesh).unwrap();

        manager.release_geometry(handle).unwrap();
        assert!(mesh.handle().is_none());
        assert!(matches!(manager.release_geometry(handle), Err(Error::InvalidGeometryHandle(_))));
    }

    #[test]
    fn test_group_reference_lifecycle() {
        let manager = legacy();
        let group = manager.register_group(3, 0);
        assert_eq!(manager.group_references(group), Some(1));

        let lod0 = manager
            .register_geometry(&lod_geometry("lod0", InitializerType::Rendering, group, 0))
            .unwrap();
        let lod2 = manager
            .register_geometry(&lod_geometry("lod2", InitializerType::Rendering, group, 2))
            .unwrap();
        assert_eq!(manager.group_references(group), Some(3));

        let proxy: Arc<dyn CachedStateProxy> = Arc::new(CountingProxy::default());
        manager.register_proxy_with_cached_state(group, proxy.clone()).unwrap();
        assert_eq!(manager.group_references(group), Some(4));

        // Creator lets go; members and proxy keep it alive
        manager.release_group(group).unwrap();
        assert_eq!(manager.group_references(group), Some(3));

        manager.release_geometry(lod0).unwrap();
        manager.release_geometry(lod2).unwrap();
        assert_eq!(manager.group_references(group), Some(1));

        manager.unregister_proxy_with_cached_state(group, &proxy).unwrap();
        assert_eq!(manager.group_references(group), None);
        assert_eq!(manager.stats().group_count, 0);
    }

    #[test]
    fn test_release_group_with_members_is_rejected() {
        let manager = legacy();
        let group = manager.register_group(1, 0);
        let lod0 = manager
            .register_geometry(&lod_geometry("lod0", InitializerType::Rendering, group, 0))
            .unwrap();

        manager.release_group(group).unwrap();
        // Over-release: the member still occupies its slot
        assert!(matches!(manager.release_group(group), Err(Error::GroupNotEmpty(_))));
        assert_eq!(manager.group_lod(group, 0), Some(lod0));

        manager.release_geometry(lod0).unwrap();
        assert_eq!(manager.group_references(group), None);
    }

    #[test]
    fn test_proxy_registration_errors() {
        let manager = legacy();
        let group = manager.register_group(1, 0);
        let proxy: Arc<dyn CachedStateProxy> = Arc::new(CountingProxy::default());
        let stranger: Arc<dyn CachedStateProxy> = Arc::new(CountingProxy::default());

        manager.register_proxy_with_cached_state(group, proxy.clone()).unwrap();
        assert!(matches!(
            manager.register_proxy_with_cached_state(group, proxy.clone()),
            Err(Error::ProxyAlreadyRegistered(_))
        ));
        assert!(matches!(
            manager.unregister_proxy_with_cached_state(group, &stranger),
            Err(Error::ProxyNotRegistered(_))
        ));
        assert_eq!(manager.group_references(group), Some(2));
    }

    #[test]
    fn test_release_restores_tracking_sets() {
        let mut config = reference_based(1000);
        config.num_always_resident_lods = 1;
        let manager = manager(config, &[("lod0", 10), ("lod1", 20)]);
        let mut cmd = MockCommandList::default();

        let group = manager.register_group(2, 0);
        let lod0 = lod_geometry("lod0", InitializerType::Rendering, group, 0);
        let lod0_handle = manager.register_geometry(&lod0).unwrap();
        render_frame(&manager, &mut cmd, 1, &[&lod0]);
        let before = manager.stats();

        let lod1 = lod_geometry("lod1", InitializerType::Rendering, group, 1);
        let handle = manager.register_geometry(&lod1).unwrap();
        render_frame(&manager, &mut cmd, 2, &[&lod0]);
        assert!(manager.is_resident(handle));
        assert!(manager.is_always_resident(handle));

        manager.pre_render();
        manager.add_referenced_geometry(&lod1);
        manager.add_referenced_geometry(&lod0);
        assert!(manager.is_geometry_referenced(&lod1));

        manager.release_geometry(handle).unwrap();
        assert!(!manager.is_resident(handle));
        assert!(!manager.is_always_resident(handle));
        assert!(!manager.is_evictable(handle));
        assert!(!manager.is_geometry_referenced(&lod1));
        assert!(!manager.is_pending_streaming(handle));

        let after = manager.stats();
        assert_eq!(after.resident_bytes, before.resident_bytes);
        assert_eq!(after.always_resident_bytes, before.always_resident_bytes);
        assert_eq!(after.geometry_count, before.geometry_count);
        assert!(manager.is_resident(lod0_handle));
    }

    #[test]
    fn test_refresh_recomputes_size() {
        let manager = manager(ManagerConfig::default(), &[]);
        let mut cmd = MockCommandList::default();
        let mesh = geometry("mesh", InitializerType::Rendering);
        let handle = manager.register_geometry(&mesh).unwrap();
        manager.tick(&mut cmd, 1);

        // Mock device sizes by primitive count
        assert_eq!(manager.geometry_size(handle), Some(10));
        assert_eq!(manager.stats().resident_bytes, 10);

        mesh.set_initializer(GeometryInitializer::with_primitives("mesh", InitializerType::Rendering, 64));
        manager.refresh_registered_geometry(handle);
        assert_eq!(manager.geometry_size(handle), Some(64));
        assert_eq!(manager.stats().resident_bytes, 64);

        let mut missing_buffer = GeometryInitializer::with_primitives("mesh", InitializerType::Rendering, 64);
        missing_buffer.segments.push(GeometrySegment { vertex_buffer: None, num_primitives: 4 });
        mesh.set_initializer(missing_buffer);
        manager.refresh_registered_geometry(handle);
        assert_eq!(manager.geometry_size(handle), Some(0));
        assert_eq!(manager.stats().resident_bytes, 0);
    }

    #[test]
    fn test_set_streaming_data_requires_registration() {
        let manager = legacy();
        let mesh = geometry("mesh", InitializerType::StreamingDestination);
        let bulk = crate::testing::ScriptedBulkData::with_payload(&[1, 2]);

        assert!(matches!(
            manager.set_streaming_data(&mesh, bulk.streamable()),
            Err(Error::NotRegistered)
        ));
        manager.register_geometry(&mesh).unwrap();
        manager.set_streaming_data(&mesh, bulk.streamable()).unwrap();
    }

    #[test]
    fn test_first_lod_raise_releases_and_lower_requeues() {
        let manager = legacy();
        let mut cmd = MockCommandList::default();
        let group = manager.register_group(3, 0);
        let proxy = Arc::new(CountingProxy::default());
        manager.register_proxy_with_cached_state(group, proxy.clone()).unwrap();

        let handles: Vec<GeometryHandle> = (0..3u8)
            .map(|lod| {
                let name = format!("lod{}", lod);
                manager
                    .register_geometry(&lod_geometry(&name, InitializerType::Rendering, group, lod))
                    .unwrap()
            })
            .collect();
        manager.tick(&mut cmd, 1);
        assert!(handles.iter().all(|h| manager.is_resident(*h)));
        assert_eq!(manager.stats().resident_bytes, 70);

        manager.set_group_current_first_lod(&mut cmd, group, 2).unwrap();
        assert!(!manager.is_resident(handles[0]));
        assert!(!manager.is_resident(handles[1]));
        assert!(manager.is_resident(handles[2]));
        assert_eq!(manager.stats().resident_bytes, 40);
        assert_eq!(cmd.replaced.last().map(Vec::len), Some(2));
        assert!(cmd.replaced.last().unwrap().iter().all(|r| r.src.is_none()));
        assert!(proxy.calls() > 0);

        manager.set_group_current_first_lod(&mut cmd, group, 0).unwrap();
        assert!(manager.is_pending_streaming(handles[0]));
        assert!(manager.is_pending_streaming(handles[1]));

        manager.tick(&mut cmd, 2);
        assert!(handles.iter().all(|h| manager.is_resident(*h)));
        assert_eq!(manager.stats().resident_bytes, 70);

        assert!(matches!(
            manager.set_group_current_first_lod(&mut cmd, group, 4),
            Err(Error::InvalidLodIndex { .. })
        ));
    }

    #[test]
    fn test_out_of_range_first_lod_is_clamped() {
        let manager = legacy();
        let mut cmd = MockCommandList::default();
        let group = manager.register_group(2, 5);

        // Lowering from the clamped first LOD queues the returning slots
        let lod0 = lod_geometry("lod0", InitializerType::Rendering, group, 0);
        let handle = manager.register_geometry(&lod0).unwrap();
        assert!(!manager.is_pending_streaming(handle));

        manager.set_group_current_first_lod(&mut cmd, group, 0).unwrap();
        assert!(manager.is_pending_streaming(handle));

        manager.tick(&mut cmd, 1);
        assert!(manager.is_resident(handle));
    }
}
