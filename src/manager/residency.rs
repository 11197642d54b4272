//! Per-frame residency controller

use std::collections::HashSet;

use crate::core::types::{FrameNumber, GeometryHandle};
use crate::gpu::device::CommandList;
use crate::manager::registry::{is_always_resident_lod, DeferredWork, ResidencyState};

impl ResidencyState {
    /// Run the residency state machine for one rendered frame.
    ///
    /// Mode handling comes first, then pending stream-ins are retried and
    /// completed reads finalized. Referenced sets are cleared at the end.
    pub fn tick(&mut self, cmd: &mut dyn CommandList, frame: FrameNumber, work: &mut DeferredWork) {
        if let Some(last) = self.last_tick_frame {
            debug_assert!(last != frame, "Geometry manager ticked twice in frame {}", frame);
        }
        self.last_tick_frame = Some(frame);
        self.evicted_last_tick = 0;
        self.made_resident_last_tick = 0;

        debug_assert!(
            self.config.use_reference_based_residency
                || (self.referenced.is_empty() && self.referenced_groups.is_empty()),
            "Referenced geometry is only tracked with reference based residency"
        );

        if self.refresh_always_resident {
            self.rebuild_always_resident(cmd, work);
        }

        if !self.config.ray_tracing_enabled {
            self.tick_disabled(work);
        } else if self.config.use_reference_based_residency {
            if !self.rendered_frame {
                if !self.referenced.is_empty() || !self.referenced_groups.is_empty() {
                    log::warn!("Referenced geometry marked without pre_render; ignored until the next rendered frame");
                }
                return;
            }
            self.rendered_frame = false;
            self.tick_reference_based(cmd, frame, work);
        } else {
            self.tick_all_resident(cmd, work);
        }

        self.retry_pending_streaming(cmd, work);
        self.process_completed_streaming_requests(cmd, work);

        self.referenced.clear();
        self.referenced_groups.clear();
        self.enable_changed = false;

        if self.config.ray_tracing_enabled && self.config.use_reference_based_residency {
            self.overrun.update(self.total_resident_size, self.budget());
        } else {
            self.overrun.reset();
        }

        log::debug!(
            "Frame {}: {} bytes resident ({} always resident), {} requested, {} evicted, {} made resident, {} pending, {} in flight",
            frame,
            self.total_resident_size,
            self.total_always_resident_size,
            self.requested_size,
            self.evicted_last_tick,
            self.made_resident_last_tick,
            self.pending_streaming.len(),
            self.ring.in_flight()
        );
    }

    /// Recompute the always-resident set after the LOD count changed
    fn rebuild_always_resident(&mut self, cmd: &mut dyn CommandList, work: &mut DeferredWork) {
        self.refresh_always_resident = false;
        self.always_resident.clear();
        self.total_always_resident_size = 0;

        let enabled = self.config.ray_tracing_enabled;
        let reference_based = self.config.use_reference_based_residency;

        for handle in self.geometries.keys() {
            let Some(entry) = self.geometries.get(handle) else {
                continue;
            };
            let geometry = entry.geometry.clone();
            let size = entry.size;

            if geometry.group().is_none() {
                continue;
            }

            if self.is_always_resident_geometry(&geometry) {
                self.always_resident.insert(handle);
                self.total_always_resident_size += size;

                if enabled {
                    if geometry.is_evicted() {
                        self.make_resident(handle, cmd, work);
                    }
                    if !self.request_stream_in(cmd, handle, work) {
                        self.pending_streaming.insert(handle);
                    }
                }
                self.evictable.remove(&handle);
            } else if enabled && reference_based && geometry.is_valid() {
                self.evict(handle, work);
            } else {
                self.refresh(handle, false);
            }
        }

        log::info!(
            "Always resident ray tracing geometry refreshed: {} geometries, {} bytes",
            self.always_resident.len(),
            self.total_always_resident_size
        );
    }

    fn tick_disabled(&mut self, work: &mut DeferredWork) {
        if self.enable_changed {
            for handle in self.geometries.keys() {
                let valid = self.geometries.get(handle).is_some_and(|e| e.geometry.is_valid());
                if valid {
                    self.evict(handle, work);
                }
            }
            self.pending_streaming.clear();
            log::info!("Ray tracing disabled, evicted {} geometries", self.evicted_last_tick);
        } else {
            debug_assert!(
                self.geometries.iter().all(|(_, e)| e.geometry.is_evicted() || !e.geometry.is_valid()),
                "Ray tracing geometry should be evicted when ray tracing is disabled"
            );
        }

        debug_assert_eq!(
            self.total_resident_size, 0,
            "Resident size should be 0 with ray tracing disabled"
        );
        if self.total_resident_size != 0 {
            log::error!(
                "{} bytes still tracked as resident with ray tracing disabled",
                self.total_resident_size
            );
            self.total_resident_size = 0;
            self.resident.clear();
            self.evictable.clear();
        }

        self.requested_size = 0;
    }

    /// Budgeted residency driven by this frame's references
    fn tick_reference_based(&mut self, cmd: &mut dyn CommandList, frame: FrameNumber, work: &mut DeferredWork) {
        if self.enable_changed {
            let always_resident: Vec<GeometryHandle> = self.always_resident.iter().copied().collect();
            for handle in always_resident {
                let evicted = self.geometries.get(handle).is_some_and(|e| e.geometry.is_evicted());
                if evicted {
                    self.make_resident(handle, cmd, work);
                }
                if !self.request_stream_in(cmd, handle, work) {
                    self.pending_streaming.insert(handle);
                }
            }
        }

        let mut not_referenced_resident = self.evictable.clone();
        let mut referenced: Vec<GeometryHandle> = Vec::with_capacity(self.referenced.len());
        let mut counted: HashSet<GeometryHandle> = HashSet::with_capacity(self.referenced.len());

        let mut requested_size = 0u64;
        let mut requested_but_evicted_size = 0u64;

        // Individually referenced geometry
        for handle in self.referenced.iter().copied() {
            let Some(entry) = self.geometries.get_mut(handle) else {
                continue;
            };
            entry.last_referenced_frame = frame;

            if counted.insert(handle) {
                requested_size += entry.size;
                if !entry.geometry.is_resident() {
                    requested_but_evicted_size += entry.size;
                }
                referenced.push(handle);
            }
            not_referenced_resident.remove(&handle);
        }

        // Referenced groups pull in every LOD from the first in-range one, so
        // dropping to a coarser LOD always finds its data resident.
        for group_handle in self.referenced_groups.iter().copied() {
            let Some(group) = self.groups.get(group_handle) else {
                continue;
            };

            let lod_count = group.lod_count();
            let first = (group.current_first_lod as usize).min(lod_count);

            for (lod, handle) in group.handles.iter().enumerate().skip(first) {
                let Some(handle) = *handle else {
                    // Stripped LOD
                    continue;
                };
                let Some(entry) = self.geometries.get_mut(handle) else {
                    continue;
                };
                entry.last_referenced_frame = frame;

                let first_count = counted.insert(handle);
                if first_count {
                    requested_size += entry.size;
                }

                if is_always_resident_lod(lod as u8, lod_count, self.config.num_always_resident_lods) {
                    assert!(
                        !entry.geometry.is_evicted(),
                        "Always resident ray tracing geometry {} was evicted",
                        handle
                    );
                } else {
                    if first_count {
                        if !entry.geometry.is_resident() {
                            requested_but_evicted_size += entry.size;
                        }
                        referenced.push(handle);
                    }
                    not_referenced_resident.remove(&handle);
                }
            }
        }

        self.requested_size = requested_size;
        let budget = self.budget();

        // Evict unreferenced geometry if the requested set will not fit
        if self.total_resident_size + requested_but_evicted_size > budget {
            let mut candidates: Vec<(GeometryHandle, FrameNumber, u64)> = not_referenced_resident
                .iter()
                .filter_map(|&h| self.geometries.get(h).map(|e| (h, e.last_referenced_frame, e.size)))
                .collect();

            // Least recently used first, then largest
            candidates.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));

            for (handle, _, _) in candidates {
                if self.total_resident_size + requested_but_evicted_size <= budget {
                    break;
                }
                debug_assert!(self.resident.contains(&handle));
                self.evict(handle, work);
            }
        }

        // Make referenced geometry resident, smallest first, until the budget is hit
        if self.total_resident_size < budget {
            referenced.sort_by_key(|&h| (self.geometries.get(h).map_or(0, |e| e.size), h));

            for handle in referenced {
                if self.total_resident_size >= budget {
                    break;
                }

                let evicted = self.geometries.get(handle).is_some_and(|e| e.geometry.is_evicted());
                if evicted {
                    self.make_resident(handle, cmd, work);
                }
                if !self.request_stream_in(cmd, handle, work) {
                    self.pending_streaming.insert(handle);
                }
            }
        }
    }

    /// Everything resident, no budget
    fn tick_all_resident(&mut self, cmd: &mut dyn CommandList, work: &mut DeferredWork) {
        if self.enable_changed {
            for handle in self.geometries.keys() {
                let evicted = self.geometries.get(handle).is_some_and(|e| e.geometry.is_evicted());
                if evicted {
                    self.make_resident(handle, cmd, work);
                }
                if !self.request_stream_in(cmd, handle, work) {
                    self.pending_streaming.insert(handle);
                }
            }
            log::info!("All ray tracing geometry made resident ({} bytes)", self.total_resident_size);
        } else {
            debug_assert!(
                self.geometries.iter().all(|(_, e)| !e.geometry.is_evicted()),
                "Ray tracing geometry should not be evicted when ray tracing is enabled"
            );
        }

        self.requested_size = self.total_resident_size;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rayon::prelude::*;

    use crate::gpu::geometry::{InitializerType, RayTracingGeometry};
    use crate::manager::ManagerConfig;
    use crate::testing::{geometry, lod_geometry, manager, reference_based, render_frame, MockCommandList};

    fn lods(
        manager: &crate::manager::GeometryManager,
        group: crate::core::types::GroupHandle,
        names: &[&str],
    ) -> Vec<Arc<RayTracingGeometry>> {
        names
            .iter()
            .enumerate()
            .map(|(lod, name)| {
                let geometry = lod_geometry(name, InitializerType::Rendering, group, lod as u8);
                manager.register_geometry(&geometry).unwrap();
                geometry
            })
            .collect()
    }

    fn handle(geometry: &RayTracingGeometry) -> crate::core::types::GeometryHandle {
        geometry.handle().unwrap()
    }

    #[test]
    fn test_lru_eviction_scenario() {
        let manager = manager(reference_based(45), &[("a0", 10), ("a1", 20), ("a2", 40), ("b0", 40)]);
        let mut cmd = MockCommandList::default();

        let group_a = manager.register_group(3, 0);
        let a = lods(&manager, group_a, &["a0", "a1", "a2"]);
        assert!(a.iter().all(|g| g.is_evicted()));

        render_frame(&manager, &mut cmd, 1, &[&a[0]]);
        assert!(manager.is_resident(handle(&a[0])));
        assert!(!manager.is_resident(handle(&a[1])));
        assert_eq!(manager.stats().resident_bytes, 10);
        assert_eq!(manager.last_referenced_frame(handle(&a[0])), Some(1));

        // Nothing competes, so it stays
        render_frame(&manager, &mut cmd, 2, &[]);
        assert!(manager.is_resident(handle(&a[0])));

        let group_b = manager.register_group(1, 0);
        let b = lods(&manager, group_b, &["b0"]);
        render_frame(&manager, &mut cmd, 3, &[&b[0]]);

        assert!(!manager.is_resident(handle(&a[0])));
        assert!(a[0].is_evicted());
        assert!(manager.is_resident(handle(&b[0])));
        assert_eq!(manager.stats().resident_bytes, 40);
        assert_eq!(manager.stats().evicted_last_tick, 1);
        assert_eq!(manager.stats().made_resident_last_tick, 1);
    }

    #[test]
    fn test_eviction_prefers_larger_on_lru_tie() {
        let manager = manager(reference_based(150), &[("big", 100), ("small", 50), ("next", 60)]);
        let mut cmd = MockCommandList::default();

        let big = geometry("big", InitializerType::Rendering);
        let small = geometry("small", InitializerType::Rendering);
        let next = geometry("next", InitializerType::Rendering);
        for g in [&big, &small, &next] {
            manager.register_geometry(g).unwrap();
        }

        render_frame(&manager, &mut cmd, 1, &[&big, &small]);
        assert_eq!(manager.stats().resident_bytes, 150);

        render_frame(&manager, &mut cmd, 2, &[&next]);
        assert!(!manager.is_resident(handle(&big)));
        assert!(manager.is_resident(handle(&small)));
        assert!(manager.is_resident(handle(&next)));
        assert_eq!(manager.stats().resident_bytes, 110);
    }

    #[test]
    fn test_referenced_geometry_overruns_budget() {
        let manager = manager(reference_based(30), &[("x", 20), ("y", 20)]);
        let mut cmd = MockCommandList::default();
        let x = geometry("x", InitializerType::Rendering);
        let y = geometry("y", InitializerType::Rendering);
        manager.register_geometry(&x).unwrap();
        manager.register_geometry(&y).unwrap();

        render_frame(&manager, &mut cmd, 1, &[&x, &y]);
        let stats = manager.stats();
        assert!(manager.is_resident(handle(&x)) && manager.is_resident(handle(&y)));
        assert_eq!(stats.resident_bytes, 40);
        assert_eq!(stats.requested_bytes, 40);
        assert_eq!(stats.budget_overrun_bytes, 10);
        assert_eq!(stats.consecutive_overrun_frames, 1);

        render_frame(&manager, &mut cmd, 2, &[&x, &y]);
        assert_eq!(manager.stats().consecutive_overrun_frames, 2);

        // Dropping the reference lets eviction catch up
        render_frame(&manager, &mut cmd, 3, &[&x]);
        let stats = manager.stats();
        assert!(!manager.is_resident(handle(&y)));
        assert_eq!(stats.resident_bytes, 20);
        assert_eq!(stats.budget_overrun_bytes, 0);
        assert_eq!(stats.consecutive_overrun_frames, 0);
    }

    #[test]
    fn test_always_resident_lod_is_never_evicted() {
        let mut config = reference_based(15);
        config.num_always_resident_lods = 1;
        let manager = manager(config, &[("lod0", 10), ("lod1", 20)]);
        let mut cmd = MockCommandList::default();

        let group = manager.register_group(2, 0);
        let g = lods(&manager, group, &["lod0", "lod1"]);
        assert!(manager.is_always_resident(handle(&g[1])));
        assert!(manager.is_pending_streaming(handle(&g[1])));

        render_frame(&manager, &mut cmd, 1, &[]);
        assert!(manager.is_resident(handle(&g[1])));
        assert!(!manager.is_evictable(handle(&g[1])));
        assert_eq!(manager.stats().always_resident_bytes, 20);

        manager.pre_render();
        manager.add_referenced_geometry_groups([group]);
        manager.tick(&mut cmd, 2);

        // Over budget with nothing evictable: the finer LOD waits
        assert!(!g[1].is_evicted());
        assert!(manager.is_resident(handle(&g[1])));
        assert!(!manager.is_resident(handle(&g[0])));
        assert_eq!(manager.stats().requested_bytes, 30);
    }

    #[test]
    fn test_referenced_group_from_first_lod() {
        let manager = manager(reference_based(1000), &[("lod0", 10), ("lod1", 20), ("lod2", 40)]);
        let mut cmd = MockCommandList::default();
        let group = manager.register_group(3, 1);
        let g = lods(&manager, group, &["lod0", "lod1", "lod2"]);

        manager.pre_render();
        manager.add_referenced_geometry_groups([group]);
        assert!(manager.is_geometry_group_referenced(group));
        manager.tick(&mut cmd, 7);

        assert!(!manager.is_resident(handle(&g[0])));
        assert!(manager.is_resident(handle(&g[1])));
        assert!(manager.is_resident(handle(&g[2])));
        assert_eq!(manager.last_referenced_frame(handle(&g[0])), Some(0));
        assert_eq!(manager.last_referenced_frame(handle(&g[1])), Some(7));
        assert_eq!(manager.stats().requested_bytes, 60);
        assert!(!manager.is_geometry_group_referenced(group));
    }

    #[test]
    fn test_tick_without_pre_render_is_ignored() {
        let manager = manager(reference_based(100), &[]);
        let mut cmd = MockCommandList::default();
        let mesh = geometry("mesh", InitializerType::Rendering);
        let handle = manager.register_geometry(&mesh).unwrap();

        manager.add_referenced_geometry(&mesh);
        manager.tick(&mut cmd, 1);
        assert!(!manager.is_resident(handle));

        render_frame(&manager, &mut cmd, 2, &[&mesh]);
        assert!(manager.is_resident(handle));
    }

    #[test]
    fn test_disable_and_enable_ray_tracing() {
        let manager = manager(ManagerConfig::default(), &[("lod0", 10), ("lod1", 20), ("loose", 5)]);
        let mut cmd = MockCommandList::default();
        let group = manager.register_group(2, 0);
        let g = lods(&manager, group, &["lod0", "lod1"]);
        let loose = geometry("loose", InitializerType::Rendering);
        manager.register_geometry(&loose).unwrap();

        manager.tick(&mut cmd, 1);
        assert_eq!(manager.stats().resident_bytes, 35);
        assert_eq!(manager.stats().requested_bytes, 35);

        manager.set_ray_tracing_enabled(false);
        manager.tick(&mut cmd, 2);
        assert_eq!(manager.stats().resident_bytes, 0);
        assert!(g.iter().all(|g| g.is_evicted()));
        assert!(loose.is_evicted());
        assert_eq!(manager.stats().pending_builds, 0);

        manager.tick(&mut cmd, 3);
        assert_eq!(manager.stats().evicted_last_tick, 0);

        manager.set_ray_tracing_enabled(true);
        manager.tick(&mut cmd, 4);
        assert_eq!(manager.stats().resident_bytes, 35);
        assert!(g.iter().all(|g| g.is_resident()));
        assert!(loose.is_resident());
    }

    #[test]
    fn test_always_resident_count_change() {
        let manager = manager(reference_based(1000), &[("lod0", 10), ("lod1", 20)]);
        let mut cmd = MockCommandList::default();
        let group = manager.register_group(2, 0);
        let g = lods(&manager, group, &["lod0", "lod1"]);

        render_frame(&manager, &mut cmd, 1, &[]);
        assert_eq!(manager.stats().resident_bytes, 0);

        manager.set_num_always_resident_lods(1);
        render_frame(&manager, &mut cmd, 2, &[]);
        assert!(manager.is_always_resident(handle(&g[1])));
        assert!(manager.is_resident(handle(&g[1])));
        assert!(!manager.is_resident(handle(&g[0])));
        assert_eq!(manager.stats().always_resident_bytes, 20);

        manager.set_num_always_resident_lods(0);
        render_frame(&manager, &mut cmd, 3, &[]);
        assert!(!manager.is_always_resident(handle(&g[1])));
        assert!(g[1].is_evicted());
        assert_eq!(manager.stats().always_resident_bytes, 0);
        assert_eq!(manager.stats().resident_bytes, 0);
    }

    #[test]
    fn test_switch_to_reference_based() {
        let manager = manager(ManagerConfig::default(), &[("lod0", 10), ("lod1", 20)]);
        let mut cmd = MockCommandList::default();
        let group = manager.register_group(2, 0);
        let g = lods(&manager, group, &["lod0", "lod1"]);
        manager.tick(&mut cmd, 1);
        assert_eq!(manager.stats().resident_bytes, 30);

        manager.set_resident_memory_budget(15);
        manager.set_use_reference_based_residency(true);
        render_frame(&manager, &mut cmd, 2, &[]);

        // Unreferenced LOD0 goes, always-resident LOD1 stays
        assert!(!manager.is_resident(handle(&g[0])));
        assert!(manager.is_resident(handle(&g[1])));
        assert_eq!(manager.stats().resident_bytes, 20);
    }

    #[test]
    fn test_concurrent_reference_marking() {
        let manager = manager(reference_based(u64::MAX), &[]);
        let mut cmd = MockCommandList::default();
        let geometries: Vec<Arc<RayTracingGeometry>> = (0..256)
            .map(|i| geometry(&format!("mesh{}", i), InitializerType::Rendering))
            .collect();
        for g in &geometries {
            manager.register_geometry(g).unwrap();
        }

        manager.pre_render();
        geometries.par_iter().for_each(|g| manager.add_referenced_geometry(g));
        assert!(geometries.iter().all(|g| manager.is_geometry_referenced(g)));
        manager.tick(&mut cmd, 1);

        assert!(geometries.iter().all(|g| manager.is_resident(handle(g))));
        assert_eq!(manager.stats().resident_bytes, 256 * crate::testing::TEST_PRIMITIVES as u64);
    }
}
