//! Stream-in of offline acceleration structure data

use std::sync::Arc;

use crate::core::types::GeometryHandle;
use crate::gpu::batch::ResourceReplaceBatch;
use crate::gpu::device::CommandList;
use crate::gpu::geometry::InitializerType;
use crate::manager::registry::{DeferredWork, GeometryStatus, ResidencyState};
use crate::streaming::bulk_data::IoStatus;
use crate::streaming::payload::decode_offline_payload;

fn to_offline_data(raw: &[u8]) -> Option<Arc<[u8]>> {
    (!raw.is_empty()).then(|| Arc::from(raw))
}

impl ResidencyState {
    /// Start streaming the build data of `handle`.
    ///
    /// Returns `false` only when the ring is full; the caller keeps the
    /// geometry in the pending set and retries next tick. Everything else,
    /// including requests that became unnecessary, is a success.
    pub fn request_stream_in(
        &mut self,
        cmd: &mut dyn CommandList,
        handle: GeometryHandle,
        work: &mut DeferredWork,
    ) -> bool {
        let Some(entry) = self.geometries.get(handle) else {
            return true;
        };
        let geometry = entry.geometry.clone();

        if self.is_below_first_lod(handle) {
            // Group moved on while this was pending
            return true;
        }

        if geometry.is_evicted() {
            return true;
        }

        if !geometry.is_valid() {
            self.make_resident(handle, cmd, work);
        }

        let Some(entry) = self.geometries.get_mut(handle) else {
            return true;
        };

        if geometry.kind() != InitializerType::StreamingDestination
            || matches!(entry.status, GeometryStatus::Streaming | GeometryStatus::StreamedIn)
        {
            return true;
        }

        let streamable = match &entry.streamable {
            Some(data) if data.size > 0 => data.clone(),
            _ => {
                // No offline data, build from vertex buffers at runtime
                entry.status = GeometryStatus::StreamedIn;
                self.finalize_stream_in(cmd, handle, None, work);
                return true;
            }
        };

        if streamable.bulk.is_loaded() {
            let raw = match streamable
                .bulk
                .read_loaded(streamable.offset, streamable.size)
                .and_then(|bytes| decode_offline_payload(&bytes))
            {
                Ok(raw) => raw,
                Err(e) => {
                    log::error!("Offline data of {} unreadable, building at runtime: {}", handle, e);
                    Vec::new()
                }
            };

            let offline = to_offline_data(&raw);
            geometry.set_raw_data(raw);
            entry.status = GeometryStatus::StreamedIn;
            self.finalize_stream_in(cmd, handle, offline, work);
            return true;
        }

        if !streamable.bulk.can_load_from_disk() {
            log::error!(
                "Bulk data of {} is not loaded and cannot be loaded from disk, building at runtime",
                handle
            );
            entry.status = GeometryStatus::StreamedIn;
            self.finalize_stream_in(cmd, handle, None, work);
            return true;
        }

        if self.ring.is_full() {
            return false;
        }

        let Some(slot) = self.ring.claim(handle, streamable.issue_read()) else {
            return false;
        };

        if let Some(entry) = self.geometries.get_mut(handle) {
            entry.streaming_request = Some(slot);
            entry.status = GeometryStatus::Streaming;
        }

        log::trace!(
            "Streaming {} bytes at offset {} for {} in slot {}",
            streamable.size,
            streamable.offset,
            handle,
            slot
        );
        true
    }

    /// Hand freshly available build data to the geometry.
    ///
    /// An intermediate streaming-source object is created from the data and
    /// its buffers are moved into the real geometry in one replace batch.
    fn finalize_stream_in(
        &mut self,
        cmd: &mut dyn CommandList,
        handle: GeometryHandle,
        offline_data: Option<Arc<[u8]>>,
        work: &mut DeferredWork,
    ) {
        let Some(entry) = self.geometries.get(handle) else {
            return;
        };
        let geometry = entry.geometry.clone();

        let mut initializer = geometry.initializer();
        initializer.kind = InitializerType::StreamingSource;
        initializer.offline_data = offline_data;

        let intermediate = cmd.create_geometry(&initializer);
        let requires_build = initializer.offline_data.is_none() || intermediate.is_compressed();

        // Replacement must be recorded before any build of this geometry
        let mut batch = ResourceReplaceBatch::with_capacity(1);
        geometry.init_for_streaming(intermediate, requires_build, &mut batch);
        batch.submit(cmd);

        self.refresh(handle, false);

        if !requires_build {
            // The build path notifies on its own
            work.notify(geometry.group());
        }
        if geometry.take_build_requirement() {
            work.build_requests.push(geometry);
        }
    }

    /// Finalize completed reads, oldest first.
    ///
    /// Stops at the first read still pending, and at a failed read after
    /// re-issuing it, so later completions never overtake an earlier one.
    pub fn process_completed_streaming_requests(&mut self, cmd: &mut dyn CommandList, work: &mut DeferredWork) {
        let slots: Vec<usize> = self.ring.pending_slots().collect();
        let mut completed = 0;

        for slot in slots {
            let Some(request) = self.ring.slot_mut(slot) else {
                break;
            };

            let handle = match request.geometry {
                Some(handle) if request.is_valid() => handle,
                _ => {
                    // Cancelled by release or eviction
                    request.reset();
                    completed += 1;
                    continue;
                }
            };

            let status = request.poll();
            if status == IoStatus::Pending {
                break;
            }

            let Some(entry) = self.geometries.get(handle) else {
                request.reset();
                completed += 1;
                continue;
            };
            let geometry = entry.geometry.clone();

            let stale = geometry.is_evicted() || self.is_below_first_lod(handle);
            let Some(entry) = self.geometries.get_mut(handle) else {
                break;
            };
            let Some(request) = self.ring.slot_mut(slot) else {
                break;
            };

            if stale {
                // Evicted or out of range while the read was in flight
                request.reset();
                entry.streaming_request = None;
                entry.status = GeometryStatus::StreamedOut;
                completed += 1;
                continue;
            }

            if status == IoStatus::Failed {
                match &entry.streamable {
                    Some(data) => {
                        log::warn!("Streaming read for {} failed, retrying", handle);
                        request.request = Some(data.issue_read());
                    }
                    None => {
                        log::error!("Streaming read for {} failed and it has no streaming data", handle);
                        request.reset();
                        entry.streaming_request = None;
                        entry.status = GeometryStatus::StreamedOut;
                        completed += 1;
                        continue;
                    }
                }
                break;
            }

            let bytes = request.take_data().unwrap_or_default();
            request.reset();
            completed += 1;

            entry.streaming_request = None;
            entry.status = GeometryStatus::StreamedIn;

            let raw = match decode_offline_payload(&bytes) {
                Ok(raw) => raw,
                Err(e) => {
                    log::error!("Streamed data of {} is malformed, building at runtime: {}", handle, e);
                    Vec::new()
                }
            };

            let offline = to_offline_data(&raw);
            geometry.set_raw_data(raw);
            self.finalize_stream_in(cmd, handle, offline, work);

            log::trace!("Streamed in {} from slot {}", handle, slot);
        }

        self.ring.consume(completed);
    }

    /// Geometry whose group's first LOD has moved past it
    pub(super) fn is_below_first_lod(&self, handle: GeometryHandle) -> bool {
        let Some(entry) = self.geometries.get(handle) else {
            return false;
        };
        entry
            .geometry
            .group()
            .and_then(|g| self.groups.get(g))
            .is_some_and(|group| entry.geometry.lod_index() < group.current_first_lod)
    }

    /// Retry every stream-in that could not get a ring slot
    pub fn retry_pending_streaming(&mut self, cmd: &mut dyn CommandList, work: &mut DeferredWork) {
        let pending = std::mem::take(&mut self.pending_streaming);
        for handle in pending {
            if !self.request_stream_in(cmd, handle, work) {
                self.pending_streaming.insert(handle);
            }
        }
    }
}
