//! Memory and queue statistics

use serde::Serialize;

/// Snapshot of manager state, refreshed every tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GeometryManagerStats {
    /// Registered geometries
    pub geometry_count: usize,
    /// Registered groups
    pub group_count: usize,
    /// Bytes of resident acceleration structures
    pub resident_bytes: u64,
    /// Bytes held by always-resident LODs
    pub always_resident_bytes: u64,
    /// Bytes requested by the last rendered frame
    pub requested_bytes: u64,
    /// Resident bytes over the budget after the last tick (0 when within)
    pub budget_overrun_bytes: u64,
    /// Ticks in a row that ended over budget
    pub consecutive_overrun_frames: u32,
    /// Geometries evicted by the last tick
    pub evicted_last_tick: usize,
    /// Geometries made resident by the last tick
    pub made_resident_last_tick: usize,
    /// Queued build requests
    pub pending_builds: usize,
    /// Primitives across queued build requests
    pub pending_build_primitives: u64,
    /// Stream-ins waiting for a ring slot
    pub pending_streaming_requests: usize,
    /// Claimed ring slots
    pub in_flight_streaming_requests: usize,
}

/// Tracks sustained budget overrun and logs its start and end
#[derive(Clone, Debug, Default)]
pub(crate) struct OverrunTracker {
    overrun_bytes: u64,
    consecutive_frames: u32,
}

impl OverrunTracker {
    /// Record the resident total at the end of a tick
    pub fn update(&mut self, resident: u64, budget: u64) {
        let overrun = resident.saturating_sub(budget);

        if overrun > 0 {
            if self.consecutive_frames == 0 {
                log::warn!(
                    "Ray tracing geometry over budget by {} bytes ({} resident, {} budget). Referenced geometry cannot be evicted",
                    overrun,
                    resident,
                    budget
                );
            }
            self.consecutive_frames += 1;
        } else if self.consecutive_frames > 0 {
            log::info!(
                "Ray tracing geometry back within budget after {} frames",
                self.consecutive_frames
            );
            self.consecutive_frames = 0;
        }

        self.overrun_bytes = overrun;
    }

    pub fn reset(&mut self) {
        self.overrun_bytes = 0;
        self.consecutive_frames = 0;
    }

    pub fn overrun_bytes(&self) -> u64 {
        self.overrun_bytes
    }

    pub fn consecutive_frames(&self) -> u32 {
        self.consecutive_frames
    }
}
