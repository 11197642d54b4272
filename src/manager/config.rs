//! Manager configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::types::Result;

/// Residency, streaming and build settings.
///
/// Values are read at construction; the runtime-mutable ones have setters on
/// [`GeometryManager`](crate::manager::GeometryManager) that raise the right
/// change edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Global ray tracing toggle. Disabling evicts everything on the next tick.
    pub ray_tracing_enabled: bool,
    /// Keep only geometry referenced by rendered frames resident, within budget.
    pub use_reference_based_residency: bool,
    /// Resident acceleration structure budget in bytes
    pub resident_geometry_memory_pool_size: u64,
    /// Capacity of the streaming ring. Fixed at construction.
    pub max_pending_streaming_requests: usize,
    /// Lowest-detail LODs per group that are never evicted
    pub num_always_resident_lods: u32,
    /// Primitive budget per build pass. `<= 0` builds everything.
    pub max_built_primitives_per_frame: i64,
    /// Priority added to a deferred build request each pass
    pub pending_build_priority_boost_per_frame: f32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ray_tracing_enabled: true,
            use_reference_based_residency: false,
            resident_geometry_memory_pool_size: 256 * 1024 * 1024,
            max_pending_streaming_requests: 128,
            num_always_resident_lods: 1,
            max_built_primitives_per_frame: -1,
            pending_build_priority_boost_per_frame: 0.001,
        }
    }
}

impl ManagerConfig {
    /// Save as pretty JSON (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from JSON (sync). Missing fields take their defaults.
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
