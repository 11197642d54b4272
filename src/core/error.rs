//! Error types for the geometry manager

use thiserror::Error;

use crate::core::types::{GeometryHandle, GroupHandle};

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid ray tracing geometry handle {0}")]
    InvalidGeometryHandle(GeometryHandle),

    #[error("invalid ray tracing geometry group handle {0}")]
    InvalidGroupHandle(GroupHandle),

    #[error("LOD index {lod} out of range for group {group} with {lod_count} LODs")]
    InvalidLodIndex {
        group: GroupHandle,
        lod: u8,
        lod_count: usize,
    },

    #[error("LOD {lod} of group {group} is already occupied by geometry {occupant}")]
    LodSlotOccupied {
        group: GroupHandle,
        lod: u8,
        occupant: GeometryHandle,
    },

    #[error("geometry is already registered as {0}")]
    AlreadyRegistered(GeometryHandle),

    #[error("geometry is not registered")]
    NotRegistered,

    #[error("group {0} still has registered geometries or proxies")]
    GroupNotEmpty(GroupHandle),

    #[error("proxy is already registered with group {0}")]
    ProxyAlreadyRegistered(GroupHandle),

    #[error("proxy is not registered with group {0}")]
    ProxyNotRegistered(GroupHandle),

    #[error("malformed offline payload: {0}")]
    Payload(String),

    #[error("bulk data unavailable: {0}")]
    BulkData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}
