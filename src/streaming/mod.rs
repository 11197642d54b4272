//! Streaming of offline acceleration structure data
//!
//! Build data lives in bulk storage and is read asynchronously into a fixed
//! ring of in-flight requests. Completion is polled once per tick; nothing
//! here blocks on I/O.

pub mod bulk_data;
pub mod file_storage;
pub mod payload;
pub mod ring;

pub use bulk_data::{BulkData, IoRequest, IoStatus, MemoryBulkData, ReadyIoRequest, StreamableData};
pub use file_storage::{FileBulkData, FileStorage};
pub use payload::{decode_offline_payload, encode_offline_payload};
pub use ring::{StreamingRequest, StreamingRing};
