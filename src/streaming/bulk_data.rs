//! Bulk storage contracts

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::core::error::Error;
use crate::core::types::Result;

/// Poll result of an asynchronous read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Pending,
    Ok,
    Failed,
}

/// An in-flight scatter-gather read
pub trait IoRequest: Send + fmt::Debug {
    /// Non-blocking completion check
    fn poll(&mut self) -> IoStatus;

    /// Take the destination buffer of a successful read
    fn take_data(&mut self) -> Option<Vec<u8>>;
}

/// A bulk data blob that geometry build data is streamed from
pub trait BulkData: Send + Sync + fmt::Debug {
    fn file_exists(&self) -> bool;

    /// Whether the whole blob is already in memory
    fn is_loaded(&self) -> bool;

    fn can_load_from_disk(&self) -> bool;

    /// Synchronous read of memory-resident data (lock, copy, unlock)
    fn read_loaded(&self, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Issue an asynchronous read of `size` bytes at `offset`
    fn scatter_gather_read(&self, offset: u64, size: u64) -> Box<dyn IoRequest>;
}

/// Byte range of a bulk blob backing one geometry
#[derive(Clone, Debug)]
pub struct StreamableData {
    pub bulk: Arc<dyn BulkData>,
    pub offset: u64,
    pub size: u64,
}

impl StreamableData {
    pub fn new(bulk: Arc<dyn BulkData>, offset: u64, size: u64) -> Self {
        Self { bulk, offset, size }
    }

    pub fn issue_read(&self) -> Box<dyn IoRequest> {
        self.bulk.scatter_gather_read(self.offset, self.size)
    }
}

/// A read that finished before it was handed out
#[derive(Debug)]
pub struct ReadyIoRequest {
    result: Option<io::Result<Vec<u8>>>,
}

impl ReadyIoRequest {
    pub fn new(result: io::Result<Vec<u8>>) -> Self {
        Self { result: Some(result) }
    }
}

impl IoRequest for ReadyIoRequest {
    fn poll(&mut self) -> IoStatus {
        match &self.result {
            Some(Ok(_)) => IoStatus::Ok,
            Some(Err(_)) => IoStatus::Failed,
            None => IoStatus::Ok,
        }
    }

    fn take_data(&mut self) -> Option<Vec<u8>> {
        match self.result.take() {
            Some(Ok(data)) => Some(data),
            other => {
                self.result = other;
                None
            }
        }
    }
}

pub(crate) fn slice_range(bytes: &[u8], offset: u64, size: u64) -> Result<Vec<u8>> {
    let start = usize::try_from(offset).map_err(|_| Error::BulkData(format!("offset {} too large", offset)))?;
    let end = start
        .checked_add(size as usize)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            Error::BulkData(format!(
                "range {}..{} outside blob of {} bytes",
                offset,
                offset.saturating_add(size),
                bytes.len()
            ))
        })?;
    Ok(bytes[start..end].to_vec())
}

/// Bulk data that always lives in memory
#[derive(Clone, Debug)]
pub struct MemoryBulkData {
    bytes: Arc<[u8]>,
}

impl MemoryBulkData {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl BulkData for MemoryBulkData {
    fn file_exists(&self) -> bool {
        false
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn can_load_from_disk(&self) -> bool {
        false
    }

    fn read_loaded(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        slice_range(&self.bytes, offset, size)
    }

    fn scatter_gather_read(&self, offset: u64, size: u64) -> Box<dyn IoRequest> {
        let result = slice_range(&self.bytes, offset, size)
            .map_err(|e| io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()));
        Box::new(ReadyIoRequest::new(result))
    }
}
