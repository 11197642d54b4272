//! File-backed bulk data with tokio reads

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;

use crate::core::types::Result;
use crate::streaming::bulk_data::{slice_range, BulkData, IoRequest, IoStatus};

/// Owner of the runtime that services file reads
pub struct FileStorage {
    /// Kept alive by every opened file; `None` when borrowing a runtime
    runtime: Option<Arc<Runtime>>,
    handle: Handle,
}

impl FileStorage {
    /// Create storage with a dedicated I/O runtime
    ///
    /// # Arguments
    /// * `io_threads` - Number of runtime worker threads
    pub fn new(io_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .thread_name("rtgeom-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        log::info!("Created file storage with {} I/O threads", io_threads.max(1));

        Ok(Self {
            runtime: Some(Arc::new(runtime)),
            handle,
        })
    }

    /// Use an existing runtime
    pub fn with_handle(handle: Handle) -> Self {
        Self { runtime: None, handle }
    }

    /// Open a bulk data file. The file is not touched until the first read.
    pub fn open(&self, path: impl Into<PathBuf>) -> Arc<FileBulkData> {
        Arc::new(FileBulkData {
            path: path.into(),
            handle: self.handle.clone(),
            _runtime: self.runtime.clone(),
            resident: RwLock::new(None),
        })
    }
}

/// A bulk data file read on demand through the storage runtime
pub struct FileBulkData {
    path: PathBuf,
    handle: Handle,
    _runtime: Option<Arc<Runtime>>,
    resident: RwLock<Option<Arc<[u8]>>>,
}

impl std::fmt::Debug for FileBulkData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBulkData")
            .field("path", &self.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl FileBulkData {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file so later stream-ins take the synchronous path
    pub fn load_into_memory(&self) -> Result<()> {
        let bytes = std::fs::read(&self.path)?;
        log::debug!("Loaded {} bytes of bulk data from {:?}", bytes.len(), self.path);
        *self.resident.write().unwrap_or_else(|e| e.into_inner()) = Some(bytes.into());
        Ok(())
    }

    /// Drop the in-memory copy
    pub fn unload(&self) {
        *self.resident.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn resident(&self) -> Option<Arc<[u8]>> {
        self.resident.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl BulkData for FileBulkData {
    fn file_exists(&self) -> bool {
        self.path.is_file()
    }

    fn is_loaded(&self) -> bool {
        self.resident().is_some()
    }

    fn can_load_from_disk(&self) -> bool {
        self.file_exists()
    }

    fn read_loaded(&self, offset: u64, size: u64) -> Result<Vec<u8>> {
        match self.resident() {
            Some(bytes) => slice_range(&bytes, offset, size),
            None => Err(crate::core::Error::BulkData(format!("{:?} is not loaded", self.path))),
        }
    }

    fn scatter_gather_read(&self, offset: u64, size: u64) -> Box<dyn IoRequest> {
        let (tx, rx) = oneshot::channel();
        let path = self.path.clone();

        self.handle.spawn(async move {
            let result = read_range(&path, offset, size).await;
            // Receiver may be gone if the request was cancelled
            let _ = tx.send(result);
        });

        Box::new(FileIoRequest {
            path: self.path.clone(),
            rx,
            result: None,
        })
    }
}

async fn read_range(path: &Path, offset: u64, size: u64) -> io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buffer = vec![0u8; size as usize];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

/// Read spawned on the storage runtime
#[derive(Debug)]
struct FileIoRequest {
    path: PathBuf,
    rx: oneshot::Receiver<io::Result<Vec<u8>>>,
    result: Option<io::Result<Vec<u8>>>,
}

impl IoRequest for FileIoRequest {
    fn poll(&mut self) -> IoStatus {
        if self.result.is_none() {
            match self.rx.try_recv() {
                Ok(result) => {
                    if let Err(e) = &result {
                        log::warn!("Bulk data read from {:?} failed: {}", self.path, e);
                    }
                    self.result = Some(result);
                }
                Err(oneshot::error::TryRecvError::Empty) => return IoStatus::Pending,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.result = Some(Err(io::Error::other("read task dropped")));
                }
            }
        }

        match &self.result {
            Some(Ok(_)) => IoStatus::Ok,
            Some(Err(_)) => IoStatus::Failed,
            None => IoStatus::Pending,
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
