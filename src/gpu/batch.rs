//! Batched resource replacement

use crate::gpu::device::{CommandList, GpuGeometryRef};

/// Replace the resources backing `dst` with those of `src` (or release them)
#[derive(Clone, Debug)]
pub struct ResourceReplace {
    pub dst: GpuGeometryRef,
    pub src: Option<GpuGeometryRef>,
}

/// Collects replacements and submits them to a command list in one call
#[derive(Debug, Default)]
pub struct ResourceReplaceBatch {
    entries: Vec<ResourceReplace>,
}

impl ResourceReplaceBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn enqueue(&mut self, dst: GpuGeometryRef, src: Option<GpuGeometryRef>) {
        self.entries.push(ResourceReplace { dst, src });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the batch. Empty batches record nothing.
    pub fn submit(self, cmd: &mut dyn CommandList) {
        if !self.entries.is_empty() {
            cmd.replace_resources(self.entries);
        }
    }
}
