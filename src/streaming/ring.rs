//! Fixed-capacity ring of in-flight stream-in requests

use crate::core::types::GeometryHandle;
use crate::streaming::bulk_data::{IoRequest, IoStatus};

/// One ring slot
#[derive(Debug, Default)]
pub struct StreamingRequest {
    /// Geometry the data is for; `None` once cancelled
    pub geometry: Option<GeometryHandle>,
    pub request: Option<Box<dyn IoRequest>>,
}

impl StreamingRequest {
    /// Forget the geometry and drop the I/O handle. The read itself keeps
    /// running; its result is discarded.
    pub fn reset(&mut self) {
        self.geometry = None;
        self.request = None;
    }

    pub fn is_valid(&self) -> bool {
        self.geometry.is_some() && self.request.is_some()
    }

    /// Status of the read; an empty slot reads as failed
    pub fn poll(&mut self) -> IoStatus {
        match &mut self.request {
            Some(request) => request.poll(),
            None => IoStatus::Failed,
        }
    }

    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        self.request.as_mut().and_then(|r| r.take_data())
    }
}

/// Circular buffer of requests, claimed at `next` and consumed oldest first
#[derive(Debug)]
pub struct StreamingRing {
    slots: Vec<StreamingRequest>,
    next: usize,
    in_flight: usize,
}

impl StreamingRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| StreamingRequest::default()).collect(),
            next: 0,
            in_flight: 0,
        }
    }

    /// Claimed slots not yet consumed, cancelled ones included
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_full(&self) -> bool {
        self.in_flight >= self.slots.len()
    }

    /// Claim the next slot for `geometry`. Returns `None` when full.
    pub fn claim(&mut self, geometry: GeometryHandle, request: Box<dyn IoRequest>) -> Option<usize> {
        if self.is_full() {
            return None;
        }

        let slot = self.next;
        self.slots[slot] = StreamingRequest {
            geometry: Some(geometry),
            request: Some(request),
        };
        self.next = (self.next + 1) % self.slots.len();
        self.in_flight += 1;
        Some(slot)
    }

    /// Detach `geometry` from its slot. The slot stays claimed until the
    /// completion scan reaches it.
    pub fn cancel(&mut self, slot: usize, geometry: GeometryHandle) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.geometry == Some(geometry) => {
                entry.reset();
                true
            }
            _ => false,
        }
    }

    /// Claimed slot indices, oldest first
    pub fn pending_slots(&self) -> impl Iterator<Item = usize> + '_ {
        let capacity = self.slots.len();
        let oldest = (self.next + capacity - self.in_flight) % capacity;
        (0..self.in_flight).map(move |i| (oldest + i) % capacity)
    }

    pub fn slot(&self, index: usize) -> Option<&StreamingRequest> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut StreamingRequest> {
        self.slots.get_mut(index)
    }

    /// Release the `count` oldest slots
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.in_flight);
        self.in_flight -= count.min(self.in_flight);
    }
}
