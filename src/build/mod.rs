//! Acceleration structure build scheduling
//!
//! Build requests sit in a sparse queue with a float priority. Each frame the
//! queue is sorted and drained against a primitive budget; requests that miss
//! the cut have their priority boosted so they cannot starve.

pub mod queue;

pub use queue::{
    BuildDispatch, BuildMode, BuildPriority, BuildQueue, BuildRequest,
    IMMEDIATE_BUILD_PRIORITY,
};
