//! Core types and utilities

pub mod types;
pub mod error;
pub mod logging;
pub mod table;
pub(crate) mod sync;

pub use types::*;
pub use error::Error;
pub use table::HandleTable;
