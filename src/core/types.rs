//! Core type aliases and handle types

use std::fmt;

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Render frame counter value
pub type FrameNumber = u64;

/// Key type for a [`HandleTable`](crate::core::table::HandleTable) row.
pub trait TableKey: Copy {
    fn from_index(index: u32) -> Self;
    fn index(self) -> u32;
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            /// Raw table index
            pub fn index(self) -> u32 {
                self.0
            }
        }

        impl TableKey for $name {
            fn from_index(index: u32) -> Self {
                Self(index)
            }

            fn index(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Opaque handle into the registered geometry table
    GeometryHandle,
    "geometry"
);

handle_type!(
    /// Opaque handle into the geometry group table
    GroupHandle,
    "group"
);

handle_type!(
    /// Index of a pending acceleration structure build request
    BuildRequestIndex,
    "build"
);
