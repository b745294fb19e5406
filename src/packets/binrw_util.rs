//! Utility types for declaring the crate's wire records with binrw.

pub mod file_time;
pub mod helpers;
pub mod pos_marker;

pub mod prelude {
    pub use super::file_time::FileTime;
    pub use super::helpers::*;
    pub use super::pos_marker::PosMarker;
}
