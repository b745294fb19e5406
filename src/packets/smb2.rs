//! SMB2/SMB3 wire records.

pub mod encrypted;
pub mod header;
pub mod message;
pub mod negotiate;

pub use encrypted::*;
pub use header::*;
pub use message::*;
pub use negotiate::*;
