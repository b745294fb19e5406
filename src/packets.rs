//! Wire records for the SMB1 negotiation shim and the SMB2/SMB3 protocol.
//!
//! All multi-byte integers are little-endian on the wire.

pub mod binrw_util;
pub mod guid;
pub mod smb1;
pub mod smb2;
