//! Client-side SMB2/SMB3 connection core.
//!
//! This crate establishes a transport conversation with an SMB server,
//! negotiates a protocol dialect (via the SMB1 multi-protocol shim), and
//! then acts as the single demultiplexing point for request/response
//! traffic on the connection: message ids are allocated from a credit-
//! charged sequence window, outbound frames are signed or encrypted per
//! the session policy, and responses are routed back to their senders in
//! whatever order the server produces them.
//!
//! Session setup, tree connect and file operations live above this crate;
//! they drive it through [`Connection::send`]/[`Connection::receive`] with
//! opaque command bodies.

pub mod connection;
pub mod crypto;
pub mod dialects;
pub mod error;
pub mod packets;
pub mod session;
pub mod tree;

pub use connection::{Connection, ConnectionConfig};
pub use error::Error;
pub use session::Session;
pub use tree::Tree;

pub type Result<T> = std::result::Result<T, crate::Error>;
