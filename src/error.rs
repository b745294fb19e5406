use std::num::TryFromIntError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::packets::smb2::Header;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Binrw error: {0}")]
    BinRWError(#[from] binrw::Error),
    #[error("Int parsing error: {0}")]
    ParsingError(#[from] TryFromIntError),
    #[error("Unexpected message, {0}")]
    InvalidMessage(String),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] crate::crypto::CryptoError),
    #[error("Signature verification failed!")]
    SignatureVerificationFailed,
    #[error("Unable to transform message: {0}")]
    TransformFailed(crate::connection::TransformError),
    #[error("Negotiation error: {0}")]
    NegotiationError(String),
    #[error("Unsupported dialect revision: {0:#06x}")]
    UnsupportedDialect(u16),
    #[error("Client is not connected.")]
    NotConnected,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Server returned status {status:#010x} for message {message_id}")]
    ServerError {
        message_id: u64,
        status: u32,
        header: Header,
    },
    #[error("The connection has failed: {0}")]
    ConnectionFailed(Arc<Error>),
    #[error("Operation timed out: {0}, after {1:?}")]
    OperationTimeout(String, Duration),
}

impl Error {
    /// The NT status of a [`Error::ServerError`], if this is one.
    pub fn server_status(&self) -> Option<u32> {
        match self {
            Error::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }
}
