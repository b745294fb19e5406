//! Cryptographic primitives for message protection: signing MACs, AEAD
//! ciphers, and errors shared between them.

mod encryption;
mod signing;

pub use encryption::{make_encrypting_algo, EncryptingAlgo, EncryptionKey, EncryptionResult};
pub use signing::{make_signing_algo, SigningAlgo, SigningAlgorithm, SigningKey};

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length for the selected algorithm")]
    InvalidKeyLength,
    #[error("AEAD operation failed: bad tag or corrupted data")]
    AeadOperationFailed,
    #[error("The selected cipher is not usable for encryption")]
    UnsupportedCipher,
}
