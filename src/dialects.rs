//! Implements SMB-dialect-specific rules and constants.

use crate::crypto::SigningAlgorithm;
use crate::packets::smb2::{Dialect, EncryptionCipher};

/// A utility struct that answers dialect-dependent questions for the
/// negotiated connection.
#[derive(Debug, Clone, Copy)]
pub struct DialectImpl {
    pub dialect: Dialect,
}

impl DialectImpl {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// 3.0.0 and above sign with AES-CMAC, older dialects with HMAC-SHA256.
    pub fn signing_algorithm(&self) -> SigningAlgorithm {
        if self.dialect >= Dialect::Smb030 {
            SigningAlgorithm::AesCmac
        } else {
            SigningAlgorithm::HmacSha256
        }
    }

    pub fn preauth_hash_supported(&self) -> bool {
        self.dialect == Dialect::Smb0311
    }

    pub fn supports_encryption(&self) -> bool {
        self.dialect.is_smb3()
    }

    /// The cipher to use when none was negotiated via contexts (3.0.x).
    pub fn default_cipher(&self) -> EncryptionCipher {
        EncryptionCipher::Aes128Ccm
    }

    /// The priority mask value for outgoing messages.
    pub fn priority_value(&self) -> u8 {
        match self.dialect {
            Dialect::Smb0311 => 1,
            _ => 0,
        }
    }
}
