//! The session collaborator.
//!
//! A [`Session`] is produced by session setup, which happens above this
//! crate: it arrives here fully formed, carrying the negotiated session id,
//! the signing key, and (when encryption was set up) the per-direction
//! encryption keys. All fields are immutable once constructed.

use crate::crypto::{EncryptionKey, SigningKey};

#[derive(Debug, Clone)]
pub struct Session {
    session_id: u64,
    signing_key: SigningKey,
    signing_required: bool,
    encrypt_data: bool,
    encryption_key: Option<EncryptionKey>,
    decryption_key: Option<EncryptionKey>,
}

impl Session {
    pub fn new(session_id: u64, signing_key: SigningKey, signing_required: bool) -> Self {
        Self {
            session_id,
            signing_key,
            signing_required,
            encrypt_data: false,
            encryption_key: None,
            decryption_key: None,
        }
    }

    /// Enables encryption for this session with the given client-to-server
    /// and server-to-client keys.
    pub fn with_encryption(
        mut self,
        encryption_key: EncryptionKey,
        decryption_key: EncryptionKey,
    ) -> Self {
        self.encrypt_data = true;
        self.encryption_key = Some(encryption_key);
        self.decryption_key = Some(decryption_key);
        self
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn signing_required(&self) -> bool {
        self.signing_required
    }

    pub fn encrypt_data(&self) -> bool {
        self.encrypt_data
    }

    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.encryption_key.as_ref()
    }

    pub fn decryption_key(&self) -> Option<&EncryptionKey> {
        self.decryption_key.as_ref()
    }
}
