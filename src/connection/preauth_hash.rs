//! Pre-auth integrity hashing for SMB 3.1.1.

use sha2::{Digest, Sha512};

use crate::packets::smb2::HashAlgorithm;

pub type PreauthHashValue = [u8; 64];

pub const SUPPORTED_ALGOS: &[HashAlgorithm] = &[HashAlgorithm::Sha512];

/// The pre-auth integrity transcript: the packed messages of the negotiate
/// exchange, in wire order, feeding a rolling SHA-512.
///
/// Session setup binds its keys to [`PreauthIntegrity::hash`], computed over
/// the transcript recorded here.
#[derive(Debug, Default, Clone)]
pub struct PreauthIntegrity {
    messages: Vec<Vec<u8>>,
}

impl PreauthIntegrity {
    /// Appends the packed bytes of a message to the transcript.
    pub fn record(&mut self, raw: &[u8]) {
        self.messages.push(raw.to_vec());
    }

    /// The recorded messages, in the order they were recorded.
    pub fn messages(&self) -> &[Vec<u8>] {
        &self.messages
    }

    /// The rolling hash over the transcript, seeded with 64 zero bytes:
    /// `H(..H(H(zeros || m1) || m2).. || mN)`.
    pub fn hash(&self) -> PreauthHashValue {
        let mut hash: PreauthHashValue = [0u8; 64];
        for message in &self.messages {
            let mut hasher = Sha512::new();
            hasher.update(hash);
            hasher.update(message);
            hash = hasher.finalize().into();
        }
        hash
    }
}
