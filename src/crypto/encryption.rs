use std::fmt::Debug;

use crate::packets::smb2::{EncryptionCipher, EncryptionNonce};

use super::CryptoError;

pub type EncryptionKey = [u8; 16];

pub struct EncryptionResult {
    /// The 16-byte AEAD tag, stored in the transform header signature field.
    pub signature: u128,
}

pub trait EncryptingAlgo: Debug + Send {
    /// Algo-specific in-place encryption.
    fn encrypt(
        &mut self,
        payload: &mut [u8],
        header_data: &[u8],
        nonce: &EncryptionNonce,
    ) -> Result<EncryptionResult, CryptoError>;

    /// Algo-specific in-place decryption.
    fn decrypt(
        &mut self,
        payload: &mut [u8],
        header_data: &[u8],
        nonce: &EncryptionNonce,
        signature: u128,
    ) -> Result<(), CryptoError>;

    /// Returns the effective nonce size of the cipher.
    fn nonce_size(&self) -> usize;

    /// Returns the nonce trimmed to the cipher's effective size.
    /// The remaining bytes of the transmitted nonce field are zero.
    fn trim_nonce<'a>(&self, nonce: &'a EncryptionNonce) -> &'a [u8] {
        debug_assert!(nonce[self.nonce_size()..].iter().all(|&x| x == 0));
        &nonce[..self.nonce_size()]
    }

    /// Clone the algo into a boxed trait object.
    ///
    /// Allows cloning users of the trait object for concurrent access:
    /// the algorithms are only usable via `&mut self`.
    fn clone_box(&self) -> Box<dyn EncryptingAlgo>;
}

pub fn make_encrypting_algo(
    cipher: EncryptionCipher,
    encrypting_key: &EncryptionKey,
) -> Result<Box<dyn EncryptingAlgo>, CryptoError> {
    match cipher {
        EncryptionCipher::Aes128Ccm => encrypt_ccm::Ccm128Encryptor::build(encrypting_key),
        EncryptionCipher::Aes128Gcm => encrypt_gcm::Gcm128Encryptor::build(encrypting_key),
        EncryptionCipher::None => Err(CryptoError::UnsupportedCipher),
    }
}

mod encrypt_ccm {
    use aes::cipher::generic_array::GenericArray;
    use aes::Aes128;
    use ccm::{
        aead::AeadMutInPlace,
        consts::{U11, U16},
        Ccm, KeyInit,
    };

    use super::*;

    /// AES-128-CCM with a 16-byte tag and an 11-byte nonce, as SMB3 uses it.
    #[derive(Clone)]
    pub struct Ccm128Encryptor {
        cipher: Ccm<Aes128, U16, U11>,
    }

    impl Ccm128Encryptor {
        pub fn build(encrypting_key: &EncryptionKey) -> Result<Box<dyn EncryptingAlgo>, CryptoError> {
            Ok(Box::new(Self {
                cipher: Ccm::<Aes128, U16, U11>::new_from_slice(encrypting_key)
                    .map_err(|_| CryptoError::InvalidKeyLength)?,
            }))
        }
    }

    impl EncryptingAlgo for Ccm128Encryptor {
        fn encrypt(
            &mut self,
            payload: &mut [u8],
            header_data: &[u8],
            nonce: &EncryptionNonce,
        ) -> Result<EncryptionResult, CryptoError> {
            let nonce = GenericArray::from_slice(self.trim_nonce(nonce));
            let signature = self
                .cipher
                .encrypt_in_place_detached(nonce, header_data, payload)
                .map_err(|_| CryptoError::AeadOperationFailed)?;

            Ok(EncryptionResult {
                signature: u128::from_le_bytes(signature.into()),
            })
        }

        fn decrypt(
            &mut self,
            payload: &mut [u8],
            header_data: &[u8],
            nonce: &EncryptionNonce,
            signature: u128,
        ) -> Result<(), CryptoError> {
            let nonce = GenericArray::from_slice(self.trim_nonce(nonce));
            self.cipher
                .decrypt_in_place_detached(
                    nonce,
                    header_data,
                    payload,
                    &signature.to_le_bytes().into(),
                )
                .map_err(|_| CryptoError::AeadOperationFailed)
        }

        fn nonce_size(&self) -> usize {
            11
        }

        fn clone_box(&self) -> Box<dyn EncryptingAlgo> {
            Box::new(self.clone())
        }
    }

    impl std::fmt::Debug for Ccm128Encryptor {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Ccm128Encryptor")
        }
    }
}

mod encrypt_gcm {
    use aead::AeadMutInPlace;
    use aes::cipher::generic_array::GenericArray;
    use aes_gcm::{Aes128Gcm, KeyInit};

    use super::*;

    /// AES-128-GCM with the standard 12-byte nonce.
    #[derive(Clone)]
    pub struct Gcm128Encryptor {
        cipher: Aes128Gcm,
    }

    impl Gcm128Encryptor {
        pub fn build(encrypting_key: &EncryptionKey) -> Result<Box<dyn EncryptingAlgo>, CryptoError> {
            Ok(Box::new(Self {
                cipher: Aes128Gcm::new_from_slice(encrypting_key)
                    .map_err(|_| CryptoError::InvalidKeyLength)?,
            }))
        }
    }

    impl EncryptingAlgo for Gcm128Encryptor {
        fn encrypt(
            &mut self,
            payload: &mut [u8],
            header_data: &[u8],
            nonce: &EncryptionNonce,
        ) -> Result<EncryptionResult, CryptoError> {
            let tag = self
                .cipher
                .encrypt_in_place_detached(
                    GenericArray::from_slice(self.trim_nonce(nonce)),
                    header_data,
                    payload,
                )
                .map_err(|_| CryptoError::AeadOperationFailed)?;
            Ok(EncryptionResult {
                signature: u128::from_le_bytes(tag.into()),
            })
        }

        fn decrypt(
            &mut self,
            payload: &mut [u8],
            header_data: &[u8],
            nonce: &EncryptionNonce,
            signature: u128,
        ) -> Result<(), CryptoError> {
            self.cipher
                .decrypt_in_place_detached(
                    GenericArray::from_slice(self.trim_nonce(nonce)),
                    header_data,
                    payload,
                    &signature.to_le_bytes().into(),
                )
                .map_err(|_| CryptoError::AeadOperationFailed)
        }

        fn nonce_size(&self) -> usize {
            12
        }

        fn clone_box(&self) -> Box<dyn EncryptingAlgo> {
            Box::new(self.clone())
        }
    }

    impl std::fmt::Debug for Gcm128Encryptor {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "Gcm128Encryptor")
        }
    }
}
