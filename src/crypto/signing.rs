use super::CryptoError;

pub type SigningKey = [u8; 16];

/// The MAC protecting a plain message, selected by the negotiated dialect:
/// AES-CMAC on 3.0.0 and above, HMAC-SHA256 below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    HmacSha256,
    AesCmac,
}

pub fn make_signing_algo(
    signing_algorithm: SigningAlgorithm,
    signing_key: &SigningKey,
) -> Result<Box<dyn SigningAlgo>, CryptoError> {
    match signing_algorithm {
        SigningAlgorithm::AesCmac => cmac_signer::Cmac128Signer::build(signing_key),
        SigningAlgorithm::HmacSha256 => hmac_signer::HmacSha256Signer::build(signing_key),
    }
}

/// A trait for SMB signing algorithms.
pub trait SigningAlgo: std::fmt::Debug + Send {
    /// Update the signing session with new data.
    fn update(&mut self, data: &[u8]);

    /// Finalize the signing session and return the 16-byte signature.
    ///
    /// This function must be called once per signing session.
    fn finalize(&mut self) -> u128;

    /// Clone the algo into a boxed trait object, starting a fresh session.
    fn clone_box(&self) -> Box<dyn SigningAlgo>;
}

mod cmac_signer {
    use super::*;
    use aes::Aes128;
    use cmac::Cmac;
    use hmac::Mac;

    #[derive(Clone)]
    pub struct Cmac128Signer {
        cmac: Option<Cmac<Aes128>>,
    }

    impl Cmac128Signer {
        pub fn build(signing_key: &SigningKey) -> Result<Box<dyn SigningAlgo>, CryptoError> {
            Ok(Box::new(Cmac128Signer {
                cmac: Some(
                    Cmac::new_from_slice(signing_key)
                        .map_err(|_| CryptoError::InvalidKeyLength)?,
                ),
            }))
        }
    }

    impl SigningAlgo for Cmac128Signer {
        fn update(&mut self, data: &[u8]) {
            self.cmac.as_mut().unwrap().update(data);
        }

        fn finalize(&mut self) -> u128 {
            u128::from_le_bytes(self.cmac.take().unwrap().finalize().into_bytes().into())
        }

        fn clone_box(&self) -> Box<dyn SigningAlgo> {
            Box::new(self.clone())
        }
    }

    impl std::fmt::Debug for Cmac128Signer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Cmac128Signer").finish()
        }
    }
}

mod hmac_signer {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    #[derive(Clone)]
    pub struct HmacSha256Signer {
        hmac: Option<Hmac<Sha256>>,
    }

    impl HmacSha256Signer {
        pub fn build(signing_key: &SigningKey) -> Result<Box<dyn SigningAlgo>, CryptoError> {
            Self::build_from_slice(signing_key)
        }

        pub(super) fn build_from_slice(
            signing_key: &[u8],
        ) -> Result<Box<dyn SigningAlgo>, CryptoError> {
            Ok(Box::new(HmacSha256Signer {
                hmac: Some(
                    Hmac::new_from_slice(signing_key)
                        .map_err(|_| CryptoError::InvalidKeyLength)?,
                ),
            }))
        }
    }

    impl SigningAlgo for HmacSha256Signer {
        fn update(&mut self, data: &[u8]) {
            self.hmac.as_mut().unwrap().update(data);
        }

        fn finalize(&mut self) -> u128 {
            // The first 16 bytes of the digest form the signature.
            let digest = self.hmac.take().unwrap().finalize().into_bytes();
            u128::from_le_bytes(digest[..16].try_into().unwrap())
        }

        fn clone_box(&self) -> Box<dyn SigningAlgo> {
            Box::new(self.clone())
        }
    }

    impl std::fmt::Debug for HmacSha256Signer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("HmacSha256Signer").finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC4493_KEY: SigningKey = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    #[test]
    fn test_cmac_rfc4493_empty_message() {
        let mut signer = make_signing_algo(SigningAlgorithm::AesCmac, &RFC4493_KEY).unwrap();
        signer.update(&[]);
        assert_eq!(
            signer.finalize().to_le_bytes(),
            [
                0xbb, 0x1d, 0x69, 0x29, 0xe9, 0x59, 0x37, 0x28, 0x7f, 0xa3, 0x7d, 0x12, 0x9b, 0x75,
                0x67, 0x46
            ]
        );
    }

    #[test]
    fn test_cmac_rfc4493_one_block() {
        let mut signer = make_signing_algo(SigningAlgorithm::AesCmac, &RFC4493_KEY).unwrap();
        signer.update(&[
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ]);
        assert_eq!(
            signer.finalize().to_le_bytes(),
            [
                0x07, 0x0a, 0x16, 0xb4, 0x6b, 0x4d, 0x41, 0x44, 0xf7, 0x9b, 0xdd, 0x9d, 0xd0, 0x4a,
                0x28, 0x7c
            ]
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case_1_truncated() {
        // RFC 4231 test case 1: 20-byte 0x0b key, "Hi There".
        let mut signer = hmac_signer::HmacSha256Signer::build_from_slice(&[0x0b; 20]).unwrap();
        signer.update(b"Hi There");
        assert_eq!(
            signer.finalize().to_le_bytes(),
            [
                0xb0, 0x34, 0x4c, 0x61, 0xd8, 0xdb, 0x38, 0x53, 0x5c, 0xa8, 0xaf, 0xce, 0xaf, 0x0b,
                0xf1, 0x2b
            ]
        );
    }

    #[test]
    fn test_split_updates_match_single_update() {
        let key = [0x42u8; 16];
        let data = b"header bytes|body bytes|more body";

        for algo in [SigningAlgorithm::AesCmac, SigningAlgorithm::HmacSha256] {
            let mut whole = make_signing_algo(algo, &key).unwrap();
            whole.update(data);

            let mut split = make_signing_algo(algo, &key).unwrap();
            split.update(&data[..13]);
            split.update(&data[13..]);

            assert_eq!(whole.finalize(), split.finalize());
        }
    }
}
