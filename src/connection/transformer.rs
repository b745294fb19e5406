//! Transforms messages to and from wire frames: serialization, signing and
//! verification, encryption and decryption, and pre-auth transcript
//! recording.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, RwLock};

use binrw::prelude::*;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{
    make_encrypting_algo, make_signing_algo, EncryptingAlgo, SigningAlgo,
};
use crate::dialects::DialectImpl;
use crate::packets::smb2::*;
use crate::session::Session;

use super::info::ConnectionInfo;
use super::preauth_hash::{PreauthHashValue, PreauthIntegrity};

/// A decoded inbound message, together with the raw frame it came from and
/// the protections that were found on it.
#[derive(Debug)]
pub struct IncomingMessage {
    pub message: PlainMessage,
    /// The raw plain frame, after decryption if the wire frame was
    /// transformed.
    pub raw: Vec<u8>,
    pub form: MessageForm,
}

/// How did a message arrive?
#[derive(Debug, Default)]
pub struct MessageForm {
    pub encrypted: bool,
    pub signed: bool,
}

impl MessageForm {
    pub fn signed_or_encrypted(&self) -> bool {
        self.signed || self.encrypted
    }
}

/// The [`Transformer`] owns the per-connection security state: the session
/// tables, the negotiated cipher, and the pre-auth integrity transcript.
///
/// See [`Transformer::transform_outgoing`] and
/// [`Transformer::transform_incoming`] for the two transformation paths.
#[derive(Debug)]
pub struct Transformer {
    /// Fully set-up sessions, keyed by session id.
    sessions: Mutex<HashMap<u64, SessionCrypto>>,
    /// Sessions that have not completed authentication yet.
    preauth_sessions: Mutex<HashMap<u64, Arc<Session>>>,

    config: RwLock<TransformerConfig>,

    preauth_integrity: Mutex<Option<PreauthIntegrity>>,
}

#[derive(Default, Debug)]
struct TransformerConfig {
    negotiated: bool,
    dialect: Option<DialectImpl>,
    /// The effective cipher for this connection, if encryption is available.
    cipher: Option<EncryptionCipher>,
}

/// The protection objects bound to a registered session's keys.
#[derive(Debug)]
struct SessionCrypto {
    session: Arc<Session>,
    signer: MessageSigner,
    encryptor: Option<MessageEncryptor>,
    decryptor: Option<MessageDecryptor>,
}

enum OutgoingProtection {
    None,
    Sign(MessageSigner),
    Encrypt(MessageEncryptor),
}

impl Default for Transformer {
    fn default() -> Self {
        Self {
            sessions: Default::default(),
            preauth_sessions: Default::default(),
            config: Default::default(),
            // cleared post-negotiation if the dialect has no preauth hash.
            preauth_integrity: Mutex::new(Some(PreauthIntegrity::default())),
        }
    }
}

impl Transformer {
    /// Notifies that the connection negotiation has been completed.
    pub fn negotiated(&self, info: &ConnectionInfo) -> crate::Result<()> {
        let mut config = self.config.write().unwrap();
        if config.negotiated {
            return Err(crate::Error::InvalidState(
                "Connection is already negotiated!".into(),
            ));
        }

        config.dialect = Some(info.dialect);
        config.cipher = if info.dialect.preauth_hash_supported() {
            // 3.1.1: the cipher comes from the negotiate context.
            info.negotiation
                .cipher_id
                .filter(|cipher| *cipher != EncryptionCipher::None)
        } else if info.dialect.supports_encryption()
            && info.negotiation.supports_encryption.unwrap_or(false)
        {
            Some(info.dialect.default_cipher())
        } else {
            None
        };
        config.negotiated = true;

        if !info.dialect.preauth_hash_supported() {
            *self.preauth_integrity.lock().unwrap() = None;
        }

        Ok(())
    }

    /// Notifies that a session has begun authentication.
    pub fn session_preauth_started(&self, session: Arc<Session>) {
        self.preauth_sessions
            .lock()
            .unwrap()
            .insert(session.session_id(), session);
    }

    /// Notifies that a session has completed setup: binds the dialect's
    /// signer and cipher objects to the session keys.
    pub fn session_started(&self, session: Arc<Session>) -> crate::Result<()> {
        let (dialect, cipher) = {
            let config = self.config.read().unwrap();
            if !config.negotiated {
                return Err(crate::Error::InvalidState(
                    "Connection is not negotiated yet!".to_string(),
                ));
            }
            (config.dialect.unwrap(), config.cipher)
        };

        let signer = MessageSigner::new(make_signing_algo(
            dialect.signing_algorithm(),
            session.signing_key(),
        )?);

        let (encryptor, decryptor) = match (
            cipher,
            session.encryption_key(),
            session.decryption_key(),
        ) {
            (Some(cipher), Some(encryption_key), Some(decryption_key)) => (
                Some(MessageEncryptor::new(make_encrypting_algo(
                    cipher,
                    encryption_key,
                )?)),
                Some(MessageDecryptor::new(make_encrypting_algo(
                    cipher,
                    decryption_key,
                )?)),
            ),
            _ => (None, None),
        };

        if session.encrypt_data() && encryptor.is_none() {
            return Err(crate::Error::InvalidState(
                "Session requires encryption, but the connection has no cipher".to_string(),
            ));
        }

        let session_id = session.session_id();
        self.preauth_sessions.lock().unwrap().remove(&session_id);
        self.sessions.lock().unwrap().insert(
            session_id,
            SessionCrypto {
                session,
                signer,
                encryptor,
                decryptor,
            },
        );
        log::debug!("Session {session_id} registered for message protection.");

        Ok(())
    }

    /// Notifies that a session has ended.
    pub fn session_ended(&self, session_id: u64) -> crate::Result<()> {
        self.preauth_sessions.lock().unwrap().remove(&session_id);
        match self.sessions.lock().unwrap().remove(&session_id) {
            Some(_) => Ok(()),
            None => Err(crate::Error::InvalidState("Session not found!".to_string())),
        }
    }

    /// A session that has begun, but not completed, authentication.
    pub fn preauth_session(&self, session_id: u64) -> Option<Arc<Session>> {
        self.preauth_sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .cloned()
    }

    /// The recorded pre-auth transcript, if the dialect keeps one.
    pub fn preauth_transcript(&self) -> Option<Vec<Vec<u8>>> {
        self.preauth_integrity
            .lock()
            .unwrap()
            .as_ref()
            .map(|integrity| integrity.messages().to_vec())
    }

    /// The rolling pre-auth hash over the transcript, if the dialect keeps
    /// one. Consumed by session setup.
    pub fn preauth_hash(&self) -> Option<PreauthHashValue> {
        self.preauth_integrity
            .lock()
            .unwrap()
            .as_ref()
            .map(|integrity| integrity.hash())
    }

    fn step_preauth_hash(&self, raw: &[u8]) {
        if let Some(integrity) = self.preauth_integrity.lock().unwrap().as_mut() {
            integrity.record(raw);
        }
    }

    /// Picks the outbound protection for a message, per the session's
    /// policy: encryption wins over signing, AEAD already authenticates.
    fn outgoing_protection(&self, session_id: u64) -> OutgoingProtection {
        if session_id == 0 {
            return OutgoingProtection::None;
        }
        let sessions = self.sessions.lock().unwrap();
        let Some(entry) = sessions.get(&session_id) else {
            // an unregistered (pre-auth) session sends in the clear.
            return OutgoingProtection::None;
        };
        if entry.session.encrypt_data() {
            if let Some(encryptor) = &entry.encryptor {
                return OutgoingProtection::Encrypt(encryptor.clone());
            }
        }
        if entry.session.signing_required() {
            return OutgoingProtection::Sign(entry.signer.clone());
        }
        OutgoingProtection::None
    }

    /// Transforms an outgoing message into its wire frame, signing or
    /// encrypting it per the session's policy. The header is updated in
    /// place (signed flag, signature).
    pub fn transform_outgoing(&self, message: &mut PlainMessage) -> crate::Result<Vec<u8>> {
        let protection = self.outgoing_protection(message.header.session_id);

        if let OutgoingProtection::Sign(_) = &protection {
            message.header.flags = message.header.flags.with_signed(true);
        }

        let mut data = message.to_bytes()?;

        if message.header.command == Command::Negotiate {
            self.step_preauth_hash(&data);
        }

        match protection {
            OutgoingProtection::None => Ok(data),
            OutgoingProtection::Sign(mut signer) => {
                signer.sign_message(&mut message.header, &mut data)?;
                Ok(data)
            }
            OutgoingProtection::Encrypt(mut encryptor) => {
                let encrypted =
                    encryptor.encrypt_message(data, message.header.session_id)?;
                let mut cursor = Cursor::new(Vec::new());
                encrypted.write(&mut cursor)?;
                Ok(cursor.into_inner())
            }
        }
    }

    /// Transforms a received wire frame into an [`IncomingMessage`],
    /// decrypting and verifying it as required.
    pub fn transform_incoming(&self, data: Vec<u8>) -> crate::Result<IncomingMessage> {
        let frame = Message::read_le(&mut Cursor::new(&data)).map_err(|_| {
            crate::Error::InvalidMessage(format!(
                "Invalid header received from server: {:02x?}",
                &data[..data.len().min(4)]
            ))
        })?;

        let mut form = MessageForm::default();
        let (mut message, raw) = match frame {
            Message::Encrypted(encrypted) => {
                form.encrypted = true;
                let session_id = encrypted.header.session_id;
                let decryptor = {
                    let sessions = self.sessions.lock().unwrap();
                    sessions
                        .get(&session_id)
                        .and_then(|entry| entry.decryptor.clone())
                };
                match decryptor {
                    Some(mut decryptor) => decryptor.decrypt_message(encrypted)?,
                    None => {
                        return Err(crate::Error::TransformFailed(TransformError {
                            outgoing: false,
                            phase: TransformPhase::EncryptDecrypt,
                            session_id: Some(session_id),
                            why: "Message is encrypted, but no decryptor is set up!",
                            msg_id: None,
                        }))
                    }
                }
            }
            Message::Plain(message) => (message, data),
        };

        self.verify_plain_incoming(&mut message, &raw, &mut form)?;

        if message.header.command == Command::Negotiate {
            self.step_preauth_hash(&raw);
        }

        Ok(IncomingMessage { message, raw, form })
    }

    /// Verifies the signature of an incoming plain message, if verification
    /// is required for it.
    fn verify_plain_incoming(
        &self,
        message: &mut PlainMessage,
        raw: &[u8],
        form: &mut MessageForm,
    ) -> crate::Result<()> {
        // Encrypted messages were authenticated by the AEAD; unsolicited
        // messages and interim pending responses are exempt; session setup
        // responses arrive before the session keys do.
        if form.encrypted
            || message.header.message_id == Header::UNSOLICITED_MESSAGE_ID
            || message.header.status == Status::U32_PENDING
            || !message.header.flags.signed()
            || message.header.command == Command::SessionSetup
        {
            return Ok(());
        }

        let session_id = message.header.session_id;
        let verifier = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&session_id).map(|entry| entry.signer.clone())
        };
        let Some(mut verifier) = verifier else {
            return Err(crate::Error::TransformFailed(TransformError {
                outgoing: false,
                phase: TransformPhase::SignVerify,
                session_id: Some(session_id),
                why: "Message is signed, but no verifier is set up!",
                msg_id: Some(message.header.message_id),
            }));
        };

        match verifier.verify_signature(&mut message.header, raw) {
            Ok(()) => {
                form.signed = true;
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to verify incoming message: {e:?}");
                Err(crate::Error::TransformFailed(TransformError {
                    outgoing: false,
                    phase: TransformPhase::SignVerify,
                    session_id: Some(session_id),
                    why: "Failed to verify incoming message!",
                    msg_id: Some(message.header.message_id),
                }))
            }
        }
    }
}

/// A struct for writing and verifying SMB message signatures.
///
/// A signing session is single-use; clone the signer for each message.
#[derive(Debug)]
pub struct MessageSigner {
    signing_algo: Box<dyn SigningAlgo>,
}

impl MessageSigner {
    pub fn new(signing_algo: Box<dyn SigningAlgo>) -> MessageSigner {
        MessageSigner { signing_algo }
    }

    /// Signs a message, patching the signature into both the header and the
    /// packed frame.
    pub fn sign_message(&mut self, header: &mut Header, raw_data: &mut [u8]) -> crate::Result<()> {
        debug_assert!(raw_data.len() >= Header::STRUCT_SIZE);

        header.signature = self.calculate_signature(header, raw_data)?;
        let mut header_writer = Cursor::new(&mut raw_data[0..Header::STRUCT_SIZE]);
        header.write(&mut header_writer)?;

        log::debug!(
            "Message #{} signed (signature={:032x}).",
            header.message_id,
            header.signature
        );
        Ok(())
    }

    /// Verifies the signature of a message.
    pub fn verify_signature(&mut self, header: &mut Header, raw_data: &[u8]) -> crate::Result<()> {
        let calculated_signature = self.calculate_signature(header, raw_data)?;
        if calculated_signature != header.signature {
            return Err(crate::Error::SignatureVerificationFailed);
        }
        log::debug!(
            "Signature verification passed (signature={:032x}).",
            header.signature
        );
        Ok(())
    }

    /// The MAC over the whole frame with the signature field zeroed.
    fn calculate_signature(&mut self, header: &mut Header, raw_data: &[u8]) -> crate::Result<u128> {
        let signature_backup = header.signature;
        header.signature = 0;
        let mut header_bytes = Cursor::new([0u8; Header::STRUCT_SIZE]);
        header.write(&mut header_bytes)?;
        header.signature = signature_backup;

        self.signing_algo.update(&header_bytes.into_inner());
        self.signing_algo.update(&raw_data[Header::STRUCT_SIZE..]);
        Ok(self.signing_algo.finalize())
    }
}

impl Clone for MessageSigner {
    fn clone(&self) -> Self {
        MessageSigner {
            signing_algo: self.signing_algo.clone_box(),
        }
    }
}

/// Wraps plain frames into encrypted (transformed) messages.
#[derive(Debug)]
pub struct MessageEncryptor {
    algo: Box<dyn EncryptingAlgo>,
}

impl MessageEncryptor {
    pub fn new(algo: Box<dyn EncryptingAlgo>) -> MessageEncryptor {
        MessageEncryptor { algo }
    }

    /// Encrypts a packed plain frame in-place, returning the full
    /// transformed message.
    pub fn encrypt_message(
        &mut self,
        mut message: Vec<u8>,
        session_id: u64,
    ) -> crate::Result<EncryptedMessage> {
        debug_assert!(session_id != 0);

        let mut header = TransformHeader {
            signature: 0,
            nonce: self.gen_nonce(),
            original_message_size: message.len().try_into()?,
            session_id,
        };

        let result = self
            .algo
            .encrypt(&mut message, &header.aead_bytes(), &header.nonce)?;
        header.signature = result.signature;

        log::debug!("Message encrypted (signature={:032x}).", header.signature);

        Ok(EncryptedMessage {
            header,
            encrypted_message: message,
        })
    }

    /// A fresh random nonce of the cipher's effective size, zero-padded to
    /// the transform header field width.
    fn gen_nonce(&self) -> EncryptionNonce {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce[..self.algo.nonce_size()]);
        nonce
    }
}

impl Clone for MessageEncryptor {
    fn clone(&self) -> Self {
        MessageEncryptor {
            algo: self.algo.clone_box(),
        }
    }
}

/// Unwraps encrypted (transformed) messages into plain frames.
#[derive(Debug)]
pub struct MessageDecryptor {
    algo: Box<dyn EncryptingAlgo>,
}

impl MessageDecryptor {
    pub fn new(algo: Box<dyn EncryptingAlgo>) -> MessageDecryptor {
        MessageDecryptor { algo }
    }

    /// Decrypts in-place and re-parses the plaintext as a plain frame.
    /// Returns the message and the raw decrypted frame.
    pub fn decrypt_message(
        &mut self,
        msg_in: EncryptedMessage,
    ) -> crate::Result<(PlainMessage, Vec<u8>)> {
        let mut buffer = msg_in.encrypted_message;
        let aead_bytes = msg_in.header.aead_bytes();
        self.algo.decrypt(
            &mut buffer,
            &aead_bytes,
            &msg_in.header.nonce,
            msg_in.header.signature,
        )?;

        let message = PlainMessage::read(&mut Cursor::new(&buffer))?;

        log::debug!(
            "Message decrypted (signature={:032x}).",
            msg_in.header.signature
        );
        Ok((message, buffer))
    }
}

impl Clone for MessageDecryptor {
    fn clone(&self) -> Self {
        MessageDecryptor {
            algo: self.algo.clone_box(),
        }
    }
}

/// An error that can occur during the transformation of messages.
#[derive(Debug)]
pub struct TransformError {
    /// If true, the error occurred while transforming an outgoing message.
    pub outgoing: bool,
    pub phase: TransformPhase,
    pub session_id: Option<u64>,
    pub why: &'static str,
    /// The message id the error relates to, when one is available, so the
    /// error can be delivered to the task waiting on it.
    pub msg_id: Option<u64>,
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Failed to transform {} message: {:?} (session_id: {:?}) - {}",
            if self.outgoing { "outgoing" } else { "incoming" },
            self.phase,
            self.session_id,
            self.why
        )
    }
}

/// The phase of the transformation process.
#[derive(Debug)]
pub enum TransformPhase {
    /// Initial to/from bytes.
    EncodeDecode,
    /// Signature calculation and verification.
    SignVerify,
    /// Encryption and decryption.
    EncryptDecrypt,
}
