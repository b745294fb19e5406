//! The SMB2/SMB3 client connection: multi-protocol dialect negotiation,
//! message protection, and request/response multiplexing.

pub mod config;
pub mod info;
pub mod preauth_hash;
pub mod sequence_window;
pub mod transformer;
pub mod transport;
pub mod worker;

use std::io::Cursor;
use std::sync::{Arc, Mutex, OnceLock};

use binrw::prelude::*;
use rand::rngs::OsRng;
use rand::RngCore;

pub use config::ConnectionConfig;
pub use info::{ConnectionInfo, NegotiatedProperties};
pub use transformer::{IncomingMessage, MessageForm, TransformError};

use crate::dialects::DialectImpl;
use crate::packets::guid::Guid;
use crate::packets::smb1::Smb1NegotiateMessage;
use crate::packets::smb2::*;
use crate::session::Session;
use crate::tree::Tree;
use crate::Error;

use sequence_window::SequenceWindow;
use transport::Transport;
use worker::ConnectionWorker;

/// The negotiation state machine, [MS-SMB2] 3.2.1.2 flavored.
///
/// `Operational` is the first state in which non-negotiate traffic is
/// allowed. `connect` only works from `Fresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Fresh,
    TcpOpen,
    Smb1Sent,
    Smb2Sent,
    Negotiated,
    Operational,
    Closed,
}

/// A client connection to an SMB server.
///
/// One `Connection` per TCP endpoint pair. After [`Connection::connect`]
/// completes negotiation, any number of threads may [`Connection::send`] and
/// [`Connection::receive`] concurrently; responses are routed back by
/// message id, whatever order they arrive in.
pub struct Connection {
    config: ConnectionConfig,
    client_guid: Guid,

    state: Mutex<ConnectionState>,
    worker: OnceLock<Arc<ConnectionWorker>>,
    conn_info: OnceLock<Arc<ConnectionInfo>>,
    /// The salt sent in the preauth integrity negotiate context.
    salt: OnceLock<[u8; 32]>,
}

impl Connection {
    /// Creates a new connection with the given configuration, without
    /// connecting. Use [`Connection::connect`] to establish it.
    pub fn build(config: ConnectionConfig) -> crate::Result<Connection> {
        let client_guid = config.client_guid.unwrap_or_else(Guid::gen);
        Ok(Connection {
            config,
            client_guid,
            state: Mutex::new(ConnectionState::Fresh),
            worker: OnceLock::new(),
            conn_info: OnceLock::new(),
            salt: OnceLock::new(),
        })
    }

    pub fn client_guid(&self) -> &Guid {
        &self.client_guid
    }

    /// The negotiated connection properties. `None` before negotiation
    /// completes.
    pub fn conn_info(&self) -> Option<&Arc<ConnectionInfo>> {
        self.conn_info.get()
    }

    /// Connects to `server` and negotiates the protocol dialect.
    ///
    /// This is a one-shot transition: a connection that has been connected
    /// (or closed) cannot be connected again.
    pub fn connect(&mut self, server: &str) -> crate::Result<()> {
        {
            let state = self.state.lock().unwrap();
            if *state != ConnectionState::Fresh {
                return Err(Error::InvalidState(format!(
                    "Connect is only valid on a fresh connection (state: {state:?})"
                )));
            }
        }

        let address = format!("{}:{}", server, self.config.port());
        log::debug!("Connecting to {address}...");
        let mut transport = Transport::new();
        transport.connect(&address)?;
        self.set_state(ConnectionState::TcpOpen);

        log::info!("Connected to {address}. Negotiating.");
        self.negotiate(transport)?;

        log::info!(
            "Negotiation successful (dialect: {:?}).",
            self.conn_info.get().unwrap().negotiation.dialect
        );
        Ok(())
    }

    /// Closes the connection. All outstanding receives fail.
    pub fn disconnect(&self) -> crate::Result<()> {
        log::info!("Disconnecting transport connection.");
        self.set_state(ConnectionState::Closed);
        match self.worker.get() {
            Some(worker) => worker.stop(),
            None => Ok(()),
        }
    }

    /// Sends a command with an opaque body, returning the header as sent --
    /// it carries the allocated message id for [`Connection::receive`].
    pub fn send(
        &self,
        command: Command,
        data: Vec<u8>,
        session: Option<&Arc<Session>>,
        tree: Option<&Tree>,
    ) -> crate::Result<Header> {
        self.send_with_charge(command, data, session, tree, 1)
    }

    /// Like [`Connection::send`], for multi-credit requests: the charge is
    /// set on the header and consumed from the sequence window.
    pub fn send_with_charge(
        &self,
        command: Command,
        data: Vec<u8>,
        session: Option<&Arc<Session>>,
        tree: Option<&Tree>,
        credit_charge: u16,
    ) -> crate::Result<Header> {
        self.ensure_operational()?;
        if command == Command::Negotiate {
            return Err(Error::InvalidState(
                "The dialect is negotiated once per connection".to_string(),
            ));
        }
        if command == Command::Cancel {
            return Err(Error::InvalidState(
                "Use send_cancel for cancel requests".to_string(),
            ));
        }

        let mut message = PlainMessage::new(command, data);
        self.prepare_header(&mut message.header, session, tree);

        self.worker()?.send(&mut message, credit_charge.max(1))?;
        Ok(message.header)
    }

    /// Cancels an in-flight request. The cancel reuses the target's message
    /// id, does not allocate from the sequence window, and has no response;
    /// the target's own receive observes the outcome.
    pub fn send_cancel(
        &self,
        message_id: u64,
        session: Option<&Arc<Session>>,
    ) -> crate::Result<()> {
        self.ensure_operational()?;

        // An SMB2 CANCEL body: structure size 4, reserved.
        let mut message = PlainMessage::new(Command::Cancel, vec![0x04, 0x00, 0x00, 0x00]);
        self.prepare_header(&mut message.header, session, None);
        message.header.message_id = message_id;

        self.worker()?.send(&mut message, 0)?;
        Ok(())
    }

    /// Waits for the terminal response to a sent message.
    pub fn receive(&self, message_id: u64) -> crate::Result<IncomingMessage> {
        self.ensure_operational()?;
        self.worker()?.receive(message_id)
    }

    /// Registers a session that has begun authenticating.
    pub fn session_preauth_started(&self, session: Arc<Session>) -> crate::Result<()> {
        self.worker()?
            .transformer()
            .session_preauth_started(session);
        Ok(())
    }

    /// Registers a fully set-up session for signing and encryption.
    pub fn session_started(&self, session: Arc<Session>) -> crate::Result<()> {
        self.worker()?.transformer().session_started(session)
    }

    /// Removes a session from the connection tables.
    pub fn session_ended(&self, session_id: u64) -> crate::Result<()> {
        self.worker()?.transformer().session_ended(session_id)
    }

    /// The pre-auth integrity hash over the negotiate exchange, for session
    /// setup key binding. `None` below dialect 3.1.1.
    pub fn preauth_hash(&self) -> Option<preauth_hash::PreauthHashValue> {
        self.worker.get()?.transformer().preauth_hash()
    }

    /// The number of requests currently awaiting a response.
    pub fn outstanding_request_count(&self) -> usize {
        self.worker
            .get()
            .map(|worker| worker.outstanding_request_count())
            .unwrap_or(0)
    }

    fn worker(&self) -> crate::Result<&Arc<ConnectionWorker>> {
        self.worker.get().ok_or(Error::NotConnected)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn ensure_operational(&self) -> crate::Result<()> {
        let state = self.state.lock().unwrap();
        match *state {
            ConnectionState::Operational => Ok(()),
            ConnectionState::Closed => Err(Error::NotConnected),
            _ => Err(Error::InvalidState(format!(
                "The connection is not operational (state: {:?})",
                *state
            ))),
        }
    }

    /// Populates the routing fields of an outgoing header.
    fn prepare_header(
        &self,
        header: &mut Header,
        session: Option<&Arc<Session>>,
        tree: Option<&Tree>,
    ) {
        let priority = self
            .conn_info
            .get()
            .map(|info| info.dialect.priority_value())
            .unwrap_or(0);
        header.flags = header.flags.with_priority_mask(priority);
        if let Some(session) = session {
            header.session_id = session.session_id();
        }
        if let Some(tree) = tree {
            header.tree_id = Some(tree.tree_connect_id());
        }
    }

    // -- Negotiation --------------------------------------------------------

    /// Runs multi-protocol negotiation over a fresh transport: SMB1
    /// NEGOTIATE first, then, if the server answers with the wildcard
    /// dialect, SMB2 NEGOTIATE through the regular send path.
    fn negotiate(&mut self, mut transport: Transport) -> crate::Result<()> {
        if self.conn_info.get().is_some() {
            return Err(Error::InvalidState("Already negotiated".into()));
        }

        let smb1_response = self.negotiate_smb1(&mut transport)?;

        // The SMB1 exchange consumed message id 0.
        let mut sequence_window = SequenceWindow::default();
        sequence_window.allocate(1);

        let worker = ConnectionWorker::start(transport, sequence_window, self.config.timeout())?;
        self.worker
            .set(worker)
            .map_err(|_| Error::InvalidState("Worker already started".into()))?;

        let negotiation =
            if smb1_response.dialect_revision == NegotiateDialect::Smb02Wildcard {
                self.negotiate_smb2()?
            } else {
                // The SMB1-elicited response is authoritative.
                log::debug!(
                    "Server selected {:?} directly from the SMB1 negotiate.",
                    smb1_response.dialect_revision
                );
                self.process_negotiate_response(&smb1_response)?
            };
        self.set_state(ConnectionState::Negotiated);

        let info = Arc::new(ConnectionInfo {
            dialect: DialectImpl::new(negotiation.dialect),
            negotiation,
            config: self.config.clone(),
        });

        self.worker()?.transformer().negotiated(&info)?;
        self.conn_info
            .set(info)
            .map_err(|_| Error::InvalidState("Already negotiated".into()))?;
        self.set_state(ConnectionState::Operational);

        Ok(())
    }

    /// Phase 1: SMB1 NEGOTIATE, answered by an SMB2 message.
    fn negotiate_smb1(&self, transport: &mut Transport) -> crate::Result<NegotiateResponse> {
        log::debug!("Negotiating multi-protocol (SMB1).");

        let smb1_negotiate = Smb1NegotiateMessage::new(self.config.dialect);
        let mut frame = Cursor::new(Vec::new());
        smb1_negotiate.write(&mut frame)?;
        transport.send_frame(&frame.into_inner())?;
        self.set_state(ConnectionState::Smb1Sent);

        let response = transport.receive_frame()?;
        let message = match Message::read_le(&mut Cursor::new(&response)) {
            Ok(Message::Plain(message)) => message,
            Ok(Message::Encrypted(_)) => {
                return Err(Error::InvalidMessage(
                    "Unexpected encrypted response to the SMB1 negotiate".to_string(),
                ))
            }
            Err(_) => {
                return Err(Error::InvalidMessage(
                    "Expected an SMB2 negotiate response, got an invalid header".to_string(),
                ))
            }
        };

        if message.header.command != Command::Negotiate {
            return Err(Error::InvalidMessage(format!(
                "Expected a negotiate response, got {}",
                message.header.command
            )));
        }
        if message.header.message_id != 0 {
            return Err(Error::InvalidMessage(
                "Expected message id 0 on the negotiate response".to_string(),
            ));
        }
        if message.header.status != Status::U32_SUCCESS {
            return Err(Error::NegotiationError(format!(
                "The server rejected the SMB1 negotiate: {}",
                Status::try_display_as_status(message.header.status)
            )));
        }

        decode_body(&response)
    }

    /// Phase 2: SMB2/SMB3 NEGOTIATE via the regular send path, so the
    /// message id, the sequence window, and the request table are all
    /// exercised before the connection is handed to callers.
    fn negotiate_smb2(&self) -> crate::Result<NegotiatedProperties> {
        log::debug!("Negotiating SMB2.");

        let request = self.build_smb2_negotiate_request();
        let mut message =
            PlainMessage::new(Command::Negotiate, encode_body(&request)?);

        let worker = self.worker()?;
        let message_id = worker.send(&mut message, 1)?;
        self.set_state(ConnectionState::Smb2Sent);

        let response = worker.receive(message_id)?;
        let negotiate_response: NegotiateResponse = decode_body(&response.raw)?;

        self.process_negotiate_response(&negotiate_response)
    }

    /// Builds the SMB2 NEGOTIATE request: either the plain SMB2 shape, or
    /// the SMB3 shape with negotiate contexts when 3.1.1 is on the table.
    fn build_smb2_negotiate_request(&self) -> NegotiateRequest {
        let dialects = match self.config.dialect {
            Some(pinned) => vec![pinned],
            None => Dialect::ALL.to_vec(),
        };
        let highest = *dialects.iter().max().unwrap();

        let security_mode = if self.config.require_signing {
            NegotiateSecurityMode::new().with_signing_required(true)
        } else {
            NegotiateSecurityMode::new().with_signing_enabled(true)
        };

        // The client GUID is only meaningful from 2.1 on.
        let client_guid = if highest >= Dialect::Smb021 {
            self.client_guid
        } else {
            Guid::default()
        };

        let capabilities = if highest >= Dialect::Smb030 {
            GlobalCapabilities::new().with_encryption(true)
        } else {
            GlobalCapabilities::new()
        };

        let negotiate_context_list = if highest >= Dialect::Smb0311 {
            let salt = *self.salt.get_or_init(|| {
                let mut salt = [0u8; 32];
                OsRng.fill_bytes(&mut salt);
                salt
            });
            Some(vec![
                NegotiateContext::preauth_integrity(PreauthIntegrityCapabilities {
                    hash_algorithms: vec![HashAlgorithm::Sha512],
                    salt: salt.to_vec(),
                }),
                NegotiateContext::encryption(EncryptionCapabilities {
                    ciphers: vec![EncryptionCipher::Aes128Gcm, EncryptionCipher::Aes128Ccm],
                }),
            ])
        } else {
            None
        };

        NegotiateRequest {
            security_mode,
            capabilities,
            client_guid,
            dialects,
            negotiate_context_list,
        }
    }

    /// Populates the negotiated connection properties from a NEGOTIATE
    /// response, per the selected dialect.
    fn process_negotiate_response(
        &self,
        response: &NegotiateResponse,
    ) -> crate::Result<NegotiatedProperties> {
        let dialect: Dialect = response.dialect_revision.try_into()?;
        if let Some(pinned) = self.config.dialect {
            if dialect != pinned {
                return Err(Error::NegotiationError(format!(
                    "Server selected {:?}, but the connection is pinned to {:?}",
                    dialect, pinned
                )));
            }
        }

        let capabilities = response.capabilities;
        let mut negotiation = NegotiatedProperties {
            dialect,
            server_guid: response.server_guid,
            max_transact_size: response.max_transact_size,
            max_read_size: response.max_read_size,
            max_write_size: response.max_write_size,
            gss_negotiate_token: response.buffer.clone(),
            require_signing: response.security_mode.signing_required(),
            supports_file_leasing: None,
            supports_multi_credit: None,
            supports_directory_leasing: None,
            supports_multi_channel: None,
            supports_persistent_handles: None,
            supports_encryption: None,
            server_capabilities: None,
            server_security_mode: None,
            cipher_id: None,
            preauth_integrity_hash_id: None,
        };
        log::debug!(
            "Connection requires signing: {}",
            negotiation.require_signing
        );

        if dialect >= Dialect::Smb021 {
            negotiation.supports_file_leasing = Some(capabilities.leasing());
            negotiation.supports_multi_credit = Some(capabilities.large_mtu());
        }

        if dialect >= Dialect::Smb030 {
            negotiation.supports_directory_leasing = Some(capabilities.directory_leasing());
            negotiation.supports_multi_channel = Some(capabilities.multi_channel());
            // Persistent handles require support this client does not have.
            negotiation.supports_persistent_handles = Some(false);
            negotiation.server_capabilities = Some(capabilities);
            negotiation.server_security_mode = Some(response.security_mode);

            if dialect < Dialect::Smb0311 {
                negotiation.supports_encryption = Some(capabilities.encryption());
            }
        }

        if dialect >= Dialect::Smb0311 {
            self.process_negotiate_contexts(response, &mut negotiation)?;
        }

        Ok(negotiation)
    }

    /// Walks the 3.1.1 negotiate-context list of the response.
    fn process_negotiate_contexts(
        &self,
        response: &NegotiateResponse,
        negotiation: &mut NegotiatedProperties,
    ) -> crate::Result<()> {
        if response.negotiate_context_list.is_none() {
            return Err(Error::NegotiationError(
                "Expected a negotiate context list for dialect 3.1.1".to_string(),
            ));
        }

        if let Some(cipher) = response.get_ctx_encrypt_cipher() {
            negotiation.cipher_id = Some(cipher);
            negotiation.supports_encryption = Some(cipher != EncryptionCipher::None);
        } else {
            negotiation.supports_encryption = Some(false);
        }

        if let Some(hash_algorithm) = response.get_ctx_integrity_algo() {
            if !preauth_hash::SUPPORTED_ALGOS.contains(&hash_algorithm) {
                return Err(Error::NegotiationError(
                    "Unsupported preauth integrity algorithm received".to_string(),
                ));
            }
            negotiation.preauth_integrity_hash_id = Some(hash_algorithm);
        }

        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get() {
            // Idempotent: joins the worker threads even after a failure
            // already marked the connection stopped.
            let _ = worker.stop();
        }
    }
}
