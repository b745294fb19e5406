//! Post-negotiation connection state.

use crate::dialects::DialectImpl;
use crate::packets::guid::Guid;
use crate::packets::smb2::*;

use super::config::ConnectionConfig;

/// Everything the negotiation settled on. Fields that only exist from a
/// certain dialect on are `None` below it.
#[derive(Debug)]
pub struct NegotiatedProperties {
    /// The selected dialect revision for the connection.
    pub dialect: Dialect,

    pub server_guid: Guid,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,

    /// The server's GSS negotiate token, remembered for authentication.
    pub gss_negotiate_token: Vec<u8>,

    /// Whether the server requires signing on this connection.
    pub require_signing: bool,

    // SMB 2.1+
    pub supports_file_leasing: Option<bool>,
    pub supports_multi_credit: Option<bool>,

    // SMB 3.x+
    pub supports_directory_leasing: Option<bool>,
    pub supports_multi_channel: Option<bool>,
    pub supports_persistent_handles: Option<bool>,
    pub supports_encryption: Option<bool>,
    pub server_capabilities: Option<GlobalCapabilities>,
    pub server_security_mode: Option<NegotiateSecurityMode>,

    // SMB 3.1.1+
    /// The cipher the server selected via the encryption negotiate context.
    pub cipher_id: Option<EncryptionCipher>,
    /// The preauth integrity hash algorithm the server selected.
    pub preauth_integrity_hash_id: Option<HashAlgorithm>,
}

/// This struct is initialized once a connection is negotiated, and holds
/// all the information about the connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    /// Negotiated properties of the connection.
    pub negotiation: NegotiatedProperties,
    /// Dialect-dependent rules for the selected dialect.
    pub dialect: DialectImpl,
    /// The configuration the connection was established with.
    pub config: ConnectionConfig,
}
