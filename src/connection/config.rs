//! Connection configuration settings.

use std::time::Duration;

use crate::packets::{guid::Guid, smb2::Dialect};

/// Specifies the configuration for a connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// The server port to connect to. Defaults to
    /// [`ConnectionConfig::DEFAULT_PORT`] (Direct TCP).
    pub port: Option<u16>,

    /// Timeout for receive operations. Defaults to
    /// [`ConnectionConfig::DEFAULT_TIMEOUT`]; zero means wait forever.
    pub timeout: Option<Duration>,

    /// Pins negotiation to a single dialect. When unset, all supported
    /// dialects are offered.
    pub dialect: Option<Dialect>,

    /// Whether this client requires message signing. Advertised in the
    /// negotiate security mode.
    pub require_signing: bool,

    /// The GUID of the client to be used in the SMB2 negotiate request.
    /// If not set, a random GUID will be generated.
    pub client_guid: Option<Guid>,
}

impl ConnectionConfig {
    pub const DEFAULT_PORT: u16 = 445;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(Self::DEFAULT_PORT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Self::DEFAULT_TIMEOUT)
    }
}
