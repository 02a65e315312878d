//! Error types shared by the codec, the tunnel dialer and the session.

use std::io;

use thiserror::Error;

/// Everything that can end a proxied session.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unexpected end of stream")]
    UnexpectedEndOfStream,

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocolVersion { major: u16, minor: u16 },

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u32),

    #[error("No such connection: {}", .0.as_deref().unwrap_or("<no database parameter>"))]
    NoSuchConnection(Option<String>),

    #[error("ssh authentication failed for {user}@{addr}: {reason}")]
    SshAuthFailed {
        user: String,
        addr: String,
        reason: String,
    },

    #[error("ssh host key rejected for {addr}: {reason}")]
    SshHostKeyRejected { addr: String, reason: String },

    #[error("upstream dial to {addr} failed: {reason}")]
    UpstreamDialFailed { addr: String, reason: String },

    #[error("failed to establish tunnel for database {database:?}: {source}")]
    TunnelEstablishmentFailed {
        database: String,
        #[source]
        source: Box<ProxyError>,
    },

    #[error("invalid address {0:?}: expected host:port")]
    InvalidAddress(String),

    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    #[error("failed to close tunnel channel ({channel}) and ssh connection ({connection})")]
    Close {
        channel: io::Error,
        connection: russh::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// SQLSTATE reported to the client in an ErrorResponse.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ProxyError::NoSuchConnection(_) => "3D000",
            ProxyError::TunnelEstablishmentFailed { .. }
            | ProxyError::SshAuthFailed { .. }
            | ProxyError::SshHostKeyRejected { .. }
            | ProxyError::UpstreamDialFailed { .. } => "08001",
            ProxyError::MalformedPacket(_)
            | ProxyError::UnexpectedEndOfStream
            | ProxyError::UnknownPacketType(_)
            | ProxyError::UnsupportedProtocolVersion { .. } => "08P01",
            _ => "08006",
        }
    }

    /// Whether the client should be sent an ErrorResponse for this error.
    ///
    /// A peer speaking another protocol version may not be able to parse one.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, ProxyError::UnsupportedProtocolVersion { .. })
    }

    /// Maps a failed read onto the codec's end-of-stream error.
    pub(crate) fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            ProxyError::UnexpectedEndOfStream
        } else {
            ProxyError::Io(err)
        }
    }
}
