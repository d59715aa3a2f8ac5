use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while supervising the daemon or driving its control API
#[derive(Debug, Error)]
pub enum BurrowError {
    /// Configured daemon binary is missing or unreadable
    #[error("daemon binary not found at {}", path.display())]
    BinaryNotFound { path: PathBuf },

    /// Process creation failed
    #[error("failed to spawn daemon: {0}")]
    Spawn(#[source] std::io::Error),

    /// Daemon could not bind its control API address
    #[error("daemon reported its address is already in use")]
    PortInUse,

    /// Account is already running the maximum number of daemon sessions
    #[error("daemon session limit reached ({limit} simultaneous sessions)")]
    SessionLimit { limit: u32 },

    /// Daemon output could not be read (includes end of stream)
    #[error("failed to read daemon output: {0}")]
    ReadFailure(#[source] std::io::Error),

    #[error("client has no tunnels")]
    NoTunnels,

    #[error("tunnel '{name}' not found")]
    TunnelNotFound { name: String },

    #[error("client '{id}' not found")]
    ClientNotFound { id: String },

    /// A tunnel operation was attempted before the readiness handshake
    #[error("client '{client}' has no control API address yet")]
    NotReady { client: String },

    /// Non-2xx answer from the control API, body kept verbatim
    #[error("control API returned {status} for tunnel '{tunnel}': {body}")]
    Api {
        tunnel: String,
        status: u16,
        body: String,
    },

    /// Connection refused, timeout and friends
    #[error("control API request for tunnel '{tunnel}' failed: {source}")]
    Transport {
        tunnel: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected control API response for tunnel '{tunnel}': {reason}")]
    MalformedResponse { tunnel: String, reason: String },

    #[error("operation on tunnel '{tunnel}' was cancelled")]
    Cancelled { tunnel: String },

    #[error("failed to signal daemon: {0}")]
    Signal(String),

    #[error("authtoken registration failed: {0}")]
    AuthToken(String),

    #[error("invalid protocol '{0}' (expected http, tcp or tls)")]
    InvalidProtocol(String),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BurrowError {
    pub fn api(tunnel: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::Api {
            tunnel: tunnel.into(),
            status,
            body: body.into(),
        }
    }

    pub fn malformed(tunnel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            tunnel: tunnel.into(),
            reason: reason.into(),
        }
    }

    /// Whether a tunnel retry loop should try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Api { .. } | Self::Transport { .. } | Self::MalformedResponse { .. }
        )
    }
}
