use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::api::{ControlApi, CreateTunnelRequest};
use crate::error::BurrowError;
use crate::retry::{retry_fixed, RetryPolicy};

/// Tunnel protocol understood by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Tcp,
    Tls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts names (`http`, `tcp`, `tls`) and the numeric codes `0`, `1`, `2`
impl FromStr for Protocol {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "0" => Ok(Protocol::Http),
            "tcp" | "1" => Ok(Protocol::Tcp),
            "tls" | "2" => Ok(Protocol::Tls),
            _ => Err(BurrowError::InvalidProtocol(s.to_string())),
        }
    }
}

/// Observed lifecycle state of a tunnel
///
/// A public URL exists only in `Created`, so "created" and "has a public
/// address" can never disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelState {
    Pending,
    Created { public_url: String },
    Closed,
}

/// Everything a tunnel operation needs from its client
pub struct ControlSession<'a> {
    pub api: &'a dyn ControlApi,
    /// Resolved tunnel collection URL
    pub base_url: &'a str,
    pub policy: RetryPolicy,
    pub cancel: &'a CancellationToken,
    /// Log failed attempts at warn instead of debug
    pub log_api: bool,
    /// Log attempts at info instead of debug
    pub verbose: bool,
}

/// One local address exposed through the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    proto: Protocol,
    name: String,
    local_addr: String,
    #[serde(skip)]
    auth: Option<String>,
    inspect: bool,
    #[serde(flatten)]
    state: TunnelState,
}

impl Tunnel {
    pub fn new(proto: Protocol, name: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self {
            proto,
            name: name.into(),
            local_addr: local_addr.into(),
            auth: None,
            inspect: false,
            state: TunnelState::Pending,
        }
    }

    /// Basic auth (`user:password`) required by the public endpoint
    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    pub fn with_inspect(mut self, inspect: bool) -> Self {
        self.inspect = inspect;
        self
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn inspect(&self) -> bool {
        self.inspect
    }

    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    pub fn is_created(&self) -> bool {
        matches!(self.state, TunnelState::Created { .. })
    }

    /// Public address assigned by the daemon, `None` unless created
    pub fn public_url(&self) -> Option<&str> {
        match &self.state {
            TunnelState::Created { public_url } => Some(public_url),
            _ => None,
        }
    }

    /// Payload for `POST /api/tunnels`
    pub fn create_request(&self) -> CreateTunnelRequest {
        CreateTunnelRequest {
            addr: self.local_addr.clone(),
            proto: self.proto.as_str().to_string(),
            name: self.name.clone(),
            inspect: self.inspect,
            auth: self.auth.clone().unwrap_or_default(),
            bind_tls: (self.proto == Protocol::Http).then_some(true),
        }
    }

    /// Open this tunnel, retrying at a fixed interval.
    ///
    /// On success the tunnel is `Created` and its public URL is returned.
    /// On failure the state is left untouched and the last error escapes.
    pub async fn create(&mut self, session: &ControlSession<'_>) -> Result<String, BurrowError> {
        let request = self.create_request();
        let name = self.name.as_str();
        let local_addr = self.local_addr.as_str();

        let public_url = retry_fixed(session.policy, session.cancel, name, |attempt| {
            let request = &request;
            async move {
                log_attempt(session, "Creating tunnel", name, local_addr, attempt);
                let record = session
                    .api
                    .create_tunnel(session.base_url, request)
                    .await
                    .inspect_err(|e| log_failure(session, name, e))?;

                if record.public_url.is_empty() {
                    let err = BurrowError::malformed(name, "response has no public_url");
                    log_failure(session, name, &err);
                    return Err(err);
                }
                Ok(record.public_url)
            }
        })
        .await?;

        tracing::info!(tunnel = %self.name, local_addr = %self.local_addr, public_url = %public_url, "Tunnel created");
        self.state = TunnelState::Created {
            public_url: public_url.clone(),
        };
        Ok(public_url)
    }

    /// Close this tunnel, retrying at a fixed interval.
    ///
    /// On success the public URL is cleared and the tunnel is `Closed`.
    pub async fn close(&mut self, session: &ControlSession<'_>) -> Result<(), BurrowError> {
        let name = self.name.as_str();
        let public_url = self.public_url().unwrap_or_default();

        retry_fixed(session.policy, session.cancel, name, |attempt| async move {
            log_attempt(session, "Closing tunnel", name, public_url, attempt);
            session
                .api
                .close_tunnel(session.base_url, name)
                .await
                .inspect_err(|e| log_failure(session, name, e))
        })
        .await?;

        tracing::info!(tunnel = %self.name, "Tunnel closed");
        self.state = TunnelState::Closed;
        Ok(())
    }
}

fn log_attempt(session: &ControlSession<'_>, what: &str, name: &str, addr: &str, attempt: u32) {
    let attempt = attempt + 1;
    let max_attempts = session.policy.max_attempts();
    if session.verbose {
        tracing::info!(tunnel = name, addr, attempt, max_attempts, "{}", what);
    } else {
        tracing::debug!(tunnel = name, addr, attempt, max_attempts, "{}", what);
    }
}

fn log_failure(session: &ControlSession<'_>, name: &str, err: &BurrowError) {
    if session.log_api {
        tracing::warn!(tunnel = name, error = %err, "Control API call failed");
    } else {
        tracing::debug!(tunnel = name, error = %err, "Control API call failed");
    }
}
