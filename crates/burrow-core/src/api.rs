//! Client for the daemon's local control API
//!
//! Only two calls are needed: `POST {base}` to open a tunnel and
//! `DELETE {base}/{name}` to close it. Nothing is retried at this layer; the
//! tunnel retry loop owns that so state changes and logging stay per tunnel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::error::BurrowError;

/// Body of `POST /api/tunnels`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    pub addr: String,
    pub proto: String,
    pub name: String,
    pub inspect: bool,
    pub auth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_tls: Option<bool>,
}

/// Tunnel as described by the control API
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelRecord {
    pub name: String,
    pub uri: String,
    pub public_url: String,
    pub proto: String,
    pub config: TunnelRecordConfig,
    pub metrics: TunnelMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelRecordConfig {
    pub addr: String,
    pub inspect: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelMetrics {
    pub conns: MetricWindow,
    pub http: MetricWindow,
}

/// Counter, gauge, rates and latency percentiles reported per tunnel
///
/// Rates are events per second over 1, 5 and 15 minutes; percentiles are
/// durations in nanoseconds. The daemon reports both as floats.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricWindow {
    pub count: i64,
    pub gauge: i64,
    pub rate1: f64,
    pub rate5: f64,
    pub rate15: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Control API operations used by tunnels
///
/// `base_url` is the resolved tunnel collection URL, e.g.
/// `http://127.0.0.1:4040/api/tunnels`.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Open a tunnel and return the daemon's record of it
    async fn create_tunnel(
        &self,
        base_url: &str,
        request: &CreateTunnelRequest,
    ) -> Result<TunnelRecord, BurrowError>;

    /// Close the tunnel called `name`
    async fn close_tunnel(&self, base_url: &str, name: &str) -> Result<(), BurrowError>;
}

/// `reqwest`-backed control API client
#[derive(Debug, Clone)]
pub struct HttpControlApi {
    client: Client,
}

impl HttpControlApi {
    pub fn new(timeout: Duration) -> Result<Self, BurrowError> {
        // No idle pooling: every request uses a fresh, short-lived connection.
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| BurrowError::Settings(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ControlApi for HttpControlApi {
    async fn create_tunnel(
        &self,
        base_url: &str,
        request: &CreateTunnelRequest,
    ) -> Result<TunnelRecord, BurrowError> {
        let tunnel = request.name.as_str();
        tracing::debug!(tunnel, url = base_url, "POST tunnel");

        let response = self
            .client
            .post(base_url)
            .json(request)
            .send()
            .await
            .map_err(|source| BurrowError::Transport {
                tunnel: tunnel.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| BurrowError::Transport {
                tunnel: tunnel.to_string(),
                source,
            })?;

        if !status.is_success() {
            return Err(BurrowError::api(tunnel, status.as_u16(), body));
        }

        serde_json::from_str(&body).map_err(|e| BurrowError::malformed(tunnel, e.to_string()))
    }

    async fn close_tunnel(&self, base_url: &str, name: &str) -> Result<(), BurrowError> {
        let url = tunnel_url(base_url, name)?;
        tracing::debug!(tunnel = name, url = %url, "DELETE tunnel");

        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|source| BurrowError::Transport {
                tunnel: name.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(BurrowError::api(name, status.as_u16(), body))
    }
}

/// `{base_url}/{name}` with `name` encoded as a single path segment
fn tunnel_url(base_url: &str, name: &str) -> Result<Url, BurrowError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| BurrowError::Settings(format!("invalid control API URL {}: {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| BurrowError::Settings(format!("control API URL {} cannot have a path", base_url)))?
        .pop_if_empty()
        .push(name);
    Ok(url)
}
