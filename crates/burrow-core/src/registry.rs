//! Live clients keyed by id
//!
//! This is the surface a request-routing front end drives: create a client
//! with a single tunnel, tear a client down, or remove one of its tunnels.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::api::{ControlApi, HttpControlApi};
use crate::client::{Client, ClientSnapshot, TunnelReport};
use crate::error::BurrowError;
use crate::options::Options;
use crate::settings::Settings;
use crate::tunnel::{Protocol, Tunnel};

/// Handle to a registered client
pub type SharedClient = Arc<Mutex<Client>>;

/// Result of [`ClientRegistry::create_client`]
#[derive(Debug, Clone, Serialize)]
pub struct CreatedClient {
    pub client_id: String,
    pub control_addr: String,
    pub tunnel: Tunnel,
}

pub struct ClientRegistry {
    clients: DashMap<String, SharedClient>,
    settings: Arc<Settings>,
    options: Options,
    api: Arc<dyn ControlApi>,
}

impl ClientRegistry {
    /// `options` is the launch template used for every new client
    pub fn new(settings: Arc<Settings>, options: Options) -> Result<Self, BurrowError> {
        let api = Arc::new(HttpControlApi::new(settings.request_timeout)?);
        Ok(Self::with_control_api(settings, options, api))
    }

    pub fn with_control_api(
        settings: Arc<Settings>,
        options: Options,
        api: Arc<dyn ControlApi>,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            settings,
            options,
            api,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, client_id: &str) -> Option<SharedClient> {
        self.clients.get(client_id).map(|c| c.value().clone())
    }

    pub async fn snapshots(&self) -> Vec<ClientSnapshot> {
        let clients: Vec<SharedClient> = self.clients.iter().map(|c| c.value().clone()).collect();
        let mut snapshots = Vec::with_capacity(clients.len());
        for client in clients {
            snapshots.push(client.lock().await.snapshot());
        }
        snapshots
    }

    /// Start a daemon exposing `host:port` as a single tunnel.
    ///
    /// The client is registered only once its tunnel is created; on any
    /// failure the daemon is stopped and the error returned.
    pub async fn create_client(
        &self,
        protocol: Protocol,
        port: u16,
        host: &str,
        tunnel_name: &str,
    ) -> Result<CreatedClient, BurrowError> {
        let local_addr = format!("{}:{}", host, port);
        tracing::info!(%protocol, local_addr = %local_addr, tunnel = tunnel_name, "Creating client");

        let mut client = Client::with_control_api(
            self.options.clone(),
            self.settings.clone(),
            self.api.clone(),
        )?;

        let control_addr = client.start().await?;
        client.add_tunnel(Tunnel::new(protocol, tunnel_name, local_addr));

        let outcome = match client.connect_all().await {
            Ok(mut reports) => match reports.pop() {
                Some(TunnelReport { result: Err(e), .. }) => Err(e),
                _ => Ok(()),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            if let Err(close_err) = client.close().await {
                tracing::warn!(client = %client.id(), error = %close_err, "Failed to stop daemon");
            }
            return Err(e);
        }

        let tunnel = client
            .tunnel(tunnel_name)
            .cloned()
            .ok_or_else(|| BurrowError::TunnelNotFound {
                name: tunnel_name.to_string(),
            })?;
        let client_id = client.id().to_string();

        tracing::info!(client = %client_id, public_url = ?tunnel.public_url(), "Client connected");
        self.clients
            .insert(client_id.clone(), Arc::new(Mutex::new(client)));

        Ok(CreatedClient {
            client_id,
            control_addr,
            tunnel,
        })
    }

    /// Close every tunnel of a client, stop its daemon and forget it
    pub async fn disconnect_client(&self, client_id: &str) -> Result<(), BurrowError> {
        let (_, shared) =
            self.clients
                .remove(client_id)
                .ok_or_else(|| BurrowError::ClientNotFound {
                    id: client_id.to_string(),
                })?;

        let mut client = shared.lock().await;
        match client.disconnect_all().await {
            Ok(reports) => {
                if let Some(failed) = reports.iter().find(|r| !r.is_ok()) {
                    tracing::warn!(client = client_id, tunnel = %failed.name, "Tunnel did not close cleanly");
                }
            }
            Err(BurrowError::NoTunnels) => {}
            Err(e) => tracing::warn!(client = client_id, error = %e, "Disconnect failed"),
        }

        client.close().await
    }

    /// Close one tunnel of a client and remove it from that client
    pub async fn disconnect_tunnel(
        &self,
        client_id: &str,
        tunnel_name: &str,
    ) -> Result<Tunnel, BurrowError> {
        let shared = self
            .get(client_id)
            .ok_or_else(|| BurrowError::ClientNotFound {
                id: client_id.to_string(),
            })?;

        let mut client = shared.lock().await;
        let reports = client.disconnect_tunnel(tunnel_name).await?;
        if let Some(report) = reports.into_iter().next() {
            report.result?;
        }

        client
            .remove_tunnel(tunnel_name)
            .ok_or_else(|| BurrowError::TunnelNotFound {
                name: tunnel_name.to_string(),
            })
    }

    /// Stop every registered client
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.clients.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.disconnect_client(&id).await {
                tracing::warn!(client = %id, error = %e, "Failed to shut down client");
            }
        }
    }
}
