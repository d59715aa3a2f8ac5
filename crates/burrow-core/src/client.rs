//! A daemon process plus the tunnels it serves
//!
//! `Client::start` performs the readiness handshake: it spawns the daemon and
//! blocks until the control API address shows up in its output. Only then
//! can tunnels be created or closed. Bulk operations fan out one future per
//! tunnel and join them all before returning a per-tunnel report.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{ControlApi, HttpControlApi};
use crate::error::BurrowError;
use crate::options::Options;
use crate::scanner;
use crate::settings::Settings;
use crate::supervisor::{DaemonSignal, ProcessSupervisor};
use crate::tunnel::{ControlSession, Tunnel};

/// Outcome of one tunnel's part in a bulk operation
#[derive(Debug)]
pub struct TunnelReport<T = ()> {
    pub name: String,
    pub result: Result<T, BurrowError>,
}

impl<T> TunnelReport<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Serializable view of a client
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub id: String,
    pub control_addr: Option<String>,
    pub tunnels: Vec<Tunnel>,
}

/// Owns one daemon subprocess and the tunnels exposed through it
pub struct Client {
    id: String,
    options: Options,
    settings: Arc<Settings>,
    api: Arc<dyn ControlApi>,
    supervisor: ProcessSupervisor,
    tunnels: Vec<Tunnel>,
    control_addr: Option<String>,
    cancel: CancellationToken,
    drain: Option<JoinHandle<()>>,
}

impl Client {
    /// Build a client; fails with `BinaryNotFound` if the daemon binary is missing
    pub fn new(options: Options, settings: Arc<Settings>) -> Result<Self, BurrowError> {
        let api = Arc::new(HttpControlApi::new(settings.request_timeout)?);
        Self::with_control_api(options, settings, api)
    }

    /// Build a client that talks to the control API through `api`
    pub fn with_control_api(
        options: Options,
        settings: Arc<Settings>,
        api: Arc<dyn ControlApi>,
    ) -> Result<Self, BurrowError> {
        let binary = options
            .binary_path
            .clone()
            .unwrap_or_else(|| settings.resolve_binary());
        let supervisor = ProcessSupervisor::new(binary)?;
        let id = Uuid::new_v4().to_string();

        tracing::debug!(client = %id, binary = %supervisor.binary().display(), "New client");

        Ok(Self {
            id,
            options,
            settings,
            api,
            supervisor,
            tunnels: Vec::new(),
            control_addr: None,
            cancel: CancellationToken::new(),
            drain: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Daemon control API bind address, once the handshake completed
    pub fn control_addr(&self) -> Option<&str> {
        self.control_addr.as_deref()
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    pub fn tunnel(&self, name: &str) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| t.name() == name)
    }

    /// PID of the daemon while it runs
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Token cancelled on close or on a forwarded signal; cancelling it
    /// interrupts in-flight retries and a pending handshake
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            id: self.id.clone(),
            control_addr: self.control_addr.clone(),
            tunnels: self.tunnels.clone(),
        }
    }

    /// Register the auth token (if any), spawn the daemon and wait for its
    /// control API address. Returns that address.
    pub async fn start(&mut self) -> Result<String, BurrowError> {
        tracing::info!(client = %self.id, "Starting daemon");

        self.supervisor.register_authtoken(&self.options).await?;

        let mut output =
            self.supervisor
                .start(&self.options, &self.cancel, self.settings.exit_on_signal)?;

        let echo = self.options.log_daemon_output;
        let addr = match scanner::await_ready(&mut output, &self.cancel, echo).await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(client = %self.id, error = %e, "Daemon failed to become ready");
                if let Err(stop_err) = self.supervisor.stop().await {
                    tracing::warn!(client = %self.id, error = %stop_err, "Failed to stop daemon");
                }
                return Err(e);
            }
        };

        self.drain = Some(tokio::spawn(scanner::drain(output, echo)));
        self.control_addr = Some(addr.clone());
        Ok(addr)
    }

    /// Append a tunnel. Names are not checked for uniqueness here; a clash
    /// surfaces as a control API error on creation.
    pub fn add_tunnel(&mut self, tunnel: Tunnel) {
        tracing::debug!(client = %self.id, tunnel = %tunnel.name(), "Add tunnel");
        self.tunnels.push(tunnel);
    }

    /// Drop a tunnel from the collection without touching the daemon
    pub fn remove_tunnel(&mut self, name: &str) -> Option<Tunnel> {
        let index = self.tunnels.iter().position(|t| t.name() == name)?;
        Some(self.tunnels.remove(index))
    }

    /// Create every tunnel that is not created yet, concurrently.
    ///
    /// Returns once every attempt has resolved, one report per attempted
    /// tunnel in collection order, carrying the public URL on success.
    pub async fn connect_all(&mut self) -> Result<Vec<TunnelReport<String>>, BurrowError> {
        if self.tunnels.is_empty() {
            return Err(BurrowError::NoTunnels);
        }
        let base_url = self.tunnel_api_url()?;
        tracing::info!(client = %self.id, "Connecting tunnels");

        let session = ControlSession {
            api: self.api.as_ref(),
            base_url: &base_url,
            policy: self.settings.retry_policy(),
            cancel: &self.cancel,
            log_api: self.settings.log_api,
            verbose: self.settings.verbose,
        };
        let session = &session;

        let tasks = self
            .tunnels
            .iter_mut()
            .filter(|t| !t.is_created())
            .map(|tunnel| async move {
                let result = tunnel.create(session).await;
                TunnelReport {
                    name: tunnel.name().to_string(),
                    result,
                }
            });

        let reports = join_all(tasks).await;
        log_reports(&self.id, "connect", &reports);
        Ok(reports)
    }

    /// Close every created tunnel, concurrently
    pub async fn disconnect_all(&mut self) -> Result<Vec<TunnelReport>, BurrowError> {
        tracing::info!(client = %self.id, "Disconnecting tunnels");
        self.close_matching(|_| true).await
    }

    /// Close the created tunnel called `name`.
    ///
    /// `TunnelNotFound` when no tunnel has that name. A tunnel that exists
    /// but was never created yields an empty report list.
    pub async fn disconnect_tunnel(&mut self, name: &str) -> Result<Vec<TunnelReport>, BurrowError> {
        if self.tunnels.is_empty() {
            return Err(BurrowError::NoTunnels);
        }
        if self.tunnel(name).is_none() {
            return Err(BurrowError::TunnelNotFound {
                name: name.to_string(),
            });
        }
        tracing::info!(client = %self.id, tunnel = name, "Disconnecting tunnel");
        self.close_matching(|t| t.name() == name).await
    }

    async fn close_matching<F>(&mut self, matches: F) -> Result<Vec<TunnelReport>, BurrowError>
    where
        F: Fn(&Tunnel) -> bool,
    {
        if self.tunnels.is_empty() {
            return Err(BurrowError::NoTunnels);
        }
        let base_url = self.tunnel_api_url()?;

        let session = ControlSession {
            api: self.api.as_ref(),
            base_url: &base_url,
            policy: self.settings.retry_policy(),
            cancel: &self.cancel,
            log_api: self.settings.log_api,
            verbose: self.settings.verbose,
        };
        let session = &session;

        let tasks = self
            .tunnels
            .iter_mut()
            .filter(|t| t.is_created() && matches(t))
            .map(|tunnel| async move {
                let result = tunnel.close(session).await;
                TunnelReport {
                    name: tunnel.name().to_string(),
                    result,
                }
            });

        let reports = join_all(tasks).await;
        log_reports(&self.id, "disconnect", &reports);
        Ok(reports)
    }

    /// Forward `signal` to the daemon
    pub fn signal(&mut self, signal: DaemonSignal) -> Result<(), BurrowError> {
        self.supervisor.signal(signal)
    }

    /// Cancel outstanding work and kill the daemon
    pub async fn close(&mut self) -> Result<(), BurrowError> {
        tracing::info!(client = %self.id, "Closing client");
        self.cancel.cancel();
        let result = self.supervisor.stop().await;
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        self.control_addr = None;
        result
    }

    /// Keep the tunnels open until `shutdown` resolves, then close every
    /// created tunnel and stop the daemon.
    ///
    /// If the client is cancelled first (by [`Client::close`] elsewhere or a
    /// forwarded signal), the daemon is already going away and only the
    /// process is stopped; the report list is then empty.
    pub async fn serve_until<F>(&mut self, shutdown: F) -> Result<Vec<TunnelReport>, BurrowError>
    where
        F: Future<Output = ()>,
    {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = shutdown => {
                tracing::info!(client = %self.id, "Shutdown requested");
            }
            _ = cancel.cancelled() => {
                tracing::info!(client = %self.id, "Client cancelled");
            }
        }

        let reports = if cancel.is_cancelled() {
            Ok(Vec::new())
        } else {
            match self.disconnect_all().await {
                Err(BurrowError::NoTunnels) => Ok(Vec::new()),
                other => other,
            }
        };

        self.close().await?;
        reports
    }

    fn tunnel_api_url(&self) -> Result<String, BurrowError> {
        self.control_addr
            .as_deref()
            .map(|addr| self.settings.tunnel_api_url(addr))
            .ok_or_else(|| BurrowError::NotReady {
                client: self.id.clone(),
            })
    }

    #[cfg(test)]
    pub(crate) fn set_control_addr(&mut self, addr: &str) {
        self.control_addr = Some(addr.to_string());
    }
}

fn log_reports<T>(client: &str, op: &str, reports: &[TunnelReport<T>]) {
    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    for report in reports {
        if let Err(e) = &report.result {
            tracing::warn!(client, tunnel = %report.name, error = %e, "Tunnel {} failed", op);
        }
    }
    tracing::info!(
        client,
        attempted = reports.len(),
        failed,
        "Tunnel {} finished",
        op
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CreateTunnelRequest, TunnelRecord};
    use crate::tunnel::{Protocol, TunnelState};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fake control API with per-tunnel latency and failures
    #[derive(Default)]
    struct FakeApi {
        latency: HashMap<String, Duration>,
        failing: Vec<String>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        finished: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl FakeApi {
        async fn call(&self, name: &str) -> Result<(), BurrowError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.latency.get(name) {
                tokio::time::sleep(*delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.finished.lock().push(name.to_string());

            if self.failing.iter().any(|f| f == name) {
                Err(BurrowError::api(name, 409, "tunnel already exists"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ControlApi for FakeApi {
        async fn create_tunnel(
            &self,
            _base_url: &str,
            request: &CreateTunnelRequest,
        ) -> Result<TunnelRecord, BurrowError> {
            self.call(&request.name).await?;
            Ok(TunnelRecord {
                public_url: format!("https://{}.example.io", request.name),
                ..TunnelRecord::default()
            })
        }

        async fn close_tunnel(&self, _base_url: &str, name: &str) -> Result<(), BurrowError> {
            self.call(name).await
        }
    }

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings {
            max_retries: 2,
            retry_interval: Duration::from_millis(100),
            exit_on_signal: false,
            ..Settings::default()
        })
    }

    fn test_client(api: Arc<FakeApi>, binary: &std::path::Path) -> Client {
        let options = Options {
            binary_path: Some(binary.to_path_buf()),
            ..Options::default()
        };
        Client::with_control_api(options, test_settings(), api).unwrap()
    }

    #[test]
    fn test_missing_binary() {
        let options = Options {
            binary_path: Some("/definitely/not/a/daemon".into()),
            ..Options::default()
        };
        let result = Client::new(options, test_settings());
        assert!(matches!(result, Err(BurrowError::BinaryNotFound { .. })));
    }

    #[tokio::test]
    async fn test_connect_all_without_tunnels() {
        let binary = crate::supervisor::executable_tempfile();
        let api = Arc::new(FakeApi::default());
        let mut client = test_client(api.clone(), binary.path());
        client.set_control_addr("127.0.0.1:4040");

        assert!(matches!(
            client.connect_all().await,
            Err(BurrowError::NoTunnels)
        ));
        assert!(matches!(
            client.disconnect_all().await,
            Err(BurrowError::NoTunnels)
        ));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert!(client.pid().is_none());
    }

    #[tokio::test]
    async fn test_connect_before_ready() {
        let binary = crate::supervisor::executable_tempfile();
        let api = Arc::new(FakeApi::default());
        let mut client = test_client(api.clone(), binary.path());
        client.add_tunnel(Tunnel::new(Protocol::Http, "web", "localhost:3000"));

        assert!(matches!(
            client.connect_all().await,
            Err(BurrowError::NotReady { .. })
        ));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_all_joins_staggered_tasks() {
        let binary = crate::supervisor::executable_tempfile();
        let mut latency = HashMap::new();
        latency.insert("a".to_string(), Duration::from_millis(300));
        latency.insert("b".to_string(), Duration::from_millis(10));
        latency.insert("c".to_string(), Duration::from_millis(150));
        let api = Arc::new(FakeApi {
            latency,
            ..FakeApi::default()
        });

        let mut client = test_client(api.clone(), binary.path());
        client.set_control_addr("127.0.0.1:4040");
        for name in ["a", "b", "c"] {
            client.add_tunnel(Tunnel::new(Protocol::Tcp, name, "localhost:22"));
        }

        let reports = client.connect_all().await.unwrap();

        // Every create resolved before connect_all returned
        assert_eq!(api.finished.lock().len(), 3);
        assert_eq!(api.peak_in_flight.load(Ordering::SeqCst), 3);
        // Completion order follows latency, reports follow collection order
        assert_eq!(*api.finished.lock(), vec!["b", "c", "a"]);
        let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(reports.iter().all(|r| r.is_ok()));
        assert!(client.tunnels().iter().all(|t| t.is_created()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_is_reported_per_tunnel() {
        let binary = crate::supervisor::executable_tempfile();
        let api = Arc::new(FakeApi {
            failing: vec!["bad".to_string()],
            ..FakeApi::default()
        });
        let mut client = test_client(api.clone(), binary.path());
        client.set_control_addr("127.0.0.1:4040");
        client.add_tunnel(Tunnel::new(Protocol::Http, "good", "localhost:3000"));
        client.add_tunnel(Tunnel::new(Protocol::Http, "bad", "localhost:3001"));

        let reports = client.connect_all().await.unwrap();

        assert!(reports[0].is_ok());
        assert!(matches!(
            reports[1].result,
            Err(BurrowError::Api { status: 409, .. })
        ));
        // good: 1 call, bad: 1 + 2 retries
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
        assert!(client.tunnel("good").unwrap().is_created());
        assert_eq!(client.tunnel("bad").unwrap().state(), &TunnelState::Pending);

        // A second pass only retries what is still pending
        let reports = client.connect_all().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "bad");
    }

    #[tokio::test]
    async fn test_disconnect_unknown_tunnel() {
        let binary = crate::supervisor::executable_tempfile();
        let api = Arc::new(FakeApi::default());
        let mut client = test_client(api.clone(), binary.path());
        client.set_control_addr("127.0.0.1:4040");
        client.add_tunnel(Tunnel::new(Protocol::Http, "web", "localhost:3000"));
        client.connect_all().await.unwrap();
        let before = client.snapshot().tunnels;

        let result = client.disconnect_tunnel("nope").await;

        assert!(matches!(result, Err(BurrowError::TunnelNotFound { name }) if name == "nope"));
        assert_eq!(client.tunnels(), before.as_slice());
    }

    #[tokio::test]
    async fn test_disconnect_single_tunnel() {
        let binary = crate::supervisor::executable_tempfile();
        let api = Arc::new(FakeApi::default());
        let mut client = test_client(api.clone(), binary.path());
        client.set_control_addr("127.0.0.1:4040");
        client.add_tunnel(Tunnel::new(Protocol::Http, "web", "localhost:3000"));
        client.add_tunnel(Tunnel::new(Protocol::Tcp, "ssh", "localhost:22"));
        client.connect_all().await.unwrap();

        let reports = client.disconnect_tunnel("ssh").await.unwrap();

        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_ok());
        assert_eq!(client.tunnel("ssh").unwrap().state(), &TunnelState::Closed);
        assert!(client.tunnel("web").unwrap().is_created());

        // Already closed: nothing left to do
        let reports = client.disconnect_tunnel("ssh").await.unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_all_only_touches_created() {
        let binary = crate::supervisor::executable_tempfile();
        let api = Arc::new(FakeApi::default());
        let mut client = test_client(api.clone(), binary.path());
        client.set_control_addr("127.0.0.1:4040");
        client.add_tunnel(Tunnel::new(Protocol::Http, "web", "localhost:3000"));
        client.connect_all().await.unwrap();
        client.add_tunnel(Tunnel::new(Protocol::Http, "later", "localhost:3001"));

        let reports = client.disconnect_all().await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].name, "web");
        assert!(client.tunnels().iter().all(|t| !t.is_created()));
    }

    #[tokio::test]
    async fn test_close_cancels_token() {
        let binary = crate::supervisor::executable_tempfile();
        let mut client = test_client(Arc::new(FakeApi::default()), binary.path());
        let token = client.cancellation_token();

        client.close().await.unwrap();

        assert!(token.is_cancelled());
        assert!(client.control_addr().is_none());
    }

    #[tokio::test]
    async fn test_serve_until_closes_tunnels_on_shutdown() {
        let binary = crate::supervisor::executable_tempfile();
        let api = Arc::new(FakeApi::default());
        let mut client = test_client(api.clone(), binary.path());
        client.set_control_addr("127.0.0.1:4040");
        client.add_tunnel(Tunnel::new(Protocol::Http, "web", "localhost:3000"));
        client.add_tunnel(Tunnel::new(Protocol::Tcp, "ssh", "localhost:22"));
        client.connect_all().await.unwrap();
        let token = client.cancellation_token();

        let reports = client.serve_until(std::future::ready(())).await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_ok()));
        // Two creates, then two closes
        assert_eq!(api.calls.load(Ordering::SeqCst), 4);
        assert!(client.tunnels().iter().all(|t| !t.is_created()));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_serve_until_after_cancel_skips_api() {
        let binary = crate::supervisor::executable_tempfile();
        let api = Arc::new(FakeApi::default());
        let mut client = test_client(api.clone(), binary.path());
        client.set_control_addr("127.0.0.1:4040");
        client.add_tunnel(Tunnel::new(Protocol::Http, "web", "localhost:3000"));
        client.connect_all().await.unwrap();

        client.cancellation_token().cancel();
        let reports = client
            .serve_until(std::future::pending::<()>())
            .await
            .unwrap();

        assert!(reports.is_empty());
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }
}
