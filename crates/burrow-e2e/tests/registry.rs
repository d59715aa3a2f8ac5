//! Client registry end-to-end tests

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use burrow_core::{BurrowError, ClientRegistry, Options, Protocol, Settings, TunnelState};
use burrow_e2e::{DaemonBehavior, FakeDaemon, MockControlApi};

fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("burrow_core=debug,burrow_e2e=debug")
        .with_test_writer()
        .try_init();
}

fn registry_for(daemon: &FakeDaemon) -> ClientRegistry {
    let settings = Settings {
        binary_path: daemon.binary().to_path_buf(),
        max_retries: 2,
        retry_interval: Duration::from_millis(20),
        exit_on_signal: false,
        ..Settings::default()
    };
    ClientRegistry::new(Arc::new(settings), Options::default()).unwrap()
}

#[tokio::test]
async fn test_create_and_disconnect_client() {
    init_test();

    let mock = MockControlApi::start().await;
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });
    let registry = registry_for(&daemon);

    let created = registry
        .create_client(Protocol::Http, 8080, "localhost", "web")
        .await
        .unwrap();
    assert_eq!(created.control_addr, mock.addr_string());
    assert_eq!(created.tunnel.local_addr(), "localhost:8080");
    assert_eq!(
        created.tunnel.public_url(),
        Some("https://web.mock.burrow.test")
    );
    assert_eq!(registry.len(), 1);

    let snapshots = registry.snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id, created.client_id);

    registry.disconnect_client(&created.client_id).await.unwrap();
    assert!(registry.is_empty());
    assert!(mock.open_tunnels().is_empty());
    assert_eq!(mock.requests_for("DELETE", "web").len(), 1);
}

#[tokio::test]
async fn test_disconnect_tunnel_keeps_client() {
    init_test();

    let mock = MockControlApi::start().await;
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });
    let registry = registry_for(&daemon);

    let created = registry
        .create_client(Protocol::Tcp, 22, "127.0.0.1", "ssh")
        .await
        .unwrap();

    let removed = registry
        .disconnect_tunnel(&created.client_id, "ssh")
        .await
        .unwrap();
    assert_eq!(*removed.state(), TunnelState::Closed);
    assert_eq!(registry.len(), 1);

    let client = registry.get(&created.client_id).unwrap();
    assert!(client.lock().await.tunnels().is_empty());

    assert!(matches!(
        registry.disconnect_tunnel(&created.client_id, "ssh").await,
        Err(BurrowError::NoTunnels)
    ));

    registry.shutdown().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_failed_tunnel_is_not_registered() {
    init_test();

    let mock = MockControlApi::start().await;
    mock.fail_always("web");
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });
    let registry = registry_for(&daemon);

    let result = registry
        .create_client(Protocol::Http, 8080, "localhost", "web")
        .await;
    assert!(matches!(result, Err(BurrowError::Api { status: 409, .. })));
    assert!(registry.is_empty());
    assert_eq!(mock.requests_for("POST", "web").len(), 3);
}
