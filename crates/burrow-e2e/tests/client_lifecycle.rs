//! Client lifecycle end-to-end tests
//!
//! Each test runs a scripted daemon that announces the mock control API as
//! its own, so every tunnel call goes over real HTTP.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_core::{BurrowError, Client, Options, Protocol, Settings, Tunnel, TunnelState};
use burrow_e2e::{DaemonBehavior, FakeDaemon, MockControlApi};

fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("burrow_core=debug,burrow_e2e=debug")
        .with_test_writer()
        .try_init();
}

fn test_settings(daemon: &FakeDaemon) -> Arc<Settings> {
    Arc::new(Settings {
        binary_path: daemon.binary().to_path_buf(),
        max_retries: 3,
        retry_interval: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
        exit_on_signal: false,
        ..Settings::default()
    })
}

async fn started_client(mock: &MockControlApi, daemon: &FakeDaemon, tunnels: Vec<Tunnel>) -> Client {
    let mut client = Client::new(Options::default(), test_settings(daemon)).expect("client");
    for tunnel in tunnels {
        client.add_tunnel(tunnel);
    }
    let addr = client.start().await.expect("daemon should become ready");
    assert_eq!(addr, mock.addr_string());
    client
}

#[tokio::test]
async fn test_connect_and_disconnect_all() {
    init_test();

    let mock = MockControlApi::start().await;
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });

    let mut client = started_client(
        &mock,
        &daemon,
        vec![
            Tunnel::new(Protocol::Http, "web", "localhost:3000").with_inspect(true),
            Tunnel::new(Protocol::Tcp, "db", "5432"),
        ],
    )
    .await;
    assert!(client.pid().is_some());

    let reports = client.connect_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.is_ok()));
    assert_eq!(
        client.tunnel("web").unwrap().public_url(),
        Some("https://web.mock.burrow.test")
    );
    assert!(client.tunnel("db").unwrap().is_created());

    // Request body as the daemon expects it
    let create = mock.requests_for("POST", "web");
    assert_eq!(create.len(), 1);
    let body = create[0].body.as_ref().unwrap();
    assert_eq!(body["proto"], "http");
    assert_eq!(body["addr"], "localhost:3000");
    assert_eq!(body["bind_tls"], true);
    assert_eq!(body["inspect"], true);
    let db_body = mock.requests_for("POST", "db")[0].body.clone().unwrap();
    assert!(db_body.get("bind_tls").is_none());

    let mut open = mock.open_tunnels();
    open.sort();
    assert_eq!(open, vec!["db".to_string(), "web".to_string()]);

    let reports = client.disconnect_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.is_ok()));
    assert!(mock.open_tunnels().is_empty());
    assert!(client
        .tunnels()
        .iter()
        .all(|t| *t.state() == TunnelState::Closed));

    let token = client.cancellation_token();
    client.close().await.unwrap();
    assert!(token.is_cancelled());
    assert!(client.pid().is_none());
    assert!(client.control_addr().is_none());
}

#[tokio::test]
async fn test_create_retries_until_accepted() {
    init_test();

    let mock = MockControlApi::start().await;
    mock.fail_first("web", 2);
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });

    let mut client = started_client(
        &mock,
        &daemon,
        vec![Tunnel::new(Protocol::Http, "web", "localhost:3000")],
    )
    .await;

    let reports = client.connect_all().await.unwrap();
    assert!(reports[0].is_ok());
    assert_eq!(mock.requests_for("POST", "web").len(), 3);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_create_gives_up_without_affecting_siblings() {
    init_test();

    let mock = MockControlApi::start().await;
    mock.fail_always("flaky");
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });

    let mut client = started_client(
        &mock,
        &daemon,
        vec![
            Tunnel::new(Protocol::Http, "flaky", "localhost:3000"),
            Tunnel::new(Protocol::Http, "web", "localhost:4000"),
        ],
    )
    .await;

    let reports = client.connect_all().await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].name, "flaky");
    assert!(matches!(
        reports[0].result,
        Err(BurrowError::Api { status: 409, .. })
    ));
    assert!(reports[1].is_ok());

    // One attempt plus max_retries
    assert_eq!(mock.requests_for("POST", "flaky").len(), 4);
    assert_eq!(*client.tunnel("flaky").unwrap().state(), TunnelState::Pending);
    assert!(client.tunnel("web").unwrap().is_created());

    // Only the created tunnel is closed
    let reports = client.disconnect_all().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "web");
    assert!(mock.requests_for("DELETE", "flaky").is_empty());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_single_tunnel() {
    init_test();

    let mock = MockControlApi::start().await;
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });

    let mut client = started_client(
        &mock,
        &daemon,
        vec![
            Tunnel::new(Protocol::Http, "web", "localhost:3000"),
            Tunnel::new(Protocol::Tcp, "db", "5432"),
        ],
    )
    .await;
    client.connect_all().await.unwrap();

    let reports = client.disconnect_tunnel("web").await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_ok());
    assert_eq!(mock.open_tunnels(), vec!["db".to_string()]);
    assert!(client.tunnel("db").unwrap().is_created());

    assert!(matches!(
        client.disconnect_tunnel("missing").await,
        Err(BurrowError::TunnelNotFound { .. })
    ));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_connect_all_waits_for_slowest_tunnel() {
    init_test();

    let mock = MockControlApi::start().await;
    mock.set_latency("slow", Duration::from_millis(300));
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });

    let mut client = started_client(
        &mock,
        &daemon,
        vec![
            Tunnel::new(Protocol::Http, "fast", "localhost:3000"),
            Tunnel::new(Protocol::Http, "slow", "localhost:4000"),
        ],
    )
    .await;

    let started = Instant::now();
    let reports = client.connect_all().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(reports.iter().all(|r| r.is_ok()));
    assert!(client.tunnels().iter().all(|t| t.is_created()));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_ready_banner_on_stderr() {
    init_test();

    let mock = MockControlApi::start().await;
    let daemon = FakeDaemon::new(DaemonBehavior::ReadyOnStderr {
        control_addr: mock.addr_string(),
    });

    let mut client = started_client(&mock, &daemon, Vec::new()).await;
    assert!(matches!(
        client.connect_all().await,
        Err(BurrowError::NoTunnels)
    ));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_daemon_arguments_and_authtoken() {
    init_test();

    let mock = MockControlApi::start().await;
    let daemon = FakeDaemon::new(DaemonBehavior::Ready {
        control_addr: mock.addr_string(),
    });

    let options = Options {
        auth_token: Some("tok_123".to_string()),
        region: Some("eu".to_string()),
        subdomain: Some("demo".to_string()),
        config_path: Some(PathBuf::from("/etc/burrow/ngrok.yml")),
        ..Options::default()
    };
    let mut client = Client::new(options, test_settings(&daemon)).unwrap();
    client.start().await.unwrap();

    assert_eq!(
        daemon.invocations(),
        vec![
            "authtoken tok_123 --config=/etc/burrow/ngrok.yml".to_string(),
            "start --none --log=stdout --region=eu --cfg=/etc/burrow/ngrok.yml --subdomain=demo"
                .to_string(),
        ]
    );

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_authtoken_prevents_start() {
    init_test();

    let daemon = FakeDaemon::with_failing_authtoken(
        DaemonBehavior::Ready {
            control_addr: "127.0.0.1:4040".to_string(),
        },
        "ERROR: invalid authtoken",
    );

    let options = Options {
        auth_token: Some("bad".to_string()),
        ..Options::default()
    };
    let mut client = Client::new(options, test_settings(&daemon)).unwrap();

    match client.start().await {
        Err(BurrowError::AuthToken(message)) => assert!(message.contains("invalid authtoken")),
        other => panic!("expected AuthToken error, got {:?}", other),
    }
    assert_eq!(daemon.invocations().len(), 1);
    assert!(client.pid().is_none());
}
