//! Mock daemon control API
//!
//! Serves `POST /api/tunnels` and `DELETE /api/tunnels/{name}` on an
//! ephemeral port, records every request and answers the way the real daemon
//! does. Individual tunnels can be made to fail or respond slowly.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::TcpListener;

const TUNNELS_PATH: &str = "/api/tunnels";

/// A recorded control API request
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
}

impl RecordedRequest {
    /// Tunnel name from the body (create) or the path (close)
    pub fn tunnel_name(&self) -> Option<String> {
        if let Some(name) = self.body.as_ref().and_then(|b| b["name"].as_str()) {
            return Some(name.to_string());
        }
        self.path
            .strip_prefix(TUNNELS_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }
}

#[derive(Default)]
struct MockState {
    requests: RwLock<Vec<RecordedRequest>>,
    /// Remaining conflict responses per tunnel; `u32::MAX` never recovers
    failures: RwLock<HashMap<String, u32>>,
    latency: RwLock<HashMap<String, Duration>>,
    /// Tunnels currently open
    open: RwLock<Vec<String>>,
}

pub struct MockControlApi {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockControlApi {
    /// Start the mock on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock control API");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());

        let state_clone = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let state = state_clone.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(&state, req).await) }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    /// Address to announce in the daemon banner
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.read().clone()
    }

    /// Requests with the given method touching tunnel `name`
    pub fn requests_for(&self, method: &str, name: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.tunnel_name().as_deref() == Some(name))
            .collect()
    }

    /// Names of tunnels created and not yet closed
    pub fn open_tunnels(&self) -> Vec<String> {
        self.state.open.read().clone()
    }

    /// Answer the first `count` requests for `name` with 409 Conflict
    pub fn fail_first(&self, name: &str, count: u32) {
        self.state.failures.write().insert(name.to_string(), count);
    }

    /// Answer every request for `name` with 409 Conflict
    pub fn fail_always(&self, name: &str) {
        self.fail_first(name, u32::MAX);
    }

    /// Delay every response for `name`
    pub fn set_latency(&self, name: &str, latency: Duration) {
        self.state.latency.write().insert(name.to_string(), latency);
    }
}

async fn handle(state: &MockState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let raw = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();
    let body: Option<Value> = serde_json::from_slice(&raw).ok();

    let recorded = RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        body,
    };
    let name = recorded.tunnel_name();
    state.requests.write().push(recorded.clone());
    tracing::debug!(method = %method, path = %path, "Mock control API request");

    let Some(name) = name else {
        return respond(StatusCode::BAD_REQUEST, json!({"msg": "missing tunnel name"}));
    };

    let latency = state.latency.read().get(&name).copied();
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }

    if take_failure(state, &name) {
        return respond(
            StatusCode::CONFLICT,
            json!({"error_code": 103, "status_code": 409, "msg": "tunnel already exists", "details": {"name": name}}),
        );
    }

    match path.as_str() {
        TUNNELS_PATH if method == Method::POST => {
            let body = recorded.body.unwrap_or(Value::Null);
            let proto = body["proto"].as_str().unwrap_or("http").to_string();
            let addr = body["addr"].as_str().unwrap_or_default().to_string();
            let inspect = body["inspect"].as_bool().unwrap_or(false);
            let public_url = match proto.as_str() {
                "http" => format!("https://{}.mock.burrow.test", name),
                "tls" => format!("tls://{}.mock.burrow.test", name),
                _ => format!("tcp://0.tcp.mock.burrow.test:{}", 10000 + state.open.read().len()),
            };

            state.open.write().push(name.clone());
            respond(
                StatusCode::CREATED,
                json!({
                    "name": name,
                    "uri": format!("{}/{}", TUNNELS_PATH, name),
                    "public_url": public_url,
                    "proto": if proto == "http" { "https".to_string() } else { proto },
                    "config": {"addr": addr, "inspect": inspect},
                    "metrics": {
                        "conns": {"count": 0, "gauge": 0, "rate1": 0, "rate5": 0, "rate15": 0, "p50": 0, "p90": 0, "p95": 0, "p99": 0},
                        "http": {"count": 0, "rate1": 0, "rate5": 0, "rate15": 0, "p50": 0, "p90": 0, "p95": 0, "p99": 0}
                    }
                }),
            )
        }
        _ if method == Method::DELETE => {
            let mut open = state.open.write();
            match open.iter().position(|n| *n == name) {
                Some(index) => {
                    open.remove(index);
                    Response::builder()
                        .status(StatusCode::NO_CONTENT)
                        .body(Full::new(Bytes::new()))
                        .unwrap()
                }
                None => respond(
                    StatusCode::NOT_FOUND,
                    json!({"error_code": 100, "status_code": 404, "msg": "tunnel not found"}),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, json!({"msg": "not found"})),
    }
}

fn take_failure(state: &MockState, name: &str) -> bool {
    let mut failures = state.failures.write();
    match failures.get_mut(name) {
        Some(0) | None => false,
        Some(remaining) if *remaining == u32::MAX => true,
        Some(remaining) => {
            *remaining -= 1;
            true
        }
    }
}

fn respond(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
