//! Supervision and tunnel orchestration for an external tunneling daemon
//!
//! A [`Client`] spawns the daemon, waits for it to announce its local control
//! API on stdout, then creates and closes tunnels through that API with
//! fixed-interval retries. [`ClientRegistry`] keeps many clients addressable
//! by id for a request-routing front end.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use burrow_core::{Client, Options, Protocol, Settings, Tunnel};
//!
//! let settings = Arc::new(Settings::default());
//! let mut client = Client::new(Options::default(), settings)?;
//! client.start().await?;
//! client.add_tunnel(Tunnel::new(Protocol::Http, "web", "localhost:3000"));
//! for report in client.connect_all().await? {
//!     println!("{}: {:?}", report.name, report.result);
//! }
//! client.disconnect_all().await?;
//! client.close().await?;
//! ```

mod api;
mod client;
mod error;
mod options;
mod registry;
mod retry;
mod scanner;
mod settings;
mod supervisor;
mod tunnel;

pub use api::{
    ControlApi, CreateTunnelRequest, HttpControlApi, MetricWindow, TunnelMetrics, TunnelRecord,
    TunnelRecordConfig,
};
pub use client::{Client, ClientSnapshot, TunnelReport};
pub use error::BurrowError;
pub use options::{Options, DEFAULT_REGION};
pub use registry::{ClientRegistry, CreatedClient, SharedClient};
pub use retry::{retry_fixed, RetryPolicy};
pub use scanner::{await_ready, ReadinessScanner, ScanEvent, CHUNK_SIZE};
pub use settings::{Settings, SettingsFile, ADDR_PLACEHOLDER};
pub use supervisor::{check_binary, DaemonOutput, DaemonSignal, ProcessSupervisor};
pub use tunnel::{ControlSession, Protocol, Tunnel, TunnelState};
