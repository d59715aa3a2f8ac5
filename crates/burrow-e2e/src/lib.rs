//! End-to-end test utilities for burrow
//!
//! Runs the real client against a scripted daemon binary and a mock control
//! API served over HTTP, so no tunneling account or network access is needed.

#[cfg(unix)]
pub mod fake_daemon;
pub mod mock_api;

#[cfg(unix)]
pub use fake_daemon::{DaemonBehavior, FakeDaemon};
pub use mock_api::{MockControlApi, RecordedRequest};
