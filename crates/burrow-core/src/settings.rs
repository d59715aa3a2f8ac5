//! Process-wide settings with environment variable priority
//!
//! Settings are resolved in this order (first found wins):
//! 1. Environment variables (BURROW_*)
//! 2. Settings file / `[settings]` table
//! 3. Default values
//!
//! The resolved [`Settings`] are built once at startup and shared read-only
//! (usually behind an `Arc`) by every client.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::BurrowError;
use crate::retry::RetryPolicy;

/// Environment variable prefix
const ENV_PREFIX: &str = "BURROW";

const DEFAULT_BINARY_PATH: &str = "./ngrok_bin/ngrok";
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_MAX_RETRIES: u32 = 50;
const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TUNNEL_API: &str = "http://{addr}/api/tunnels";

/// Placeholder replaced by the daemon's control API bind address
pub const ADDR_PLACEHOLDER: &str = "{addr}";

/// Settings as written in TOML, every field optional
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SettingsFile {
    /// Path to the daemon binary
    #[serde(alias = "path")]
    pub binary_path: Option<PathBuf>,

    /// Fallback when `binary_path` is empty
    pub default_binary_path: Option<PathBuf>,

    /// Directory for log files
    pub log_dir: Option<PathBuf>,

    /// Log every failed control API attempt
    pub log_api: Option<bool>,

    /// Promote per-attempt tunnel logs to info
    pub verbose: Option<bool>,

    /// Additional attempts after the first failed create/close
    pub max_retries: Option<u32>,

    /// Fixed delay between attempts, in milliseconds
    pub retry_interval_ms: Option<u64>,

    /// Per-request timeout for control API calls, in milliseconds
    pub request_timeout_ms: Option<u64>,

    /// Control API URL template containing `{addr}`
    pub tunnel_api: Option<String>,

    /// Forward termination signals to the daemon, then exit this process.
    /// When off, the owner of the client handles signals and shuts down.
    pub exit_on_signal: Option<bool>,
}

/// Resolved settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub binary_path: PathBuf,
    pub default_binary_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_api: bool,
    pub verbose: bool,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub request_timeout: Duration,
    pub tunnel_api_template: String,
    pub exit_on_signal: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from(DEFAULT_BINARY_PATH),
            default_binary_path: PathBuf::from(DEFAULT_BINARY_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            log_api: false,
            verbose: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            tunnel_api_template: DEFAULT_TUNNEL_API.to_string(),
            exit_on_signal: true,
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn get_env_u32(name: &str) -> Option<u32> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_u64(name: &str) -> Option<u64> {
    get_env(name).and_then(|v| v.parse().ok())
}

fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).and_then(|v| match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

impl SettingsFile {
    /// Load settings from a TOML file (optional)
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(file) => {
                        tracing::info!("Loaded settings from {}", path.display());
                        return file;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path.display(), e);
                }
            }
        }
        Self::default()
    }

    /// Resolve settings from environment variables first, then this file
    pub fn resolve(self) -> Result<Settings, BurrowError> {
        let defaults = Settings::default();

        let binary_path = get_env("BINARY")
            .map(PathBuf::from)
            .or(self.binary_path)
            .unwrap_or(defaults.binary_path);

        let default_binary_path = self
            .default_binary_path
            .unwrap_or(defaults.default_binary_path);

        let log_dir = get_env("LOG_DIR")
            .map(PathBuf::from)
            .or(self.log_dir)
            .unwrap_or(defaults.log_dir);

        let log_api = get_env_bool("LOG_API")
            .or(self.log_api)
            .unwrap_or(defaults.log_api);

        let verbose = get_env_bool("VERBOSE")
            .or(self.verbose)
            .unwrap_or(defaults.verbose);

        let max_retries = get_env_u32("MAX_RETRIES")
            .or(self.max_retries)
            .unwrap_or(defaults.max_retries);

        let retry_interval = get_env_u64("RETRY_INTERVAL_MS")
            .or(self.retry_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_interval);

        let request_timeout = self
            .request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.request_timeout);

        let tunnel_api_template = get_env("TUNNEL_API")
            .or(self.tunnel_api)
            .unwrap_or(defaults.tunnel_api_template);

        if !tunnel_api_template.contains(ADDR_PLACEHOLDER) {
            return Err(BurrowError::Settings(format!(
                "tunnel API template '{}' must contain {}",
                tunnel_api_template, ADDR_PLACEHOLDER
            )));
        }

        let exit_on_signal = self.exit_on_signal.unwrap_or(defaults.exit_on_signal);

        Ok(Settings {
            binary_path,
            default_binary_path,
            log_dir,
            log_api,
            verbose,
            max_retries,
            retry_interval,
            request_timeout,
            tunnel_api_template,
            exit_on_signal,
        })
    }
}

impl Settings {
    /// Load a settings file and resolve it with environment overrides
    pub fn load_and_resolve(path: &Path) -> Result<Self, BurrowError> {
        SettingsFile::load(path).resolve()
    }

    /// Effective daemon binary path
    pub fn resolve_binary(&self) -> PathBuf {
        let path = if self.binary_path.as_os_str().is_empty() {
            self.default_binary_path.clone()
        } else {
            self.binary_path.clone()
        };

        if cfg!(windows) && path.extension().is_none() {
            path.with_extension("exe")
        } else {
            path
        }
    }

    /// Control API collection URL for a discovered bind address
    pub fn tunnel_api_url(&self, control_addr: &str) -> String {
        self.tunnel_api_template
            .replace(ADDR_PLACEHOLDER, control_addr)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_interval)
    }
}
