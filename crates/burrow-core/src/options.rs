use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Region used when none is configured
pub const DEFAULT_REGION: &str = "us";

/// Launch configuration for one daemon process.
///
/// Supplied once when a client is built and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Reserved subdomain (paid plans only)
    pub subdomain: Option<String>,

    /// Account token registered with `authtoken` before start
    #[serde(alias = "authtoken", skip_serializing)]
    pub auth_token: Option<String>,

    /// Daemon region, `us` when unset
    pub region: Option<String>,

    /// Daemon configuration file
    #[serde(alias = "cfg_path")]
    pub config_path: Option<PathBuf>,

    /// Overrides the settings' binary for this client
    #[serde(alias = "binpath")]
    pub binary_path: Option<PathBuf>,

    /// Echo everything the daemon prints into our own log
    #[serde(alias = "log_daemon")]
    pub log_daemon_output: bool,
}

impl Options {
    pub fn region(&self) -> &str {
        self.region
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
    }

    /// Arguments for `<binary> start ...`
    pub fn daemon_args(&self) -> Vec<String> {
        let mut args = vec![
            "start".to_string(),
            "--none".to_string(),
            "--log=stdout".to_string(),
            format!("--region={}", self.region()),
        ];

        if let Some(path) = &self.config_path {
            args.push(format!("--cfg={}", path.display()));
        }
        if let Some(subdomain) = self.subdomain.as_deref().filter(|s| !s.is_empty()) {
            args.push(format!("--subdomain={}", subdomain));
        }

        args
    }

    /// Arguments for `<binary> authtoken ...`, if a token is configured
    pub fn authtoken_args(&self) -> Option<Vec<String>> {
        let token = self.auth_token.as_deref().filter(|t| !t.is_empty())?;

        let mut args = vec!["authtoken".to_string(), token.to_string()];
        if let Some(path) = &self.config_path {
            args.push(format!("--config={}", path.display()));
        }
        Some(args)
    }
}
