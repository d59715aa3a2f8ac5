//! Burrow configuration file
//!
//! Looked up as `./burrow.toml`, then `~/.config/burrow/config.toml`.
//!
//! ```toml
//! [settings]
//! binary_path = "/usr/local/bin/ngrok"
//! max_retries = 10
//!
//! [daemon]
//! region = "eu"
//! authtoken = "..."
//!
//! [[tunnels]]
//! proto = "http"
//! name = "web"
//! addr = "localhost:3000"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burrow_core::{Options, Protocol, SettingsFile, Tunnel};
use serde::Deserialize;

const LOCAL_CONFIG: &str = "burrow.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BurrowConfig {
    pub settings: SettingsFile,
    pub daemon: Options,
    pub tunnels: Vec<TunnelConfig>,
}

/// One `[[tunnels]]` entry, or one `--tunnel proto:name:addr` flag
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelConfig {
    pub proto: Protocol,
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub inspect: bool,
}

impl TunnelConfig {
    pub fn into_tunnel(self) -> Tunnel {
        Tunnel::new(self.proto, self.name, self.addr)
            .with_auth(self.auth)
            .with_inspect(self.inspect)
    }
}

/// Parse `proto:name:addr`; `addr` may itself contain a colon
pub fn parse_tunnel_flag(value: &str) -> Result<TunnelConfig, String> {
    let mut parts = value.splitn(3, ':');
    let (Some(proto), Some(name), Some(addr)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected proto:name:addr, got '{}'", value));
    };
    if name.is_empty() || addr.is_empty() {
        return Err(format!("expected proto:name:addr, got '{}'", value));
    }

    let proto = proto.parse::<Protocol>().map_err(|e| e.to_string())?;
    Ok(TunnelConfig {
        proto,
        name: name.to_string(),
        addr: addr.to_string(),
        auth: String::new(),
        inspect: false,
    })
}

impl BurrowConfig {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("burrow")
    }

    /// First existing default location, if any
    pub fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(LOCAL_CONFIG);
        if local.exists() {
            return Some(local);
        }
        let user = Self::config_dir().join("config.toml");
        user.exists().then_some(user)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load an explicit path, else the first default location, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) => Self::load(&path),
                None => Ok(Self::default()),
            },
        }
    }
}
