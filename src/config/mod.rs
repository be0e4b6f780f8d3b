//! Configuration module

use crate::backend::{LyrebirdOptions, SnowflakeOptions};
use crate::port::{DEFAULT_PROBE_TIMEOUT, DEFAULT_SEARCH_LIMIT};
use crate::registry::DEFAULT_STOP_TIMEOUT;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Shared pluggable-transport state directory
    pub state_location: PathBuf,

    /// Home directory override for the Hysteria2 config file
    pub home_dir: Option<PathBuf>,

    /// Also export the `TOR_PT_*` variables into this process's environment
    pub export_environment: bool,

    /// Candidates tried past a preferred port before giving up
    pub port_search_limit: u16,

    pub probe_timeout_ms: u64,

    /// Bound on waiting for a stopped backend to exit
    pub stop_timeout_ms: u64,

    /// Pause after launching Hysteria2 so it can bind its listener
    pub hysteria2_startup_delay_ms: u64,

    pub executables: Executables,

    /// Backends started by `iptproxy-rust run`
    pub autostart: Autostart,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration for a given state location
    pub fn with_state_location(state_location: impl Into<PathBuf>) -> Self {
        Config {
            state_location: state_location.into(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_location.as_os_str().is_empty() {
            return Err(Error::config("state-location is required"));
        }
        if self.port_search_limit == 0 {
            return Err(Error::config("port-search-limit must be at least 1"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(Error::config("probe-timeout-ms must be positive"));
        }

        if let Some(ref lyrebird) = self.autostart.lyrebird {
            for creds in [&lyrebird.obfs4_forwarder, &lyrebird.meek_forwarder]
                .into_iter()
                .flatten()
            {
                if creds.user.is_empty() {
                    return Err(Error::config("Forwarder user must not be empty"));
                }
            }
        }
        if let Some(ref hysteria2) = self.autostart.hysteria2 {
            if hysteria2.server.is_empty() {
                return Err(Error::config("hysteria2 server must not be empty"));
            }
        }

        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn hysteria2_startup_delay(&self) -> Duration {
        Duration::from_millis(self.hysteria2_startup_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_location: PathBuf::new(),
            home_dir: None,
            export_environment: true,
            port_search_limit: DEFAULT_SEARCH_LIMIT,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT.as_millis() as u64,
            hysteria2_startup_delay_ms: 1000,
            executables: Executables::default(),
            autostart: Autostart::default(),
        }
    }
}

/// Backend executables; bare names are looked up on `PATH`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Executables {
    pub lyrebird: PathBuf,
    pub snowflake: PathBuf,
    pub v2ray: PathBuf,
    pub hysteria: PathBuf,
}

impl Default for Executables {
    fn default() -> Self {
        Executables {
            lyrebird: PathBuf::from("lyrebird"),
            snowflake: PathBuf::from("snowflake-client"),
            v2ray: PathBuf::from("v2ray"),
            hysteria: PathBuf::from("hysteria"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Autostart {
    pub lyrebird: Option<LyrebirdAutostart>,
    pub snowflake: Option<SnowflakeOptions>,
    pub hysteria2: Option<Hysteria2Autostart>,
    pub v2ray_ws: Option<V2RayEndpoint>,
    pub v2ray_srtp: Option<V2RayEndpoint>,
    pub v2ray_wechat: Option<V2RayEndpoint>,
}

impl Autostart {
    pub fn is_empty(&self) -> bool {
        self.lyrebird.is_none()
            && self.snowflake.is_none()
            && self.hysteria2.is_none()
            && self.v2ray_ws.is_none()
            && self.v2ray_srtp.is_none()
            && self.v2ray_wechat.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LyrebirdAutostart {
    #[serde(flatten)]
    pub options: LyrebirdOptions,
    pub obfs4_forwarder: Option<ForwarderCredentials>,
    pub meek_forwarder: Option<ForwarderCredentials>,
}

/// Credentials a forwarder presents to Lyrebird
#[derive(Clone, Serialize, Deserialize)]
pub struct ForwarderCredentials {
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for ForwarderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hysteria2Autostart {
    pub server: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct V2RayEndpoint {
    pub server_address: String,
    pub server_port: String,
    #[serde(default)]
    pub ws_path: Option<String>,
    pub id: String,
}
