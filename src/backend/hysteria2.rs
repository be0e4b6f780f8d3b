//! Hysteria2 client
//!
//! The only backend configured through a file: `<home>/.hysteria/config`
//! is written with the resolved SOCKS5 listen address before launch and
//! removed on stop.

use super::{Artifact, BackendArgs, BackendKind};
use crate::common::net::loopback_addr;
use crate::{Error, Result, Supervisor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Directory under the home directory holding the client config
pub const HYSTERIA_CONFIG_DIR: &str = ".hysteria";

const CONFIG_FILE: &str = "config";

/// Client configuration file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hysteria2ClientConfig {
    pub server: String,
    pub socks5: Socks5Section,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socks5Section {
    pub listen: String,
}

impl Hysteria2ClientConfig {
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Hysteria2ClientConfig {
            server: server.into(),
            socks5: Socks5Section {
                listen: loopback_addr(port),
            },
        }
    }

    /// `server: ..` followed by a blank line and the `socks5:` block
    pub fn to_yaml(&self) -> Result<String> {
        let server = serde_yaml::to_string(&ServerOnly {
            server: &self.server,
        })?;
        let socks5 = serde_yaml::to_string(&Socks5Only {
            socks5: &self.socks5,
        })?;
        Ok(format!("{}\n{}", server, socks5))
    }
}

#[derive(Serialize)]
struct ServerOnly<'a> {
    server: &'a str,
}

#[derive(Serialize)]
struct Socks5Only<'a> {
    socks5: &'a Socks5Section,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hysteria2Options {
    /// Server URI, passed through unchanged
    pub server: String,
    pub config_path: PathBuf,
}

impl Hysteria2Options {
    /// Options writing the config under `home`
    pub fn new(server: impl Into<String>, home: &Path) -> Self {
        Hysteria2Options {
            server: server.into(),
            config_path: home.join(HYSTERIA_CONFIG_DIR).join(CONFIG_FILE),
        }
    }

    pub(super) fn command_args(&self) -> Vec<String> {
        vec![
            "client".to_string(),
            "-c".to_string(),
            self.config_path.to_string_lossy().into_owned(),
        ]
    }

    pub(super) fn artifact(&self, port: u16) -> Result<Artifact> {
        Ok(Artifact {
            path: self.config_path.clone(),
            contents: Hysteria2ClientConfig::new(&self.server, port).to_yaml()?,
        })
    }
}

impl Supervisor {
    /// Write the client config, launch Hysteria2 and wait for the startup
    /// delay before returning the SOCKS5 port.
    ///
    /// While Hysteria2 runs this returns its port without touching the home
    /// directory.
    pub async fn start_hysteria2(&self, server: impl Into<String>) -> Result<u16> {
        let server = server.into();
        self.registry
            .start_with(BackendKind::Hysteria2, || {
                let home = self.home_dir()?;
                let config_dir = home.join(HYSTERIA_CONFIG_DIR);
                create_config_dir(&config_dir).map_err(|e| {
                    error!("Failed to create {}: {}", config_dir.display(), e);
                    e
                })?;

                let options = Hysteria2Options::new(server, &home);
                debug!("Hysteria2 config at {}", options.config_path.display());
                Ok(BackendArgs::Hysteria2(options))
            })
            .await
    }

    /// Stop Hysteria2 and remove its config file
    pub async fn stop_hysteria2(&self) -> Result<()> {
        self.registry.stop(BackendKind::Hysteria2).await
    }

    pub fn hysteria2_port(&self) -> u16 {
        self.registry.port(BackendKind::Hysteria2)
    }

    fn home_dir(&self) -> Result<PathBuf> {
        match self.config.home_dir {
            Some(ref home) => Ok(home.clone()),
            None => dirs::home_dir().ok_or(Error::HomeDirectory),
        }
    }
}

fn create_config_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(path)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(path)?;
    Ok(())
}
