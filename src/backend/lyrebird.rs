//! Lyrebird (obfs4 / meek_lite / webtunnel client)

use super::{BackendArgs, BackendKind};
use crate::launcher::PortMap;
use crate::{Result, Supervisor};
use serde::{Deserialize, Serialize};

/// Log file Lyrebird writes inside the state location when logging is enabled
pub const LYREBIRD_LOG_FILE: &str = "lyrebird.log";

const LOG_LEVELS: &[&str] = &["ERROR", "WARN", "INFO", "DEBUG"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LyrebirdOptions {
    /// ERROR, WARN, INFO or DEBUG; anything else means ERROR
    pub log_level: String,
    /// Log to `<state location>/lyrebird.log`
    pub enable_logging: bool,
    /// Disable the address scrubber
    pub unsafe_logging: bool,
}

impl Default for LyrebirdOptions {
    fn default() -> Self {
        LyrebirdOptions {
            log_level: "ERROR".to_string(),
            enable_logging: false,
            unsafe_logging: false,
        }
    }
}

impl LyrebirdOptions {
    pub fn new(log_level: impl Into<String>, enable_logging: bool, unsafe_logging: bool) -> Self {
        LyrebirdOptions {
            log_level: log_level.into(),
            enable_logging,
            unsafe_logging,
        }
    }

    pub fn effective_log_level(&self) -> &'static str {
        let level = self.log_level.trim().to_uppercase();
        LOG_LEVELS
            .iter()
            .copied()
            .find(|l| *l == level)
            .unwrap_or("ERROR")
    }

    pub(super) fn command_args(&self, ports: &PortMap) -> Vec<String> {
        let mut args = Vec::new();
        for (listener, port) in ports.iter() {
            args.push(format!("-{}-port", listener.replace('_', "-")));
            args.push(port.to_string());
        }
        args.push("-log-level".to_string());
        args.push(self.effective_log_level().to_string());
        if self.enable_logging {
            args.push("-enable-logging".to_string());
        }
        if self.unsafe_logging {
            args.push("-unsafe-logging".to_string());
        }
        args
    }
}

impl Supervisor {
    /// Start Lyrebird and return the obfs4 port.
    ///
    /// The meek_lite and webtunnel ports may have moved past collisions;
    /// read them with [`meek_port`](Self::meek_port) and
    /// [`webtunnel_port`](Self::webtunnel_port) afterwards.
    pub async fn start_lyrebird(&self, options: LyrebirdOptions) -> Result<u16> {
        self.registry
            .start(BackendKind::Lyrebird, BackendArgs::Lyrebird(options))
            .await
    }

    pub async fn stop_lyrebird(&self) -> Result<()> {
        self.registry.stop(BackendKind::Lyrebird).await
    }

    pub fn obfs4_port(&self) -> u16 {
        self.lyrebird_listener_port("obfs4")
    }

    pub fn meek_port(&self) -> u16 {
        self.lyrebird_listener_port("meek_lite")
    }

    pub fn webtunnel_port(&self) -> u16 {
        self.lyrebird_listener_port("webtunnel")
    }

    /// Name of Lyrebird's log file, relative to the state location
    pub fn lyrebird_log_file() -> &'static str {
        LYREBIRD_LOG_FILE
    }

    fn lyrebird_listener_port(&self, listener: &str) -> u16 {
        self.registry
            .listener_port(BackendKind::Lyrebird, listener)
            .unwrap_or(0)
    }
}
