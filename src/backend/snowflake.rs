//! Snowflake client

use super::{BackendArgs, BackendKind};
use crate::launcher::PortMap;
use crate::{Result, Supervisor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SnowflakeOptions {
    /// Comma-separated ICE servers
    pub ice: String,
    /// Broker URL
    pub url: String,
    /// Comma-separated front domains
    pub fronts: String,
    pub amp_cache: String,
    pub sqs_queue_url: String,
    pub sqs_creds: String,
    /// Empty disables logging
    pub log_file: String,
    /// Resolve `log_file` relative to the state location
    pub log_to_state_dir: bool,
    /// Keep local LAN address ICE candidates
    pub keep_local_addresses: bool,
    pub unsafe_logging: bool,
    /// Multiplexed WebRTC peers; values below 1 mean 1
    pub max_peers: i32,
}

impl Default for SnowflakeOptions {
    fn default() -> Self {
        SnowflakeOptions {
            ice: String::new(),
            url: String::new(),
            fronts: String::new(),
            amp_cache: String::new(),
            sqs_queue_url: String::new(),
            sqs_creds: String::new(),
            log_file: String::new(),
            log_to_state_dir: false,
            keep_local_addresses: false,
            unsafe_logging: false,
            max_peers: 1,
        }
    }
}

impl SnowflakeOptions {
    pub fn effective_max_peers(&self) -> i32 {
        self.max_peers.max(1)
    }

    pub(super) fn command_args(&self, ports: &PortMap) -> Vec<String> {
        let mut args = vec!["-socks-port".to_string(), ports.primary().to_string()];

        let strings = [
            ("-ice", &self.ice),
            ("-url", &self.url),
            ("-fronts", &self.fronts),
            ("-ampcache", &self.amp_cache),
            ("-sqsqueue", &self.sqs_queue_url),
            ("-sqscreds", &self.sqs_creds),
            ("-log", &self.log_file),
        ];
        for (flag, value) in strings {
            if !value.is_empty() {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }

        let flags = [
            ("-log-to-state-dir", self.log_to_state_dir),
            ("-keep-local-addresses", self.keep_local_addresses),
            ("-unsafe-logging", self.unsafe_logging),
        ];
        args.extend(
            flags
                .iter()
                .filter(|(_, enabled)| *enabled)
                .map(|(flag, _)| flag.to_string()),
        );

        args.push("-max".to_string());
        args.push(self.effective_max_peers().to_string());
        args
    }
}

impl Supervisor {
    pub async fn start_snowflake(&self, options: SnowflakeOptions) -> Result<u16> {
        self.registry
            .start(BackendKind::Snowflake, BackendArgs::Snowflake(options))
            .await
    }

    pub async fn stop_snowflake(&self) -> Result<()> {
        self.registry.stop(BackendKind::Snowflake).await
    }

    pub fn snowflake_port(&self) -> u16 {
        self.registry.port(BackendKind::Snowflake)
    }
}
