//! Supervised backends
//!
//! Each backend kind has a fixed set of local listeners with default ports,
//! an argument shape passed through verbatim to the unit, and a
//! `start_*` / `stop_*` / `*_port` operation set on [`Supervisor`].
//!
//! [`Supervisor`]: crate::Supervisor

mod forwarders;
mod hysteria2;
mod lyrebird;
mod snowflake;
mod v2ray;

pub use forwarders::ForwarderTarget;
pub use hysteria2::{Hysteria2ClientConfig, Hysteria2Options, Socks5Section, HYSTERIA_CONFIG_DIR};
pub use lyrebird::{LyrebirdOptions, LYREBIRD_LOG_FILE};
pub use snowflake::SnowflakeOptions;
pub use v2ray::{V2RayOptions, V2RayTransport};

use crate::launcher::PortMap;
use crate::Result;
use std::fmt;
use std::path::PathBuf;

/// A local listener exposed by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    pub name: &'static str,
    pub default_port: u16,
}

const fn listener(name: &'static str, default_port: u16) -> Listener {
    Listener { name, default_port }
}

const LYREBIRD_LISTENERS: &[Listener] = &[
    listener("obfs4", 47300),
    listener("meek_lite", 47000),
    listener("webtunnel", 47500),
];
const OBFS4_FORWARDER_LISTENERS: &[Listener] = &[listener("socks", 47350)];
const MEEK_FORWARDER_LISTENERS: &[Listener] = &[listener("socks", 47360)];
const V2RAY_SRTP_LISTENERS: &[Listener] = &[listener("socks", 47600)];
const V2RAY_WECHAT_LISTENERS: &[Listener] = &[listener("socks", 47700)];
const V2RAY_WS_LISTENERS: &[Listener] = &[listener("socks", 47800)];
const SNOWFLAKE_LISTENERS: &[Listener] = &[listener("socks", 47900)];
const HYSTERIA2_LISTENERS: &[Listener] = &[listener("socks5", 48000)];

/// Backend type; exactly one registry slot exists per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Lyrebird,
    /// Credential-injecting forwarder in front of Lyrebird's obfs4 listener
    Obfs4Forwarder,
    /// Credential-injecting forwarder in front of Lyrebird's meek_lite listener
    MeekForwarder,
    V2RayWs,
    V2RaySrtp,
    V2RayWechat,
    Hysteria2,
    Snowflake,
}

impl BackendKind {
    pub const ALL: [BackendKind; 8] = [
        BackendKind::Lyrebird,
        BackendKind::Obfs4Forwarder,
        BackendKind::MeekForwarder,
        BackendKind::V2RayWs,
        BackendKind::V2RaySrtp,
        BackendKind::V2RayWechat,
        BackendKind::Hysteria2,
        BackendKind::Snowflake,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Lyrebird => "lyrebird",
            BackendKind::Obfs4Forwarder => "obfs4-forwarder",
            BackendKind::MeekForwarder => "meek-forwarder",
            BackendKind::V2RayWs => "v2ray-ws",
            BackendKind::V2RaySrtp => "v2ray-srtp",
            BackendKind::V2RayWechat => "v2ray-wechat",
            BackendKind::Hysteria2 => "hysteria2",
            BackendKind::Snowflake => "snowflake",
        }
    }

    /// Listeners in allocation order; the first one is the primary
    pub fn listeners(&self) -> &'static [Listener] {
        match self {
            BackendKind::Lyrebird => LYREBIRD_LISTENERS,
            BackendKind::Obfs4Forwarder => OBFS4_FORWARDER_LISTENERS,
            BackendKind::MeekForwarder => MEEK_FORWARDER_LISTENERS,
            BackendKind::V2RayWs => V2RAY_WS_LISTENERS,
            BackendKind::V2RaySrtp => V2RAY_SRTP_LISTENERS,
            BackendKind::V2RayWechat => V2RAY_WECHAT_LISTENERS,
            BackendKind::Hysteria2 => HYSTERIA2_LISTENERS,
            BackendKind::Snowflake => SNOWFLAKE_LISTENERS,
        }
    }

    /// Backend and listener an auxiliary forwarder relays to
    pub fn parent(&self) -> Option<(BackendKind, &'static str)> {
        match self {
            BackendKind::Obfs4Forwarder => Some((BackendKind::Lyrebird, "obfs4")),
            BackendKind::MeekForwarder => Some((BackendKind::Lyrebird, "meek_lite")),
            _ => None,
        }
    }

    pub fn is_auxiliary(&self) -> bool {
        self.parent().is_some()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<&str> for BackendKind {
    type Error = crate::Error;

    fn try_from(s: &str) -> Result<Self> {
        BackendKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s.to_lowercase())
            .ok_or_else(|| crate::Error::config(format!("Unknown backend: {}", s)))
    }
}

/// Backend-specific launch arguments, opaque to the supervisor
#[derive(Debug, Clone)]
pub enum BackendArgs {
    Lyrebird(LyrebirdOptions),
    Forwarder(ForwarderTarget),
    V2Ray(V2RayOptions),
    Hysteria2(Hysteria2Options),
    Snowflake(SnowflakeOptions),
}

/// A file a backend reads its configuration from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub contents: String,
}

impl BackendArgs {
    /// Command line for an external backend process
    pub fn command_args(&self, ports: &PortMap) -> Vec<String> {
        match self {
            BackendArgs::Lyrebird(options) => options.command_args(ports),
            BackendArgs::Forwarder(_) => Vec::new(),
            BackendArgs::V2Ray(options) => options.command_args(ports),
            BackendArgs::Hysteria2(options) => options.command_args(),
            BackendArgs::Snowflake(options) => options.command_args(ports),
        }
    }

    /// Configuration file to write before launch and remove on stop
    pub fn artifact(&self, ports: &PortMap) -> Result<Option<Artifact>> {
        match self {
            BackendArgs::Hysteria2(options) => options.artifact(ports.primary()).map(Some),
            _ => Ok(None),
        }
    }
}
