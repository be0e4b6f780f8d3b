//! IPtProxy Rust - lifecycle supervisor for local pluggable-transport backends
//!
//! Starts, stops and hands out local SOCKS ports for anti-censorship
//! transport clients running side by side:
//! - Lyrebird (obfs4, meek_lite, webtunnel) with optional credential-injecting
//!   forwarders in front of obfs4 and meek_lite
//! - Snowflake
//! - V2Ray over WebSocket, SRTP and WeChat-video
//! - Hysteria2
//!
//! Every `start_*` call is idempotent and returns the backend's port as soon
//! as the unit is launched; every `stop_*` call is idempotent.
//!
//! # Architecture
//!
//! ```text
//!                 +---------------------+
//!                 |  Supervisor (façade) |
//!                 +----------+----------+
//!                            |
//!                 +----------v----------+
//!                 |      registry/      |  one slot per backend
//!                 +--+--------+------+--+
//!                    |        |      |
//!        +-----------v-+  +---v----+ +v-------------+
//!        | environment |  |  port  | |  launcher/   |
//!        | (state dir) |  | (alloc)| | process, fwd |
//!        +-------------+  +--------+ +------+-------+
//!                                           |
//!                               +-----------v-----------+
//!                               |  backend executables  |
//!                               |  forwarder (SOCKS5)   |
//!                               +-----------------------+
//! ```

pub mod backend;
pub mod common;
pub mod compat;
pub mod config;
pub mod environment;
pub mod forwarder;
pub mod launcher;
pub mod port;
pub mod registry;

pub use backend::BackendKind;
pub use common::error::{Error, Result};
pub use config::Config;

use environment::Provisioner;
use forwarder::ForwarderLauncher;
use launcher::{Launcher, ProcessLauncher};
use port::PortAllocator;
use registry::Registry;
use std::sync::Arc;
use tracing::info;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Owns the backend registry and exposes the per-backend operations
///
/// The `start_*` / `stop_*` / `*_port` operations live next to each backend
/// in [`backend`].
pub struct Supervisor {
    config: Config,
    registry: Arc<Registry>,
}

impl Supervisor {
    /// Create a supervisor with the default launchers: the configured
    /// executables for external backends and the built-in SOCKS5 forwarder
    /// for the auxiliary forwarders.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        info!("Initializing IPtProxy Rust v{}", VERSION);

        let provisioner = Provisioner::new(&config.state_location, config.export_environment);
        let allocator = PortAllocator::new(config.probe_timeout(), config.port_search_limit);
        let registry = Registry::new(provisioner, allocator)
            .with_stop_timeout(config.stop_timeout())
            .with_startup_delay(BackendKind::Hysteria2, config.hysteria2_startup_delay());

        let executables = &config.executables;
        let process_launchers = [
            (BackendKind::Lyrebird, &executables.lyrebird),
            (BackendKind::Snowflake, &executables.snowflake),
            (BackendKind::V2RayWs, &executables.v2ray),
            (BackendKind::V2RaySrtp, &executables.v2ray),
            (BackendKind::V2RayWechat, &executables.v2ray),
            (BackendKind::Hysteria2, &executables.hysteria),
        ];
        for (kind, program) in process_launchers {
            registry.set_launcher(kind, Arc::new(ProcessLauncher::new(program)));
        }
        for kind in [BackendKind::Obfs4Forwarder, BackendKind::MeekForwarder] {
            registry.set_launcher(kind, Arc::new(ForwarderLauncher));
        }

        info!(
            "State location: {}",
            config.state_location.display()
        );

        Ok(Supervisor {
            config,
            registry: Arc::new(registry),
        })
    }

    /// Replace the launcher for `kind`, e.g. to run a backend in-process
    pub fn with_launcher(self, kind: BackendKind, launcher: Arc<dyn Launcher>) -> Self {
        self.set_launcher(kind, launcher);
        self
    }

    pub fn set_launcher(&self, kind: BackendKind, launcher: Arc<dyn Launcher>) {
        self.registry.set_launcher(kind, launcher);
    }

    /// Port the next start of `kind` tries first for `listener`.
    ///
    /// Returns false while `kind` is running or if it has no such listener.
    pub fn set_preferred_port(&self, kind: BackendKind, listener: &str, port: u16) -> bool {
        self.registry.set_preferred_port(kind, listener, port)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether nothing accepts TCP connections on `127.0.0.1:port`
    pub async fn is_port_available(&self, port: u16) -> bool {
        self.registry.allocator().is_available(port).await
    }

    pub fn is_running(&self, kind: BackendKind) -> bool {
        self.registry.is_running(kind)
    }

    pub fn running(&self) -> Vec<BackendKind> {
        self.registry.running()
    }

    /// Stop every running backend, forwarders first
    pub async fn stop_all(&self) {
        self.registry.stop_all().await
    }
}
