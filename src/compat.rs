//! Blocking, integer-returning operation surface
//!
//! For embedders that cannot drive futures (FFI bindings, mobile glue).
//! Each start returns the assigned port, or `0` when the backend could not
//! be started; details go to the log. An unusable state location is fatal
//! and panics with the diagnostic, since no backend can run without it.
//!
//! The async [`Supervisor`] is built lazily on the first operation, so the
//! state location may still be changed with
//! [`set_state_location`](BlockingSupervisor::set_state_location) up to
//! then, or later while nothing is running.

use crate::backend::{BackendKind, LyrebirdOptions, SnowflakeOptions, LYREBIRD_LOG_FILE};
use crate::port::is_port_available;
use crate::{Config, Error, Result, Supervisor};
use parking_lot::Mutex;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{error, warn};

pub struct BlockingSupervisor {
    runtime: Runtime,
    config: Mutex<Config>,
    inner: Mutex<Option<Arc<Supervisor>>>,
}

impl BlockingSupervisor {
    pub fn new(config: Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().clamp(2, 4))
            .enable_all()
            .thread_name("iptproxy-worker")
            .build()?;

        Ok(BlockingSupervisor {
            runtime,
            config: Mutex::new(config),
            inner: Mutex::new(None),
        })
    }

    /// Point future starts at a different state location.
    ///
    /// Returns false, leaving the location unchanged, while any backend runs.
    pub fn set_state_location(&self, path: impl Into<PathBuf>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(ref supervisor) = *inner {
            if !supervisor.running().is_empty() {
                warn!("State location cannot change while backends are running");
                return false;
            }
        }
        self.config.lock().state_location = path.into();
        *inner = None;
        true
    }

    pub fn state_location(&self) -> PathBuf {
        self.config.lock().state_location.clone()
    }

    pub fn lyrebird_log_file(&self) -> &'static str {
        LYREBIRD_LOG_FILE
    }

    pub fn is_port_available(&self, port: u16) -> bool {
        self.runtime.block_on(is_port_available(port))
    }

    // Lyrebird

    pub fn start_lyrebird(&self, log_level: &str, enable_logging: bool, unsafe_logging: bool) -> u16 {
        let options = LyrebirdOptions::new(log_level, enable_logging, unsafe_logging);
        self.start("Lyrebird", |s| async move { s.start_lyrebird(options).await })
    }

    pub fn stop_lyrebird(&self) {
        self.stop("Lyrebird", |s| async move { s.stop_lyrebird().await })
    }

    pub fn obfs4_port(&self) -> u16 {
        self.port(BackendKind::Lyrebird, "obfs4", |s| s.obfs4_port())
    }

    pub fn meek_port(&self) -> u16 {
        self.port(BackendKind::Lyrebird, "meek_lite", |s| s.meek_port())
    }

    pub fn webtunnel_port(&self) -> u16 {
        self.port(BackendKind::Lyrebird, "webtunnel", |s| s.webtunnel_port())
    }

    // Forwarders

    pub fn start_obfs4(
        &self,
        user: &str,
        password: &str,
        log_level: &str,
        enable_logging: bool,
        unsafe_logging: bool,
    ) -> u16 {
        let (user, password) = (user.to_string(), password.to_string());
        let options = LyrebirdOptions::new(log_level, enable_logging, unsafe_logging);
        self.start("Obfs4 forwarder", |s| async move {
            s.start_obfs4(user, password, options).await
        })
    }

    pub fn start_meek(
        &self,
        user: &str,
        password: &str,
        log_level: &str,
        enable_logging: bool,
        unsafe_logging: bool,
    ) -> u16 {
        let (user, password) = (user.to_string(), password.to_string());
        let options = LyrebirdOptions::new(log_level, enable_logging, unsafe_logging);
        self.start("Meek forwarder", |s| async move {
            s.start_meek(user, password, options).await
        })
    }

    pub fn stop_obfs4_forwarder(&self) {
        self.stop("Obfs4 forwarder", |s| async move { s.stop_obfs4_forwarder().await })
    }

    pub fn stop_meek_forwarder(&self) {
        self.stop("Meek forwarder", |s| async move { s.stop_meek_forwarder().await })
    }

    pub fn obfs4_forwarder_port(&self) -> u16 {
        self.port(BackendKind::Obfs4Forwarder, "socks", |s| s.obfs4_forwarder_port())
    }

    pub fn meek_forwarder_port(&self) -> u16 {
        self.port(BackendKind::MeekForwarder, "socks", |s| s.meek_forwarder_port())
    }

    // V2Ray

    pub fn start_v2ray_ws(&self, server_address: &str, server_port: &str, ws_path: &str, id: &str) -> u16 {
        let args = (
            server_address.to_string(),
            server_port.to_string(),
            ws_path.to_string(),
            id.to_string(),
        );
        self.start("V2Ray WebSocket", |s| async move {
            s.start_v2ray_ws(args.0, args.1, args.2, args.3).await
        })
    }

    pub fn start_v2ray_srtp(&self, server_address: &str, server_port: &str, id: &str) -> u16 {
        let args = (server_address.to_string(), server_port.to_string(), id.to_string());
        self.start("V2Ray SRTP", |s| async move {
            s.start_v2ray_srtp(args.0, args.1, args.2).await
        })
    }

    pub fn start_v2ray_wechat(&self, server_address: &str, server_port: &str, id: &str) -> u16 {
        let args = (server_address.to_string(), server_port.to_string(), id.to_string());
        self.start("V2Ray WeChat", |s| async move {
            s.start_v2ray_wechat(args.0, args.1, args.2).await
        })
    }

    pub fn stop_v2ray_ws(&self) {
        self.stop("V2Ray WebSocket", |s| async move { s.stop_v2ray_ws().await })
    }

    pub fn stop_v2ray_srtp(&self) {
        self.stop("V2Ray SRTP", |s| async move { s.stop_v2ray_srtp().await })
    }

    pub fn stop_v2ray_wechat(&self) {
        self.stop("V2Ray WeChat", |s| async move { s.stop_v2ray_wechat().await })
    }

    pub fn v2ray_ws_port(&self) -> u16 {
        self.port(BackendKind::V2RayWs, "socks", |s| s.v2ray_ws_port())
    }

    pub fn v2ray_srtp_port(&self) -> u16 {
        self.port(BackendKind::V2RaySrtp, "socks", |s| s.v2ray_srtp_port())
    }

    pub fn v2ray_wechat_port(&self) -> u16 {
        self.port(BackendKind::V2RayWechat, "socks", |s| s.v2ray_wechat_port())
    }

    // Hysteria2

    pub fn start_hysteria2(&self, server: &str) -> u16 {
        let server = server.to_string();
        self.start("Hysteria2", |s| async move { s.start_hysteria2(server).await })
    }

    pub fn stop_hysteria2(&self) {
        self.stop("Hysteria2", |s| async move { s.stop_hysteria2().await })
    }

    pub fn hysteria2_port(&self) -> u16 {
        self.port(BackendKind::Hysteria2, "socks5", |s| s.hysteria2_port())
    }

    // Snowflake

    pub fn start_snowflake(&self, options: SnowflakeOptions) -> u16 {
        self.start("Snowflake", |s| async move { s.start_snowflake(options).await })
    }

    pub fn stop_snowflake(&self) {
        self.stop("Snowflake", |s| async move { s.stop_snowflake().await })
    }

    pub fn snowflake_port(&self) -> u16 {
        self.port(BackendKind::Snowflake, "socks", |s| s.snowflake_port())
    }

    /// Stop everything that runs
    pub fn stop_all(&self) {
        let supervisor = self.inner.lock().clone();
        if let Some(supervisor) = supervisor {
            self.runtime.block_on(supervisor.stop_all());
        }
    }

    fn supervisor(&self) -> Result<Arc<Supervisor>> {
        let mut inner = self.inner.lock();
        if let Some(ref supervisor) = *inner {
            return Ok(supervisor.clone());
        }

        let config = self.config.lock().clone();
        if config.state_location.as_os_str().is_empty() {
            return Err(Error::state_location(
                Path::new(""),
                "state location is not set",
            ));
        }

        let supervisor = Arc::new(Supervisor::new(config)?);
        *inner = Some(supervisor.clone());
        Ok(supervisor)
    }

    fn start<F, Fut>(&self, name: &str, op: F) -> u16
    where
        F: FnOnce(Arc<Supervisor>) -> Fut,
        Fut: Future<Output = Result<u16>>,
    {
        let result = self
            .supervisor()
            .and_then(|supervisor| self.runtime.block_on(op(supervisor)));

        match result {
            Ok(port) => port,
            Err(e) if e.is_fatal() => panic!("{}", e),
            Err(e) => {
                error!("Failed to start {}: {}", name, e);
                0
            }
        }
    }

    fn stop<F, Fut>(&self, name: &str, op: F)
    where
        F: FnOnce(Arc<Supervisor>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let supervisor = self.inner.lock().clone();
        let Some(supervisor) = supervisor else {
            return;
        };
        if let Err(e) = self.runtime.block_on(op(supervisor)) {
            warn!("Failed to stop {}: {}", name, e);
        }
    }

    /// Current port, or the listener's default while no supervisor can be
    /// built yet
    fn port(
        &self,
        kind: BackendKind,
        listener: &str,
        query: impl FnOnce(&Supervisor) -> u16,
    ) -> u16 {
        match self.supervisor() {
            Ok(supervisor) => query(&supervisor),
            Err(_) => kind
                .listeners()
                .iter()
                .find(|l| l.name == listener)
                .map(|l| l.default_port)
                .unwrap_or(0),
        }
    }
}

impl Drop for BlockingSupervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
