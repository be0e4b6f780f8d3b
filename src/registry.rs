//! Backend lifecycle registry
//!
//! One slot per [`BackendKind`]. A slot remembers the ports of its listeners
//! across restarts and owns the running unit, if any. Start and stop of the
//! same slot are serialized by the slot's transition lock; different slots
//! never contend.

use crate::backend::{Artifact, BackendArgs, BackendKind};
use crate::environment::Provisioner;
use crate::launcher::{LaunchContext, Launcher, PortMap};
use crate::port::PortAllocator;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default bound on waiting for a stopped unit to finish
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningUnit {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    artifact: Option<PathBuf>,
}

impl RunningUnit {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }
}

struct SlotState {
    /// Current port per listener; preferred ports while stopped
    ports: Vec<u16>,
    unit: Option<RunningUnit>,
}

struct Slot {
    kind: BackendKind,
    transition: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(kind: BackendKind) -> Self {
        Slot {
            kind,
            transition: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState {
                ports: kind.listeners().iter().map(|l| l.default_port).collect(),
                unit: None,
            }),
        }
    }

    fn port_map(&self) -> PortMap {
        PortMap::new(self.kind.listeners(), &self.state.lock().ports)
    }
}

/// Tracks and transitions every backend unit
pub struct Registry {
    slots: HashMap<BackendKind, Slot>,
    launchers: RwLock<HashMap<BackendKind, Arc<dyn Launcher>>>,
    allocator: PortAllocator,
    provisioner: Provisioner,
    startup_delays: HashMap<BackendKind, Duration>,
    stop_timeout: Duration,
}

impl Registry {
    pub fn new(provisioner: Provisioner, allocator: PortAllocator) -> Self {
        Registry {
            slots: BackendKind::ALL
                .iter()
                .map(|kind| (*kind, Slot::new(*kind)))
                .collect(),
            launchers: RwLock::new(HashMap::new()),
            allocator,
            provisioner,
            startup_delays: HashMap::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Block `start` for `delay` after launching `kind`
    pub fn with_startup_delay(mut self, kind: BackendKind, delay: Duration) -> Self {
        self.startup_delays.insert(kind, delay);
        self
    }

    /// Replace the launcher used for future starts of `kind`
    pub fn set_launcher(&self, kind: BackendKind, launcher: Arc<dyn Launcher>) {
        self.launchers.write().insert(kind, launcher);
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    fn slot(&self, kind: BackendKind) -> &Slot {
        // Every kind gets a slot in `new`
        &self.slots[&kind]
    }

    /// Start `kind` unless it is already running.
    ///
    /// Returns the primary listener's port. A running backend keeps its
    /// ports and `args` are ignored. The port is returned once the unit has
    /// been launched, not necessarily once it is listening.
    pub async fn start(&self, kind: BackendKind, args: BackendArgs) -> Result<u16> {
        self.start_with(kind, move || Ok(args)).await
    }

    /// Like [`start`](Self::start), but `prepare` builds the arguments and
    /// runs only when `kind` is not already running.
    pub async fn start_with<F>(&self, kind: BackendKind, prepare: F) -> Result<u16>
    where
        F: FnOnce() -> Result<BackendArgs> + Send,
    {
        let slot = self.slot(kind);
        let _transition = slot.transition.lock().await;

        if let Some(port) = self.running_port(slot) {
            debug!("{} already running on {}", kind, port);
            return Ok(port);
        }
        self.reap(slot).await;

        info!("Starting {}", kind);

        let launcher = self.launcher(kind)?;
        let args = prepare()?;
        let env = self.provisioner.provision()?;

        let preferred = slot.state.lock().ports.clone();
        let mut ports = Vec::with_capacity(preferred.len());
        for port in preferred {
            match self.allocator.allocate(port).await {
                Ok(port) => ports.push(port),
                Err(e) => {
                    self.release_all(&ports);
                    warn!("{}: {}", kind, e);
                    return Err(e);
                }
            }
        }
        let port_map = PortMap::new(kind.listeners(), &ports);

        let artifact = match args.artifact(&port_map) {
            Ok(artifact) => artifact,
            Err(e) => {
                self.release_all(&ports);
                return Err(e);
            }
        };
        if let Some(ref artifact) = artifact {
            if let Err(e) = write_artifact(artifact).await {
                self.release_all(&ports);
                error!(
                    "Could not write {} config {}: {}",
                    kind,
                    artifact.path.display(),
                    e
                );
                return Err(e.into());
            }
        }
        let artifact = artifact.map(|a| a.path);

        let cancel = CancellationToken::new();
        let ctx = LaunchContext {
            kind,
            ports: port_map.clone(),
            env,
            args,
        };

        let unit = match launcher.launch(ctx, cancel.clone()).await {
            Ok(unit) => unit,
            Err(e) => {
                error!("Failed to launch {}: {}", kind, e);
                if let Some(ref path) = artifact {
                    remove_artifact(path).await;
                }
                self.release_all(&ports);
                return Err(e);
            }
        };

        let task = tokio::spawn(async move {
            match unit.await {
                Ok(()) => debug!("{} unit finished", kind),
                Err(e) => error!("{} unit failed: {}", kind, e),
            }
        });

        {
            let mut state = slot.state.lock();
            state.ports = ports;
            state.unit = Some(RunningUnit {
                cancel,
                task,
                artifact,
            });
        }

        info!("{} started on {}", kind, port_map);

        if let Some(delay) = self.startup_delays.get(&kind) {
            sleep(*delay).await;
        }

        Ok(port_map.primary())
    }

    /// Stop `kind` if it is running.
    ///
    /// Signals the unit, removes its config artifact, frees its ports and
    /// waits up to the stop timeout for it to finish before aborting it.
    pub async fn stop(&self, kind: BackendKind) -> Result<()> {
        let slot = self.slot(kind);
        let _transition = slot.transition.lock().await;

        let (mut unit, ports) = {
            let mut state = slot.state.lock();
            match state.unit.take() {
                Some(unit) => (unit, state.ports.clone()),
                None => {
                    debug!("{} not running", kind);
                    return Ok(());
                }
            }
        };

        info!("Stopping {}", kind);
        unit.cancel.cancel();

        if let Some(ref path) = unit.artifact {
            remove_artifact(path).await;
        }

        self.release_all(&ports);

        match timeout(self.stop_timeout, &mut unit.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} unit panicked: {}", kind, e),
            Err(_) => {
                warn!("{} did not stop within {:?}, aborting", kind, self.stop_timeout);
                unit.task.abort();
            }
        }

        info!("{} stopped", kind);
        Ok(())
    }

    /// Stop every running unit, auxiliary forwarders first
    pub async fn stop_all(&self) {
        // Exited units are included so their ports and artifacts are released
        let (auxiliary, backends): (Vec<BackendKind>, Vec<BackendKind>) = BackendKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.slot(*kind).state.lock().unit.is_some())
            .partition(|kind| kind.is_auxiliary());

        for group in [auxiliary, backends] {
            let stops = group.into_iter().map(|kind| self.stop(kind));
            for result in futures::future::join_all(stops).await {
                if let Err(e) = result {
                    warn!("Stop failed: {}", e);
                }
            }
        }
    }

    /// Set the port the next start of `kind` tries first for `listener`.
    ///
    /// Has no effect on a running unit.
    pub fn set_preferred_port(&self, kind: BackendKind, listener: &str, port: u16) -> bool {
        let slot = self.slot(kind);
        let mut state = slot.state.lock();
        if state.unit.is_some() {
            return false;
        }
        match kind.listeners().iter().position(|l| l.name == listener) {
            Some(index) => {
                state.ports[index] = port;
                true
            }
            None => false,
        }
    }

    /// Whether `kind` has a unit that has not exited
    pub fn is_running(&self, kind: BackendKind) -> bool {
        self.slot(kind)
            .state
            .lock()
            .unit
            .as_ref()
            .is_some_and(RunningUnit::is_live)
    }

    /// Primary port of `kind`: the assigned port while running, otherwise the
    /// port the next start will try first
    pub fn port(&self, kind: BackendKind) -> u16 {
        self.slot(kind).port_map().primary()
    }

    /// Port of one named listener of `kind`
    pub fn listener_port(&self, kind: BackendKind, listener: &str) -> Option<u16> {
        self.slot(kind).port_map().get(listener)
    }

    /// All listener ports of `kind`
    pub fn ports(&self, kind: BackendKind) -> PortMap {
        self.slot(kind).port_map()
    }

    /// Kinds with a running unit
    pub fn running(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.is_running(*kind))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.running().len()
    }

    fn running_port(&self, slot: &Slot) -> Option<u16> {
        let state = slot.state.lock();
        match state.unit {
            Some(ref unit) if unit.is_live() => Some(state.ports[0]),
            _ => None,
        }
    }

    /// Clean up after a unit that exited on its own
    async fn reap(&self, slot: &Slot) {
        let (unit, ports) = {
            let mut state = slot.state.lock();
            match state.unit.take() {
                Some(unit) => (unit, state.ports.clone()),
                None => return,
            }
        };

        warn!("{} exited on its own, relaunching", slot.kind);
        if let Some(ref path) = unit.artifact {
            remove_artifact(path).await;
        }
        self.release_all(&ports);
    }

    fn launcher(&self, kind: BackendKind) -> Result<Arc<dyn Launcher>> {
        self.launchers
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| crate::Error::launch(format!("No launcher registered for {}", kind)))
    }

    fn release_all(&self, ports: &[u16]) {
        for port in ports {
            self.allocator.release(*port);
        }
    }
}

async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}

async fn write_artifact(artifact: &Artifact) -> io::Result<()> {
    if let Some(parent) = artifact.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&artifact.path, artifact.contents.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Hysteria2Options, LyrebirdOptions};
    use crate::launcher::Unit;
    use crate::Error;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts launches and idles until cancelled
    #[derive(Default)]
    struct CountingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl Launcher for CountingLauncher {
        async fn launch(&self, _ctx: LaunchContext, shutdown: CancellationToken) -> Result<Unit> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(async move {
                shutdown.cancelled().await;
                Ok(())
            }
            .boxed())
        }
    }

    /// Ignores cancellation
    struct StubbornLauncher;

    #[async_trait]
    impl Launcher for StubbornLauncher {
        async fn launch(&self, _ctx: LaunchContext, _shutdown: CancellationToken) -> Result<Unit> {
            Ok(async {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            .boxed())
        }
    }

    /// Fails to bring the unit up
    struct FailingLauncher;

    #[async_trait]
    impl Launcher for FailingLauncher {
        async fn launch(&self, _ctx: LaunchContext, _shutdown: CancellationToken) -> Result<Unit> {
            Err(Error::launch("executable not found"))
        }
    }

    /// Launches units that exit straight away
    #[derive(Default)]
    struct ExitingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl Launcher for ExitingLauncher {
        async fn launch(&self, _ctx: LaunchContext, _shutdown: CancellationToken) -> Result<Unit> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(async { Err::<(), _>(Error::launch("exited with status: 1")) }.boxed())
        }
    }

    fn hysteria2_args(config_path: &Path) -> BackendArgs {
        BackendArgs::Hysteria2(Hysteria2Options {
            server: "hysteria2://secret@example.com:443".to_string(),
            config_path: config_path.to_path_buf(),
        })
    }

    fn registry(state: &std::path::Path) -> Registry {
        Registry::new(
            Provisioner::new(state.join("state"), false),
            PortAllocator::default(),
        )
    }

    fn lyrebird_args() -> BackendArgs {
        BackendArgs::Lyrebird(LyrebirdOptions::default())
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        let launcher = Arc::new(CountingLauncher::default());
        registry.set_launcher(BackendKind::Lyrebird, launcher.clone());

        let first = registry.start(BackendKind::Lyrebird, lyrebird_args()).await.unwrap();
        assert_eq!(registry.running_count(), 1);

        let second = registry.start(BackendKind::Lyrebird, lyrebird_args()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.running_count(), 1);
        assert_eq!(registry.allocator().reserved_count(), 3);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        registry.set_launcher(BackendKind::Lyrebird, Arc::new(CountingLauncher::default()));

        registry.start(BackendKind::Lyrebird, lyrebird_args()).await.unwrap();
        registry.stop(BackendKind::Lyrebird).await.unwrap();
        assert!(!registry.is_running(BackendKind::Lyrebird));
        assert_eq!(registry.allocator().reserved_count(), 0);

        registry.stop(BackendKind::Lyrebird).await.unwrap();
        assert!(!registry.is_running(BackendKind::Lyrebird));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        registry.stop(BackendKind::Snowflake).await.unwrap();
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_start_fails_without_launcher() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());

        let err = registry.start(BackendKind::Lyrebird, lyrebird_args()).await.unwrap_err();
        assert!(matches!(err, Error::Launch(_)));
        assert!(!registry.is_running(BackendKind::Lyrebird));
        assert_eq!(registry.allocator().reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_state_location() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("state");
        std::fs::write(&file, b"x").unwrap();

        let registry = registry(tmp.path());
        registry.set_launcher(BackendKind::Lyrebird, Arc::new(CountingLauncher::default()));

        let err = registry.start(BackendKind::Lyrebird, lyrebird_args()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!registry.is_running(BackendKind::Lyrebird));
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_backend_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        registry.set_launcher(BackendKind::Hysteria2, Arc::new(FailingLauncher));

        let config_path = tmp.path().join(".hysteria").join("config");
        let err = registry
            .start(BackendKind::Hysteria2, hysteria2_args(&config_path))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Launch(_)));
        assert!(!registry.is_running(BackendKind::Hysteria2));
        assert_eq!(registry.allocator().reserved_count(), 0);
        assert!(!config_path.exists());

        // A later start with a working launcher goes through
        let launcher = Arc::new(CountingLauncher::default());
        registry.set_launcher(BackendKind::Hysteria2, launcher.clone());
        registry
            .start(BackendKind::Hysteria2, hysteria2_args(&config_path))
            .await
            .unwrap();
        assert!(registry.is_running(BackendKind::Hysteria2));
        assert!(config_path.exists());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_exited_unit_is_relaunched() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        let launcher = Arc::new(ExitingLauncher::default());
        registry.set_launcher(BackendKind::Snowflake, launcher.clone());

        let args = BackendArgs::Snowflake(Default::default());
        let first = registry.start(BackendKind::Snowflake, args.clone()).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!registry.is_running(BackendKind::Snowflake));
        assert!(registry.running().is_empty());

        // The dead unit's port is released and handed out again
        let second = registry.start(BackendKind::Snowflake, args).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(registry.allocator().reserved_count(), 1);

        registry.stop(BackendKind::Snowflake).await.unwrap();
        assert_eq!(registry.allocator().reserved_count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_skipped_while_running() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        registry.set_launcher(BackendKind::Lyrebird, Arc::new(CountingLauncher::default()));

        let port = registry.start(BackendKind::Lyrebird, lyrebird_args()).await.unwrap();
        let again = registry
            .start_with(BackendKind::Lyrebird, || Err(Error::HomeDirectory))
            .await
            .unwrap();
        assert_eq!(again, port);

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_artifact_written_and_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        registry.set_launcher(BackendKind::Hysteria2, Arc::new(CountingLauncher::default()));

        let config_path = tmp.path().join(".hysteria").join("config");
        let port = registry
            .start(BackendKind::Hysteria2, hysteria2_args(&config_path))
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains(&format!("listen: 127.0.0.1:{}", port)));

        registry.stop(BackendKind::Hysteria2).await.unwrap();
        assert!(!config_path.exists());
    }

    #[tokio::test]
    async fn test_stop_aborts_stubborn_unit() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path()).with_stop_timeout(Duration::from_millis(100));
        registry.set_launcher(BackendKind::Snowflake, Arc::new(StubbornLauncher));

        registry
            .start(
                BackendKind::Snowflake,
                BackendArgs::Snowflake(Default::default()),
            )
            .await
            .unwrap();

        let stopped = timeout(Duration::from_secs(2), registry.stop(BackendKind::Snowflake)).await;
        assert!(matches!(stopped, Ok(Ok(()))));
        assert!(!registry.is_running(BackendKind::Snowflake));
    }

    #[tokio::test]
    async fn test_preferred_port_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        registry.set_launcher(BackendKind::Snowflake, Arc::new(CountingLauncher::default()));

        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = occupied.local_addr().unwrap().port();
        assert!(registry.set_preferred_port(BackendKind::Snowflake, "socks", taken));

        let args = BackendArgs::Snowflake(Default::default());
        let port = registry.start(BackendKind::Snowflake, args.clone()).await.unwrap();
        assert!(port > taken);
        assert!(!registry.set_preferred_port(BackendKind::Snowflake, "socks", taken));

        registry.stop(BackendKind::Snowflake).await.unwrap();
        assert_eq!(registry.port(BackendKind::Snowflake), port);
        assert!(!registry.set_preferred_port(BackendKind::Snowflake, "webtunnel", 1));
    }

    #[tokio::test]
    async fn test_distinct_backends_get_distinct_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry(tmp.path());
        for kind in [BackendKind::V2RayWs, BackendKind::V2RaySrtp] {
            registry.set_launcher(kind, Arc::new(CountingLauncher::default()));
        }

        let ws = registry
            .start(BackendKind::V2RayWs, BackendArgs::V2Ray(Default::default()))
            .await
            .unwrap();
        let srtp = registry
            .start(BackendKind::V2RaySrtp, BackendArgs::V2Ray(Default::default()))
            .await
            .unwrap();
        assert_ne!(ws, srtp);
        assert_eq!(registry.running().len(), 2);

        registry.stop_all().await;
        assert_eq!(registry.running_count(), 0);
    }
}
