//! Process environment handed to transport backends
//!
//! Kept in its own test binary: it exports `TOR_PT_*` into the process
//! environment, which every test in a binary shares.

use async_trait::async_trait;
use iptproxy_rust::backend::LyrebirdOptions;
use futures::FutureExt;
use iptproxy_rust::launcher::{LaunchContext, Launcher, Unit};
use iptproxy_rust::{BackendKind, Config, Result, Supervisor};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingLauncher {
    contexts: Mutex<Vec<LaunchContext>>,
}

#[async_trait]
impl Launcher for RecordingLauncher {
    async fn launch(&self, ctx: LaunchContext, shutdown: CancellationToken) -> Result<Unit> {
        self.contexts.lock().push(ctx);
        Ok(async move {
            shutdown.cancelled().await;
            Ok(())
        }
        .boxed())
    }
}

#[tokio::test]
async fn test_lyrebird_start_provisions_state_and_environment() {
    let tmp = tempfile::tempdir().unwrap();
    let state = tmp.path().join("test-state");
    assert!(!state.exists());

    let launcher = Arc::new(RecordingLauncher::default());
    let supervisor = Supervisor::new(Config::with_state_location(&state))
        .unwrap()
        .with_launcher(BackendKind::Lyrebird, launcher.clone());

    let port = supervisor
        .start_lyrebird(LyrebirdOptions::new("ERROR", false, false))
        .await
        .unwrap();
    assert!(port >= 47300);

    assert!(state.is_dir());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&state).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    assert_eq!(
        std::env::var("TOR_PT_CLIENT_TRANSPORTS").unwrap(),
        "meek_lite,obfs4,webtunnel,snowflake"
    );
    assert_eq!(std::env::var("TOR_PT_MANAGED_TRANSPORT_VER").unwrap(), "1");
    assert_eq!(
        std::env::var("TOR_PT_STATE_LOCATION").unwrap(),
        state.to_string_lossy()
    );

    // The same contract travels with the launch context
    let contexts = launcher.contexts.lock().clone();
    assert_eq!(contexts.len(), 1);
    let vars = contexts[0].env.vars();
    assert!(vars
        .iter()
        .any(|(k, v)| *k == "TOR_PT_STATE_LOCATION" && *v == state.to_string_lossy()));

    supervisor.stop_lyrebird().await.unwrap();
}
