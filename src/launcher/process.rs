//! External backend process launcher
//!
//! Spawns the backend executable with its arguments and the `TOR_PT_*`
//! environment, forwards its stderr to the log and terminates it when the
//! shutdown token fires: SIGTERM first, SIGKILL after a grace period.

use super::{LaunchContext, Launcher, Unit};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a backend gets to exit after SIGTERM
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Launches a backend as a child process
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ProcessLauncher {
            program: program.into(),
            grace: TERMINATE_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self, ctx: &LaunchContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(ctx.args.command_args(&ctx.ports))
            .envs(ctx.env.vars())
            .current_dir(&ctx.env.state_location)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

async fn terminate(name: &str, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!("{} exited with status: {}", name, status);
        }
        Ok(Err(e)) => {
            warn!("Error waiting for {}: {}", name, e);
        }
        Err(_) => {
            warn!("{} didn't exit gracefully, forcing kill", name);
            let _ = child.kill().await;
        }
    }
}

async fn supervise(
    name: &'static str,
    mut child: Child,
    grace: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                info!("{} exited", name);
                Ok(())
            } else {
                Err(Error::launch(format!("{} exited with status: {}", name, status)))
            }
        }
        _ = shutdown.cancelled() => {
            debug!("Stopping {}", name);
            terminate(name, &mut child, grace).await;
            Ok(())
        }
    }
}

async fn forward_stderr(name: &'static str, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(backend = name, "{}", line);
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, ctx: LaunchContext, shutdown: CancellationToken) -> Result<Unit> {
        let name = ctx.kind.name();
        let mut child = self.command(&ctx).spawn().map_err(|e| {
            Error::launch(format!(
                "Failed to spawn {} ({}): {}",
                name,
                self.program.display(),
                e
            ))
        })?;

        info!("{} started with PID: {}", name, child.id().unwrap_or(0));

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name, stderr));
        }

        Ok(supervise(name, child, self.grace, shutdown).boxed())
    }
}
