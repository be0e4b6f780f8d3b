//! Backend launchers
//!
//! A launch has two phases. [`Launcher::launch`] does whatever can fail up
//! front (spawning the executable, binding the listener) and is awaited by
//! the registry before the backend counts as running. The [`Unit`] it
//! returns then runs detached until it exits or its shutdown token fires.

mod process;

pub use process::ProcessLauncher;

use crate::backend::{BackendArgs, BackendKind, Listener};
use crate::environment::PtEnvironment;
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Ports assigned to each listener of a backend, primary listener first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    entries: Vec<(&'static str, u16)>,
}

impl PortMap {
    pub fn new(listeners: &[Listener], ports: &[u16]) -> Self {
        PortMap {
            entries: listeners
                .iter()
                .zip(ports)
                .map(|(listener, port)| (listener.name, *port))
                .collect(),
        }
    }

    /// Port of the listener whose number the start operation returns
    pub fn primary(&self) -> u16 {
        self.entries.first().map(|(_, port)| *port).unwrap_or(0)
    }

    pub fn get(&self, listener: &str) -> Option<u16> {
        self.entries
            .iter()
            .find(|(name, _)| *name == listener)
            .map(|(_, port)| *port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u16)> + '_ {
        self.entries.iter().copied()
    }
}

impl fmt::Display for PortMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, port)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, port)?;
        }
        Ok(())
    }
}

/// Everything a backend unit receives at launch
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub kind: BackendKind,
    pub ports: PortMap,
    pub env: PtEnvironment,
    pub args: BackendArgs,
}

/// A launched backend, running until it exits or its shutdown token fires
pub type Unit = BoxFuture<'static, Result<()>>;

/// Launches backend units
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Bring the unit up.
    ///
    /// Returns once the unit has been spawned or bound; an error here leaves
    /// the backend not running. The returned [`Unit`] must finish soon after
    /// `shutdown` is cancelled.
    async fn launch(&self, ctx: LaunchContext, shutdown: CancellationToken) -> Result<Unit>;
}
