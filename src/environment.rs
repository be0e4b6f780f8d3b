//! State directory provisioning and the pluggable-transport environment
//!
//! Every backend needs a writable state directory and learns it, together
//! with the enabled transports, from three `TOR_PT_*` variables. Those are
//! produced here as a [`PtEnvironment`] that is handed to each launch and,
//! unless disabled, exported into the process environment for backends
//! that only read it from there.
//!
//! Exporting is last-writer-wins: concurrent provisioning from different
//! starts is not serialized.

use crate::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

pub const TOR_PT_CLIENT_TRANSPORTS: &str = "TOR_PT_CLIENT_TRANSPORTS";
pub const TOR_PT_MANAGED_TRANSPORT_VER: &str = "TOR_PT_MANAGED_TRANSPORT_VER";
pub const TOR_PT_STATE_LOCATION: &str = "TOR_PT_STATE_LOCATION";

/// Transports enabled for every backend
pub const CLIENT_TRANSPORTS: &[&str] = &["meek_lite", "obfs4", "webtunnel", "snowflake"];

/// Managed transport protocol version
pub const MANAGED_TRANSPORT_VER: &str = "1";

/// Marker used to verify the state directory is writable
pub const WRITE_TEST_FILE: &str = ".iptproxy-writetest";

/// The environment contract backends are started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtEnvironment {
    pub client_transports: String,
    pub transport_version: String,
    pub state_location: PathBuf,
}

impl PtEnvironment {
    pub fn new(state_location: PathBuf) -> Self {
        PtEnvironment {
            client_transports: CLIENT_TRANSPORTS.join(","),
            transport_version: MANAGED_TRANSPORT_VER.to_string(),
            state_location,
        }
    }

    /// Key/value pairs in the order backends expect them
    pub fn vars(&self) -> [(&'static str, String); 3] {
        [
            (TOR_PT_CLIENT_TRANSPORTS, self.client_transports.clone()),
            (TOR_PT_MANAGED_TRANSPORT_VER, self.transport_version.clone()),
            (
                TOR_PT_STATE_LOCATION,
                self.state_location.to_string_lossy().into_owned(),
            ),
        ]
    }

    /// Set the variables on the current process
    pub fn export(&self) {
        for (key, value) in self.vars() {
            std::env::set_var(key, value);
        }
    }
}

/// Validates the state directory and builds the environment contract
#[derive(Debug, Clone)]
pub struct Provisioner {
    state_location: PathBuf,
    export: bool,
}

impl Provisioner {
    pub fn new(state_location: impl Into<PathBuf>, export: bool) -> Self {
        Provisioner {
            state_location: state_location.into(),
            export,
        }
    }

    pub fn state_location(&self) -> &Path {
        &self.state_location
    }

    /// Ensure the state directory exists and is writable.
    ///
    /// Safe to call repeatedly. Failures are [`Error::StateLocation`], which
    /// is fatal: no backend can run without the directory.
    pub fn provision(&self) -> Result<PtEnvironment> {
        ensure_state_dir(&self.state_location).map_err(|e| {
            let err = Error::state_location(&self.state_location, e.to_string());
            error!("{}", err);
            err
        })?;

        let env = PtEnvironment::new(self.state_location.clone());
        if self.export {
            env.export();
        }

        debug!("State location {} ready", self.state_location.display());
        Ok(env)
    }
}

fn ensure_state_dir(path: &Path) -> io::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "state location is not set",
        ));
    }

    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            create_private_dir(path)?;
            fs::metadata(path)?
        }
        Err(e) => return Err(e),
    };

    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "exists but is not a directory",
        ));
    }

    let marker = path.join(WRITE_TEST_FILE);
    fs::File::create(&marker)?;
    fs::remove_file(&marker)
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}
