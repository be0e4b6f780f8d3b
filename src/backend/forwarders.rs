//! Credential-injecting forwarders in front of Lyrebird's obfs4 and
//! meek_lite listeners

use super::{BackendArgs, BackendKind, LyrebirdOptions};
use crate::common::net::loopback_addr;
use crate::{Error, Result, Supervisor};
use serde::{Deserialize, Serialize};

/// Upstream listener and the credentials presented to it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderTarget {
    pub user: String,
    pub password: String,
    /// `host:port` of the backend listener
    #[serde(default)]
    pub upstream: String,
}

impl std::fmt::Debug for ForwarderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwarderTarget")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("upstream", &self.upstream)
            .finish()
    }
}

impl Supervisor {
    /// Start Lyrebird if needed, then a forwarder that injects `user` and
    /// `password` into every CONNECT to the obfs4 listener. Returns the
    /// forwarder's port.
    pub async fn start_obfs4(
        &self,
        user: impl Into<String>,
        password: impl Into<String>,
        options: LyrebirdOptions,
    ) -> Result<u16> {
        self.start_auxiliary(BackendKind::Obfs4Forwarder, user.into(), password.into(), options)
            .await
    }

    /// Same as [`start_obfs4`](Self::start_obfs4), relaying to meek_lite
    pub async fn start_meek(
        &self,
        user: impl Into<String>,
        password: impl Into<String>,
        options: LyrebirdOptions,
    ) -> Result<u16> {
        self.start_auxiliary(BackendKind::MeekForwarder, user.into(), password.into(), options)
            .await
    }

    /// Stops only the forwarder; Lyrebird keeps running
    pub async fn stop_obfs4_forwarder(&self) -> Result<()> {
        self.registry.stop(BackendKind::Obfs4Forwarder).await
    }

    pub async fn stop_meek_forwarder(&self) -> Result<()> {
        self.registry.stop(BackendKind::MeekForwarder).await
    }

    pub fn obfs4_forwarder_port(&self) -> u16 {
        self.registry.port(BackendKind::Obfs4Forwarder)
    }

    pub fn meek_forwarder_port(&self) -> u16 {
        self.registry.port(BackendKind::MeekForwarder)
    }

    /// Start the auxiliary forwarder `kind` after an idempotent start of the
    /// backend it relays to.
    ///
    /// The forwarder's lifecycle is independent afterwards: stopping it
    /// leaves the backend running and vice versa.
    pub async fn start_auxiliary(
        &self,
        kind: BackendKind,
        user: String,
        password: String,
        options: LyrebirdOptions,
    ) -> Result<u16> {
        let (parent, listener) = kind
            .parent()
            .ok_or_else(|| Error::internal(format!("{} has no parent backend", kind)))?;

        self.registry.start(parent, BackendArgs::Lyrebird(options)).await?;
        let upstream_port = self
            .registry
            .listener_port(parent, listener)
            .ok_or_else(|| Error::internal(format!("{} has no {} listener", parent, listener)))?;

        let target = ForwarderTarget {
            user,
            password,
            upstream: loopback_addr(upstream_port),
        };
        self.registry.start(kind, BackendArgs::Forwarder(target)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_password() {
        let target = ForwarderTarget {
            user: "cert=abc;iat-mode=0".to_string(),
            password: "\0".to_string(),
            upstream: "127.0.0.1:47300".to_string(),
        };
        let rendered = format!("{:?}", target);
        assert!(rendered.contains("cert=abc"));
        assert!(rendered.contains("<redacted>"));
    }
}
