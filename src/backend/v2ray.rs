//! V2Ray clients over WebSocket, SRTP and WeChat-video transports

use super::{BackendArgs, BackendKind};
use crate::launcher::PortMap;
use crate::{Result, Supervisor};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum V2RayTransport {
    Ws,
    Srtp,
    Wechat,
}

impl V2RayTransport {
    pub fn kind(&self) -> BackendKind {
        match self {
            V2RayTransport::Ws => BackendKind::V2RayWs,
            V2RayTransport::Srtp => BackendKind::V2RaySrtp,
            V2RayTransport::Wechat => BackendKind::V2RayWechat,
        }
    }

    pub fn from_kind(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::V2RayWs => Some(V2RayTransport::Ws),
            BackendKind::V2RaySrtp => Some(V2RayTransport::Srtp),
            BackendKind::V2RayWechat => Some(V2RayTransport::Wechat),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            V2RayTransport::Ws => "ws",
            V2RayTransport::Srtp => "srtp",
            V2RayTransport::Wechat => "wechat",
        }
    }
}

impl fmt::Display for V2RayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters; all passed through unchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct V2RayOptions {
    pub transport: V2RayTransport,
    pub server_address: String,
    pub server_port: String,
    /// WebSocket path, only used by [`V2RayTransport::Ws`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_path: Option<String>,
    /// User UUID
    pub id: String,
}

impl Default for V2RayOptions {
    fn default() -> Self {
        V2RayOptions {
            transport: V2RayTransport::Ws,
            server_address: String::new(),
            server_port: String::new(),
            ws_path: None,
            id: String::new(),
        }
    }
}

impl V2RayOptions {
    pub(super) fn command_args(&self, ports: &PortMap) -> Vec<String> {
        let mut args = vec![
            "-listen-port".to_string(),
            ports.primary().to_string(),
            "-transport".to_string(),
            self.transport.to_string(),
            "-server".to_string(),
            self.server_address.clone(),
            "-server-port".to_string(),
            self.server_port.clone(),
        ];
        if self.transport == V2RayTransport::Ws {
            if let Some(ref path) = self.ws_path {
                args.push("-path".to_string());
                args.push(path.clone());
            }
        }
        args.push("-id".to_string());
        args.push(self.id.clone());
        args
    }
}

impl Supervisor {
    pub async fn start_v2ray_ws(
        &self,
        server_address: impl Into<String>,
        server_port: impl Into<String>,
        ws_path: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<u16> {
        self.start_v2ray(V2RayOptions {
            transport: V2RayTransport::Ws,
            server_address: server_address.into(),
            server_port: server_port.into(),
            ws_path: Some(ws_path.into()),
            id: id.into(),
        })
        .await
    }

    pub async fn start_v2ray_srtp(
        &self,
        server_address: impl Into<String>,
        server_port: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<u16> {
        self.start_v2ray(V2RayOptions {
            transport: V2RayTransport::Srtp,
            server_address: server_address.into(),
            server_port: server_port.into(),
            ws_path: None,
            id: id.into(),
        })
        .await
    }

    pub async fn start_v2ray_wechat(
        &self,
        server_address: impl Into<String>,
        server_port: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<u16> {
        self.start_v2ray(V2RayOptions {
            transport: V2RayTransport::Wechat,
            server_address: server_address.into(),
            server_port: server_port.into(),
            ws_path: None,
            id: id.into(),
        })
        .await
    }

    /// Start the V2Ray unit matching `options.transport`
    pub async fn start_v2ray(&self, options: V2RayOptions) -> Result<u16> {
        self.registry
            .start(options.transport.kind(), BackendArgs::V2Ray(options))
            .await
    }

    pub async fn stop_v2ray_ws(&self) -> Result<()> {
        self.registry.stop(BackendKind::V2RayWs).await
    }

    pub async fn stop_v2ray_srtp(&self) -> Result<()> {
        self.registry.stop(BackendKind::V2RaySrtp).await
    }

    pub async fn stop_v2ray_wechat(&self) -> Result<()> {
        self.registry.stop(BackendKind::V2RayWechat).await
    }

    pub fn v2ray_ws_port(&self) -> u16 {
        self.registry.port(BackendKind::V2RayWs)
    }

    pub fn v2ray_srtp_port(&self) -> u16 {
        self.registry.port(BackendKind::V2RaySrtp)
    }

    pub fn v2ray_wechat_port(&self) -> u16 {
        self.registry.port(BackendKind::V2RayWechat)
    }
}
