//! Credential-injecting SOCKS5 forwarder
//!
//! Some HTTP stacks cannot be configured with a SOCKS proxy that needs
//! credentials, while Lyrebird takes its per-bridge arguments as SOCKS5
//! username/password. The forwarder sits in between: local clients connect
//! without credentials (a client that insists on username/password is
//! accepted and its credentials discarded), and every CONNECT is replayed
//! against the backend's listener with the configured credentials.

use crate::backend::{BackendArgs, ForwarderTarget};
use crate::common::net::{configure_tcp_stream, loopback_addr, Address};
use crate::common::socks::{
    client_connect, AuthMethodFlags, AuthResponse, Command, Credentials, Request, Response,
    UsernamePasswordAuth, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD,
    REP_COMMAND_NOT_SUPPORTED, REP_CONNECTION_REFUSED, REP_GENERAL_FAILURE, REP_TTL_EXPIRED,
};
use crate::launcher::{LaunchContext, Launcher, Unit};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Upstream connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Relays local SOCKS5 clients to an upstream SOCKS5 listener
pub struct Socks5Forwarder {
    upstream: String,
    credentials: Credentials,
}

impl Socks5Forwarder {
    pub fn new(target: &ForwarderTarget) -> Self {
        Socks5Forwarder {
            upstream: target.upstream.clone(),
            credentials: Credentials {
                username: target.user.clone(),
                password: target.password.clone(),
            },
        }
    }

    /// Bind `127.0.0.1:port` and accept connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, port: u16, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(loopback_addr(port)).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires.
    ///
    /// Connections in flight are cancelled together with the listener.
    pub async fn serve_listener(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let port = listener.local_addr()?.port();
        info!(
            "SOCKS5 forwarder listening on {} -> {}",
            listener.local_addr()?,
            self.upstream
        );

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        configure_tcp_stream(&stream);
                        let this = self.clone();
                        let shutdown = shutdown.clone();
                        tracker.spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                result = this.handle_connection(stream, peer_addr) => {
                                    if let Err(e) = result {
                                        debug!("Forwarder connection error from {}: {}", peer_addr, e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => error!("Forwarder accept error: {}", e),
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("SOCKS5 forwarder on port {} stopped", port);
        Ok(())
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        // Step 1: method negotiation
        let methods = AuthMethodFlags::read_from(&mut stream).await?;
        if methods.no_auth {
            AuthResponse::new(AUTH_NO_AUTH).write_to(&mut stream).await?;
        } else if methods.username_password {
            AuthResponse::new(AUTH_USERNAME_PASSWORD)
                .write_to(&mut stream)
                .await?;
            // Client credentials are replaced by the configured ones
            UsernamePasswordAuth::read_from(&mut stream).await?;
            UsernamePasswordAuth::write_response(&mut stream, true).await?;
        } else {
            AuthResponse::new(AUTH_NO_ACCEPTABLE)
                .write_to(&mut stream)
                .await?;
            return Err(Error::auth("No acceptable authentication method"));
        }

        // Step 2: request
        let request = Request::read_from(&mut stream).await?;
        if request.command != Command::Connect {
            Response::failure(REP_COMMAND_NOT_SUPPORTED)
                .write_to(&mut stream)
                .await?;
            return Err(Error::unsupported(format!(
                "{:?} not supported",
                request.command
            )));
        }

        debug!(
            "Forwarder CONNECT {} -> {} via {}",
            peer_addr,
            request.address.to_string_with_port(request.port),
            self.upstream
        );

        // Step 3: replay against the upstream with credentials
        let mut upstream = match self.dial_upstream(&request.address, request.port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                Response::failure(reply_code(&e))
                    .write_to(&mut stream)
                    .await?;
                return Err(e);
            }
        };

        let local_addr = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        Response::success(Address::from(local_addr.ip()), local_addr.port())
            .write_to(&mut stream)
            .await?;

        // Step 4: relay
        let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        debug!(
            "Forwarder CONNECT {} completed (sent: {}, received: {})",
            peer_addr, sent, received
        );
        Ok(())
    }

    async fn dial_upstream(&self, address: &Address, port: u16) -> Result<TcpStream> {
        let mut upstream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.upstream))
            .await
            .map_err(|_| Error::timeout("Upstream connection timeout"))??;
        configure_tcp_stream(&upstream);

        client_connect(&mut upstream, Some(&self.credentials), address, port).await?;
        Ok(upstream)
    }
}

/// Reply sent to the local client when the upstream leg fails
fn reply_code(e: &Error) -> u8 {
    match e {
        Error::SocksReply(code) => *code,
        Error::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        Error::Timeout(_) => REP_TTL_EXPIRED,
        _ => REP_GENERAL_FAILURE,
    }
}

/// Runs a [`Socks5Forwarder`] as a supervised unit
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwarderLauncher;

#[async_trait]
impl Launcher for ForwarderLauncher {
    async fn launch(&self, ctx: LaunchContext, shutdown: CancellationToken) -> Result<Unit> {
        let BackendArgs::Forwarder(ref target) = ctx.args else {
            return Err(Error::internal(format!(
                "{} launched without a forwarder target",
                ctx.kind
            )));
        };

        let listener = TcpListener::bind(loopback_addr(ctx.ports.primary())).await?;
        Ok(Arc::new(Socks5Forwarder::new(target))
            .serve_listener(listener, shutdown)
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::common::socks::{AuthMethodFlags, REP_HOST_UNREACHABLE, SOCKS5_VERSION};
    use crate::environment::PtEnvironment;
    use crate::launcher::PortMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal SOCKS5 server that requires `user`/`secret` and echoes
    async fn upstream_requiring_auth() -> (u16, tokio::task::JoinHandle<(String, String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let methods = AuthMethodFlags::read_from(&mut stream).await.unwrap();
            assert!(methods.username_password);
            AuthResponse::new(AUTH_USERNAME_PASSWORD)
                .write_to(&mut stream)
                .await
                .unwrap();
            let auth = UsernamePasswordAuth::read_from(&mut stream).await.unwrap();
            UsernamePasswordAuth::write_response(&mut stream, true)
                .await
                .unwrap();
            let request = Request::read_from(&mut stream).await.unwrap();
            Response::success(Address::Ipv4(Ipv4Addr::LOCALHOST), 0)
                .write_to(&mut stream)
                .await
                .unwrap();

            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();

            (
                auth.username,
                auth.password,
                request.address.to_string_with_port(request.port),
            )
        });

        (port, handle)
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn connect_with_retry(port: u16) -> TcpStream {
        for _ in 0..50 {
            if let Ok(stream) = TcpStream::connect(loopback_addr(port)).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("forwarder did not start on {}", port);
    }

    #[tokio::test]
    async fn test_forwarder_injects_credentials() {
        let (upstream_port, upstream) = upstream_requiring_auth().await;
        let target = ForwarderTarget {
            user: "user".to_string(),
            password: "secret".to_string(),
            upstream: loopback_addr(upstream_port),
        };

        let port = free_port().await;
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(
            Arc::new(Socks5Forwarder::new(&target)).serve(port, shutdown.clone()),
        );

        let mut client = connect_with_retry(port).await;
        client_connect(
            &mut client,
            None,
            &Address::Domain("bridge.example".to_string()),
            443,
        )
        .await
        .unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        let (user, password, destination) = upstream.await.unwrap();
        assert_eq!(user, "user");
        assert_eq!(password, "secret");
        assert_eq!(destination, "bridge.example:443");

        shutdown.cancel();
        let result = timeout(Duration::from_secs(2), server).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_forwarder_reports_unreachable_upstream() {
        let target = ForwarderTarget {
            user: "user".to_string(),
            password: "secret".to_string(),
            upstream: loopback_addr(free_port().await),
        };

        let port = free_port().await;
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::new(Socks5Forwarder::new(&target)).serve(port, shutdown.clone()));

        let mut client = connect_with_retry(port).await;
        client
            .write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
            .await
            .unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [SOCKS5_VERSION, AUTH_NO_AUTH]);

        client
            .write_all(&[SOCKS5_VERSION, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_CONNECTION_REFUSED);

        shutdown.cancel();
    }

    /// SOCKS5 server that accepts credentials and fails every CONNECT with `code`
    async fn upstream_failing_with(code: u8) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            AuthMethodFlags::read_from(&mut stream).await.unwrap();
            AuthResponse::new(AUTH_USERNAME_PASSWORD)
                .write_to(&mut stream)
                .await
                .unwrap();
            UsernamePasswordAuth::read_from(&mut stream).await.unwrap();
            UsernamePasswordAuth::write_response(&mut stream, true)
                .await
                .unwrap();
            Request::read_from(&mut stream).await.unwrap();
            Response::failure(code).write_to(&mut stream).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_forwarder_passes_upstream_reply_through() {
        let target = ForwarderTarget {
            user: "user".to_string(),
            password: "secret".to_string(),
            upstream: loopback_addr(upstream_failing_with(REP_HOST_UNREACHABLE).await),
        };

        let port = free_port().await;
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::new(Socks5Forwarder::new(&target)).serve(port, shutdown.clone()));

        let mut client = connect_with_retry(port).await;
        let err = client_connect(
            &mut client,
            None,
            &Address::Domain("bridge.example".to_string()),
            443,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SocksReply(REP_HOST_UNREACHABLE)));

        shutdown.cancel();
    }

    #[test]
    fn test_reply_code_mapping() {
        assert_eq!(reply_code(&Error::SocksReply(REP_TTL_EXPIRED)), REP_TTL_EXPIRED);
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(reply_code(&Error::Io(refused)), REP_CONNECTION_REFUSED);
        assert_eq!(reply_code(&Error::protocol("bad version")), REP_GENERAL_FAILURE);
    }

    #[tokio::test]
    async fn test_launch_fails_when_port_taken() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let kind = BackendKind::Obfs4Forwarder;
        let ctx = LaunchContext {
            kind,
            ports: PortMap::new(kind.listeners(), &[port]),
            env: PtEnvironment::new(std::env::temp_dir()),
            args: BackendArgs::Forwarder(ForwarderTarget {
                user: String::new(),
                password: String::new(),
                upstream: loopback_addr(1),
            }),
        };

        let result = ForwarderLauncher.launch(ctx, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_forwarder_rejects_bind() {
        let target = ForwarderTarget {
            user: String::new(),
            password: String::new(),
            upstream: loopback_addr(1),
        };

        let port = free_port().await;
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::new(Socks5Forwarder::new(&target)).serve(port, shutdown.clone()));

        let mut client = connect_with_retry(port).await;
        client
            .write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH])
            .await
            .unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        client
            .write_all(&[SOCKS5_VERSION, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);

        shutdown.cancel();
    }
}
