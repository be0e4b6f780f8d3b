//! SOCKS5 protocol implementation (RFC 1928 / RFC 1929)

use super::net::Address;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// Username/password sub-negotiation version
pub const USERPASS_VERSION: u8 = 0x01;

// SOCKS5 commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// SOCKS5 reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(Error::protocol(format!(
                "Unknown SOCKS5 command: {}",
                value
            ))),
        }
    }
}

/// Methods offered by a client greeting
#[derive(Debug, Clone, Copy)]
pub struct AuthMethodFlags {
    pub no_auth: bool,
    pub username_password: bool,
}

impl AuthMethodFlags {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                head[0]
            )));
        }

        let n = head[1] as usize;
        let mut methods = [0u8; 255];
        reader.read_exact(&mut methods[..n]).await?;

        let mut flags = Self {
            no_auth: false,
            username_password: false,
        };
        for &m in &methods[..n] {
            match m {
                AUTH_NO_AUTH => flags.no_auth = true,
                AUTH_USERNAME_PASSWORD => flags.username_password = true,
                _ => {}
            }
        }
        Ok(flags)
    }
}

/// SOCKS5 method selection reply
pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub fn new(method: u8) -> Self {
        AuthResponse { method }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, self.method]).await?;
        Ok(())
    }
}

/// SOCKS5 request
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                header[0]
            )));
        }

        let command = Command::try_from(header[1])?;

        // Reserved byte (header[2]) is ignored
        let (address, port) = Address::read_with_type(reader, header[3]).await?;

        Ok(Request {
            command,
            address,
            port,
        })
    }
}

/// SOCKS5 reply
pub struct Response {
    pub reply: u8,
    pub address: Address,
    pub port: u16,
}

impl Response {
    pub fn success(address: Address, port: u16) -> Self {
        Response {
            reply: REP_SUCCEEDED,
            address,
            port,
        }
    }

    pub fn failure(reply: u8) -> Self {
        Response {
            reply,
            address: Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(3 + self.address.len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.reply, 0x00]);
        self.address.encode(self.port, &mut buf)?;
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// Username/Password authentication
pub struct UsernamePasswordAuth {
    pub username: String,
    pub password: String,
}

impl UsernamePasswordAuth {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut version = [0u8; 1];
        reader.read_exact(&mut version).await?;

        if version[0] != USERPASS_VERSION {
            return Err(Error::protocol("Unsupported auth version"));
        }

        let mut ulen = [0u8; 1];
        reader.read_exact(&mut ulen).await?;
        let mut username = vec![0u8; ulen[0] as usize];
        reader.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        reader.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        reader.read_exact(&mut password).await?;

        Ok(UsernamePasswordAuth {
            username: String::from_utf8_lossy(&username).to_string(),
            password: String::from_utf8_lossy(&password).to_string(),
        })
    }

    pub async fn write_response<W: AsyncWrite + Unpin>(
        writer: &mut W,
        success: bool,
    ) -> Result<()> {
        let status = if success { 0x00 } else { 0x01 };
        writer.write_all(&[USERPASS_VERSION, status]).await?;
        Ok(())
    }
}

/// Credentials presented to an upstream SOCKS5 server
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Perform the client side of a SOCKS5 CONNECT over an established stream.
///
/// Offers username/password when `credentials` is set, otherwise no-auth only.
pub async fn client_connect<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    credentials: Option<&Credentials>,
    address: &Address,
    port: u16,
) -> Result<()> {
    // Greeting
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_NO_AUTH]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|e| Error::connection(format!("Failed to send SOCKS5 greeting: {}", e)))?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .map_err(|e| Error::connection(format!("Failed to read SOCKS5 response: {}", e)))?;

    if choice[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 version"));
    }

    match (choice[1], credentials) {
        (AUTH_NO_AUTH, _) => {}
        (AUTH_USERNAME_PASSWORD, Some(creds)) => {
            authenticate_password(stream, creds).await?;
        }
        (AUTH_NO_ACCEPTABLE, _) => {
            return Err(Error::auth("No acceptable authentication method"));
        }
        (method, _) => {
            return Err(Error::protocol(format!(
                "Unsupported authentication method: {}",
                method
            )));
        }
    }

    // Connect request
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    address.encode(port, &mut request)?;
    stream.write_all(&request).await.map_err(|e| {
        Error::connection(format!("Failed to send SOCKS5 connect request: {}", e))
    })?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| Error::connection(format!("Failed to read SOCKS5 reply: {}", e)))?;

    if reply[0] != SOCKS5_VERSION {
        return Err(Error::protocol("Invalid SOCKS5 version in reply"));
    }

    if reply[1] != REP_SUCCEEDED {
        return Err(Error::SocksReply(reply[1]));
    }

    // Skip bound address
    Address::read_with_type(stream, reply[3]).await?;

    debug!("SOCKS5 upstream connected to {}", address.to_string_with_port(port));
    Ok(())
}

async fn authenticate_password<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    credentials: &Credentials,
) -> Result<()> {
    let username = credentials.username.as_bytes();
    let password = credentials.password.as_bytes();

    if username.len() > 255 || password.len() > 255 {
        return Err(Error::auth("Username or password too long"));
    }

    let mut auth_request = Vec::with_capacity(3 + username.len() + password.len());
    auth_request.push(USERPASS_VERSION);
    auth_request.push(username.len() as u8);
    auth_request.extend_from_slice(username);
    auth_request.push(password.len() as u8);
    auth_request.extend_from_slice(password);

    stream.write_all(&auth_request).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;

    if response[1] != 0x00 {
        return Err(Error::auth("Upstream rejected credentials"));
    }

    Ok(())
}

/// Map an upstream reply code to the error message
pub fn reply_error_message(code: u8) -> String {
    match code {
        REP_GENERAL_FAILURE => "General SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "Connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "Network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "Host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "Connection refused".to_string(),
        REP_TTL_EXPIRED => "TTL expired".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "Command not supported".to_string(),
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "Address type not supported".to_string(),
        _ => format!("Unknown error: {}", code),
    }
}
