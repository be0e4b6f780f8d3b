//! Error types for the supervisor

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Supervisor error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared state directory is unusable. Backends cannot run without it.
    #[error(
        "Error with state location directory \"{}\":\n  {reason}\n  \
         The state location needs to be set to a writable directory.\n  \
         Use an app-private directory to avoid information leaks.\n  \
         Use a non-temporary directory to allow reuse of potentially stored state.",
        path.display()
    )]
    StateLocation { path: PathBuf, reason: String },

    #[error("Could not get home directory")]
    HomeDirectory,

    #[error("No available port in {start}..={end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    /// A SOCKS5 server answered a request with a non-success reply code
    #[error("SOCKS5 request failed: {}", crate::common::socks::reply_error_message(*.0))]
    SocksReply(u8),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn state_location<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Error::StateLocation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn launch<S: Into<String>>(msg: S) -> Self {
        Error::Launch(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Auth(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Fatal errors leave no backend able to run; callers should not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StateLocation { .. })
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
