//! Common utilities and types

pub mod error;
pub mod net;
pub mod socks;

pub use error::{Error, Result};
