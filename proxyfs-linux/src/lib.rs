//! # ProxyFS Linux
//!
//! Linux host integration for ProxyFS:
//!
//! - [`host`]: a lower filesystem backed by the real directory tree
//! - [`fuse`]: serves a proxy volume to the kernel through FUSE
//! - [`socket`]: Unix datagram transport for monitor notifications
//! - [`diagdir`]: publishes the diagnostic endpoints as files

pub mod diagdir;
pub mod fuse;
pub mod host;
pub mod socket;

use std::io;

use proxyfs_core::ProxyError;
use thiserror::Error;

pub use fuse::{mount, BridgeOptions, FuseBridge};
pub use host::HostFs;
pub use socket::{ProcProbe, Subscriber, UnixTransport};

/// Errors of the host integration layer.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// A notification frame did not carry a valid event.
    #[error("Malformed notification: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, HostError>;
