//! Error types for the ProxyFS system.

use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a lower filesystem through the operation-forwarding
/// interface in [`crate::lower`].
#[derive(Debug, Error)]
pub enum LowerError {
    /// The lower filesystem has no implementation of the requested operation.
    #[error("operation not implemented by the lower filesystem")]
    NotImplemented,

    /// The named object does not exist in the lower filesystem.
    #[error("not found in the lower filesystem")]
    NotFound,

    /// The lower filesystem could not allocate an object.
    #[error("lower filesystem allocation failed")]
    AllocationFailure,

    /// The lower filesystem failed with an OS error number.
    #[error("lower filesystem error (errno {0})")]
    Os(i32),

    /// I/O error from the storage behind the lower filesystem.
    #[error("lower filesystem I/O error")]
    Io {
        #[from]
        #[source]
        source: std::io::Error,
    },
}

impl LowerError {
    /// Returns the errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            LowerError::NotImplemented => libc::ENOSYS,
            LowerError::NotFound => libc::ENOENT,
            LowerError::AllocationFailure => libc::ENOMEM,
            LowerError::Os(code) => *code,
            LowerError::Io { source } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result type alias for lower filesystem operations.
pub type LowerResult<T> = std::result::Result<T, LowerError>;

/// Comprehensive error type for all ProxyFS operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Resolution of a name failed.
    #[error("Not found: {name:?}")]
    NotFound {
        name: OsString,
    },

    /// The lower filesystem lacks an optional capability.
    #[error("Operation not supported: {operation}")]
    Unsupported {
        operation: &'static str,
    },

    /// The lower filesystem lacks a capability the operation cannot do without.
    #[error("Operation not possible: {operation}")]
    NotPossible {
        operation: &'static str,
    },

    /// The lower handle does not accept ioctl commands.
    #[error("Inappropriate ioctl 0x{cmd:x}")]
    NoIoctl {
        cmd: u32,
    },

    /// Memory or resource exhaustion.
    #[error("Allocation failure: {what}")]
    AllocationFailure {
        what: &'static str,
    },

    /// A proxy object is missing the lower binding the operation needs.
    #[error("Proxy {object} has no bound lower {binding}")]
    Unbound {
        object: &'static str,
        binding: &'static str,
    },

    /// A handle identifier that is not (or no longer) open.
    #[error("Invalid handle: {0}")]
    BadHandle(u64),

    /// A node identifier unknown to the node table.
    #[error("Unknown node: {0}")]
    UnknownNode(u64),

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The lower path passed to mount does not exist.
    #[error("Lower path not found: {}", path.display())]
    LowerPathNotFound {
        path: PathBuf,
    },

    /// The lower filesystem reported an error for the forwarded operation.
    #[error("Lower filesystem failed '{operation}' (errno {errno})")]
    Lower {
        operation: &'static str,
        errno: i32,
    },

    /// I/O error from the host system.
    #[error("I/O error")]
    Io {
        #[from]
        #[source]
        source: std::io::Error,
    },

    /// Every buffer of the notification pool is in use.
    #[error("Buffer pool exhausted: {count} buffers in use")]
    PoolExhausted {
        count: usize,
    },

    /// The notification pool was never initialised or already destroyed.
    #[error("Buffer pool is not initialised")]
    PoolUninitialized,

    /// Pool parameters that cannot produce a usable pool.
    #[error("Invalid buffer pool configuration: count {count}, size {size}")]
    InvalidPoolConfig {
        count: usize,
        size: usize,
    },

    /// A notification does not fit into a pool buffer.
    #[error("Message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        len: usize,
        max: usize,
    },

    /// The notification transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service context is not running.
    #[error("Service is not running")]
    NotRunning,

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// Returns the errno a host bridge should answer with.
    pub fn errno(&self) -> i32 {
        match self {
            ProxyError::NotFound { .. } => libc::ENOENT,
            ProxyError::Unsupported { .. } => libc::EOPNOTSUPP,
            ProxyError::NotPossible { .. } => libc::ENOSYS,
            ProxyError::NoIoctl { .. } => libc::ENOTTY,
            ProxyError::AllocationFailure { .. } => libc::ENOMEM,
            ProxyError::Unbound { .. } => libc::EINVAL,
            ProxyError::BadHandle(_) => libc::EBADF,
            ProxyError::UnknownNode(_) => libc::ENOENT,
            ProxyError::InvalidArgument(_) => libc::EINVAL,
            ProxyError::LowerPathNotFound { .. } => libc::ENOENT,
            ProxyError::Lower { errno, .. } => *errno,
            ProxyError::Io { source } => source.raw_os_error().unwrap_or(libc::EIO),
            ProxyError::PoolExhausted { .. } => libc::ENOBUFS,
            ProxyError::PoolUninitialized => libc::ENODEV,
            ProxyError::InvalidPoolConfig { .. } => libc::EINVAL,
            ProxyError::MessageTooLarge { .. } => libc::EMSGSIZE,
            ProxyError::Transport(_) => libc::EPIPE,
            ProxyError::NotRunning => libc::ESHUTDOWN,
            ProxyError::Config(_) => libc::EINVAL,
        }
    }

    /// Returns true for the soft conditions that never fail a filesystem call.
    pub fn is_soft(&self) -> bool {
        matches!(self, ProxyError::PoolExhausted { .. })
    }
}

/// Result type alias for ProxyFS operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::NotFound { name: OsString::from("missing") };
        assert_eq!(err.to_string(), "Not found: \"missing\"");

        let err = ProxyError::Unsupported { operation: "statfs" };
        assert_eq!(err.to_string(), "Operation not supported: statfs");

        let err = ProxyError::NotPossible { operation: "create" };
        assert_eq!(err.to_string(), "Operation not possible: create");

        let err = ProxyError::Unbound { object: "entry", binding: "entry" };
        assert_eq!(err.to_string(), "Proxy entry has no bound lower entry");

        let err = ProxyError::LowerPathNotFound { path: PathBuf::from("/lower") };
        assert_eq!(err.to_string(), "Lower path not found: /lower");

        let err = ProxyError::MessageTooLarge { len: 2048, max: 1008 };
        assert_eq!(err.to_string(), "Message of 2048 bytes exceeds the 1008 byte limit");
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(ProxyError::Unsupported { operation: "x" }.errno(), libc::EOPNOTSUPP);
        assert_eq!(ProxyError::NotPossible { operation: "x" }.errno(), libc::ENOSYS);
        assert_eq!(ProxyError::NoIoctl { cmd: 1 }.errno(), libc::ENOTTY);
        assert_eq!(ProxyError::BadHandle(7).errno(), libc::EBADF);
        assert_eq!(ProxyError::Lower { operation: "read", errno: libc::EACCES }.errno(), libc::EACCES);
        assert_eq!(LowerError::Os(libc::EXDEV).errno(), libc::EXDEV);
        assert_eq!(LowerError::NotFound.errno(), libc::ENOENT);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::from_raw_os_error(libc::EPERM);
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io { .. }));
        assert_eq!(proxy_err.errno(), libc::EPERM);

        let lower_err: LowerError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(lower_err.errno(), libc::EIO);
    }
}
