//! Forwarding of every proxy operation to the lower filesystem.
//!
//! The operations are grouped by family, one module each: entry
//! validation, node metadata and structure, handle I/O, volume-level
//! operations and cached pages. Each one translates proxy objects to their
//! bound lower objects, forwards the call, and updates the proxy graph as
//! the lower result directs.
//!
//! When the lower filesystem does not implement an operation, the
//! operation's [`Fallback`] decides what the caller sees.

mod entry;
mod handle;
mod mapping;
mod node;
mod volume;

pub use entry::ENTRY_OPS;
pub use node::InvalidateOutcome;

use crate::error::{LowerError, LowerResult, ProxyError, Result};
use crate::stats::OperationType;

/// Reply for an operation the lower filesystem does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Succeed without doing anything
    Noop,
    /// Optional capability: `EOPNOTSUPP`
    Unsupported,
    /// Capability the operation cannot do without: `ENOSYS`
    NotPossible,
    /// `ENOTTY`
    NoIoctl,
    /// The proxy applies the generic behaviour itself
    Builtin,
}

impl OperationType {
    pub fn fallback(&self) -> Fallback {
        use OperationType::*;
        match self {
            Lookup | Invalidate | Release | Flush | Fsync | CheckFlags | Fadvise | DirtyInode
            | WriteInode | DropInode | EvictInode | PutSuper | SyncFs | FreezeSuper | FreezeFs
            | ThawSuper | UnfreezeFs | UmountBegin | NrCachedObjects | FreeCachedObjects
            | Shutdown | InvalidateRange => Fallback::Noop,

            Revalidate | WeakRevalidate | HashName | CompareNames | DeleteEntry => Fallback::Builtin,

            Statfs | RemountFs | QuotaRead | QuotaWrite | Getxattr | Setxattr | Removexattr
            | FileattrGet | FileattrSet | Fallocate | CopyFileRange | RemapFileRange
            | Setlease | ReadFolio | Writepage | Writepages | DirtyFolio | Readahead
            | WriteBegin | WriteEnd | Bmap | InvalidateFolio | ReleaseFolio | DirectIo
            | LaunderFolio | IsPartiallyUptodate => Fallback::Unsupported,

            Ioctl | CompatIoctl => Fallback::NoIoctl,

            GetLink | Permission | GetInodeAcl | Readlink | Create | Link | Unlink | Symlink
            | Mkdir | Rmdir | Mknod | Rename | Setattr | Getattr | Listxattr | Fiemap
            | UpdateTime | AtomicOpen | Tmpfile | GetAcl | SetAcl | Open | Llseek | Read
            | Write | ReadIter | WriteIter | Iterate | Mmap | Fasync | Lock | Flock
            | SpliceRead | SpliceWrite => Fallback::NotPossible,
        }
    }
}

/// Translates a lower failure of `op` into the proxy's error.
pub(crate) fn lower_error(op: OperationType, err: LowerError) -> ProxyError {
    match err {
        LowerError::NotImplemented => match op.fallback() {
            Fallback::Unsupported => ProxyError::Unsupported { operation: op.name() },
            Fallback::NoIoctl => ProxyError::NoIoctl { cmd: 0 },
            Fallback::NotPossible | Fallback::Noop | Fallback::Builtin => {
                ProxyError::NotPossible { operation: op.name() }
            }
        },
        LowerError::AllocationFailure => ProxyError::AllocationFailure { what: op.name() },
        other => ProxyError::Lower { operation: op.name(), errno: other.errno() },
    }
}

/// Lifts a lower result, turning a missing no-op operation into success.
pub(crate) fn lift<T: Default>(op: OperationType, result: LowerResult<T>) -> Result<T> {
    match result {
        Err(LowerError::NotImplemented) if op.fallback() == Fallback::Noop => Ok(T::default()),
        other => other.map_err(|e| lower_error(op, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_policy() {
        assert_eq!(OperationType::Flush.fallback(), Fallback::Noop);
        assert_eq!(OperationType::SyncFs.fallback(), Fallback::Noop);
        assert_eq!(OperationType::Statfs.fallback(), Fallback::Unsupported);
        assert_eq!(OperationType::ReadFolio.fallback(), Fallback::Unsupported);
        assert_eq!(OperationType::Create.fallback(), Fallback::NotPossible);
        assert_eq!(OperationType::Llseek.fallback(), Fallback::NotPossible);
        assert_eq!(OperationType::Ioctl.fallback(), Fallback::NoIoctl);
        assert_eq!(OperationType::Revalidate.fallback(), Fallback::Builtin);
    }

    #[test]
    fn test_lift() {
        assert!(lift::<()>(OperationType::Fsync, Err(LowerError::NotImplemented)).is_ok());
        assert_eq!(lift::<u64>(OperationType::NrCachedObjects, Err(LowerError::NotImplemented)).unwrap(), 0);

        let err = lift::<()>(OperationType::Mkdir, Err(LowerError::NotImplemented)).unwrap_err();
        assert_eq!(err.errno(), libc::ENOSYS);

        let err = lift::<()>(OperationType::Statfs, Err(LowerError::NotImplemented)).unwrap_err();
        assert_eq!(err.errno(), libc::EOPNOTSUPP);

        let err = lift::<()>(OperationType::Unlink, Err(LowerError::Os(libc::EACCES))).unwrap_err();
        assert!(matches!(err, ProxyError::Lower { operation: "unlink", errno } if errno == libc::EACCES));

        let err = lift::<()>(OperationType::Flush, Err(LowerError::NotFound)).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
