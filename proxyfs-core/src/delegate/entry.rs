//! Entry validation.

use std::collections::hash_map::DefaultHasher;
use std::ffi::OsStr;
use std::hash::{Hash, Hasher};

use tracing::trace;

use super::lower_error;
use crate::entry::{EntryOps, ProxyEntry};
use crate::error::{LowerError, LowerResult, Result};
use crate::lower::LowerDentry;
use crate::stats::OperationType;

/// Dispatch table installed on every entry the binder creates.
pub static ENTRY_OPS: EntryOps = EntryOps {
    revalidate,
    weak_revalidate,
    hash: hash_name,
    compare: compare_names,
    delete,
};

/// Forwards to the lower entry; `builtin` answers when the lower entry
/// leaves the operation to the generic code.
fn forward<T>(
    op: OperationType,
    entry: &ProxyEntry,
    call: impl FnOnce(&dyn LowerDentry) -> LowerResult<T>,
    builtin: impl FnOnce() -> T,
) -> Result<T> {
    trace!(op = op.name(), entry = ?entry.name(), "Forwarding");
    let lower = entry.lower()?;
    match call(lower.as_ref()) {
        Ok(value) => Ok(value),
        Err(LowerError::NotImplemented) => Ok(builtin()),
        Err(e) => Err(lower_error(op, e)),
    }
}

fn revalidate(entry: &ProxyEntry, flags: u32) -> Result<bool> {
    forward(OperationType::Revalidate, entry, |d| d.revalidate(flags), || !entry.is_pruned())
}

fn weak_revalidate(entry: &ProxyEntry, flags: u32) -> Result<bool> {
    forward(OperationType::WeakRevalidate, entry, |d| d.weak_revalidate(flags), || !entry.is_pruned())
}

fn hash_name(entry: &ProxyEntry, name: &OsStr) -> Result<u64> {
    forward(OperationType::HashName, entry, |d| d.hash(name), || {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        hasher.finish()
    })
}

fn compare_names(entry: &ProxyEntry, name: &OsStr, other: &OsStr) -> Result<bool> {
    forward(OperationType::CompareNames, entry, |d| d.compare(name, other), || name == other)
}

fn delete(entry: &ProxyEntry) -> Result<bool> {
    forward(OperationType::DeleteEntry, entry, |d| d.delete(), || false)
}

#[cfg(test)]
mod tests {
    use crate::memfs::MemFs;
    use crate::volume::{MountOptions, ProxyFs};
    use std::ffi::OsStr;
    use std::path::Path;
    use std::sync::Arc;

    #[test]
    fn test_builtin_entry_ops() {
        let fs = MemFs::new();
        fs.add_file("/a", b"");
        let proxy = ProxyFs::mount(Arc::new(fs), Path::new("/"), MountOptions::default()).unwrap();
        let entry = proxy.binder().resolve(proxy.root(), OsStr::new("a")).unwrap();

        assert!(entry.revalidate(0).unwrap());
        assert!(entry.weak_revalidate(0).unwrap());
        assert!(!entry.should_delete().unwrap());
        assert!(entry.compare_names(OsStr::new("x"), OsStr::new("x")).unwrap());
        assert!(!entry.compare_names(OsStr::new("x"), OsStr::new("y")).unwrap());
        assert_eq!(
            entry.hash_name(OsStr::new("k")).unwrap(),
            entry.hash_name(OsStr::new("k")).unwrap()
        );
    }

    #[test]
    fn test_lower_entry_ops_win() {
        let fs = MemFs::new();
        fs.add_file("/Readme", b"");
        fs.set_case_insensitive(true);
        let proxy = ProxyFs::mount(Arc::new(fs.clone()), Path::new("/"), MountOptions::default()).unwrap();
        let entry = proxy.binder().resolve(proxy.root(), OsStr::new("Readme")).unwrap();

        assert!(entry.compare_names(OsStr::new("README"), OsStr::new("readme")).unwrap());
        assert_eq!(
            entry.hash_name(OsStr::new("README")).unwrap(),
            entry.hash_name(OsStr::new("readme")).unwrap()
        );

        fs.remove_path("/Readme");
        assert!(!entry.revalidate(0).unwrap());
    }

    #[test]
    fn test_pruned_entry_is_unbound() {
        let fs = MemFs::new();
        fs.add_file("/a", b"");
        let proxy = ProxyFs::mount(Arc::new(fs), Path::new("/"), MountOptions::default()).unwrap();
        let entry = proxy.binder().resolve(proxy.root(), OsStr::new("a")).unwrap();

        entry.prune();
        assert!(entry.revalidate(0).is_err());
    }
}
