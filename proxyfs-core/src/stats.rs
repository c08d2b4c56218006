//! Operation counters for a mounted ProxyFS volume.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

macro_rules! operation_types {
    ($($variant:ident => $name:literal,)*) => {
        /// Every operation the proxy forwards to the lower filesystem.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum OperationType {
            $($variant,)*
        }

        impl OperationType {
            /// All operation types, in declaration order.
            pub const ALL: &'static [OperationType] = &[$(OperationType::$variant,)*];

            /// Returns a human-readable name for the operation type.
            pub fn name(&self) -> &'static str {
                match self {
                    $(OperationType::$variant => $name,)*
                }
            }
        }
    };
}

operation_types! {
    // entry validation
    Lookup => "lookup",
    Revalidate => "d_revalidate",
    WeakRevalidate => "d_weak_revalidate",
    HashName => "d_hash",
    CompareNames => "d_compare",
    DeleteEntry => "d_delete",
    Invalidate => "invalidate",
    // node metadata and structure
    GetLink => "get_link",
    Permission => "permission",
    GetInodeAcl => "get_inode_acl",
    Readlink => "readlink",
    Create => "create",
    Link => "link",
    Unlink => "unlink",
    Symlink => "symlink",
    Mkdir => "mkdir",
    Rmdir => "rmdir",
    Mknod => "mknod",
    Rename => "rename",
    Setattr => "setattr",
    Getattr => "getattr",
    Listxattr => "listxattr",
    Getxattr => "getxattr",
    Setxattr => "setxattr",
    Removexattr => "removexattr",
    Fiemap => "fiemap",
    UpdateTime => "update_time",
    AtomicOpen => "atomic_open",
    Tmpfile => "tmpfile",
    GetAcl => "get_acl",
    SetAcl => "set_acl",
    FileattrGet => "fileattr_get",
    FileattrSet => "fileattr_set",
    // handle I/O
    Open => "open",
    Release => "release",
    Llseek => "llseek",
    Read => "read",
    Write => "write",
    ReadIter => "read_iter",
    WriteIter => "write_iter",
    Iterate => "iterate_shared",
    Ioctl => "unlocked_ioctl",
    CompatIoctl => "compat_ioctl",
    Mmap => "mmap",
    Flush => "flush",
    Fsync => "fsync",
    Fasync => "fasync",
    Lock => "lock",
    Flock => "flock",
    CheckFlags => "check_flags",
    SpliceRead => "splice_read",
    SpliceWrite => "splice_write",
    CopyFileRange => "copy_file_range",
    RemapFileRange => "remap_file_range",
    Fallocate => "fallocate",
    Fadvise => "fadvise",
    Setlease => "setlease",
    // volume
    DirtyInode => "dirty_inode",
    WriteInode => "write_inode",
    DropInode => "drop_inode",
    EvictInode => "evict_inode",
    PutSuper => "put_super",
    SyncFs => "sync_fs",
    FreezeSuper => "freeze_super",
    FreezeFs => "freeze_fs",
    ThawSuper => "thaw_super",
    UnfreezeFs => "unfreeze_fs",
    Statfs => "statfs",
    RemountFs => "remount_fs",
    UmountBegin => "umount_begin",
    QuotaRead => "quota_read",
    QuotaWrite => "quota_write",
    NrCachedObjects => "nr_cached_objects",
    FreeCachedObjects => "free_cached_objects",
    Shutdown => "shutdown",
    // cached pages
    ReadFolio => "read_folio",
    Writepage => "writepage",
    Writepages => "writepages",
    DirtyFolio => "dirty_folio",
    Readahead => "readahead",
    WriteBegin => "write_begin",
    WriteEnd => "write_end",
    Bmap => "bmap",
    InvalidateFolio => "invalidate_folio",
    InvalidateRange => "invalidate_range",
    ReleaseFolio => "release_folio",
    DirectIo => "direct_IO",
    LaunderFolio => "launder_folio",
    IsPartiallyUptodate => "is_partially_uptodate",
}

/// Counters for a mounted volume.
pub struct ProxyStats {
    /// Number of active mounts
    pub mount_count: AtomicU64,

    /// Count of forwarded operations by type
    operation_counts: RwLock<HashMap<OperationType, AtomicU64>>,

    /// Operations that returned an error
    pub failed_operations: AtomicU64,

    /// Total bytes read through proxy handles
    pub bytes_read: AtomicU64,

    /// Total bytes written through proxy handles
    pub bytes_written: AtomicU64,

    /// Number of currently open proxy handles
    pub active_handles: AtomicU64,

    /// Notifications handed to the channel
    pub events_sent: AtomicU64,

    /// Notifications dropped by the channel
    pub events_dropped: AtomicU64,
}

impl ProxyStats {
    /// Creates a new ProxyStats instance with all counters at zero.
    pub fn new() -> Self {
        let operation_counts = OperationType::ALL
            .iter()
            .map(|op| (*op, AtomicU64::new(0)))
            .collect();

        Self {
            mount_count: AtomicU64::new(0),
            operation_counts: RwLock::new(operation_counts),
            failed_operations: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            active_handles: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    /// Increments the count for a specific operation type.
    pub fn increment_operation(&self, op_type: OperationType) {
        let counts = self.operation_counts.read();
        if let Some(counter) = counts.get(&op_type) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Gets the count for a specific operation type.
    pub fn get_operation_count(&self, op_type: OperationType) -> u64 {
        let counts = self.operation_counts.read();
        counts
            .get(&op_type)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Returns a snapshot of all operation counts.
    pub fn get_all_operation_counts(&self) -> HashMap<OperationType, u64> {
        let counts = self.operation_counts.read();
        counts
            .iter()
            .map(|(op_type, counter)| (*op_type, counter.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn increment_failures(&self) {
        self.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_mounts(&self) {
        self.mount_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_mounts(&self) {
        self.mount_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_active_handles(&self) {
        self.active_handles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_active_handles(&self) {
        self.active_handles.fetch_sub(1, Ordering::Relaxed);
    }

    /// Drops `count` handles closed in bulk, as at unmount.
    pub fn release_active_handles(&self, count: u64) {
        let _ = self
            .active_handles
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(count)));
    }

    pub fn record_event(&self, delivered: bool) {
        if delivered {
            self.events_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Renders the counters as the text of the volume's stats report.
    /// Operations that were never called are omitted.
    pub fn render(&self) -> String {
        let mut out = String::from("ProxyFS statistics:\n");
        let _ = writeln!(out, "  mounts: {}", self.mount_count.load(Ordering::Relaxed));
        let _ = writeln!(out, "  open handles: {}", self.active_handles.load(Ordering::Relaxed));
        let _ = writeln!(out, "  bytes read: {}", self.bytes_read.load(Ordering::Relaxed));
        let _ = writeln!(out, "  bytes written: {}", self.bytes_written.load(Ordering::Relaxed));
        let _ = writeln!(out, "  failed operations: {}", self.failed_operations.load(Ordering::Relaxed));
        let _ = writeln!(
            out,
            "  events: {} sent, {} dropped",
            self.events_sent.load(Ordering::Relaxed),
            self.events_dropped.load(Ordering::Relaxed)
        );

        let counts = self.get_all_operation_counts();
        for op in OperationType::ALL {
            let count = counts.get(op).copied().unwrap_or(0);
            if count > 0 {
                let _ = writeln!(out, "  {}: {}", op.name(), count);
            }
        }
        out
    }

    /// Resets all statistics to zero.
    pub fn reset(&self) {
        self.mount_count.store(0, Ordering::Relaxed);
        self.failed_operations.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.active_handles.store(0, Ordering::Relaxed);
        self.events_sent.store(0, Ordering::Relaxed);
        self.events_dropped.store(0, Ordering::Relaxed);

        let counts = self.operation_counts.read();
        for counter in counts.values() {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_stats_new() {
        let stats = ProxyStats::new();

        assert_eq!(stats.mount_count.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 0);
        assert_eq!(stats.active_handles.load(Ordering::Relaxed), 0);

        for op_type in OperationType::ALL {
            assert_eq!(stats.get_operation_count(*op_type), 0);
        }
    }

    #[test]
    fn test_operation_counting() {
        let stats = ProxyStats::new();

        stats.increment_operation(OperationType::Read);
        stats.increment_operation(OperationType::Read);
        stats.increment_operation(OperationType::Write);

        assert_eq!(stats.get_operation_count(OperationType::Read), 2);
        assert_eq!(stats.get_operation_count(OperationType::Write), 1);
        assert_eq!(stats.get_operation_count(OperationType::Open), 0);
    }

    #[test]
    fn test_render_lists_used_operations() {
        let stats = ProxyStats::new();
        stats.increment_mounts();
        stats.increment_operation(OperationType::Mkdir);
        stats.record_event(true);
        stats.record_event(false);

        let text = stats.render();
        assert!(text.starts_with("ProxyFS statistics:\n"));
        assert!(text.contains("  mounts: 1\n"));
        assert!(text.contains("  mkdir: 1\n"));
        assert!(text.contains("  events: 1 sent, 1 dropped\n"));
        assert!(!text.contains("rmdir"));
    }

    #[test]
    fn test_reset() {
        let stats = ProxyStats::new();

        stats.increment_mounts();
        stats.add_bytes_read(1024);
        stats.add_bytes_written(512);
        stats.increment_active_handles();
        stats.increment_failures();
        stats.increment_operation(OperationType::Read);

        stats.reset();

        assert_eq!(stats.mount_count.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bytes_read.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bytes_written.load(Ordering::Relaxed), 0);
        assert_eq!(stats.active_handles.load(Ordering::Relaxed), 0);
        assert_eq!(stats.failed_operations.load(Ordering::Relaxed), 0);
        assert_eq!(stats.get_operation_count(OperationType::Read), 0);
    }

    #[test]
    fn test_operation_type_names() {
        assert_eq!(OperationType::Open.name(), "open");
        assert_eq!(OperationType::Iterate.name(), "iterate_shared");
        assert_eq!(OperationType::DirectIo.name(), "direct_IO");
        assert_eq!(OperationType::Statfs.name(), "statfs");
        assert_eq!(OperationType::ALL.len(), OperationType::IsPartiallyUptodate as usize + 1);
    }
}
