//! The mounted proxy volume.
//!
//! [`ProxyFs::mount`] binds the root node and entry to a lower path. Every
//! other operation of the volume lives in [`crate::delegate`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::channel::SendOutcome;
use crate::context::{HandlerGuard, ProxyContext};
use crate::delegate::{lift, ENTRY_OPS};
use crate::entry::{EntryBinder, ProxyEntry};
use crate::error::{LowerError, ProxyError, Result};
use crate::event::{EventKind, FsEvent};
use crate::handle::HandleTable;
use crate::lower::{LowerFilesystem, LowerVolumeRef};
use crate::node::{NodeTable, ProxyNode};
use crate::stats::{OperationType, ProxyStats};
use crate::types::NodeId;

/// Filesystem magic number of proxy volumes.
pub const PROXYFS_MAGIC: u32 = 0x2025_0710;

/// Name the filesystem registers under.
pub const FS_NAME: &str = "proxyfs";

/// Options for [`ProxyFs::mount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Maximum number of simultaneously open proxy handles
    pub max_open_handles: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self { max_open_handles: 4096 }
    }
}

/// What unmount finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmountReport {
    pub handles_closed: usize,
    pub entries_pruned: usize,
    pub nodes_released: usize,
}

/// A mounted proxy volume.
pub struct ProxyFs {
    id: Uuid,
    lower_path: PathBuf,
    mounted_at: SystemTime,
    options: MountOptions,
    lower_fs: Arc<dyn LowerFilesystem>,
    pub(crate) lower_volume: LowerVolumeRef,
    pub(crate) root: Arc<ProxyEntry>,
    pub(crate) nodes: NodeTable,
    pub(crate) handles: HandleTable,
    pub(crate) stats: Arc<ProxyStats>,
    context: Option<Arc<ProxyContext>>,
    unmounted: AtomicBool,
}

impl ProxyFs {
    /// Mounts a proxy volume over `lower_path` of `lower_fs`.
    pub fn mount(
        lower_fs: Arc<dyn LowerFilesystem>,
        lower_path: &Path,
        options: MountOptions,
    ) -> Result<Self> {
        info!(lower = %lower_path.display(), fs = lower_fs.name(), "Mounting proxy volume");

        let not_found = || ProxyError::LowerPathNotFound { path: lower_path.to_path_buf() };
        let lower = lower_fs.resolve_path(lower_path).map_err(|e| match e {
            LowerError::NotFound => not_found(),
            other => ProxyError::Lower { operation: "mount", errno: other.errno() },
        })?;
        let inode = lower.dentry.inode().ok_or_else(not_found)?;

        let nodes = NodeTable::new();
        let root_node = nodes.bind_root(inode);
        let lower_volume = lower.mount.volume();
        let root = ProxyEntry::new(
            OsString::new(),
            Weak::new(),
            lower.dentry,
            Some(lower.mount),
            Some(root_node),
        );
        root.install_ops(&ENTRY_OPS);

        let stats = Arc::new(ProxyStats::new());
        stats.increment_mounts();

        let fs = Self {
            id: Uuid::new_v4(),
            lower_path: lower_path.to_path_buf(),
            mounted_at: SystemTime::now(),
            handles: HandleTable::new(options.max_open_handles),
            options,
            lower_fs,
            lower_volume,
            root,
            nodes,
            stats,
            context: None,
            unmounted: AtomicBool::new(false),
        };
        info!(id = %fs.id, root = %fs.root_id(), "Mounted proxy volume");
        Ok(fs)
    }

    /// Attaches the service context used for lifecycle accounting and
    /// notifications.
    pub fn with_context(mut self, context: Arc<ProxyContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Closes every handle, prunes the entry tree and releases every node.
    /// Later calls do nothing.
    pub fn unmount(&self) -> UnmountReport {
        if self.unmounted.swap(true, Ordering::AcqRel) {
            return UnmountReport::default();
        }
        let handles_closed = self.handles.close_all();
        self.stats.release_active_handles(handles_closed as u64);
        let entries_pruned = self.root.prune();
        let nodes_released = self.nodes.clear();
        if let Err(e) = lift(OperationType::PutSuper, self.lower_volume.put_super()) {
            debug!(error = %e, "Lower put_super failed");
        }
        self.stats.decrement_mounts();

        let report = UnmountReport { handles_closed, entries_pruned, nodes_released };
        info!(id = %self.id, ?report, "Unmounted proxy volume");
        report
    }

    pub fn is_mounted(&self) -> bool {
        !self.unmounted.load(Ordering::Acquire)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn lower_path(&self) -> &Path {
        &self.lower_path
    }

    pub fn lower_fs(&self) -> &Arc<dyn LowerFilesystem> {
        &self.lower_fs
    }

    pub fn mounted_at(&self) -> SystemTime {
        self.mounted_at
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn magic(&self) -> u32 {
        PROXYFS_MAGIC
    }

    pub fn root(&self) -> &Arc<ProxyEntry> {
        &self.root
    }

    pub fn root_id(&self) -> NodeId {
        self.root.node().map_or(NodeId::new(0), |n| n.id())
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn context(&self) -> Option<&Arc<ProxyContext>> {
        self.context.as_ref()
    }

    pub fn binder(&self) -> EntryBinder<'_> {
        EntryBinder::new(&self.nodes)
    }

    pub fn show_options(&self) -> String {
        ",proxyfs=1".to_string()
    }

    pub fn show_devname(&self) -> String {
        FS_NAME.to_string()
    }

    pub fn show_path(&self) -> String {
        "/ (via proxyfs)".to_string()
    }

    pub fn show_stats(&self) -> String {
        self.stats.render()
    }

    /// The node with `id` and an entry naming it.
    pub(crate) fn locate(&self, id: NodeId) -> Result<(Arc<ProxyNode>, Arc<ProxyEntry>)> {
        if id == self.root_id() {
            let node = self.root.require_node()?;
            return Ok((node, Arc::clone(&self.root)));
        }
        let node = self.nodes.get(id)?;
        let entry = node
            .alias()
            .ok_or(ProxyError::Unbound { object: "node", binding: "entry" })?;
        Ok((node, entry))
    }

    /// Runs one forwarded operation with accounting.
    pub(crate) fn run<T>(&self, op: OperationType, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _handler: Option<HandlerGuard<'_>> = match &self.context {
            Some(ctx) => Some(ctx.enter()?),
            None => None,
        };
        self.stats.increment_operation(op);
        trace!(op = op.name(), "Forwarding");
        let result = f();
        if let Err(e) = &result {
            self.stats.increment_failures();
            debug!(op = op.name(), error = %e, "Operation failed");
        }
        result
    }

    /// Reports an activity to the monitor, if one is attached.
    pub(crate) fn emit(&self, kind: EventKind, node: NodeId, entry: &ProxyEntry, pid: u32) {
        let Some(ctx) = &self.context else {
            return;
        };
        let event = FsEvent::new(kind, node, entry.path().to_string_lossy(), pid);
        match ctx.notify(&event) {
            None | Some(SendOutcome::NoEndpoint | SendOutcome::NoSubscriber) => {}
            Some(outcome) => self.stats.record_event(outcome.is_delivered()),
        }
    }
}

impl std::fmt::Debug for ProxyFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyFs")
            .field("id", &self.id)
            .field("lower_path", &self.lower_path)
            .field("nodes", &self.nodes.len())
            .field("handles", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemFs;

    #[test]
    fn test_mount_binds_root() {
        let fs = MemFs::new();
        let proxy = ProxyFs::mount(Arc::new(fs.clone()), Path::new("/"), MountOptions::default()).unwrap();

        assert_eq!(proxy.root_id().get(), MemFs::ROOT_INO);
        assert_eq!(proxy.magic(), 0x20250710);
        assert_eq!(proxy.nodes().len(), 1);
        assert!(proxy.root().lower().is_ok());
    }

    #[test]
    fn test_mount_missing_lower_path() {
        let fs = MemFs::new();
        let err = ProxyFs::mount(Arc::new(fs), Path::new("/missing"), MountOptions::default()).unwrap_err();
        assert!(matches!(err, ProxyError::LowerPathNotFound { .. }));
        assert_eq!(err.to_string(), "Lower path not found: /missing");
    }

    #[test]
    fn test_mount_subdirectory() {
        let fs = MemFs::new();
        let ino = fs.add_dir("/srv");
        let proxy = ProxyFs::mount(Arc::new(fs), Path::new("/srv"), MountOptions::default()).unwrap();
        assert_eq!(proxy.root_id().get(), ino);
    }

    #[test]
    fn test_show_ops() {
        let fs = MemFs::new();
        let proxy = ProxyFs::mount(Arc::new(fs), Path::new("/"), MountOptions::default()).unwrap();
        assert_eq!(proxy.show_options(), ",proxyfs=1");
        assert_eq!(proxy.show_devname(), "proxyfs");
        assert_eq!(proxy.show_path(), "/ (via proxyfs)");
        assert!(proxy.show_stats().contains("mounts: 1"));
    }

    #[test]
    fn test_unmount_releases_everything() {
        let fs = MemFs::new();
        let proxy = ProxyFs::mount(Arc::new(fs.clone()), Path::new("/"), MountOptions::default()).unwrap();

        let report = proxy.unmount();
        assert_eq!(report.nodes_released, 1);
        assert_eq!(report.entries_pruned, 1);
        assert!(!proxy.is_mounted());
        assert_eq!(proxy.unmount(), UnmountReport::default());
        assert!(proxy.root().lower().is_err());
    }
}
