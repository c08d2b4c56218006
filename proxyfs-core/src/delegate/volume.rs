//! Volume-level operations.

use tracing::info;

use super::lift;
use crate::error::{LowerResult, Result};
use crate::lower::{LowerInodeRef, LowerVolume};
use crate::stats::OperationType;
use crate::types::{NodeId, StatFs};
use crate::volume::ProxyFs;

impl ProxyFs {
    fn with_volume<T: Default>(
        &self,
        op: OperationType,
        call: impl FnOnce(&dyn LowerVolume) -> LowerResult<T>,
    ) -> Result<T> {
        self.run(op, || lift(op, call(self.lower_volume.as_ref())))
    }

    fn with_volume_node<T: Default>(
        &self,
        op: OperationType,
        id: NodeId,
        call: impl FnOnce(&dyn LowerVolume, &LowerInodeRef) -> LowerResult<T>,
    ) -> Result<T> {
        self.run(op, || {
            let node = self.nodes.get(id)?;
            lift(op, call(self.lower_volume.as_ref(), node.lower()))
        })
    }

    pub fn dirty_node(&self, id: NodeId, flags: i32) -> Result<()> {
        self.with_volume_node(OperationType::DirtyInode, id, |v, inode| v.dirty_inode(inode, flags))
    }

    pub fn write_node(&self, id: NodeId, sync: bool) -> Result<()> {
        self.with_volume_node(OperationType::WriteInode, id, |v, inode| v.write_inode(inode, sync))
    }

    /// Whether the lower volume wants the node dropped once unused.
    pub fn drop_node(&self, id: NodeId) -> Result<bool> {
        self.with_volume_node(OperationType::DropInode, id, |v, inode| v.drop_inode(inode))
    }

    pub fn evict_node(&self, id: NodeId) -> Result<()> {
        self.with_volume_node(OperationType::EvictInode, id, |v, inode| v.evict_inode(inode))
    }

    pub fn sync_fs(&self, wait: bool) -> Result<()> {
        self.with_volume(OperationType::SyncFs, |v| v.sync_fs(wait))
    }

    pub fn freeze_super(&self, who: u32) -> Result<()> {
        self.with_volume(OperationType::FreezeSuper, |v| v.freeze_super(who))
    }

    pub fn thaw_super(&self, who: u32) -> Result<()> {
        self.with_volume(OperationType::ThawSuper, |v| v.thaw_super(who))
    }

    pub fn freeze_fs(&self) -> Result<()> {
        self.with_volume(OperationType::FreezeFs, |v| v.freeze_fs())
    }

    pub fn unfreeze_fs(&self) -> Result<()> {
        self.with_volume(OperationType::UnfreezeFs, |v| v.unfreeze_fs())
    }

    /// Statistics of the lower volume, queried through the root entry.
    pub fn statfs(&self) -> Result<StatFs> {
        self.run(OperationType::Statfs, || {
            let root = self.root.lower()?;
            lift(OperationType::Statfs, self.lower_volume.statfs(&root))
        })
    }

    /// Forwards a remount, returning the flags the lower volume settled on.
    pub fn remount(&self, flags: u32, data: &str) -> Result<u32> {
        let mut flags = flags;
        self.with_volume(OperationType::RemountFs, |v| v.remount_fs(&mut flags, data))?;
        info!(flags, "Remounted proxy volume");
        Ok(flags)
    }

    pub fn umount_begin(&self) -> Result<()> {
        self.with_volume(OperationType::UmountBegin, |v| v.umount_begin())
    }

    pub fn quota_read(&self, typ: i32, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.with_volume(OperationType::QuotaRead, |v| v.quota_read(typ, offset, len))
    }

    pub fn quota_write(&self, typ: i32, offset: u64, data: &[u8]) -> Result<usize> {
        self.with_volume(OperationType::QuotaWrite, |v| v.quota_write(typ, offset, data))
    }

    pub fn nr_cached_objects(&self) -> Result<u64> {
        self.with_volume(OperationType::NrCachedObjects, |v| v.nr_cached_objects())
    }

    pub fn free_cached_objects(&self, nr_to_scan: u64) -> Result<u64> {
        self.with_volume(OperationType::FreeCachedObjects, |v| v.free_cached_objects(nr_to_scan))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.with_volume(OperationType::Shutdown, |v| v.shutdown())
    }
}
