//! The operation-forwarding interface consumed from the lower filesystem.
//!
//! A lower filesystem is described by five capability traits, one per
//! operation family: [`LowerDentry`] (entry validation), [`LowerInode`]
//! (node metadata and structural operations), [`LowerFile`] (handle I/O),
//! [`LowerVolume`] (volume-level operations) and [`LowerMapping`]
//! (cached-page operations). Every operation has a default body returning
//! [`LowerError::NotImplemented`]; an adapter implements only what its
//! storage supports and the delegator decides how a missing capability is
//! reported.
//!
//! References to lower objects are plain `Arc`/`Box` values. Holding one
//! retains the lower object; dropping it is the release.

use std::any::Any;
use std::ffi::{OsStr, OsString};
use std::io::{IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{LowerError, LowerResult};
use crate::types::{
    Acl, AclType, Credentials, DirEntry, Extent, FileAttrFlags, FileType, LockRequest,
    MapRequest, NodeAttr, OpenFlags, PageIndex, SetAttr, StatFs, Whence,
};

pub type LowerInodeRef = Arc<dyn LowerInode>;
pub type LowerDentryRef = Arc<dyn LowerDentry>;
pub type LowerMountRef = Arc<dyn LowerMount>;
pub type LowerVolumeRef = Arc<dyn LowerVolume>;
pub type LowerMappingRef = Arc<dyn LowerMapping>;
/// Lower handles are owned by exactly one proxy handle.
pub type LowerFileBox = Box<dyn LowerFile>;

/// Entry point of a lower filesystem.
pub trait LowerFilesystem: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Resolves an absolute path to a mounted lower entry.
    fn resolve_path(&self, path: &Path) -> LowerResult<LowerPath>;
}

/// A resolved lower location: the mount it lives on and its entry.
#[derive(Clone)]
pub struct LowerPath {
    pub mount: LowerMountRef,
    pub dentry: LowerDentryRef,
}

/// A mounted lower volume.
pub trait LowerMount: Send + Sync {
    /// Identifier unique among the lower filesystem's mounts.
    fn id(&self) -> u64;

    /// The volume behind this mount.
    fn volume(&self) -> LowerVolumeRef;
}

/// A lower directory entry.
pub trait LowerDentry: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Name of this entry under its parent.
    fn name(&self) -> OsString;

    /// The node this entry links to, `None` for a negative entry.
    fn inode(&self) -> Option<LowerInodeRef>;

    /// A mount stacked on this entry, if it is a mount point.
    fn mounted(&self) -> Option<LowerMountRef> {
        None
    }

    /// Finds an already cached child entry.
    fn lookup_cached(&self, name: &OsStr) -> Option<LowerDentryRef>;

    /// Allocates a new, still negative, child entry.
    fn alloc_child(&self, name: &OsStr) -> LowerResult<LowerDentryRef>;

    fn revalidate(&self, _flags: u32) -> LowerResult<bool> {
        Err(LowerError::NotImplemented)
    }

    fn weak_revalidate(&self, _flags: u32) -> LowerResult<bool> {
        Err(LowerError::NotImplemented)
    }

    fn hash(&self, _name: &OsStr) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    fn compare(&self, _name: &OsStr, _other: &OsStr) -> LowerResult<bool> {
        Err(LowerError::NotImplemented)
    }

    /// Whether the entry should be dropped as soon as it is unused.
    fn delete(&self) -> LowerResult<bool> {
        Err(LowerError::NotImplemented)
    }
}

/// A lower node: metadata and structural operations.
pub trait LowerInode: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn ino(&self) -> u64;

    fn kind(&self) -> FileType;

    /// Cached pages of this node.
    fn mapping(&self) -> Option<LowerMappingRef> {
        None
    }

    /// Looks `dentry` up in this directory, making it positive if found.
    fn lookup(&self, _dentry: &LowerDentryRef, _flags: u32) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    /// Opens the node reached through `dentry`.
    fn open(
        &self,
        _dentry: &LowerDentryRef,
        _flags: OpenFlags,
        _creds: &Credentials,
    ) -> LowerResult<LowerFileBox> {
        Err(LowerError::NotImplemented)
    }

    fn get_link(&self, _dentry: &LowerDentryRef) -> LowerResult<PathBuf> {
        Err(LowerError::NotImplemented)
    }

    fn permission(&self, _mask: i32, _creds: &Credentials) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn get_inode_acl(&self, _typ: AclType) -> LowerResult<Option<Acl>> {
        Err(LowerError::NotImplemented)
    }

    fn readlink(&self, _dentry: &LowerDentryRef) -> LowerResult<PathBuf> {
        Err(LowerError::NotImplemented)
    }

    fn create(
        &self,
        _dentry: &LowerDentryRef,
        _mode: u32,
        _excl: bool,
        _creds: &Credentials,
    ) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn link(&self, _old: &LowerDentryRef, _new: &LowerDentryRef) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn unlink(&self, _dentry: &LowerDentryRef) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn symlink(
        &self,
        _dentry: &LowerDentryRef,
        _target: &Path,
        _creds: &Credentials,
    ) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn mkdir(&self, _dentry: &LowerDentryRef, _mode: u32, _creds: &Credentials) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn rmdir(&self, _dentry: &LowerDentryRef) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn mknod(
        &self,
        _dentry: &LowerDentryRef,
        _mode: u32,
        _rdev: u32,
        _creds: &Credentials,
    ) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn rename(
        &self,
        _old: &LowerDentryRef,
        _new_dir: &LowerInodeRef,
        _new: &LowerDentryRef,
        _flags: u32,
    ) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn setattr(&self, _dentry: &LowerDentryRef, _attr: &SetAttr) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn getattr(&self, _dentry: &LowerDentryRef) -> LowerResult<NodeAttr> {
        Err(LowerError::NotImplemented)
    }

    fn listxattr(&self, _dentry: &LowerDentryRef) -> LowerResult<Vec<OsString>> {
        Err(LowerError::NotImplemented)
    }

    fn getxattr(&self, _dentry: &LowerDentryRef, _name: &OsStr) -> LowerResult<Vec<u8>> {
        Err(LowerError::NotImplemented)
    }

    fn setxattr(
        &self,
        _dentry: &LowerDentryRef,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
    ) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn removexattr(&self, _dentry: &LowerDentryRef, _name: &OsStr) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn fiemap(&self, _start: u64, _len: u64) -> LowerResult<Vec<Extent>> {
        Err(LowerError::NotImplemented)
    }

    fn update_time(&self, _flags: i32) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    /// Looks up, optionally creates, and opens `dentry` in one step.
    fn atomic_open(
        &self,
        _dentry: &LowerDentryRef,
        _flags: OpenFlags,
        _mode: u32,
        _creds: &Credentials,
    ) -> LowerResult<LowerFileBox> {
        Err(LowerError::NotImplemented)
    }

    /// Creates an unnamed node in this directory and opens it.
    fn tmpfile(&self, _mode: u32, _creds: &Credentials) -> LowerResult<LowerFileBox> {
        Err(LowerError::NotImplemented)
    }

    fn get_acl(&self, _dentry: &LowerDentryRef, _typ: AclType) -> LowerResult<Option<Acl>> {
        Err(LowerError::NotImplemented)
    }

    fn set_acl(
        &self,
        _dentry: &LowerDentryRef,
        _typ: AclType,
        _acl: Option<&Acl>,
    ) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn fileattr_get(&self, _dentry: &LowerDentryRef) -> LowerResult<FileAttrFlags> {
        Err(LowerError::NotImplemented)
    }

    fn fileattr_set(&self, _dentry: &LowerDentryRef, _attr: &FileAttrFlags) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }
}

/// A lower open handle. Dropping it closes the handle.
pub trait LowerFile: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// The node this handle was opened on.
    fn inode(&self) -> LowerInodeRef;

    /// Cached pages of the handle's node.
    fn mapping(&self) -> Option<LowerMappingRef> {
        self.inode().mapping()
    }

    fn llseek(&self, _offset: i64, _whence: Whence) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    fn read(&self, _offset: u64, _buf: &mut [u8]) -> LowerResult<usize> {
        Err(LowerError::NotImplemented)
    }

    fn write(&self, _offset: u64, _data: &[u8]) -> LowerResult<usize> {
        Err(LowerError::NotImplemented)
    }

    fn read_vectored(&self, offset: u64, bufs: &mut [IoSliceMut<'_>]) -> LowerResult<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let n = self.read(offset + total as u64, buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn write_vectored(&self, offset: u64, bufs: &[IoSlice<'_>]) -> LowerResult<usize> {
        let mut total = 0;
        for buf in bufs {
            let n = self.write(offset + total as u64, buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Lists directory entries starting after `offset`.
    fn iterate(&self, _offset: i64) -> LowerResult<Vec<DirEntry>> {
        Err(LowerError::NotImplemented)
    }

    fn ioctl(&self, _cmd: u32, _arg: &[u8]) -> LowerResult<Vec<u8>> {
        Err(LowerError::NotImplemented)
    }

    fn compat_ioctl(&self, _cmd: u32, _arg: &[u8]) -> LowerResult<Vec<u8>> {
        Err(LowerError::NotImplemented)
    }

    fn mmap(&self, _request: &MapRequest) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn flush(&self, _lock_owner: u64) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn fsync(&self, _start: u64, _end: u64, _datasync: bool) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn fasync(&self, _fd: i32, _on: bool) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn lock(&self, _cmd: i32, _request: &LockRequest) -> LowerResult<LockRequest> {
        Err(LowerError::NotImplemented)
    }

    fn flock(&self, _operation: i32) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn check_flags(&self, _flags: OpenFlags) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn splice_read(&self, _offset: u64, _len: usize) -> LowerResult<Vec<u8>> {
        Err(LowerError::NotImplemented)
    }

    fn splice_write(&self, _offset: u64, _data: &[u8]) -> LowerResult<usize> {
        Err(LowerError::NotImplemented)
    }

    fn copy_file_range(
        &self,
        _offset_in: u64,
        _dst: &dyn LowerFile,
        _offset_out: u64,
        _len: u64,
        _flags: u32,
    ) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    fn remap_file_range(
        &self,
        _pos_in: u64,
        _dst: &dyn LowerFile,
        _pos_out: u64,
        _len: u64,
        _remap_flags: u32,
    ) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    fn fallocate(&self, _mode: i32, _offset: u64, _len: u64) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn fadvise(&self, _offset: u64, _len: u64, _advice: i32) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn setlease(&self, _arg: i32) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }
}

/// Volume-level operations of a lower filesystem.
pub trait LowerVolume: Send + Sync {
    fn dirty_inode(&self, _inode: &LowerInodeRef, _flags: i32) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn write_inode(&self, _inode: &LowerInodeRef, _sync: bool) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    /// Returns true if the node should be dropped once unused.
    fn drop_inode(&self, _inode: &LowerInodeRef) -> LowerResult<bool> {
        Err(LowerError::NotImplemented)
    }

    fn evict_inode(&self, _inode: &LowerInodeRef) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn put_super(&self) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn sync_fs(&self, _wait: bool) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn freeze_super(&self, _who: u32) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn freeze_fs(&self) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn thaw_super(&self, _who: u32) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn unfreeze_fs(&self) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn statfs(&self, _dentry: &LowerDentryRef) -> LowerResult<StatFs> {
        Err(LowerError::NotImplemented)
    }

    fn remount_fs(&self, _flags: &mut u32, _data: &str) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn umount_begin(&self) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn quota_read(&self, _typ: i32, _offset: u64, _len: usize) -> LowerResult<Vec<u8>> {
        Err(LowerError::NotImplemented)
    }

    fn quota_write(&self, _typ: i32, _offset: u64, _data: &[u8]) -> LowerResult<usize> {
        Err(LowerError::NotImplemented)
    }

    fn nr_cached_objects(&self) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    fn free_cached_objects(&self, _nr_to_scan: u64) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    fn shutdown(&self) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }
}

/// Direction and buffer of a direct I/O request.
pub enum DirectIo<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Cached-page operations of a lower node.
pub trait LowerMapping: Send + Sync {
    fn read_folio(
        &self,
        _file: Option<&dyn LowerFile>,
        _index: PageIndex,
        _buf: &mut [u8],
    ) -> LowerResult<usize> {
        Err(LowerError::NotImplemented)
    }

    fn writepage(&self, _index: PageIndex, _data: &[u8]) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn writepages(&self, _start: PageIndex, _end: PageIndex) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    /// Marks a page dirty, returning true if it was clean before.
    fn dirty_folio(&self, _index: PageIndex) -> LowerResult<bool> {
        Err(LowerError::NotImplemented)
    }

    fn readahead(&self, _start: PageIndex, _nr_pages: u64) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    /// Prepares a buffered write of `len` bytes at `pos`.
    fn write_begin(&self, _file: Option<&dyn LowerFile>, _pos: u64, _len: usize) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    /// Completes a buffered write, returning the bytes accepted.
    fn write_end(
        &self,
        _file: Option<&dyn LowerFile>,
        _pos: u64,
        _data: &[u8],
    ) -> LowerResult<usize> {
        Err(LowerError::NotImplemented)
    }

    fn bmap(&self, _block: u64) -> LowerResult<u64> {
        Err(LowerError::NotImplemented)
    }

    fn invalidate_folio(&self, _index: PageIndex, _offset: usize, _len: usize) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    /// Drops every cached page in `start..=end` (`None` = to the end).
    fn invalidate_range(&self, _start: PageIndex, _end: Option<PageIndex>) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn release_folio(&self, _index: PageIndex) -> LowerResult<bool> {
        Err(LowerError::NotImplemented)
    }

    fn direct_io(
        &self,
        _file: Option<&dyn LowerFile>,
        _offset: u64,
        _io: DirectIo<'_>,
    ) -> LowerResult<usize> {
        Err(LowerError::NotImplemented)
    }

    fn launder_folio(&self, _index: PageIndex) -> LowerResult<()> {
        Err(LowerError::NotImplemented)
    }

    fn is_partially_uptodate(&self, _index: PageIndex, _from: usize, _count: usize) -> LowerResult<bool> {
        Err(LowerError::NotImplemented)
    }
}
