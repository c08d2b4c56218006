//! Serves a proxy volume to the kernel through FUSE.
//!
//! Every FUSE request is translated to the matching [`ProxyFs`] operation.
//! FUSE addresses the root as inode 1; every other inode number is the
//! proxy node identifier, which is the lower node's identifier.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    BackgroundSession, FileAttr, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow, FUSE_ROOT_ID,
};
use tracing::{debug, info, warn};

use proxyfs_core::error::ProxyError;
use proxyfs_core::types::{
    Credentials, FileType, HandleId, LockRequest, NodeAttr, NodeId, OpenFlags, SetAttr, SetTime,
};
use proxyfs_core::volume::{ProxyFs, FS_NAME};

use crate::Result;

/// How the bridge is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    pub read_only: bool,
    pub allow_other: bool,
    /// How long the kernel may cache entries and attributes
    pub ttl: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self { read_only: false, allow_other: false, ttl: Duration::from_secs(1) }
    }
}

impl BridgeOptions {
    pub fn mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName(FS_NAME.to_string()),
            MountOption::Subtype(FS_NAME.to_string()),
        ];
        if self.read_only {
            options.push(MountOption::RO);
        }
        if self.allow_other {
            // AutoUnmount is refused by fusermount without allow_other.
            options.push(MountOption::AllowOther);
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

/// Mounts `fs` at `mount_point` in a background session. The volume is
/// unmounted when the session drops.
pub fn mount(fs: Arc<ProxyFs>, mount_point: &Path, options: &BridgeOptions) -> Result<BackgroundSession> {
    info!(mount_point = %mount_point.display(), read_only = options.read_only, "Mounting FUSE bridge");
    let bridge = FuseBridge::new(fs, options.ttl);
    Ok(fuser::spawn_mount2(bridge, mount_point, &options.mount_options())?)
}

fn to_fuse_type(kind: FileType) -> fuser::FileType {
    match kind {
        FileType::File => fuser::FileType::RegularFile,
        FileType::Directory => fuser::FileType::Directory,
        FileType::Symlink => fuser::FileType::Symlink,
        FileType::CharDevice => fuser::FileType::CharDevice,
        FileType::BlockDevice => fuser::FileType::BlockDevice,
        FileType::Fifo => fuser::FileType::NamedPipe,
        FileType::Socket => fuser::FileType::Socket,
    }
}

fn to_set_time(time: Option<TimeOrNow>) -> Option<SetTime> {
    time.map(|t| match t {
        TimeOrNow::Now => SetTime::Now,
        TimeOrNow::SpecificTime(at) => SetTime::At(at),
    })
}

fn credentials(req: &Request<'_>) -> Credentials {
    Credentials::new(req.uid(), req.gid(), req.pid())
}

/// Logs a failed request and returns its errno.
fn errno(op: &str, err: ProxyError) -> i32 {
    if matches!(err, ProxyError::NotFound { .. }) {
        debug!(op, error = %err, "Request failed");
    } else {
        warn!(op, error = %err, "Request failed");
    }
    err.errno()
}

/// FUSE adapter around a mounted proxy volume.
pub struct FuseBridge {
    fs: Arc<ProxyFs>,
    ttl: Duration,
}

impl FuseBridge {
    pub fn new(fs: Arc<ProxyFs>, ttl: Duration) -> Self {
        Self { fs, ttl }
    }

    /// The proxy node a FUSE inode number addresses.
    pub fn node_id(&self, ino: u64) -> NodeId {
        if ino == FUSE_ROOT_ID {
            self.fs.root_id()
        } else {
            NodeId::new(ino)
        }
    }

    /// The FUSE inode number of a proxy node.
    pub fn fuse_ino(&self, id: NodeId) -> u64 {
        if id == self.fs.root_id() {
            FUSE_ROOT_ID
        } else {
            id.get()
        }
    }

    pub fn file_attr(&self, attr: &NodeAttr) -> FileAttr {
        FileAttr {
            ino: self.fuse_ino(attr.ino),
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: SystemTime::UNIX_EPOCH,
            kind: to_fuse_type(attr.kind),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
            flags: 0,
        }
    }

    fn reply_entry(&self, op: &str, result: proxyfs_core::Result<NodeAttr>, reply: ReplyEntry) {
        match result {
            Ok(attr) => reply.entry(&self.ttl, &self.file_attr(&attr), 0),
            Err(e) => reply.error(errno(op, e)),
        }
    }

    fn reply_empty(op: &str, result: proxyfs_core::Result<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno(op, e)),
        }
    }

    fn reply_xattr(size: u32, data: Vec<u8>, reply: ReplyXattr) {
        if size == 0 {
            reply.size(data.len() as u32);
        } else if data.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&data);
        }
    }
}

impl Filesystem for FuseBridge {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), libc::c_int> {
        info!(root = %self.fs.root_id(), lower = %self.fs.lower_path().display(), "FUSE session started");
        Ok(())
    }

    fn destroy(&mut self) {
        let report = self.fs.unmount();
        info!(
            handles = report.handles_closed,
            entries = report.entries_pruned,
            nodes = report.nodes_released,
            "FUSE session ended"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self.fs.lookup(self.node_id(parent), name).map(|(_, attr)| attr);
        self.reply_entry("lookup", result, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        if ino != FUSE_ROOT_ID {
            self.fs.forget(NodeId::new(ino), nlookup);
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.fs.getattr(self.node_id(ino)) {
            Ok(attr) => reply.attr(&self.ttl, &self.file_attr(&attr)),
            Err(e) => reply.error(errno("getattr", e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: to_set_time(atime),
            mtime: to_set_time(mtime),
        };
        match self.fs.setattr(self.node_id(ino), &changes) {
            Ok(attr) => reply.attr(&self.ttl, &self.file_attr(&attr)),
            Err(e) => reply.error(errno("setattr", e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink(self.node_id(ino)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self
            .fs
            .mknod(self.node_id(parent), name, mode & !umask, rdev, &credentials(req))
            .map(|(_, attr)| attr);
        self.reply_entry("mknod", result, reply);
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        let result = self
            .fs
            .mkdir(self.node_id(parent), name, mode & !umask, &credentials(req))
            .map(|(_, attr)| attr);
        self.reply_entry("mkdir", result, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        Self::reply_empty("unlink", self.fs.unlink(self.node_id(parent), name, &credentials(req)), reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        Self::reply_empty("rmdir", self.fs.rmdir(self.node_id(parent), name, &credentials(req)), reply);
    }

    fn symlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, link: &Path, reply: ReplyEntry) {
        let result = self
            .fs
            .symlink(self.node_id(parent), name, link, &credentials(req))
            .map(|(_, attr)| attr);
        self.reply_entry("symlink", result, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.fs.rename(
            self.node_id(parent),
            name,
            self.node_id(newparent),
            newname,
            flags,
            &credentials(req),
        );
        Self::reply_empty("rename", result, reply);
    }

    fn link(&mut self, req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let result = self
            .fs
            .link(self.node_id(ino), self.node_id(newparent), newname, &credentials(req))
            .map(|(_, attr)| attr);
        self.reply_entry("link", result, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.fs.open(self.node_id(ino), OpenFlags::from_bits(flags), &credentials(req)) {
            Ok(handle) => reply.opened(handle.id().get(), 0),
            Err(e) => reply.error(errno("open", e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let mut buf = vec![0u8; size as usize];
        match self.fs.read(HandleId::new(fh), offset.max(0) as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(errno("read", e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(HandleId::new(fh), offset.max(0) as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        Self::reply_empty("flush", self.fs.flush(HandleId::new(fh), lock_owner), reply);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        Self::reply_empty("release", self.fs.release(HandleId::new(fh)), reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        Self::reply_empty("fsync", self.fs.fsync(HandleId::new(fh), 0, u64::MAX, datasync), reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let flags = OpenFlags::from_bits(flags) | OpenFlags::DIRECTORY;
        match self.fs.open(self.node_id(ino), flags, &credentials(req)) {
            Ok(handle) => reply.opened(handle.id().get(), 0),
            Err(e) => reply.error(errno("opendir", e)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = match self.fs.readdir(HandleId::new(fh), offset) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno("readdir", e)),
        };
        for entry in entries {
            if reply.add(self.fuse_ino(entry.ino), entry.offset, to_fuse_type(entry.kind), &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        Self::reply_empty("releasedir", self.fs.release(HandleId::new(fh)), reply);
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        Self::reply_empty("fsyncdir", self.fs.fsync(HandleId::new(fh), 0, u64::MAX, datasync), reply);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(st) => reply.statfs(st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen, st.frsize),
            Err(e) => reply.error(errno("statfs", e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        Self::reply_empty("setxattr", self.fs.setxattr(self.node_id(ino), name, value, flags), reply);
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self.fs.getxattr(self.node_id(ino), name) {
            Ok(value) => Self::reply_xattr(size, value, reply),
            Err(e) => reply.error(errno("getxattr", e)),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.listxattr(self.node_id(ino)) {
            Ok(names) => Self::reply_xattr(size, xattr_list(&names), reply),
            Err(e) => reply.error(errno("listxattr", e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        Self::reply_empty("removexattr", self.fs.removexattr(self.node_id(ino), name), reply);
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        Self::reply_empty("access", self.fs.permission(self.node_id(ino), mask, &credentials(req)), reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.fs.create_and_open(
            self.node_id(parent),
            name,
            mode & !umask,
            OpenFlags::from_bits(flags),
            &credentials(req),
        );
        match result {
            Ok((_, attr, handle)) => {
                reply.created(&self.ttl, &self.file_attr(&attr), 0, handle.id().get(), 0)
            }
            Err(e) => reply.error(errno("create", e)),
        }
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let request = LockRequest { start, end, typ, pid };
        match self.fs.lock(HandleId::new(fh), libc::F_GETLK, &request) {
            Ok(lock) => reply.locked(lock.start, lock.end, lock.typ, lock.pid),
            Err(e) => reply.error(errno("getlk", e)),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let cmd = if sleep { libc::F_SETLKW } else { libc::F_SETLK };
        let request = LockRequest { start, end, typ, pid };
        let result = self.fs.lock(HandleId::new(fh), cmd, &request).map(|_| ());
        Self::reply_empty("setlk", result, reply);
    }
}

/// Joins extended attribute names the way listxattr reports them.
pub fn xattr_list(names: &[OsString]) -> Vec<u8> {
    let mut data = Vec::new();
    for name in names {
        data.extend_from_slice(name.as_bytes());
        data.push(0);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostFs;
    use proxyfs_core::volume::MountOptions;

    fn bridge() -> (tempfile::TempDir, FuseBridge) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"1234").unwrap();
        let fs = ProxyFs::mount(Arc::new(HostFs::new()), dir.path(), MountOptions::default()).unwrap();
        (dir, FuseBridge::new(Arc::new(fs), Duration::from_secs(1)))
    }

    #[test]
    fn test_root_inode_mapping() {
        let (_dir, bridge) = bridge();
        let root = bridge.fs.root_id();
        assert_eq!(bridge.node_id(FUSE_ROOT_ID), root);
        assert_eq!(bridge.fuse_ino(root), FUSE_ROOT_ID);
        assert_eq!(bridge.node_id(77), NodeId::new(77));
        assert_eq!(bridge.fuse_ino(NodeId::new(77)), 77);
    }

    #[test]
    fn test_file_attr_conversion() {
        let (_dir, bridge) = bridge();
        let (_, attr) = bridge.fs.lookup(bridge.fs.root_id(), OsStr::new("f")).unwrap();
        let fattr = bridge.file_attr(&attr);
        assert_eq!(fattr.ino, attr.ino.get());
        assert_eq!(fattr.size, 4);
        assert_eq!(fattr.kind, fuser::FileType::RegularFile);

        let root = bridge.file_attr(&bridge.fs.getattr(bridge.fs.root_id()).unwrap());
        assert_eq!(root.ino, FUSE_ROOT_ID);
        assert_eq!(root.kind, fuser::FileType::Directory);
    }

    #[test]
    fn test_mount_options() {
        let options = BridgeOptions { read_only: true, ..Default::default() }.mount_options();
        assert!(options.contains(&MountOption::RO));
        assert!(!options.contains(&MountOption::AutoUnmount));

        let options = BridgeOptions { allow_other: true, ..Default::default() }.mount_options();
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn test_xattr_list() {
        let names = vec![OsString::from("user.a"), OsString::from("user.bc")];
        assert_eq!(xattr_list(&names), b"user.a\0user.bc\0");
    }
}
