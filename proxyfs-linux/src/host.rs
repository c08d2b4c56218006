//! Lower filesystem over a real directory tree.
//!
//! `HostFs` forwards every lower operation to the host kernel through
//! `std::fs` and `libc`. Node identity is the real inode number.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, FileExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::trace;

use proxyfs_core::error::{LowerError, LowerResult};
use proxyfs_core::lower::{
    LowerDentry, LowerDentryRef, LowerFile, LowerFileBox, LowerFilesystem, LowerInode,
    LowerInodeRef, LowerMount, LowerPath, LowerVolume, LowerVolumeRef,
};
use proxyfs_core::types::{
    Credentials, DirEntry, FileType, LockRequest, NodeAttr, NodeId, OpenFlags, SetAttr, SetTime,
    StatFs, Whence,
};

fn c_path(path: &Path) -> LowerResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| LowerError::Os(libc::EINVAL))
}

fn c_name(name: &OsStr) -> LowerResult<CString> {
    CString::new(name.as_bytes()).map_err(|_| LowerError::Os(libc::EINVAL))
}

/// Turns a `-1` libc return into the current errno.
fn check(ret: libc::c_int) -> LowerResult<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(ret)
    }
}

fn check_size(ret: libc::ssize_t) -> LowerResult<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(ret as usize)
    }
}

fn file_type(meta: &fs::Metadata) -> FileType {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::Fifo
    } else if ft.is_socket() {
        FileType::Socket
    } else {
        FileType::File
    }
}

fn to_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH
    }
}

/// Converts host metadata to proxy attributes.
pub fn metadata_to_attr(meta: &fs::Metadata) -> NodeAttr {
    let mut attr = NodeAttr::new(NodeId::new(meta.ino()), file_type(meta), (meta.mode() & 0o7777) as u16);
    attr.size = meta.size();
    attr.blocks = meta.blocks();
    attr.atime = to_time(meta.atime(), meta.atime_nsec());
    attr.mtime = to_time(meta.mtime(), meta.mtime_nsec());
    attr.ctime = to_time(meta.ctime(), meta.ctime_nsec());
    attr.nlink = meta.nlink() as u32;
    attr.uid = meta.uid();
    attr.gid = meta.gid();
    attr.rdev = meta.rdev() as u32;
    attr.blksize = meta.blksize() as u32;
    attr
}

/// Identity of a host node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HostId {
    ino: u64,
    kind: FileType,
}

impl HostId {
    fn of(meta: &fs::Metadata) -> Self {
        Self { ino: meta.ino(), kind: file_type(meta) }
    }
}

/// The host's directory tree as a lower filesystem.
#[derive(Debug, Clone, Default)]
pub struct HostFs {
    root: Arc<Mutex<Weak<HostDentry>>>,
}

impl HostFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn root_dentry(&self) -> LowerResult<Arc<HostDentry>> {
        let mut root = self.root.lock();
        if let Some(dentry) = root.upgrade() {
            return Ok(dentry);
        }
        let dentry = HostDentry::new(OsString::new(), PathBuf::from("/"), None);
        dentry.relookup()?;
        *root = Arc::downgrade(&dentry);
        Ok(dentry)
    }
}

impl LowerFilesystem for HostFs {
    fn name(&self) -> &str {
        "hostfs"
    }

    fn resolve_path(&self, path: &Path) -> LowerResult<LowerPath> {
        let mut dentry = self.root_dentry()?;
        for component in path.components() {
            match component {
                Component::Normal(name) => {
                    let child = match dentry.cached_child(name) {
                        Some(child) => child,
                        None => dentry.child(name),
                    };
                    child.relookup()?;
                    if child.id.lock().is_none() {
                        return Err(LowerError::NotFound);
                    }
                    dentry = child;
                }
                Component::RootDir | Component::CurDir => {}
                _ => return Err(LowerError::Os(libc::EINVAL)),
            }
        }
        let dev = fs::metadata(&dentry.path)?.dev();
        let mount: Arc<dyn LowerMount> = Arc::new(HostMount { dev });
        Ok(LowerPath { mount, dentry })
    }
}

struct HostMount {
    dev: u64,
}

impl LowerMount for HostMount {
    fn id(&self) -> u64 {
        self.dev
    }

    fn volume(&self) -> LowerVolumeRef {
        Arc::new(HostVolume)
    }
}

struct HostVolume;

impl LowerVolume for HostVolume {
    fn sync_fs(&self, _wait: bool) -> LowerResult<()> {
        // SAFETY: sync takes no arguments and cannot fail.
        unsafe { libc::sync() };
        Ok(())
    }

    fn statfs(&self, dentry: &LowerDentryRef) -> LowerResult<StatFs> {
        let path = c_path(&host_dentry(dentry)?.path)?;
        // SAFETY: an all-zero statvfs is a valid out-parameter.
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `path` is NUL terminated and `st` is a valid pointer.
        check(unsafe { libc::statvfs(path.as_ptr(), &mut st) })?;
        Ok(StatFs {
            blocks: st.f_blocks as u64,
            bfree: st.f_bfree as u64,
            bavail: st.f_bavail as u64,
            files: st.f_files as u64,
            ffree: st.f_ffree as u64,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
        })
    }
}

struct HostDentry {
    this: Weak<HostDentry>,
    name: OsString,
    path: PathBuf,
    parent: Option<Arc<HostDentry>>,
    id: Mutex<Option<HostId>>,
    children: Mutex<HashMap<OsString, Weak<HostDentry>>>,
}

impl HostDentry {
    fn new(name: OsString, path: PathBuf, parent: Option<Arc<HostDentry>>) -> Arc<Self> {
        let dentry = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            name,
            path,
            parent,
            id: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
        });
        if let Some(parent) = &dentry.parent {
            parent.children.lock().insert(dentry.name.clone(), Arc::downgrade(&dentry));
        }
        dentry
    }

    fn cached_child(&self, name: &OsStr) -> Option<Arc<HostDentry>> {
        self.children.lock().get(name).and_then(Weak::upgrade)
    }

    fn child(&self, name: &OsStr) -> Arc<HostDentry> {
        HostDentry::new(name.to_os_string(), self.path.join(name), self.this.upgrade())
    }

    /// Re-reads the node the path currently names.
    fn relookup(&self) -> LowerResult<Option<HostId>> {
        let id = match fs::symlink_metadata(&self.path) {
            Ok(meta) => Some(HostId::of(&meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        *self.id.lock() = id;
        Ok(id)
    }

    fn set(&self, id: Option<HostId>) {
        *self.id.lock() = id;
    }
}

fn host_dentry(dentry: &LowerDentryRef) -> LowerResult<&HostDentry> {
    dentry
        .as_any()
        .downcast_ref::<HostDentry>()
        .ok_or(LowerError::Os(libc::EXDEV))
}

impl LowerDentry for HostDentry {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> OsString {
        self.name.clone()
    }

    fn inode(&self) -> Option<LowerInodeRef> {
        let id = (*self.id.lock())?;
        Some(Arc::new(HostInode { id, path: self.path.clone() }))
    }

    fn lookup_cached(&self, name: &OsStr) -> Option<LowerDentryRef> {
        self.cached_child(name).map(|d| d as LowerDentryRef)
    }

    fn alloc_child(&self, name: &OsStr) -> LowerResult<LowerDentryRef> {
        Ok(self.child(name))
    }

    fn revalidate(&self, _flags: u32) -> LowerResult<bool> {
        let cached = *self.id.lock();
        let current = match fs::symlink_metadata(&self.path) {
            Ok(meta) => Some(HostId::of(&meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(cached == current)
    }
}

/// A host node, remembered with the path it was reached through.
struct HostInode {
    id: HostId,
    path: PathBuf,
}

impl HostInode {
    fn require_dir(&self) -> LowerResult<()> {
        if self.id.kind != FileType::Directory {
            return Err(LowerError::Os(libc::ENOTDIR));
        }
        Ok(())
    }

    /// Refreshes `dentry` after a successful create.
    fn created(&self, dentry: &HostDentry) -> LowerResult<()> {
        trace!(path = %dentry.path.display(), "Created host node");
        dentry.relookup()?;
        Ok(())
    }

    fn open_path(&self, path: &Path, flags: OpenFlags, mode: Option<u32>) -> LowerResult<LowerFileBox> {
        let mut options = OpenOptions::new();
        options
            .read(flags.is_readable())
            .write(flags.is_writable())
            .append(flags.contains(OpenFlags::APPEND));
        // O_TRUNC rides along with the other raw flags so it combines with O_APPEND.
        let passthrough =
            flags.bits() & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_CREAT | libc::O_EXCL);
        options.custom_flags(passthrough);
        if let Some(mode) = mode {
            if flags.contains(OpenFlags::EXCLUSIVE) {
                options.create_new(true);
            } else {
                options.create(true);
            }
            options.mode(mode);
        }
        let file = options.open(path)?;
        let id = HostId::of(&file.metadata()?);
        Ok(Box::new(HostFile { file, id, path: path.to_path_buf() }))
    }
}

impl LowerInode for HostInode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn ino(&self) -> u64 {
        self.id.ino
    }

    fn kind(&self) -> FileType {
        self.id.kind
    }

    fn lookup(&self, dentry: &LowerDentryRef, _flags: u32) -> LowerResult<()> {
        self.require_dir()?;
        host_dentry(dentry)?.relookup()?;
        Ok(())
    }

    fn open(
        &self,
        dentry: &LowerDentryRef,
        flags: OpenFlags,
        _creds: &Credentials,
    ) -> LowerResult<LowerFileBox> {
        self.open_path(&host_dentry(dentry)?.path, flags, None)
    }

    fn get_link(&self, dentry: &LowerDentryRef) -> LowerResult<PathBuf> {
        self.readlink(dentry)
    }

    fn permission(&self, mask: i32, _creds: &Credentials) -> LowerResult<()> {
        let path = c_path(&self.path)?;
        // SAFETY: `path` is NUL terminated.
        check(unsafe { libc::access(path.as_ptr(), mask) })?;
        Ok(())
    }

    fn readlink(&self, dentry: &LowerDentryRef) -> LowerResult<PathBuf> {
        Ok(fs::read_link(&host_dentry(dentry)?.path)?)
    }

    fn create(
        &self,
        dentry: &LowerDentryRef,
        mode: u32,
        excl: bool,
        _creds: &Credentials,
    ) -> LowerResult<()> {
        self.require_dir()?;
        let target = host_dentry(dentry)?;
        let mut options = OpenOptions::new();
        options.write(true).mode(mode & 0o7777);
        if excl {
            options.create_new(true);
        } else {
            options.create(true);
        }
        options.open(&target.path)?;
        self.created(target)
    }

    fn link(&self, old: &LowerDentryRef, new: &LowerDentryRef) -> LowerResult<()> {
        let target = host_dentry(new)?;
        fs::hard_link(&host_dentry(old)?.path, &target.path)?;
        self.created(target)
    }

    fn unlink(&self, dentry: &LowerDentryRef) -> LowerResult<()> {
        let target = host_dentry(dentry)?;
        fs::remove_file(&target.path)?;
        target.set(None);
        Ok(())
    }

    fn symlink(&self, dentry: &LowerDentryRef, link: &Path, _creds: &Credentials) -> LowerResult<()> {
        let target = host_dentry(dentry)?;
        std::os::unix::fs::symlink(link, &target.path)?;
        self.created(target)
    }

    fn mkdir(&self, dentry: &LowerDentryRef, mode: u32, _creds: &Credentials) -> LowerResult<()> {
        let target = host_dentry(dentry)?;
        fs::DirBuilder::new().mode(mode & 0o7777).create(&target.path)?;
        self.created(target)
    }

    fn rmdir(&self, dentry: &LowerDentryRef) -> LowerResult<()> {
        let target = host_dentry(dentry)?;
        fs::remove_dir(&target.path)?;
        target.set(None);
        Ok(())
    }

    fn mknod(
        &self,
        dentry: &LowerDentryRef,
        mode: u32,
        rdev: u32,
        _creds: &Credentials,
    ) -> LowerResult<()> {
        let target = host_dentry(dentry)?;
        let path = c_path(&target.path)?;
        // SAFETY: `path` is NUL terminated.
        check(unsafe { libc::mknod(path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })?;
        self.created(target)
    }

    fn rename(
        &self,
        old: &LowerDentryRef,
        _new_dir: &LowerInodeRef,
        new: &LowerDentryRef,
        flags: u32,
    ) -> LowerResult<()> {
        let source = host_dentry(old)?;
        let target = host_dentry(new)?;
        let from = c_path(&source.path)?;
        let to = c_path(&target.path)?;
        // SAFETY: both paths are NUL terminated; AT_FDCWD resolves them as given.
        check(unsafe {
            libc::renameat2(libc::AT_FDCWD, from.as_ptr(), libc::AT_FDCWD, to.as_ptr(), flags)
        })?;
        source.set(None);
        target.relookup()?;
        Ok(())
    }

    fn setattr(&self, dentry: &LowerDentryRef, attr: &SetAttr) -> LowerResult<()> {
        let path = &host_dentry(dentry)?.path;
        if let Some(mode) = attr.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        if attr.uid.is_some() || attr.gid.is_some() {
            std::os::unix::fs::lchown(path, attr.uid, attr.gid)?;
        }
        if let Some(size) = attr.size {
            OpenOptions::new().write(true).open(path)?.set_len(size)?;
        }
        if attr.atime.is_some() || attr.mtime.is_some() {
            let spec = |t: Option<SetTime>| match t {
                None => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
                Some(SetTime::Now) => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_NOW },
                Some(SetTime::At(at)) => {
                    let d = at.duration_since(UNIX_EPOCH).unwrap_or_default();
                    libc::timespec {
                        tv_sec: d.as_secs() as libc::time_t,
                        tv_nsec: d.subsec_nanos() as libc::c_long,
                    }
                }
            };
            let times = [spec(attr.atime), spec(attr.mtime)];
            let c = c_path(path)?;
            // SAFETY: `c` is NUL terminated and `times` holds two timespecs.
            check(unsafe {
                libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW)
            })?;
        }
        Ok(())
    }

    fn getattr(&self, dentry: &LowerDentryRef) -> LowerResult<NodeAttr> {
        Ok(metadata_to_attr(&fs::symlink_metadata(&host_dentry(dentry)?.path)?))
    }

    fn listxattr(&self, dentry: &LowerDentryRef) -> LowerResult<Vec<OsString>> {
        let path = c_path(&host_dentry(dentry)?.path)?;
        // SAFETY: a null buffer with size 0 queries the needed size.
        let size = check_size(unsafe { libc::llistxattr(path.as_ptr(), std::ptr::null_mut(), 0) })?;
        let mut buf = vec![0u8; size];
        // SAFETY: `buf` is valid for `buf.len()` bytes.
        let n = check_size(unsafe {
            libc::llistxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        })?;
        buf.truncate(n);
        Ok(buf
            .split(|b| *b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| OsString::from_vec(name.to_vec()))
            .collect())
    }

    fn getxattr(&self, dentry: &LowerDentryRef, name: &OsStr) -> LowerResult<Vec<u8>> {
        let path = c_path(&host_dentry(dentry)?.path)?;
        let name = c_name(name)?;
        // SAFETY: a null buffer with size 0 queries the needed size.
        let size = check_size(unsafe {
            libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
        })?;
        let mut buf = vec![0u8; size];
        // SAFETY: `buf` is valid for `buf.len()` bytes.
        let n = check_size(unsafe {
            libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        })?;
        buf.truncate(n);
        Ok(buf)
    }

    fn setxattr(
        &self,
        dentry: &LowerDentryRef,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> LowerResult<()> {
        let path = c_path(&host_dentry(dentry)?.path)?;
        let name = c_name(name)?;
        // SAFETY: all pointers are valid for the lengths passed.
        check(unsafe {
            libc::lsetxattr(path.as_ptr(), name.as_ptr(), value.as_ptr().cast(), value.len(), flags)
        })?;
        Ok(())
    }

    fn removexattr(&self, dentry: &LowerDentryRef, name: &OsStr) -> LowerResult<()> {
        let path = c_path(&host_dentry(dentry)?.path)?;
        let name = c_name(name)?;
        // SAFETY: both strings are NUL terminated.
        check(unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) })?;
        Ok(())
    }

    fn update_time(&self, _flags: i32) -> LowerResult<()> {
        let path = c_path(&self.path)?;
        // SAFETY: a null times pointer sets both times to now.
        check(unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), std::ptr::null(), 0) })?;
        Ok(())
    }

    fn tmpfile(&self, mode: u32, _creds: &Credentials) -> LowerResult<LowerFileBox> {
        self.require_dir()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .mode(mode & 0o7777)
            .custom_flags(libc::O_TMPFILE)
            .open(&self.path)?;
        let id = HostId::of(&file.metadata()?);
        Ok(Box::new(HostFile { file, id, path: self.path.clone() }))
    }
}

struct HostFile {
    file: File,
    id: HostId,
    path: PathBuf,
}

impl HostFile {
    fn fd(&self) -> libc::c_int {
        self.file.as_raw_fd()
    }
}

impl LowerFile for HostFile {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn inode(&self) -> LowerInodeRef {
        Arc::new(HostInode { id: self.id, path: self.path.clone() })
    }

    fn llseek(&self, offset: i64, whence: Whence) -> LowerResult<u64> {
        let whence = match whence {
            Whence::Set => libc::SEEK_SET,
            Whence::Current => libc::SEEK_CUR,
            Whence::End => libc::SEEK_END,
            Whence::Data => libc::SEEK_DATA,
            Whence::Hole => libc::SEEK_HOLE,
        };
        // SAFETY: the descriptor is owned by `self.file`.
        let pos = unsafe { libc::lseek(self.fd(), offset as libc::off_t, whence) };
        if pos < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(pos as u64)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> LowerResult<usize> {
        Ok(self.file.read_at(buf, offset)?)
    }

    fn write(&self, offset: u64, data: &[u8]) -> LowerResult<usize> {
        Ok(self.file.write_at(data, offset)?)
    }

    fn iterate(&self, offset: i64) -> LowerResult<Vec<DirEntry>> {
        if self.id.kind != FileType::Directory {
            return Err(LowerError::Os(libc::ENOTDIR));
        }
        let parent_ino = self
            .path
            .parent()
            .and_then(|p| fs::metadata(p).ok())
            .map_or(self.id.ino, |m| m.ino());
        let mut entries = vec![
            (self.id.ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];
        let mut children = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            children.push((meta.ino(), file_type(&meta), entry.file_name()));
        }
        children.sort_by(|a, b| a.2.cmp(&b.2));
        entries.extend(children);

        Ok(entries
            .into_iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(i, (ino, kind, name))| DirEntry {
                ino: NodeId::new(ino),
                offset: i as i64 + 1,
                kind,
                name,
            })
            .collect())
    }

    fn flush(&self, _lock_owner: u64) -> LowerResult<()> {
        Ok(())
    }

    fn fsync(&self, _start: u64, _end: u64, datasync: bool) -> LowerResult<()> {
        if datasync {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn lock(&self, cmd: i32, request: &LockRequest) -> LowerResult<LockRequest> {
        // SAFETY: an all-zero flock is a valid starting value.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = request.typ as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = request.start as libc::off_t;
        fl.l_len = if request.end == u64::MAX {
            0
        } else {
            (request.end - request.start + 1) as libc::off_t
        };
        // SAFETY: the descriptor is owned by `self.file` and `fl` is valid.
        check(unsafe { libc::fcntl(self.fd(), cmd, &mut fl) })?;
        let end = if fl.l_len == 0 {
            u64::MAX
        } else {
            (fl.l_start + fl.l_len - 1) as u64
        };
        Ok(LockRequest {
            start: fl.l_start as u64,
            end,
            typ: fl.l_type as i32,
            pid: fl.l_pid as u32,
        })
    }

    fn flock(&self, operation: i32) -> LowerResult<()> {
        // SAFETY: the descriptor is owned by `self.file`.
        check(unsafe { libc::flock(self.fd(), operation) })?;
        Ok(())
    }

    fn check_flags(&self, _flags: OpenFlags) -> LowerResult<()> {
        Ok(())
    }

    fn copy_file_range(
        &self,
        offset_in: u64,
        dst: &dyn LowerFile,
        offset_out: u64,
        len: u64,
        flags: u32,
    ) -> LowerResult<u64> {
        let dst = dst
            .as_any()
            .downcast_ref::<HostFile>()
            .ok_or(LowerError::Os(libc::EXDEV))?;
        let mut off_in = offset_in as libc::loff_t;
        let mut off_out = offset_out as libc::loff_t;
        // SAFETY: both descriptors are owned by their files; offsets are valid pointers.
        let n = check_size(unsafe {
            libc::copy_file_range(self.fd(), &mut off_in, dst.fd(), &mut off_out, len as usize, flags)
        })?;
        Ok(n as u64)
    }

    fn fallocate(&self, mode: i32, offset: u64, len: u64) -> LowerResult<()> {
        // SAFETY: the descriptor is owned by `self.file`.
        check(unsafe {
            libc::fallocate(self.fd(), mode, offset as libc::off_t, len as libc::off_t)
        })?;
        Ok(())
    }

    fn fadvise(&self, offset: u64, len: u64, advice: i32) -> LowerResult<()> {
        // SAFETY: the descriptor is owned by `self.file`.
        let ret = unsafe {
            libc::posix_fadvise(self.fd(), offset as libc::off_t, len as libc::off_t, advice)
        };
        if ret != 0 {
            return Err(LowerError::Os(ret));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxyfs_core::volume::{MountOptions, ProxyFs};
    use std::ffi::OsStr;

    fn mount(dir: &Path) -> ProxyFs {
        ProxyFs::mount(Arc::new(HostFs::new()), dir, MountOptions::default()).unwrap()
    }

    #[test]
    fn test_root_binds_real_inode() {
        let dir = tempfile::tempdir().unwrap();
        let fs = mount(dir.path());
        assert_eq!(fs.root_id().get(), fs::metadata(dir.path()).unwrap().ino());
    }

    #[test]
    fn test_lookup_and_read() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"hello host").unwrap();
        let proxy = mount(dir.path());

        let (entry, attr) = proxy.lookup(proxy.root_id(), OsStr::new("hello.txt")).unwrap();
        assert_eq!(attr.size, 10);
        assert_eq!(attr.ino.get(), fs::metadata(dir.path().join("hello.txt")).unwrap().ino());

        let node = entry.node().unwrap();
        let handle = proxy.open(node.id(), OpenFlags::READ, &Credentials::current()).unwrap();
        let mut buf = [0u8; 32];
        let n = proxy.read(handle.id(), 6, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"host");
        proxy.release(handle.id()).unwrap();
    }

    #[test]
    fn test_structural_operations() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = mount(dir.path());
        let creds = Credentials::current();
        let root = proxy.root_id();

        let (sub, _) = proxy.mkdir(root, OsStr::new("sub"), 0o755, &creds).unwrap();
        let sub_id = sub.node().unwrap().id();
        let (file, attr) = proxy.create(sub_id, OsStr::new("a"), 0o644, true, &creds).unwrap();
        assert_eq!(attr.size, 0);
        assert!(dir.path().join("sub/a").exists());

        let handle = proxy.open(file.node().unwrap().id(), OpenFlags::WRITE, &creds).unwrap();
        assert_eq!(proxy.write(handle.id(), 0, b"data").unwrap(), 4);
        proxy.release(handle.id()).unwrap();
        assert_eq!(fs::read(dir.path().join("sub/a")).unwrap(), b"data");

        proxy.rename(sub_id, OsStr::new("a"), root, OsStr::new("b"), 0, &creds).unwrap();
        assert!(dir.path().join("b").exists());
        proxy.unlink(root, OsStr::new("b"), &creds).unwrap();
        proxy.rmdir(root, OsStr::new("sub"), &creds).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_readdir_lists_children() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x"), b"").unwrap();
        fs::create_dir(dir.path().join("y")).unwrap();
        let proxy = mount(dir.path());

        let handle = proxy
            .open(proxy.root_id(), OpenFlags::READ | OpenFlags::DIRECTORY, &Credentials::current())
            .unwrap();
        let names: Vec<_> = proxy
            .readdir(handle.id(), 0)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", "..", "x", "y"]);

        let rest = proxy.readdir(handle.id(), 3).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].kind, FileType::Directory);
    }

    #[test]
    fn test_missing_lower_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProxyFs::mount(
            Arc::new(HostFs::new()),
            &dir.path().join("missing"),
            MountOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[test]
    fn test_statfs() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = mount(dir.path());
        let st = proxy.statfs().unwrap();
        assert!(st.bsize > 0);
    }
}
