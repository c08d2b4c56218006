//! In-memory lower filesystem.
//!
//! `MemFs` implements the whole lower interface over a tree kept in memory.
//! It counts the lower references it hands out (dentries, node references,
//! open files) so callers can check that every reference the proxy takes
//! is released again, and it can be told to fail placeholder allocation.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};

use crate::error::{LowerError, LowerResult};
use crate::lower::{
    DirectIo, LowerDentry, LowerDentryRef, LowerFile, LowerFileBox, LowerFilesystem,
    LowerInode, LowerInodeRef, LowerMapping, LowerMappingRef, LowerMount, LowerPath,
    LowerVolume, LowerVolumeRef,
};
use crate::types::{
    Credentials, DirEntry, FileType, NodeAttr, NodeId, OpenFlags, PageIndex, SetAttr, SetTime,
    StatFs, Whence,
};

/// Page size of the in-memory page cache.
pub const PAGE_SIZE: usize = 4096;

const RENAME_NOREPLACE: u32 = 1;

struct MemNode {
    ino: u64,
    kind: FileType,
    state: RwLock<NodeState>,
}

struct NodeState {
    perm: u16,
    uid: u32,
    gid: u32,
    rdev: u32,
    nlink: u32,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    data: Vec<u8>,
    target: PathBuf,
    children: BTreeMap<OsString, u64>,
    xattrs: BTreeMap<OsString, Vec<u8>>,
    cached_pages: BTreeSet<PageIndex>,
}

impl MemNode {
    fn new(ino: u64, kind: FileType, perm: u16, creds: &Credentials) -> Arc<Self> {
        let now = SystemTime::now();
        Arc::new(Self {
            ino,
            kind,
            state: RwLock::new(NodeState {
                perm,
                uid: creds.uid,
                gid: creds.gid,
                rdev: 0,
                nlink: if kind == FileType::Directory { 2 } else { 1 },
                atime: now,
                mtime: now,
                ctime: now,
                data: Vec::new(),
                target: PathBuf::new(),
                children: BTreeMap::new(),
                xattrs: BTreeMap::new(),
                cached_pages: BTreeSet::new(),
            }),
        })
    }

    fn attr(&self) -> NodeAttr {
        let state = self.state.read();
        let mut attr = NodeAttr::new(NodeId::new(self.ino), self.kind, state.perm);
        attr.size = match self.kind {
            FileType::Symlink => state.target.as_os_str().len() as u64,
            _ => state.data.len() as u64,
        };
        attr.blocks = attr.size.div_ceil(512);
        attr.atime = state.atime;
        attr.mtime = state.mtime;
        attr.ctime = state.ctime;
        attr.nlink = state.nlink;
        attr.uid = state.uid;
        attr.gid = state.gid;
        attr.rdev = state.rdev;
        attr
    }
}

struct Inner {
    nodes: RwLock<HashMap<u64, Arc<MemNode>>>,
    next_ino: AtomicU64,
    root: Mutex<Weak<MemDentry>>,
    inode_refs: AtomicUsize,
    dentries: AtomicUsize,
    files: AtomicUsize,
    files_released: AtomicUsize,
    fail_allocations: AtomicBool,
    case_insensitive: AtomicBool,
}

impl Inner {
    fn node(&self, ino: u64) -> LowerResult<Arc<MemNode>> {
        self.nodes.read().get(&ino).cloned().ok_or(LowerError::NotFound)
    }

    fn alloc_node(&self, kind: FileType, perm: u16, creds: &Credentials) -> Arc<MemNode> {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let node = MemNode::new(ino, kind, perm, creds);
        self.nodes.write().insert(ino, Arc::clone(&node));
        node
    }

    fn drop_if_unlinked(&self, node: &MemNode) {
        if node.state.read().nlink == 0 {
            self.nodes.write().remove(&node.ino);
        }
    }
}

/// An in-memory lower filesystem. Clones share the same tree.
#[derive(Clone)]
pub struct MemFs {
    inner: Arc<Inner>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// Node identifier of the root directory.
    pub const ROOT_INO: u64 = 1;

    pub fn new() -> Self {
        let root = MemNode::new(Self::ROOT_INO, FileType::Directory, 0o755, &Credentials::default());
        let mut nodes = HashMap::new();
        nodes.insert(Self::ROOT_INO, root);
        Self {
            inner: Arc::new(Inner {
                nodes: RwLock::new(nodes),
                next_ino: AtomicU64::new(Self::ROOT_INO + 1),
                root: Mutex::new(Weak::new()),
                inode_refs: AtomicUsize::new(0),
                dentries: AtomicUsize::new(0),
                files: AtomicUsize::new(0),
                files_released: AtomicUsize::new(0),
                fail_allocations: AtomicBool::new(false),
                case_insensitive: AtomicBool::new(false),
            }),
        }
    }

    /// Walks `path` in the tree, returning the node identifier.
    fn walk(&self, path: &Path) -> LowerResult<u64> {
        let mut ino = Self::ROOT_INO;
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => {
                    let node = self.inner.node(ino)?;
                    let next = node.state.read().children.get(name).copied();
                    ino = next.ok_or(LowerError::NotFound)?;
                }
                _ => return Err(LowerError::Os(libc::EINVAL)),
            }
        }
        Ok(ino)
    }

    fn add(&self, path: &Path, kind: FileType, perm: u16) -> Arc<MemNode> {
        let parent_ino = path.parent().map_or(Ok(Self::ROOT_INO), |p| self.walk(p));
        let parent = parent_ino
            .and_then(|ino| self.inner.node(ino))
            .unwrap_or_else(|_| panic!("parent of {} does not exist", path.display()));
        let name = path.file_name().unwrap_or_else(|| panic!("{} has no name", path.display()));
        let node = self.inner.alloc_node(kind, perm, &Credentials::default());
        let mut parent_state = parent.state.write();
        parent_state.children.insert(name.to_os_string(), node.ino);
        if kind == FileType::Directory {
            parent_state.nlink += 1;
        }
        node
    }

    /// Adds a regular file with `data`, returning its node identifier.
    ///
    /// # Panics
    /// If the parent directory does not exist.
    pub fn add_file(&self, path: impl AsRef<Path>, data: &[u8]) -> u64 {
        let node = self.add(path.as_ref(), FileType::File, 0o644);
        node.state.write().data = data.to_vec();
        node.ino
    }

    /// Adds a directory, returning its node identifier.
    ///
    /// # Panics
    /// If the parent directory does not exist.
    pub fn add_dir(&self, path: impl AsRef<Path>) -> u64 {
        self.add(path.as_ref(), FileType::Directory, 0o755).ino
    }

    /// Unlinks `path` behind the back of any mounted proxy.
    pub fn remove_path(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return false;
        };
        let Ok(parent) = self.walk(parent).and_then(|ino| self.inner.node(ino)) else {
            return false;
        };
        let Some(ino) = parent.state.write().children.remove(name) else {
            return false;
        };
        if let Ok(node) = self.inner.node(ino) {
            node.state.write().nlink -= 1;
            self.inner.drop_if_unlinked(&node);
        }
        true
    }

    /// Contents of the file at `path`.
    pub fn read_path(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let ino = self.walk(path.as_ref()).ok()?;
        let node = self.inner.node(ino).ok()?;
        let data = node.state.read().data.clone();
        Some(data)
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.walk(path.as_ref()).is_ok()
    }

    /// A fresh counted reference to node `ino`.
    pub fn inode(&self, ino: u64) -> Option<LowerInodeRef> {
        let node = self.inner.node(ino).ok()?;
        Some(MemInode::new(&self.inner, node))
    }

    /// Pages of node `ino` currently in the page cache.
    pub fn cached_pages(&self, ino: u64) -> usize {
        self.inner.node(ino).map_or(0, |n| n.state.read().cached_pages.len())
    }

    pub fn live_inode_refs(&self) -> usize {
        self.inner.inode_refs.load(Ordering::SeqCst)
    }

    pub fn live_dentries(&self) -> usize {
        self.inner.dentries.load(Ordering::SeqCst)
    }

    pub fn live_files(&self) -> usize {
        self.inner.files.load(Ordering::SeqCst)
    }

    /// Number of lower files closed so far.
    pub fn files_released(&self) -> usize {
        self.inner.files_released.load(Ordering::SeqCst)
    }

    /// Makes placeholder allocation fail.
    pub fn fail_allocations(&self, fail: bool) {
        self.inner.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// Makes entries hash and compare names case-insensitively.
    pub fn set_case_insensitive(&self, on: bool) {
        self.inner.case_insensitive.store(on, Ordering::SeqCst);
    }

    fn root_dentry(&self) -> Arc<MemDentry> {
        let mut root = self.inner.root.lock();
        if let Some(dentry) = root.upgrade() {
            return dentry;
        }
        let dentry = MemDentry::new(&self.inner, OsString::new(), None);
        *dentry.node.lock() = self.inner.node(Self::ROOT_INO).ok();
        *root = Arc::downgrade(&dentry);
        dentry
    }
}

impl LowerFilesystem for MemFs {
    fn name(&self) -> &str {
        "memfs"
    }

    fn resolve_path(&self, path: &Path) -> LowerResult<LowerPath> {
        let mut dentry = self.root_dentry();
        for component in path.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            let child = match dentry.cached_child(name) {
                Some(child) => child,
                None => MemDentry::new(&self.inner, name.to_os_string(), Some(Arc::clone(&dentry))),
            };
            child.relookup();
            if child.node.lock().is_none() {
                return Err(LowerError::NotFound);
            }
            dentry = child;
        }
        let mount: Arc<dyn LowerMount> = Arc::new(MemMount { fs: Arc::clone(&self.inner) });
        Ok(LowerPath { mount, dentry })
    }
}

struct MemMount {
    fs: Arc<Inner>,
}

impl LowerMount for MemMount {
    fn id(&self) -> u64 {
        1
    }

    fn volume(&self) -> LowerVolumeRef {
        Arc::new(MemVolume { fs: Arc::clone(&self.fs) })
    }
}

struct MemVolume {
    fs: Arc<Inner>,
}

impl LowerVolume for MemVolume {
    fn sync_fs(&self, _wait: bool) -> LowerResult<()> {
        Ok(())
    }

    fn statfs(&self, _dentry: &LowerDentryRef) -> LowerResult<StatFs> {
        let nodes = self.fs.nodes.read();
        let used: u64 = nodes.values().map(|n| n.state.read().data.len() as u64).sum();
        let bsize = PAGE_SIZE as u64;
        let blocks = 1 << 20;
        let free = blocks - used.div_ceil(bsize);
        Ok(StatFs {
            blocks,
            bfree: free,
            bavail: free,
            files: 1 << 20,
            ffree: (1 << 20) - nodes.len() as u64,
            bsize: PAGE_SIZE as u32,
            namelen: 255,
            frsize: PAGE_SIZE as u32,
        })
    }

    fn nr_cached_objects(&self) -> LowerResult<u64> {
        Ok(self.fs.dentries.load(Ordering::SeqCst) as u64)
    }
}

struct MemDentry {
    fs: Arc<Inner>,
    this: Weak<MemDentry>,
    name: OsString,
    parent: Option<Arc<MemDentry>>,
    node: Mutex<Option<Arc<MemNode>>>,
    children: Mutex<HashMap<OsString, Weak<MemDentry>>>,
}

impl MemDentry {
    fn new(fs: &Arc<Inner>, name: OsString, parent: Option<Arc<MemDentry>>) -> Arc<Self> {
        fs.dentries.fetch_add(1, Ordering::SeqCst);
        let dentry = Arc::new_cyclic(|this| Self {
            fs: Arc::clone(fs),
            this: this.clone(),
            name,
            parent,
            node: Mutex::new(None),
            children: Mutex::new(HashMap::new()),
        });
        if let Some(parent) = &dentry.parent {
            parent.children.lock().insert(dentry.name.clone(), Arc::downgrade(&dentry));
        }
        dentry
    }

    fn cached_child(&self, name: &OsStr) -> Option<Arc<MemDentry>> {
        self.children.lock().get(name).and_then(Weak::upgrade)
    }

    /// The node `name` currently links to under the parent directory.
    fn linked_node(&self) -> Option<Arc<MemNode>> {
        let Some(parent) = &self.parent else {
            return self.fs.node(MemFs::ROOT_INO).ok();
        };
        let dir = parent.node.lock().clone()?;
        let ino = dir.state.read().children.get(&self.name).copied()?;
        self.fs.node(ino).ok()
    }

    fn relookup(&self) {
        *self.node.lock() = self.linked_node();
    }

    fn set_node(&self, node: Option<Arc<MemNode>>) {
        *self.node.lock() = node;
    }
}

impl Drop for MemDentry {
    fn drop(&mut self) {
        self.fs.dentries.fetch_sub(1, Ordering::SeqCst);
    }
}

fn mem_dentry(dentry: &LowerDentryRef) -> LowerResult<&MemDentry> {
    dentry
        .as_any()
        .downcast_ref::<MemDentry>()
        .ok_or(LowerError::Os(libc::EXDEV))
}

impl LowerDentry for MemDentry {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> OsString {
        self.name.clone()
    }

    fn inode(&self) -> Option<LowerInodeRef> {
        let node = self.node.lock().clone()?;
        Some(MemInode::new(&self.fs, node))
    }

    fn lookup_cached(&self, name: &OsStr) -> Option<LowerDentryRef> {
        self.cached_child(name).map(|d| d as LowerDentryRef)
    }

    fn alloc_child(&self, name: &OsStr) -> LowerResult<LowerDentryRef> {
        if self.fs.fail_allocations.load(Ordering::SeqCst) {
            return Err(LowerError::AllocationFailure);
        }
        let me = self.this.upgrade().ok_or(LowerError::Os(libc::ESTALE))?;
        Ok(MemDentry::new(&self.fs, name.to_os_string(), Some(me)))
    }

    fn revalidate(&self, _flags: u32) -> LowerResult<bool> {
        let current = self.node.lock().clone();
        let linked = self.linked_node();
        Ok(match (current, linked) {
            (Some(a), Some(b)) => a.ino == b.ino,
            (None, None) => true,
            _ => false,
        })
    }

    fn hash(&self, name: &OsStr) -> LowerResult<u64> {
        if !self.fs.case_insensitive.load(Ordering::SeqCst) {
            return Err(LowerError::NotImplemented);
        }
        // FNV-1a over the lowercased name.
        let folded = name.to_string_lossy().to_lowercase();
        Ok(folded.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        }))
    }

    fn compare(&self, name: &OsStr, other: &OsStr) -> LowerResult<bool> {
        if !self.fs.case_insensitive.load(Ordering::SeqCst) {
            return Err(LowerError::NotImplemented);
        }
        Ok(name.to_string_lossy().to_lowercase() == other.to_string_lossy().to_lowercase())
    }
}

/// A counted reference to a node.
struct MemInode {
    fs: Arc<Inner>,
    node: Arc<MemNode>,
}

impl MemInode {
    fn new(fs: &Arc<Inner>, node: Arc<MemNode>) -> LowerInodeRef {
        fs.inode_refs.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self { fs: Arc::clone(fs), node })
    }

    fn dir_state(&self) -> LowerResult<parking_lot::RwLockWriteGuard<'_, NodeState>> {
        if self.node.kind != FileType::Directory {
            return Err(LowerError::Os(libc::ENOTDIR));
        }
        Ok(self.node.state.write())
    }

    /// Links a new node under `dentry`'s name.
    fn make(
        &self,
        dentry: &LowerDentryRef,
        kind: FileType,
        mode: u32,
        creds: &Credentials,
    ) -> LowerResult<Arc<MemNode>> {
        let target = mem_dentry(dentry)?;
        let mut dir = self.dir_state()?;
        if dir.children.contains_key(&target.name) {
            return Err(LowerError::Os(libc::EEXIST));
        }
        let node = self.fs.alloc_node(kind, (mode & 0o7777) as u16, creds);
        dir.children.insert(target.name.clone(), node.ino);
        if kind == FileType::Directory {
            dir.nlink += 1;
        }
        dir.mtime = SystemTime::now();
        target.set_node(Some(Arc::clone(&node)));
        Ok(node)
    }

    fn open_node(&self, node: Arc<MemNode>, flags: OpenFlags) -> LowerResult<LowerFileBox> {
        if node.kind == FileType::Directory && flags.is_writable() {
            return Err(LowerError::Os(libc::EISDIR));
        }
        if flags.contains(OpenFlags::TRUNCATE) && flags.is_writable() {
            node.state.write().data.clear();
        }
        Ok(MemFile::open(&self.fs, node, flags))
    }

    /// Removes `dentry`'s name from this directory.
    fn remove(&self, dentry: &LowerDentryRef, dir_wanted: bool) -> LowerResult<()> {
        let target = mem_dentry(dentry)?;
        let mut dir = self.dir_state()?;
        let ino = *dir.children.get(&target.name).ok_or(LowerError::NotFound)?;
        let node = self.fs.node(ino)?;
        match (node.kind == FileType::Directory, dir_wanted) {
            (true, false) => return Err(LowerError::Os(libc::EISDIR)),
            (false, true) => return Err(LowerError::Os(libc::ENOTDIR)),
            (true, true) if !node.state.read().children.is_empty() => {
                return Err(LowerError::Os(libc::ENOTEMPTY))
            }
            _ => {}
        }
        dir.children.remove(&target.name);
        if dir_wanted {
            dir.nlink -= 1;
            node.state.write().nlink = 0;
        } else {
            node.state.write().nlink -= 1;
        }
        dir.mtime = SystemTime::now();
        drop(dir);
        self.fs.drop_if_unlinked(&node);
        target.set_node(None);
        Ok(())
    }
}

impl Drop for MemInode {
    fn drop(&mut self) {
        self.fs.inode_refs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LowerInode for MemInode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn ino(&self) -> u64 {
        self.node.ino
    }

    fn kind(&self) -> FileType {
        self.node.kind
    }

    fn mapping(&self) -> Option<LowerMappingRef> {
        (self.node.kind == FileType::File)
            .then(|| Arc::new(MemMapping { node: Arc::clone(&self.node) }) as LowerMappingRef)
    }

    fn lookup(&self, dentry: &LowerDentryRef, _flags: u32) -> LowerResult<()> {
        let target = mem_dentry(dentry)?;
        let ino = self.dir_state()?.children.get(&target.name).copied();
        target.set_node(ino.and_then(|ino| self.fs.node(ino).ok()));
        Ok(())
    }

    fn open(
        &self,
        _dentry: &LowerDentryRef,
        flags: OpenFlags,
        _creds: &Credentials,
    ) -> LowerResult<LowerFileBox> {
        self.open_node(Arc::clone(&self.node), flags)
    }

    fn get_link(&self, dentry: &LowerDentryRef) -> LowerResult<PathBuf> {
        self.readlink(dentry)
    }

    fn readlink(&self, _dentry: &LowerDentryRef) -> LowerResult<PathBuf> {
        if self.node.kind != FileType::Symlink {
            return Err(LowerError::Os(libc::EINVAL));
        }
        Ok(self.node.state.read().target.clone())
    }

    fn permission(&self, mask: i32, creds: &Credentials) -> LowerResult<()> {
        if creds.uid == 0 {
            return Ok(());
        }
        let state = self.node.state.read();
        let bits = i32::from(if creds.uid == state.uid {
            state.perm >> 6
        } else if creds.gid == state.gid {
            state.perm >> 3
        } else {
            state.perm
        });
        if bits & mask & 0o7 == mask & 0o7 {
            Ok(())
        } else {
            Err(LowerError::Os(libc::EACCES))
        }
    }

    fn create(
        &self,
        dentry: &LowerDentryRef,
        mode: u32,
        excl: bool,
        creds: &Credentials,
    ) -> LowerResult<()> {
        match self.make(dentry, FileType::File, mode, creds) {
            Err(LowerError::Os(libc::EEXIST)) if !excl => self.lookup(dentry, 0),
            other => other.map(|_| ()),
        }
    }

    fn link(&self, old: &LowerDentryRef, new: &LowerDentryRef) -> LowerResult<()> {
        let source = mem_dentry(old)?.node.lock().clone().ok_or(LowerError::NotFound)?;
        if source.kind == FileType::Directory {
            return Err(LowerError::Os(libc::EPERM));
        }
        let target = mem_dentry(new)?;
        let mut dir = self.dir_state()?;
        if dir.children.contains_key(&target.name) {
            return Err(LowerError::Os(libc::EEXIST));
        }
        dir.children.insert(target.name.clone(), source.ino);
        source.state.write().nlink += 1;
        target.set_node(Some(source));
        Ok(())
    }

    fn unlink(&self, dentry: &LowerDentryRef) -> LowerResult<()> {
        self.remove(dentry, false)
    }

    fn symlink(&self, dentry: &LowerDentryRef, target: &Path, creds: &Credentials) -> LowerResult<()> {
        let node = self.make(dentry, FileType::Symlink, 0o777, creds)?;
        node.state.write().target = target.to_path_buf();
        Ok(())
    }

    fn mkdir(&self, dentry: &LowerDentryRef, mode: u32, creds: &Credentials) -> LowerResult<()> {
        self.make(dentry, FileType::Directory, mode, creds).map(|_| ())
    }

    fn rmdir(&self, dentry: &LowerDentryRef) -> LowerResult<()> {
        self.remove(dentry, true)
    }

    fn mknod(
        &self,
        dentry: &LowerDentryRef,
        mode: u32,
        rdev: u32,
        creds: &Credentials,
    ) -> LowerResult<()> {
        let node = self.make(dentry, FileType::from_mode(mode), mode, creds)?;
        node.state.write().rdev = rdev;
        Ok(())
    }

    fn rename(
        &self,
        old: &LowerDentryRef,
        new_dir: &LowerInodeRef,
        new: &LowerDentryRef,
        flags: u32,
    ) -> LowerResult<()> {
        let source = mem_dentry(old)?;
        let target = mem_dentry(new)?;
        let new_dir = new_dir
            .as_any()
            .downcast_ref::<MemInode>()
            .ok_or(LowerError::Os(libc::EXDEV))?;
        if new_dir.node.kind != FileType::Directory || self.node.kind != FileType::Directory {
            return Err(LowerError::Os(libc::ENOTDIR));
        }

        let ino = *self.node.state.read().children.get(&source.name).ok_or(LowerError::NotFound)?;
        let replaced = new_dir.node.state.read().children.get(&target.name).copied();
        if replaced.is_some() && flags & RENAME_NOREPLACE != 0 {
            return Err(LowerError::Os(libc::EEXIST));
        }

        self.node.state.write().children.remove(&source.name);
        new_dir.node.state.write().children.insert(target.name.clone(), ino);
        if let Some(replaced) = replaced.filter(|r| *r != ino) {
            let node = self.fs.node(replaced)?;
            node.state.write().nlink -= 1;
            self.fs.drop_if_unlinked(&node);
        }
        target.set_node(self.fs.node(ino).ok());
        source.set_node(None);
        Ok(())
    }

    fn setattr(&self, _dentry: &LowerDentryRef, attr: &SetAttr) -> LowerResult<()> {
        let now = SystemTime::now();
        let resolve = |t: SetTime| match t {
            SetTime::Now => now,
            SetTime::At(at) => at,
        };
        let mut state = self.node.state.write();
        if let Some(mode) = attr.mode {
            state.perm = (mode & 0o7777) as u16;
        }
        if let Some(uid) = attr.uid {
            state.uid = uid;
        }
        if let Some(gid) = attr.gid {
            state.gid = gid;
        }
        if let Some(size) = attr.size {
            if self.node.kind == FileType::Directory {
                return Err(LowerError::Os(libc::EISDIR));
            }
            state.data.resize(size as usize, 0);
            state.mtime = now;
        }
        if let Some(atime) = attr.atime {
            state.atime = resolve(atime);
        }
        if let Some(mtime) = attr.mtime {
            state.mtime = resolve(mtime);
        }
        state.ctime = now;
        Ok(())
    }

    fn getattr(&self, _dentry: &LowerDentryRef) -> LowerResult<NodeAttr> {
        Ok(self.node.attr())
    }

    fn listxattr(&self, _dentry: &LowerDentryRef) -> LowerResult<Vec<OsString>> {
        Ok(self.node.state.read().xattrs.keys().cloned().collect())
    }

    fn getxattr(&self, _dentry: &LowerDentryRef, name: &OsStr) -> LowerResult<Vec<u8>> {
        self.node
            .state
            .read()
            .xattrs
            .get(name)
            .cloned()
            .ok_or(LowerError::Os(libc::ENODATA))
    }

    fn setxattr(
        &self,
        _dentry: &LowerDentryRef,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> LowerResult<()> {
        let mut state = self.node.state.write();
        let exists = state.xattrs.contains_key(name);
        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(LowerError::Os(libc::EEXIST));
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(LowerError::Os(libc::ENODATA));
        }
        state.xattrs.insert(name.to_os_string(), value.to_vec());
        Ok(())
    }

    fn removexattr(&self, _dentry: &LowerDentryRef, name: &OsStr) -> LowerResult<()> {
        self.node
            .state
            .write()
            .xattrs
            .remove(name)
            .map(|_| ())
            .ok_or(LowerError::Os(libc::ENODATA))
    }

    fn update_time(&self, _flags: i32) -> LowerResult<()> {
        let now = SystemTime::now();
        let mut state = self.node.state.write();
        state.mtime = now;
        state.ctime = now;
        Ok(())
    }

    fn tmpfile(&self, mode: u32, creds: &Credentials) -> LowerResult<LowerFileBox> {
        if self.node.kind != FileType::Directory {
            return Err(LowerError::Os(libc::ENOTDIR));
        }
        let node = self.fs.alloc_node(FileType::File, (mode & 0o7777) as u16, creds);
        node.state.write().nlink = 0;
        self.open_node(node, OpenFlags::READ_WRITE)
    }
}

struct MemFile {
    fs: Arc<Inner>,
    node: Arc<MemNode>,
    flags: OpenFlags,
    pos: AtomicU64,
}

impl MemFile {
    fn open(fs: &Arc<Inner>, node: Arc<MemNode>, flags: OpenFlags) -> LowerFileBox {
        fs.files.fetch_add(1, Ordering::SeqCst);
        Box::new(Self { fs: Arc::clone(fs), node, flags, pos: AtomicU64::new(0) })
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.fs.files.fetch_sub(1, Ordering::SeqCst);
        self.fs.files_released.fetch_add(1, Ordering::SeqCst);
        self.fs.drop_if_unlinked(&self.node);
    }
}

impl LowerFile for MemFile {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn inode(&self) -> LowerInodeRef {
        MemInode::new(&self.fs, Arc::clone(&self.node))
    }

    fn llseek(&self, offset: i64, whence: Whence) -> LowerResult<u64> {
        let size = self.node.state.read().data.len() as i64;
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => self.pos.load(Ordering::SeqCst) as i64,
            Whence::End => size,
            Whence::Data | Whence::Hole => return Err(LowerError::NotImplemented),
        };
        let pos = base.checked_add(offset).filter(|p| *p >= 0).ok_or(LowerError::Os(libc::EINVAL))?;
        self.pos.store(pos as u64, Ordering::SeqCst);
        Ok(pos as u64)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> LowerResult<usize> {
        if !self.flags.is_readable() {
            return Err(LowerError::Os(libc::EBADF));
        }
        if self.node.kind == FileType::Directory {
            return Err(LowerError::Os(libc::EISDIR));
        }
        let state = self.node.state.read();
        let start = (offset as usize).min(state.data.len());
        let n = buf.len().min(state.data.len() - start);
        buf[..n].copy_from_slice(&state.data[start..start + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, data: &[u8]) -> LowerResult<usize> {
        if !self.flags.is_writable() {
            return Err(LowerError::Os(libc::EBADF));
        }
        let mut state = self.node.state.write();
        let start = if self.flags.contains(OpenFlags::APPEND) {
            state.data.len()
        } else {
            offset as usize
        };
        let end = start + data.len();
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[start..end].copy_from_slice(data);
        state.mtime = SystemTime::now();
        Ok(data.len())
    }

    fn iterate(&self, offset: i64) -> LowerResult<Vec<DirEntry>> {
        if self.node.kind != FileType::Directory {
            return Err(LowerError::Os(libc::ENOTDIR));
        }
        let children: Vec<(OsString, u64)> = self
            .node
            .state
            .read()
            .children
            .iter()
            .map(|(name, ino)| (name.clone(), *ino))
            .collect();
        let mut entries = vec![
            (OsString::from("."), self.node.ino, FileType::Directory),
            (OsString::from(".."), self.node.ino, FileType::Directory),
        ];
        for (name, ino) in children {
            let kind = self.fs.node(ino).map_or(FileType::File, |n| n.kind);
            entries.push((name, ino, kind));
        }
        Ok(entries
            .into_iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(i, (name, ino, kind))| DirEntry {
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

    fn fsync(&self, _start: u64, _end: u64, _datasync: bool) -> LowerResult<()> {
        Ok(())
    }

    fn fallocate(&self, mode: i32, offset: u64, len: u64) -> LowerResult<()> {
        if mode != 0 {
            return Err(LowerError::Os(libc::EOPNOTSUPP));
        }
        let mut state = self.node.state.write();
        let end = (offset + len) as usize;
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        Ok(())
    }

    fn copy_file_range(
        &self,
        offset_in: u64,
        dst: &dyn LowerFile,
        offset_out: u64,
        len: u64,
        _flags: u32,
    ) -> LowerResult<u64> {
        let mut buf = vec![0; len as usize];
        let n = self.read(offset_in, &mut buf)?;
        let written = dst.write(offset_out, &buf[..n])?;
        Ok(written as u64)
    }
}

struct MemMapping {
    node: Arc<MemNode>,
}

impl LowerMapping for MemMapping {
    fn read_folio(
        &self,
        _file: Option<&dyn LowerFile>,
        index: PageIndex,
        buf: &mut [u8],
    ) -> LowerResult<usize> {
        let mut state = self.node.state.write();
        let start = (index as usize * PAGE_SIZE).min(state.data.len());
        let end = (start + PAGE_SIZE).min(state.data.len());
        let n = (end - start).min(buf.len());
        buf[..n].copy_from_slice(&state.data[start..start + n]);
        state.cached_pages.insert(index);
        Ok(n)
    }

    fn writepage(&self, index: PageIndex, data: &[u8]) -> LowerResult<()> {
        let mut state = self.node.state.write();
        let start = index as usize * PAGE_SIZE;
        let end = start + data.len().min(PAGE_SIZE);
        if state.data.len() < end {
            state.data.resize(end, 0);
        }
        state.data[start..end].copy_from_slice(&data[..end - start]);
        state.cached_pages.insert(index);
        Ok(())
    }

    fn readahead(&self, start: PageIndex, nr_pages: u64) -> LowerResult<u64> {
        let mut state = self.node.state.write();
        let pages = (state.data.len() as u64).div_ceil(PAGE_SIZE as u64);
        let end = (start + nr_pages).min(pages);
        state.cached_pages.extend(start..end);
        Ok(end.saturating_sub(start))
    }

    fn invalidate_range(&self, start: PageIndex, end: Option<PageIndex>) -> LowerResult<()> {
        let end = end.unwrap_or(PageIndex::MAX);
        self.node.state.write().cached_pages.retain(|p| *p < start || *p > end);
        Ok(())
    }

    fn release_folio(&self, index: PageIndex) -> LowerResult<bool> {
        Ok(self.node.state.write().cached_pages.remove(&index))
    }

    fn direct_io(
        &self,
        _file: Option<&dyn LowerFile>,
        offset: u64,
        io: DirectIo<'_>,
    ) -> LowerResult<usize> {
        let mut state = self.node.state.write();
        let start = offset as usize;
        match io {
            DirectIo::Read(buf) => {
                let start = start.min(state.data.len());
                let n = buf.len().min(state.data.len() - start);
                buf[..n].copy_from_slice(&state.data[start..start + n]);
                Ok(n)
            }
            DirectIo::Write(data) => {
                let end = start + data.len();
                if state.data.len() < end {
                    state.data.resize(end, 0);
                }
                state.data[start..end].copy_from_slice(data);
                Ok(data.len())
            }
        }
    }
}
