//! Node metadata and structural operations.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{lift, lower_error};
use crate::entry::ProxyEntry;
use crate::error::{LowerResult, ProxyError, Result};
use crate::event::EventKind;
use crate::handle::ProxyHandle;
use crate::lower::{LowerDentryRef, LowerInodeRef};
use crate::node::ProxyNode;
use crate::stats::OperationType;
use crate::types::{
    Acl, AclType, Credentials, Extent, FileAttrFlags, NodeAttr, NodeId, OpenFlags, SetAttr,
};
use crate::volume::ProxyFs;

/// Result of an entry invalidation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateOutcome {
    /// The entry and its cached pages were dropped
    Invalidated,
    /// The entry is in use; nothing was done
    Deferred,
    /// No cached entry by that name
    NotCached,
}

impl ProxyFs {
    /// Attributes of the node named by `entry`, reported under the proxy
    /// node identifier.
    pub(crate) fn entry_attr(&self, entry: &ProxyEntry) -> Result<NodeAttr> {
        let node = entry.require_node()?;
        let lower = entry.lower()?;
        let mut attr = node
            .lower()
            .getattr(&lower)
            .map_err(|e| lower_error(OperationType::Getattr, e))?;
        attr.ino = node.id();
        Ok(attr)
    }

    /// Drops the lookup `entry` gained if `result` is an error.
    fn settle<T>(&self, entry: &ProxyEntry, result: Result<T>) -> Result<T> {
        if result.is_err() {
            if let Some(node) = entry.node() {
                self.nodes.forget(node.id(), 1);
            }
        }
        result
    }

    /// Resolves a child the caller already holds a lookup on.
    fn resolve_held(&self, dir: &Arc<ProxyEntry>, name: &OsStr) -> Result<Arc<ProxyEntry>> {
        let entry = self.binder().resolve(dir, name)?;
        if let Some(node) = entry.node() {
            self.nodes.forget(node.id(), 1);
        }
        Ok(entry)
    }

    /// Binds a node to a freshly created lower entry.
    fn instantiate(
        &self,
        dir: &Arc<ProxyEntry>,
        entry: &Arc<ProxyEntry>,
        op: OperationType,
    ) -> Result<Arc<ProxyNode>> {
        let inode = entry
            .lower()?
            .inode()
            .ok_or(ProxyError::Lower { operation: op.name(), errno: libc::EIO })?;
        let node = self.nodes.bind(inode);
        entry.instantiate(Arc::clone(&node));
        dir.insert_child(Arc::clone(entry));
        debug!(path = %entry.path().display(), node = %node.id(), "Instantiated proxy node");
        Ok(node)
    }

    fn lower_of(&self, id: NodeId) -> Result<(Arc<ProxyNode>, LowerDentryRef)> {
        let (node, entry) = self.locate(id)?;
        Ok((node, entry.lower()?))
    }

    /// Runs a node-level operation that needs the node and its lower entry.
    fn with_node<T: Default>(
        &self,
        op: OperationType,
        id: NodeId,
        call: impl FnOnce(&LowerInodeRef, &LowerDentryRef) -> LowerResult<T>,
    ) -> Result<T> {
        self.run(op, || {
            let (node, lower) = self.lower_of(id)?;
            lift(op, call(node.lower(), &lower))
        })
    }

    /// Resolves `name` under `parent` and reports its attributes.
    pub fn lookup(&self, parent: NodeId, name: &OsStr) -> Result<(Arc<ProxyEntry>, NodeAttr)> {
        self.run(OperationType::Lookup, || {
            let (_, dir) = self.locate(parent)?;
            let entry = self.binder().resolve(&dir, name)?;
            let attr = self.entry_attr(&entry);
            Ok((Arc::clone(&entry), self.settle(&entry, attr)?))
        })
    }

    /// Drops `nlookup` lookups of a node.
    pub fn forget(&self, id: NodeId, nlookup: u64) -> bool {
        self.nodes.forget(id, nlookup)
    }

    pub fn getattr(&self, id: NodeId) -> Result<NodeAttr> {
        self.run(OperationType::Getattr, || {
            let (_, entry) = self.locate(id)?;
            self.entry_attr(&entry)
        })
    }

    pub fn setattr(&self, id: NodeId, changes: &SetAttr) -> Result<NodeAttr> {
        self.run(OperationType::Setattr, || {
            let (node, entry) = self.locate(id)?;
            node.lower()
                .setattr(&entry.lower()?, changes)
                .map_err(|e| lower_error(OperationType::Setattr, e))?;
            self.entry_attr(&entry)
        })
    }

    pub fn get_link(&self, id: NodeId) -> Result<PathBuf> {
        self.with_node(OperationType::GetLink, id, |inode, dentry| inode.get_link(dentry))
    }

    pub fn readlink(&self, id: NodeId) -> Result<PathBuf> {
        self.with_node(OperationType::Readlink, id, |inode, dentry| inode.readlink(dentry))
    }

    pub fn permission(&self, id: NodeId, mask: i32, creds: &Credentials) -> Result<()> {
        self.with_node(OperationType::Permission, id, |inode, _| inode.permission(mask, creds))
    }

    pub fn get_inode_acl(&self, id: NodeId, typ: AclType) -> Result<Option<Acl>> {
        self.with_node(OperationType::GetInodeAcl, id, |inode, _| inode.get_inode_acl(typ))
    }

    /// Creates a child through `call` and binds a node to it.
    fn make_child(
        &self,
        op: OperationType,
        kind: EventKind,
        parent: NodeId,
        name: &OsStr,
        pid: u32,
        call: impl FnOnce(&LowerInodeRef, &LowerDentryRef) -> LowerResult<()>,
    ) -> Result<(Arc<ProxyEntry>, NodeAttr)> {
        self.run(op, || {
            let (dir_node, dir) = self.locate(parent)?;
            let entry = self.binder().bind(&dir, name, 0)?;
            if !entry.is_negative() {
                return self.settle(
                    &entry,
                    Err(ProxyError::Lower { operation: op.name(), errno: libc::EEXIST }),
                );
            }
            call(dir_node.lower(), &entry.lower()?).map_err(|e| lower_error(op, e))?;
            let node = self.instantiate(&dir, &entry, op)?;
            let attr = self.entry_attr(&entry);
            let attr = self.settle(&entry, attr)?;
            self.emit(kind, node.id(), &entry, pid);
            Ok((entry, attr))
        })
    }

    pub fn create(
        &self,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        excl: bool,
        creds: &Credentials,
    ) -> Result<(Arc<ProxyEntry>, NodeAttr)> {
        self.make_child(OperationType::Create, EventKind::Create, parent, name, creds.pid, |dir, d| {
            dir.create(d, mode, excl, creds)
        })
    }

    pub fn mkdir(
        &self,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        creds: &Credentials,
    ) -> Result<(Arc<ProxyEntry>, NodeAttr)> {
        self.make_child(OperationType::Mkdir, EventKind::Mkdir, parent, name, creds.pid, |dir, d| {
            dir.mkdir(d, mode, creds)
        })
    }

    pub fn mknod(
        &self,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        creds: &Credentials,
    ) -> Result<(Arc<ProxyEntry>, NodeAttr)> {
        self.make_child(OperationType::Mknod, EventKind::Mknod, parent, name, creds.pid, |dir, d| {
            dir.mknod(d, mode, rdev, creds)
        })
    }

    pub fn symlink(
        &self,
        parent: NodeId,
        name: &OsStr,
        target: &Path,
        creds: &Credentials,
    ) -> Result<(Arc<ProxyEntry>, NodeAttr)> {
        self.make_child(OperationType::Symlink, EventKind::Symlink, parent, name, creds.pid, |dir, d| {
            dir.symlink(d, target, creds)
        })
    }

    /// Links the node `id` as `new_name` under `new_parent`.
    pub fn link(
        &self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &OsStr,
        creds: &Credentials,
    ) -> Result<(Arc<ProxyEntry>, NodeAttr)> {
        let (_, old) = self.locate(id)?;
        let old_lower = old.lower()?;
        self.make_child(OperationType::Link, EventKind::Link, new_parent, new_name, creds.pid, |dir, d| {
            dir.link(&old_lower, d)
        })
    }

    /// Removes the child through `call` and prunes its entry.
    fn remove_child(
        &self,
        op: OperationType,
        kind: EventKind,
        parent: NodeId,
        name: &OsStr,
        pid: u32,
        call: impl FnOnce(&LowerInodeRef, &LowerDentryRef) -> LowerResult<()>,
    ) -> Result<()> {
        self.run(op, || {
            let (dir_node, dir) = self.locate(parent)?;
            let entry = self.resolve_held(&dir, name)?;
            let node = entry.require_node()?;
            call(dir_node.lower(), &entry.lower()?).map_err(|e| lower_error(op, e))?;
            self.emit(kind, node.id(), &entry, pid);
            entry.prune();
            Ok(())
        })
    }

    pub fn unlink(&self, parent: NodeId, name: &OsStr, creds: &Credentials) -> Result<()> {
        self.remove_child(OperationType::Unlink, EventKind::Unlink, parent, name, creds.pid, |dir, d| {
            dir.unlink(d)
        })
    }

    pub fn rmdir(&self, parent: NodeId, name: &OsStr, creds: &Credentials) -> Result<()> {
        self.remove_child(OperationType::Rmdir, EventKind::Rmdir, parent, name, creds.pid, |dir, d| {
            dir.rmdir(d)
        })
    }

    /// Renames `parent/name` to `new_parent/new_name`. The old entries are
    /// pruned and the moved node, with every cached descendant, is bound
    /// again under its new name.
    pub fn rename(
        &self,
        parent: NodeId,
        name: &OsStr,
        new_parent: NodeId,
        new_name: &OsStr,
        flags: u32,
        creds: &Credentials,
    ) -> Result<()> {
        self.run(OperationType::Rename, || {
            let (dir_node, dir) = self.locate(parent)?;
            let (new_dir_node, new_dir) = self.locate(new_parent)?;
            let old = self.resolve_held(&dir, name)?;
            let node = old.require_node()?;
            let new = self.binder().bind(&new_dir, new_name, 0)?;
            if let Some(replaced) = new.node() {
                self.nodes.forget(replaced.id(), 1);
            }

            dir_node
                .lower()
                .rename(&old.lower()?, new_dir_node.lower(), &new.lower()?, flags)
                .map_err(|e| lower_error(OperationType::Rename, e))?;

            self.emit(EventKind::Rename, node.id(), &old, creds.pid);
            new.prune();
            match self.resolve_held(&new_dir, new_name) {
                Ok(moved) => self.rebind_children(&old, &moved),
                Err(e) => debug!(name = ?new_name, error = %e, "Renamed entry not rebound"),
            }
            old.prune();
            Ok(())
        })
    }

    /// Binds fresh entries under `to` for the cached children of `from`.
    fn rebind_children(&self, from: &ProxyEntry, to: &Arc<ProxyEntry>) {
        for child in from.cached_children() {
            match self.resolve_held(to, child.name()) {
                Ok(fresh) => self.rebind_children(&child, &fresh),
                Err(e) => debug!(name = ?child.name(), error = %e, "Moved entry not rebound"),
            }
        }
    }

    pub fn listxattr(&self, id: NodeId) -> Result<Vec<OsString>> {
        self.with_node(OperationType::Listxattr, id, |inode, d| inode.listxattr(d))
    }

    pub fn getxattr(&self, id: NodeId, name: &OsStr) -> Result<Vec<u8>> {
        self.with_node(OperationType::Getxattr, id, |inode, d| inode.getxattr(d, name))
    }

    pub fn setxattr(&self, id: NodeId, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        self.with_node(OperationType::Setxattr, id, |inode, d| inode.setxattr(d, name, value, flags))
    }

    pub fn removexattr(&self, id: NodeId, name: &OsStr) -> Result<()> {
        self.with_node(OperationType::Removexattr, id, |inode, d| inode.removexattr(d, name))
    }

    pub fn fiemap(&self, id: NodeId, start: u64, len: u64) -> Result<Vec<Extent>> {
        self.with_node(OperationType::Fiemap, id, |inode, _| inode.fiemap(start, len))
    }

    pub fn update_time(&self, id: NodeId, flags: i32) -> Result<()> {
        self.with_node(OperationType::UpdateTime, id, |inode, _| inode.update_time(flags))
    }

    pub fn get_acl(&self, id: NodeId, typ: AclType) -> Result<Option<Acl>> {
        self.with_node(OperationType::GetAcl, id, |inode, d| inode.get_acl(d, typ))
    }

    pub fn set_acl(&self, id: NodeId, typ: AclType, acl: Option<&Acl>) -> Result<()> {
        self.with_node(OperationType::SetAcl, id, |inode, d| inode.set_acl(d, typ, acl))
    }

    pub fn fileattr_get(&self, id: NodeId) -> Result<FileAttrFlags> {
        self.with_node(OperationType::FileattrGet, id, |inode, d| inode.fileattr_get(d))
    }

    pub fn fileattr_set(&self, id: NodeId, attr: &FileAttrFlags) -> Result<()> {
        self.with_node(OperationType::FileattrSet, id, |inode, d| inode.fileattr_set(d, attr))
    }

    /// Looks up, creates if needed, and opens `parent/name` in one lower
    /// call.
    pub fn atomic_open(
        &self,
        parent: NodeId,
        name: &OsStr,
        flags: OpenFlags,
        mode: u32,
        creds: &Credentials,
    ) -> Result<(Arc<ProxyEntry>, NodeAttr, Arc<ProxyHandle>)> {
        self.run(OperationType::AtomicOpen, || {
            let (dir_node, dir) = self.locate(parent)?;
            let entry = self.binder().bind(&dir, name, 0)?;
            let created = entry.is_negative();
            let opened = entry.lower().and_then(|lower| {
                dir_node
                    .lower()
                    .atomic_open(&lower, flags, mode, creds)
                    .map_err(|e| lower_error(OperationType::AtomicOpen, e))
            });
            let file = self.settle(&entry, opened)?;

            let node = match entry.node() {
                Some(node) => node,
                None => self.instantiate(&dir, &entry, OperationType::AtomicOpen)?,
            };
            let handle = self.handles.adopt(Some(&entry), Arc::clone(&node), file, flags, creds);
            let handle = self.settle(&entry, handle)?;
            self.stats.increment_active_handles();
            let attr = self.entry_attr(&entry)?;

            let kind = if created { EventKind::Create } else { EventKind::Open };
            self.emit(kind, node.id(), &entry, creds.pid);
            Ok((entry, attr, handle))
        })
    }

    /// Creates and opens `parent/name`, using the lower atomic open when
    /// available and create followed by open otherwise.
    pub fn create_and_open(
        &self,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        flags: OpenFlags,
        creds: &Credentials,
    ) -> Result<(Arc<ProxyEntry>, NodeAttr, Arc<ProxyHandle>)> {
        let flags = flags | OpenFlags::CREATE;
        match self.atomic_open(parent, name, flags, mode, creds) {
            Err(ProxyError::NotPossible { .. }) => {
                let excl = flags.contains(OpenFlags::EXCLUSIVE);
                let (entry, attr) = self.create(parent, name, mode, excl, creds)?;
                let node = entry.require_node()?;
                let handle = self.open(node.id(), flags, creds)?;
                Ok((entry, attr, handle))
            }
            other => other,
        }
    }

    /// Opens an unnamed node in the directory `parent`.
    pub fn tmpfile(
        &self,
        parent: NodeId,
        mode: u32,
        flags: OpenFlags,
        creds: &Credentials,
    ) -> Result<Arc<ProxyHandle>> {
        self.run(OperationType::Tmpfile, || {
            let (dir_node, _) = self.locate(parent)?;
            let file = dir_node
                .lower()
                .tmpfile(mode, creds)
                .map_err(|e| lower_error(OperationType::Tmpfile, e))?;
            let node = self.nodes.bind(file.inode());
            let handle = self.handles.adopt(None, node, file, flags, creds)?;
            self.stats.increment_active_handles();
            Ok(handle)
        })
    }

    /// Invalidates the cached child `name` of `parent`.
    pub fn invalidate(&self, parent: NodeId, name: &OsStr) -> Result<InvalidateOutcome> {
        let (_, dir) = self.locate(parent)?;
        match dir.child(name) {
            Some(entry) => self.invalidate_entry(&entry),
            None => Ok(InvalidateOutcome::NotCached),
        }
    }

    /// Drops an unused entry together with the cached pages of its node
    /// and of every handle open on that node. An entry in use is left
    /// untouched.
    pub fn invalidate_entry(&self, entry: &Arc<ProxyEntry>) -> Result<InvalidateOutcome> {
        self.run(OperationType::Invalidate, || {
            if Arc::ptr_eq(entry, &self.root) {
                debug!("Root entry is never invalidated");
                return Ok(InvalidateOutcome::Deferred);
            }
            let holders = entry.holders();
            if holders > 0 {
                warn!(path = %entry.path().display(), holders, "Entry in use, invalidation deferred");
                return Ok(InvalidateOutcome::Deferred);
            }

            let node = entry.node();
            entry.prune();
            if let Some(node) = node {
                if let Some(mapping) = node.lower().mapping() {
                    lift(OperationType::InvalidateRange, mapping.invalidate_range(0, None))?;
                }
                for handle in self.handles.for_node(node.id()) {
                    if let Some(mapping) = handle.lower().mapping() {
                        lift(OperationType::InvalidateRange, mapping.invalidate_range(0, None))?;
                    }
                }
            }
            debug!(path = %entry.path().display(), "Invalidated entry");
            Ok(InvalidateOutcome::Invalidated)
        })
    }
}
