//! Proxy directory entries and the binder that creates them.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::delegate::{lift, ENTRY_OPS};
use crate::error::{ProxyError, Result};
use crate::lower::{LowerDentryRef, LowerMountRef};
use crate::node::{NodeTable, ProxyNode};
use crate::stats::OperationType;

/// Entry-level operations installed on every bound entry.
pub struct EntryOps {
    pub revalidate: fn(&ProxyEntry, u32) -> Result<bool>,
    pub weak_revalidate: fn(&ProxyEntry, u32) -> Result<bool>,
    pub hash: fn(&ProxyEntry, &OsStr) -> Result<u64>,
    pub compare: fn(&ProxyEntry, &OsStr, &OsStr) -> Result<bool>,
    pub delete: fn(&ProxyEntry) -> Result<bool>,
}

/// A named link under a parent entry.
///
/// The lower entry is fixed at construction. It is released once, either
/// when the entry is pruned while unused or when the entry itself drops.
pub struct ProxyEntry {
    name: OsString,
    parent: Weak<ProxyEntry>,
    lower: Mutex<Option<LowerDentryRef>>,
    mount: Option<LowerMountRef>,
    node: Mutex<Option<Arc<ProxyNode>>>,
    children: Mutex<HashMap<OsString, Arc<ProxyEntry>>>,
    ops: OnceLock<&'static EntryOps>,
    holders: AtomicUsize,
    pruned: AtomicBool,
}

impl ProxyEntry {
    pub(crate) fn new(
        name: OsString,
        parent: Weak<ProxyEntry>,
        lower: LowerDentryRef,
        mount: Option<LowerMountRef>,
        node: Option<Arc<ProxyNode>>,
    ) -> Arc<Self> {
        let entry = Arc::new(Self {
            name,
            parent,
            lower: Mutex::new(Some(lower)),
            mount,
            node: Mutex::new(node),
            children: Mutex::new(HashMap::new()),
            ops: OnceLock::new(),
            holders: AtomicUsize::new(0),
            pruned: AtomicBool::new(false),
        });
        if let Some(node) = entry.node() {
            node.add_alias(&entry);
        }
        entry
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<ProxyEntry>> {
        self.parent.upgrade()
    }

    /// Path of the entry relative to the volume root.
    pub fn path(&self) -> PathBuf {
        let mut parts = vec![self.name.clone()];
        let mut cur = self.parent();
        while let Some(entry) = cur {
            parts.push(entry.name.clone());
            cur = entry.parent();
        }
        let mut path = PathBuf::from("/");
        for part in parts.iter().rev().filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }

    /// The bound lower entry.
    pub fn lower(&self) -> Result<LowerDentryRef> {
        self.lower
            .lock()
            .clone()
            .ok_or(ProxyError::Unbound { object: "entry", binding: "entry" })
    }

    pub fn mount(&self) -> Option<&LowerMountRef> {
        self.mount.as_ref()
    }

    /// The node this entry names, `None` for a negative entry.
    pub fn node(&self) -> Option<Arc<ProxyNode>> {
        self.node.lock().clone()
    }

    pub fn require_node(&self) -> Result<Arc<ProxyNode>> {
        self.node().ok_or_else(|| ProxyError::NotFound { name: self.name.clone() })
    }

    pub fn is_negative(&self) -> bool {
        self.node.lock().is_none()
    }

    /// Attaches a node to a negative entry after a successful create.
    pub(crate) fn instantiate(self: &Arc<Self>, node: Arc<ProxyNode>) {
        node.add_alias(self);
        *self.node.lock() = Some(node);
    }

    pub(crate) fn install_ops(&self, ops: &'static EntryOps) {
        let _ = self.ops.set(ops);
    }

    fn ops(&self) -> Result<&'static EntryOps> {
        self.ops
            .get()
            .copied()
            .ok_or(ProxyError::Unbound { object: "entry", binding: "operations" })
    }

    pub fn revalidate(&self, flags: u32) -> Result<bool> {
        (self.ops()?.revalidate)(self, flags)
    }

    pub fn weak_revalidate(&self, flags: u32) -> Result<bool> {
        (self.ops()?.weak_revalidate)(self, flags)
    }

    pub fn hash_name(&self, name: &OsStr) -> Result<u64> {
        (self.ops()?.hash)(self, name)
    }

    pub fn compare_names(&self, name: &OsStr, other: &OsStr) -> Result<bool> {
        (self.ops()?.compare)(self, name, other)
    }

    /// Whether the entry should be dropped as soon as it is unused.
    pub fn should_delete(&self) -> Result<bool> {
        (self.ops()?.delete)(self)
    }

    /// Marks the entry as in use until the returned guard drops.
    pub fn hold(self: &Arc<Self>) -> EntryGuard {
        self.holders.fetch_add(1, Ordering::AcqRel);
        EntryGuard { entry: Arc::clone(self) }
    }

    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned.load(Ordering::Acquire)
    }

    pub fn child(&self, name: &OsStr) -> Option<Arc<ProxyEntry>> {
        self.children.lock().get(name).cloned()
    }

    /// Snapshot of the cached children.
    pub fn cached_children(&self) -> Vec<Arc<ProxyEntry>> {
        self.children.lock().values().cloned().collect()
    }

    pub fn children_count(&self) -> usize {
        self.children.lock().len()
    }

    pub(crate) fn insert_child(&self, child: Arc<ProxyEntry>) {
        self.children.lock().insert(child.name.clone(), child);
    }

    /// Unlinks the entry from its parent's cache. Returns false if it was
    /// already gone.
    pub(crate) fn detach(&self) -> bool {
        if self.pruned.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(parent) = self.parent() {
            let mut siblings = parent.children.lock();
            if siblings
                .get(&self.name)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), self))
            {
                siblings.remove(&self.name);
            }
        }
        true
    }

    /// Detaches the entry and its cached descendants. Lower entries of
    /// entries nobody holds are released now, the rest on final drop.
    pub(crate) fn prune(&self) -> usize {
        self.detach();
        let children: Vec<_> = self.children.lock().drain().map(|(_, c)| c).collect();
        let mut pruned = 1;
        for child in children {
            pruned += child.prune();
        }
        if self.holders() == 0 && self.lower.lock().take().is_some() {
            debug!(entry = ?self.name, "Released lower entry");
        }
        pruned
    }
}

impl Drop for ProxyEntry {
    fn drop(&mut self) {
        if self.lower.get_mut().take().is_some() {
            trace!(entry = ?self.name, "Released lower entry on drop");
        }
    }
}

impl std::fmt::Debug for ProxyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEntry")
            .field("name", &self.name)
            .field("node", &self.node().map(|n| n.id()))
            .field("holders", &self.holders())
            .field("pruned", &self.is_pruned())
            .finish()
    }
}

/// Keeps an entry in use. Invalidation of a held entry is deferred.
pub struct EntryGuard {
    entry: Arc<ProxyEntry>,
}

impl EntryGuard {
    pub fn entry(&self) -> &Arc<ProxyEntry> {
        &self.entry
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.entry.holders.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resolves names against the lower filesystem and binds proxy entries.
pub struct EntryBinder<'a> {
    nodes: &'a NodeTable,
}

impl<'a> EntryBinder<'a> {
    pub fn new(nodes: &'a NodeTable) -> Self {
        Self { nodes }
    }

    /// Resolves `name` under `parent` to a positive entry.
    pub fn resolve(&self, parent: &Arc<ProxyEntry>, name: &OsStr) -> Result<Arc<ProxyEntry>> {
        let entry = self.bind(parent, name, 0)?;
        if entry.is_negative() {
            return Err(ProxyError::NotFound { name: name.to_os_string() });
        }
        Ok(entry)
    }

    /// Resolves `name` under `parent`, returning a negative entry when the
    /// lower filesystem has no node by that name.
    pub(crate) fn bind(
        &self,
        parent: &Arc<ProxyEntry>,
        name: &OsStr,
        flags: u32,
    ) -> Result<Arc<ProxyEntry>> {
        if let Some(cached) = parent.child(name) {
            if let Some(node) = cached.node() {
                let current = self.nodes.adopt(&node);
                if !Arc::ptr_eq(&current, &node) {
                    cached.instantiate(current);
                }
                trace!(parent = ?parent.name(), name = ?name, "Entry cache hit");
                return Ok(cached);
            }
        }

        let parent_lower = parent.lower()?;
        let parent_node = parent.require_node()?;

        // Placeholder: released by drop on every early return below.
        let lower = match parent_lower.lookup_cached(name) {
            Some(dentry) => dentry,
            None => parent_lower
                .alloc_child(name)
                .map_err(|_| ProxyError::AllocationFailure { what: "lower entry" })?,
        };

        lift(OperationType::Lookup, parent_node.lower().lookup(&lower, flags))?;

        let node = lower.inode().map(|inode| self.nodes.bind(inode));
        let mount = lower.mounted().or_else(|| parent.mount().cloned());
        let positive = node.is_some();
        let entry = ProxyEntry::new(name.to_os_string(), Arc::downgrade(parent), lower, mount, node);
        entry.install_ops(&ENTRY_OPS);

        if positive {
            parent.insert_child(Arc::clone(&entry));
            debug!(
                path = %entry.path().display(),
                node = ?entry.node().map(|n| n.id()),
                "Bound proxy entry"
            );
        } else {
            trace!(name = ?name, "Bound negative entry");
        }
        Ok(entry)
    }
}
