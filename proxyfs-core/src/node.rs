//! Proxy nodes and the table that owns them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::entry::ProxyEntry;
use crate::error::{ProxyError, Result};
use crate::lower::LowerInodeRef;
use crate::types::{FileType, NodeId};

/// One filesystem object of the proxy volume.
///
/// A node always holds exactly one reference to its lower node; the
/// reference is released when the last `Arc<ProxyNode>` goes away.
pub struct ProxyNode {
    id: NodeId,
    kind: FileType,
    lower: LowerInodeRef,
    /// Kernel-style lookup count, decremented by forget.
    lookups: AtomicU64,
    /// The root node is never forgotten.
    pinned: bool,
    /// Entries naming this node, most recently bound last.
    aliases: Mutex<Vec<Weak<ProxyEntry>>>,
}

impl ProxyNode {
    fn new(lower: LowerInodeRef, pinned: bool) -> Self {
        Self {
            id: NodeId::new(lower.ino()),
            kind: lower.kind(),
            lower,
            lookups: AtomicU64::new(0),
            pinned,
            aliases: Mutex::new(Vec::new()),
        }
    }

    /// Identifier, equal to the lower node's identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> FileType {
        self.kind
    }

    /// The bound lower node.
    pub fn lower(&self) -> &LowerInodeRef {
        &self.lower
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Acquire)
    }

    /// Returns a live entry naming this node, preferring the most recently
    /// bound one. Pruned entries are forgotten on the way.
    pub fn alias(&self) -> Option<Arc<ProxyEntry>> {
        let mut aliases = self.aliases.lock();
        aliases.retain(|a| a.upgrade().is_some_and(|e| !e.is_pruned()));
        aliases.last().and_then(Weak::upgrade)
    }

    pub fn alias_count(&self) -> usize {
        self.aliases
            .lock()
            .iter()
            .filter(|a| a.upgrade().is_some_and(|e| !e.is_pruned()))
            .count()
    }

    pub(crate) fn add_alias(&self, entry: &Arc<ProxyEntry>) {
        let mut aliases = self.aliases.lock();
        if !aliases.iter().any(|a| std::ptr::eq(a.as_ptr(), Arc::as_ptr(entry))) {
            aliases.push(Arc::downgrade(entry));
        }
    }
}

impl std::fmt::Debug for ProxyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("lookups", &self.lookup_count())
            .finish()
    }
}

/// Allocates and reclaims proxy nodes, keyed by the lower node identifier.
#[derive(Default)]
pub struct NodeTable {
    nodes: DashMap<NodeId, Arc<ProxyNode>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a proxy node to `lower`, or returns the node already bound to
    /// the same lower identifier. Either way the node's lookup count grows
    /// by one.
    pub fn bind(&self, lower: LowerInodeRef) -> Arc<ProxyNode> {
        self.bind_inner(lower, false)
    }

    /// Binds the root node, which is exempt from forget.
    pub fn bind_root(&self, lower: LowerInodeRef) -> Arc<ProxyNode> {
        self.bind_inner(lower, true)
    }

    fn bind_inner(&self, lower: LowerInodeRef, pinned: bool) -> Arc<ProxyNode> {
        let id = NodeId::new(lower.ino());
        let node = self
            .nodes
            .entry(id)
            .or_insert_with(|| {
                debug!(node = %id, "Bound proxy node");
                Arc::new(ProxyNode::new(lower, pinned))
            })
            .clone();
        node.lookups.fetch_add(1, Ordering::AcqRel);
        node
    }

    /// Re-registers a node held by a cached entry and counts a lookup.
    /// Returns the node the table holds for that identifier, which differs
    /// from `node` only if the identifier was rebound after a forget.
    pub fn adopt(&self, node: &Arc<ProxyNode>) -> Arc<ProxyNode> {
        let current = self
            .nodes
            .entry(node.id())
            .or_insert_with(|| Arc::clone(node))
            .clone();
        current.lookups.fetch_add(1, Ordering::AcqRel);
        current
    }

    pub fn get(&self, id: NodeId) -> Result<Arc<ProxyNode>> {
        self.nodes
            .get(&id)
            .map(|n| n.clone())
            .ok_or(ProxyError::UnknownNode(id.get()))
    }

    /// Drops `nlookup` lookups. The node leaves the table when its count
    /// reaches zero; returns true in that case.
    pub fn forget(&self, id: NodeId, nlookup: u64) -> bool {
        let removed = self.nodes.remove_if(&id, |_, node| {
            if node.pinned {
                return false;
            }
            let prev = node
                .lookups
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(nlookup)))
                .unwrap_or(0);
            prev <= nlookup
        });
        if removed.is_some() {
            debug!(node = %id, "Released proxy node");
        }
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drops every node, releasing the lower references not held elsewhere.
    pub fn clear(&self) -> usize {
        let count = self.nodes.len();
        self.nodes.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::LowerFilesystem;
    use crate::memfs::MemFs;
    use std::path::Path;

    #[test]
    fn test_bind_mirrors_lower_identifier() {
        let fs = MemFs::new();
        let ino = fs.add_file("/a.txt", b"hello");
        let table = NodeTable::new();

        let node = table.bind(fs.inode(ino).unwrap());
        assert_eq!(node.id().get(), ino);
        assert_eq!(node.kind(), FileType::File);
        assert_eq!(node.lookup_count(), 1);

        let again = table.bind(fs.inode(ino).unwrap());
        assert!(Arc::ptr_eq(&node, &again));
        assert_eq!(node.lookup_count(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_forget_releases_lower_reference() {
        let fs = MemFs::new();
        let ino = fs.add_file("/a.txt", b"");
        let table = NodeTable::new();
        let baseline = fs.live_inode_refs();

        table.bind(fs.inode(ino).unwrap());
        table.bind(fs.inode(ino).unwrap());
        assert_eq!(fs.live_inode_refs(), baseline + 1);

        assert!(!table.forget(NodeId::new(ino), 1));
        assert!(table.forget(NodeId::new(ino), 1));
        assert!(table.get(NodeId::new(ino)).is_err());
        assert_eq!(fs.live_inode_refs(), baseline);
    }

    #[test]
    fn test_alias_falls_back_to_live_entry() {
        let fs = MemFs::new();
        let ino = fs.add_file("/a", b"");
        let table = NodeTable::new();
        let node = table.bind(fs.inode(ino).unwrap());
        let lower = fs.resolve_path(Path::new("/a")).unwrap();

        let first = ProxyEntry::new("a".into(), Weak::new(), lower.dentry.clone(), None, Some(node.clone()));
        let second = ProxyEntry::new("b".into(), Weak::new(), lower.dentry, None, Some(node.clone()));
        assert!(Arc::ptr_eq(&node.alias().unwrap(), &second));
        assert_eq!(node.alias_count(), 2);

        second.prune();
        assert!(Arc::ptr_eq(&node.alias().unwrap(), &first));
        assert_eq!(node.alias_count(), 1);

        drop(first);
        assert!(node.alias().is_none());
    }

    #[test]
    fn test_root_is_pinned() {
        let fs = MemFs::new();
        let table = NodeTable::new();
        let root = table.bind_root(fs.inode(MemFs::ROOT_INO).unwrap());

        assert!(!table.forget(root.id(), 10));
        assert!(table.get(root.id()).is_ok());
        assert_eq!(table.clear(), 1);
        assert!(table.is_empty());
    }
}
