//! Open proxy handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::delegate::lower_error;
use crate::entry::{EntryGuard, ProxyEntry};
use crate::error::{ProxyError, Result};
use crate::lower::{LowerFile, LowerFileBox};
use crate::node::ProxyNode;
use crate::stats::OperationType;
use crate::types::{Credentials, HandleId, NodeId, OpenFlags};

/// One open access session. Owns its lower handle; dropping the proxy
/// handle closes the lower one.
pub struct ProxyHandle {
    id: HandleId,
    node: Arc<ProxyNode>,
    flags: OpenFlags,
    creds: Credentials,
    opened_at: SystemTime,
    lower: LowerFileBox,
    /// Unnamed handles (tmpfile) have no entry.
    entry: Option<EntryGuard>,
}

impl ProxyHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn node(&self) -> &Arc<ProxyNode> {
        &self.node
    }

    pub fn entry(&self) -> Option<&Arc<ProxyEntry>> {
        self.entry.as_ref().map(|g| g.entry())
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    /// The bound lower handle.
    pub fn lower(&self) -> &dyn LowerFile {
        self.lower.as_ref()
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("id", &self.id)
            .field("node", &self.node.id())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Opens, tracks and closes proxy handles.
pub struct HandleTable {
    handles: DashMap<HandleId, Arc<ProxyHandle>>,
    next_id: AtomicU64,
    max_open: usize,
}

impl HandleTable {
    pub fn new(max_open: usize) -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_open,
        }
    }

    /// Opens the node named by `entry` at the lower filesystem with the
    /// client's flags and credentials.
    pub fn open(
        &self,
        entry: &Arc<ProxyEntry>,
        flags: OpenFlags,
        creds: &Credentials,
    ) -> Result<Arc<ProxyHandle>> {
        let node = entry.require_node()?;
        let lower_entry = entry.lower()?;
        let lower = node
            .lower()
            .open(&lower_entry, flags, creds)
            .map_err(|e| lower_error(OperationType::Open, e))?;
        self.adopt(Some(entry), node, lower, flags, creds)
    }

    /// Registers an already opened lower handle. On failure the lower
    /// handle is closed before the error is returned.
    pub fn adopt(
        &self,
        entry: Option<&Arc<ProxyEntry>>,
        node: Arc<ProxyNode>,
        lower: LowerFileBox,
        flags: OpenFlags,
        creds: &Credentials,
    ) -> Result<Arc<ProxyHandle>> {
        if self.handles.len() >= self.max_open {
            drop(lower);
            debug!(limit = self.max_open, "Handle table full, closed lower handle");
            return Err(ProxyError::AllocationFailure { what: "proxy handle" });
        }

        let id = HandleId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(ProxyHandle {
            id,
            node,
            flags,
            creds: *creds,
            opened_at: SystemTime::now(),
            lower,
            entry: entry.map(|e| e.hold()),
        });
        self.handles.insert(id, Arc::clone(&handle));
        trace!(handle = %id, node = %handle.node.id(), flags = %flags, "Opened proxy handle");
        Ok(handle)
    }

    pub fn get(&self, id: HandleId) -> Result<Arc<ProxyHandle>> {
        self.handles
            .get(&id)
            .map(|h| h.clone())
            .ok_or(ProxyError::BadHandle(id.get()))
    }

    /// Removes the handle. The lower handle is closed as soon as no
    /// in-flight operation still uses it.
    pub fn close(&self, id: HandleId) -> Result<()> {
        let (_, handle) = self
            .handles
            .remove(&id)
            .ok_or(ProxyError::BadHandle(id.get()))?;
        trace!(handle = %id, node = %handle.node.id(), "Closed proxy handle");
        drop(handle);
        Ok(())
    }

    /// Handles currently open on `node`.
    pub fn for_node(&self, node: NodeId) -> Vec<Arc<ProxyHandle>> {
        self.handles
            .iter()
            .filter(|h| h.node.id() == node)
            .map(|h| h.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Closes every handle, returning how many were open.
    pub fn close_all(&self) -> usize {
        let count = self.handles.len();
        self.handles.clear();
        count
    }
}
