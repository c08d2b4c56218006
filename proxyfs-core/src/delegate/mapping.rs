//! Cached-page operations.
//!
//! Every operation targets the page mapping of a node. A node whose lower
//! counterpart has no mapping reports the operation as unsupported.

use super::lift;
use crate::error::{LowerResult, ProxyError, Result};
use crate::lower::{DirectIo, LowerFile, LowerMapping, LowerMappingRef};
use crate::stats::OperationType;
use crate::types::{HandleId, NodeId, PageIndex};
use crate::volume::ProxyFs;

impl ProxyFs {
    fn mapping_of(&self, op: OperationType, id: NodeId) -> Result<LowerMappingRef> {
        let node = self.nodes.get(id)?;
        node.lower()
            .mapping()
            .ok_or(ProxyError::Unsupported { operation: op.name() })
    }

    fn with_mapping<T: Default>(
        &self,
        op: OperationType,
        id: NodeId,
        call: impl FnOnce(&dyn LowerMapping) -> LowerResult<T>,
    ) -> Result<T> {
        self.run(op, || {
            let mapping = self.mapping_of(op, id)?;
            lift(op, call(mapping.as_ref()))
        })
    }

    /// Same as `with_mapping`, also passing the lower handle of `fh`.
    fn with_mapping_file<T: Default>(
        &self,
        op: OperationType,
        id: NodeId,
        fh: Option<HandleId>,
        call: impl FnOnce(&dyn LowerMapping, Option<&dyn LowerFile>) -> LowerResult<T>,
    ) -> Result<T> {
        self.run(op, || {
            let mapping = self.mapping_of(op, id)?;
            let handle = fh.map(|fh| self.handles.get(fh)).transpose()?;
            lift(op, call(mapping.as_ref(), handle.as_ref().map(|h| h.lower())))
        })
    }

    pub fn read_page(
        &self,
        id: NodeId,
        fh: Option<HandleId>,
        index: PageIndex,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.with_mapping_file(OperationType::ReadFolio, id, fh, |m, f| m.read_folio(f, index, buf))
    }

    pub fn write_page(&self, id: NodeId, index: PageIndex, data: &[u8]) -> Result<()> {
        self.with_mapping(OperationType::Writepage, id, |m| m.writepage(index, data))
    }

    pub fn write_pages(&self, id: NodeId, start: PageIndex, end: PageIndex) -> Result<u64> {
        self.with_mapping(OperationType::Writepages, id, |m| m.writepages(start, end))
    }

    pub fn dirty_page(&self, id: NodeId, index: PageIndex) -> Result<bool> {
        self.with_mapping(OperationType::DirtyFolio, id, |m| m.dirty_folio(index))
    }

    pub fn readahead(&self, id: NodeId, start: PageIndex, nr_pages: u64) -> Result<u64> {
        self.with_mapping(OperationType::Readahead, id, |m| m.readahead(start, nr_pages))
    }

    pub fn write_begin(&self, id: NodeId, fh: Option<HandleId>, pos: u64, len: usize) -> Result<()> {
        self.with_mapping_file(OperationType::WriteBegin, id, fh, |m, f| m.write_begin(f, pos, len))
    }

    pub fn write_end(&self, id: NodeId, fh: Option<HandleId>, pos: u64, data: &[u8]) -> Result<usize> {
        self.with_mapping_file(OperationType::WriteEnd, id, fh, |m, f| m.write_end(f, pos, data))
    }

    pub fn bmap(&self, id: NodeId, block: u64) -> Result<u64> {
        self.with_mapping(OperationType::Bmap, id, |m| m.bmap(block))
    }

    pub fn invalidate_page(&self, id: NodeId, index: PageIndex, offset: usize, len: usize) -> Result<()> {
        self.with_mapping(OperationType::InvalidateFolio, id, |m| m.invalidate_folio(index, offset, len))
    }

    /// Drops cached pages `start..=end`; `None` runs to the end of the node.
    pub fn invalidate_pages(&self, id: NodeId, start: PageIndex, end: Option<PageIndex>) -> Result<()> {
        self.run(OperationType::InvalidateRange, || {
            let node = self.nodes.get(id)?;
            match node.lower().mapping() {
                Some(mapping) => lift(OperationType::InvalidateRange, mapping.invalidate_range(start, end)),
                None => Ok(()),
            }
        })
    }

    pub fn release_page(&self, id: NodeId, index: PageIndex) -> Result<bool> {
        self.with_mapping(OperationType::ReleaseFolio, id, |m| m.release_folio(index))
    }

    pub fn direct_io(&self, id: NodeId, fh: Option<HandleId>, offset: u64, io: DirectIo<'_>) -> Result<usize> {
        self.with_mapping_file(OperationType::DirectIo, id, fh, |m, f| m.direct_io(f, offset, io))
    }

    pub fn launder_page(&self, id: NodeId, index: PageIndex) -> Result<()> {
        self.with_mapping(OperationType::LaunderFolio, id, |m| m.launder_folio(index))
    }

    pub fn is_partially_uptodate(&self, id: NodeId, index: PageIndex, from: usize, count: usize) -> Result<bool> {
        self.with_mapping(OperationType::IsPartiallyUptodate, id, |m| {
            m.is_partially_uptodate(index, from, count)
        })
    }
}
