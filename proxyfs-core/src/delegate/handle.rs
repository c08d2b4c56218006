//! Handle I/O.

use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use super::{lift, lower_error};
use crate::error::{LowerError, LowerResult, ProxyError, Result};
use crate::event::EventKind;
use crate::handle::ProxyHandle;
use crate::lower::LowerFile;
use crate::stats::OperationType;
use crate::types::{
    Credentials, DirEntry, HandleId, LockRequest, MapRequest, NodeId, OpenFlags, Whence,
};
use crate::volume::ProxyFs;

impl ProxyFs {
    fn with_handle<T: Default>(
        &self,
        op: OperationType,
        fh: HandleId,
        call: impl FnOnce(&dyn LowerFile) -> LowerResult<T>,
    ) -> Result<T> {
        self.run(op, || {
            let handle = self.handles.get(fh)?;
            lift(op, call(handle.lower()))
        })
    }

    /// Opens the node `id` on behalf of `creds`.
    pub fn open(&self, id: NodeId, flags: OpenFlags, creds: &Credentials) -> Result<Arc<ProxyHandle>> {
        self.run(OperationType::Open, || {
            let (node, entry) = self.locate(id)?;
            let handle = self.handles.open(&entry, flags, creds)?;
            self.stats.increment_active_handles();
            self.emit(EventKind::Open, node.id(), &entry, creds.pid);
            Ok(handle)
        })
    }

    /// Closes a handle. The lower handle is released exactly once, when
    /// the last in-flight use of it ends.
    pub fn release(&self, fh: HandleId) -> Result<()> {
        self.run(OperationType::Release, || {
            self.handles.close(fh)?;
            self.stats.decrement_active_handles();
            Ok(())
        })
    }

    pub fn llseek(&self, fh: HandleId, offset: i64, whence: Whence) -> Result<u64> {
        self.with_handle(OperationType::Llseek, fh, |f| f.llseek(offset, whence))
    }

    pub fn read(&self, fh: HandleId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.with_handle(OperationType::Read, fh, |f| f.read(offset, buf))?;
        self.stats.add_bytes_read(n as u64);
        Ok(n)
    }

    pub fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        let n = self.with_handle(OperationType::Write, fh, |f| f.write(offset, data))?;
        self.stats.add_bytes_written(n as u64);
        Ok(n)
    }

    pub fn read_vectored(&self, fh: HandleId, offset: u64, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let n = self.with_handle(OperationType::ReadIter, fh, |f| f.read_vectored(offset, bufs))?;
        self.stats.add_bytes_read(n as u64);
        Ok(n)
    }

    pub fn write_vectored(&self, fh: HandleId, offset: u64, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let n = self.with_handle(OperationType::WriteIter, fh, |f| f.write_vectored(offset, bufs))?;
        self.stats.add_bytes_written(n as u64);
        Ok(n)
    }

    /// Directory entries after `offset`.
    pub fn readdir(&self, fh: HandleId, offset: i64) -> Result<Vec<DirEntry>> {
        self.with_handle(OperationType::Iterate, fh, |f| f.iterate(offset))
    }

    pub fn ioctl(&self, fh: HandleId, cmd: u32, arg: &[u8]) -> Result<Vec<u8>> {
        self.run(OperationType::Ioctl, || {
            let handle = self.handles.get(fh)?;
            match handle.lower().ioctl(cmd, arg) {
                Err(LowerError::NotImplemented) => Err(ProxyError::NoIoctl { cmd }),
                other => other.map_err(|e| lower_error(OperationType::Ioctl, e)),
            }
        })
    }

    pub fn compat_ioctl(&self, fh: HandleId, cmd: u32, arg: &[u8]) -> Result<Vec<u8>> {
        self.run(OperationType::CompatIoctl, || {
            let handle = self.handles.get(fh)?;
            match handle.lower().compat_ioctl(cmd, arg) {
                Err(LowerError::NotImplemented) => Err(ProxyError::NoIoctl { cmd }),
                other => other.map_err(|e| lower_error(OperationType::CompatIoctl, e)),
            }
        })
    }

    pub fn mmap(&self, fh: HandleId, request: &MapRequest) -> Result<()> {
        self.with_handle(OperationType::Mmap, fh, |f| f.mmap(request))
    }

    pub fn flush(&self, fh: HandleId, lock_owner: u64) -> Result<()> {
        self.with_handle(OperationType::Flush, fh, |f| f.flush(lock_owner))
    }

    pub fn fsync(&self, fh: HandleId, start: u64, end: u64, datasync: bool) -> Result<()> {
        self.with_handle(OperationType::Fsync, fh, |f| f.fsync(start, end, datasync))
    }

    pub fn fasync(&self, fh: HandleId, fd: i32, on: bool) -> Result<()> {
        self.with_handle(OperationType::Fasync, fh, |f| f.fasync(fd, on))
    }

    pub fn lock(&self, fh: HandleId, cmd: i32, request: &LockRequest) -> Result<LockRequest> {
        self.run(OperationType::Lock, || {
            let handle = self.handles.get(fh)?;
            handle
                .lower()
                .lock(cmd, request)
                .map_err(|e| lower_error(OperationType::Lock, e))
        })
    }

    pub fn flock(&self, fh: HandleId, operation: i32) -> Result<()> {
        self.with_handle(OperationType::Flock, fh, |f| f.flock(operation))
    }

    pub fn check_flags(&self, fh: HandleId, flags: OpenFlags) -> Result<()> {
        self.with_handle(OperationType::CheckFlags, fh, |f| f.check_flags(flags))
    }

    pub fn splice_read(&self, fh: HandleId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.with_handle(OperationType::SpliceRead, fh, |f| f.splice_read(offset, len))?;
        self.stats.add_bytes_read(data.len() as u64);
        Ok(data)
    }

    pub fn splice_write(&self, fh: HandleId, offset: u64, data: &[u8]) -> Result<usize> {
        let n = self.with_handle(OperationType::SpliceWrite, fh, |f| f.splice_write(offset, data))?;
        self.stats.add_bytes_written(n as u64);
        Ok(n)
    }

    /// Copies `len` bytes between two open handles inside the lower
    /// filesystem.
    pub fn copy_file_range(
        &self,
        fh_in: HandleId,
        offset_in: u64,
        fh_out: HandleId,
        offset_out: u64,
        len: u64,
        flags: u32,
    ) -> Result<u64> {
        self.run(OperationType::CopyFileRange, || {
            let src = self.handles.get(fh_in)?;
            let dst = self.handles.get(fh_out)?;
            let copied = lift(
                OperationType::CopyFileRange,
                src.lower().copy_file_range(offset_in, dst.lower(), offset_out, len, flags),
            )?;
            self.stats.add_bytes_written(copied);
            Ok(copied)
        })
    }

    pub fn remap_file_range(
        &self,
        fh_in: HandleId,
        pos_in: u64,
        fh_out: HandleId,
        pos_out: u64,
        len: u64,
        remap_flags: u32,
    ) -> Result<u64> {
        self.run(OperationType::RemapFileRange, || {
            let src = self.handles.get(fh_in)?;
            let dst = self.handles.get(fh_out)?;
            lift(
                OperationType::RemapFileRange,
                src.lower().remap_file_range(pos_in, dst.lower(), pos_out, len, remap_flags),
            )
        })
    }

    pub fn fallocate(&self, fh: HandleId, mode: i32, offset: u64, len: u64) -> Result<()> {
        self.with_handle(OperationType::Fallocate, fh, |f| f.fallocate(mode, offset, len))
    }

    pub fn fadvise(&self, fh: HandleId, offset: u64, len: u64, advice: i32) -> Result<()> {
        self.with_handle(OperationType::Fadvise, fh, |f| f.fadvise(offset, len, advice))
    }

    pub fn setlease(&self, fh: HandleId, arg: i32) -> Result<()> {
        self.with_handle(OperationType::Setlease, fh, |f| f.setlease(arg))
    }
}
