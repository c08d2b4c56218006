//! Fixed-capacity pool of pre-allocated notification buffers.
//!
//! The pool owns `count` buffers of `size` bytes each. A bitmap records
//! which slots are handed out; `in_use` always equals the number of set bits.
//! Acquisition never blocks beyond the pool lock, which is held only for the
//! O(count) bitmap scan. A [`PoolBuffer`] returns itself to its pool when
//! dropped, so a buffer cannot be freed twice.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};

const WORD_BITS: usize = u64::BITS as usize;

/// Snapshot of the pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub count: usize,
    pub size: usize,
    pub in_use: usize,
}

struct SlotState {
    /// Buffers currently parked in the pool; `None` while handed out.
    slots: Vec<Option<Box<[u8]>>>,
    /// Address of each slot's buffer, fixed for the pool's lifetime.
    addrs: Vec<usize>,
    bitmap: Vec<u64>,
}

impl SlotState {
    fn first_free(&self, count: usize) -> Option<usize> {
        self.bitmap.iter().enumerate().find_map(|(w, word)| {
            let bit = word.trailing_ones() as usize;
            let idx = w * WORD_BITS + bit;
            (bit < WORD_BITS && idx < count).then_some(idx)
        })
    }

    fn set(&mut self, idx: usize) {
        self.bitmap[idx / WORD_BITS] |= 1 << (idx % WORD_BITS);
    }

    /// Clears the bit, returning whether it was set.
    fn test_and_clear(&mut self, idx: usize) -> bool {
        let mask = 1 << (idx % WORD_BITS);
        let word = &mut self.bitmap[idx / WORD_BITS];
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }

    fn popcount(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }
}

struct PoolShared {
    count: usize,
    size: usize,
    state: Mutex<SlotState>,
    in_use: AtomicUsize,
}

impl PoolShared {
    /// Parks `buf` in the slot whose address it carries.
    fn give_back(&self, buf: Box<[u8]>) -> std::result::Result<(), Box<[u8]>> {
        let addr = buf.as_ptr() as usize;
        let mut state = self.state.lock();
        let Some(idx) = state.addrs.iter().position(|a| *a == addr) else {
            return Err(buf);
        };
        if !state.test_and_clear(idx) {
            return Err(buf);
        }
        state.slots[idx] = Some(buf);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

/// A pool of equally sized byte buffers.
pub struct BufferPool {
    shared: RwLock<Option<Arc<PoolShared>>>,
}

impl BufferPool {
    /// Allocates `count` buffers of `size` bytes.
    ///
    /// Either every buffer is allocated or none is: buffers allocated before
    /// a failure are freed before the error is returned.
    pub fn new(count: usize, size: usize) -> Result<Self> {
        if count == 0 || size == 0 {
            return Err(ProxyError::InvalidPoolConfig { count, size });
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| ProxyError::AllocationFailure { what: "buffer pool slots" })?;
        for _ in 0..count {
            let mut buf: Vec<u8> = Vec::new();
            buf.try_reserve_exact(size)
                .map_err(|_| ProxyError::AllocationFailure { what: "buffer pool buffer" })?;
            buf.resize(size, 0);
            slots.push(Some(buf.into_boxed_slice()));
        }

        let addrs = slots
            .iter()
            .flatten()
            .map(|b| b.as_ptr() as usize)
            .collect();
        let words = count.div_ceil(WORD_BITS);

        info!(count, size, "Created buffer pool");
        Ok(Self {
            shared: RwLock::new(Some(Arc::new(PoolShared {
                count,
                size,
                state: Mutex::new(SlotState { slots, addrs, bitmap: vec![0; words] }),
                in_use: AtomicUsize::new(0),
            }))),
        })
    }

    /// Allocates the buffers of a pool that was destroyed or never
    /// initialised. Does nothing on a live pool.
    pub fn init(&self, count: usize, size: usize) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let fresh = Self::new(count, size)?;
        let shared = fresh.shared.write().take();
        let mut current = self.shared.write();
        if current.is_none() {
            *current = shared;
        }
        Ok(())
    }

    /// A pool with no buffers, as left behind by a failed init.
    pub fn uninitialized() -> Self {
        Self { shared: RwLock::new(None) }
    }

    fn shared(&self) -> Result<Arc<PoolShared>> {
        self.shared.read().clone().ok_or(ProxyError::PoolUninitialized)
    }

    /// Hands out the first free buffer without blocking.
    pub fn acquire(&self) -> Result<PoolBuffer> {
        let shared = self.shared()?;
        let (idx, data) = {
            let mut state = shared.state.lock();
            let Some(idx) = state.first_free(shared.count) else {
                warn!(count = shared.count, "Buffer pool exhausted");
                return Err(ProxyError::PoolExhausted { count: shared.count });
            };
            let Some(data) = state.slots[idx].take() else {
                return Err(ProxyError::PoolExhausted { count: shared.count });
            };
            state.set(idx);
            shared.in_use.fetch_add(1, Ordering::AcqRel);
            (idx, data)
        };

        Ok(PoolBuffer {
            data: Some(data),
            slot: idx,
            pool: Arc::downgrade(&shared),
        })
    }

    /// Returns a buffer to this pool. Returns false if the buffer was not
    /// handed out by this pool, in which case it goes back to its own pool.
    pub fn release(&self, mut buf: PoolBuffer) -> bool {
        let Ok(shared) = self.shared() else {
            return false;
        };
        let ours = buf
            .pool
            .upgrade()
            .is_some_and(|owner| Arc::ptr_eq(&owner, &shared));
        if !ours {
            debug!("Buffer released to a pool that does not own it");
            return false;
        }
        match buf.data.take() {
            Some(data) => shared.give_back(data).is_ok(),
            None => false,
        }
    }

    /// Frees every buffer. Safe to call repeatedly and on a pool that was
    /// never initialised; buffers still handed out are freed when dropped.
    pub fn destroy(&self) {
        if let Some(shared) = self.shared.write().take() {
            let in_use = shared.in_use.load(Ordering::Acquire);
            if in_use > 0 {
                warn!(in_use, "Destroying buffer pool with buffers still in use");
            }
            info!(count = shared.count, "Destroyed buffer pool");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.read().is_some()
    }

    /// Size of every buffer, 0 when not initialised.
    pub fn buffer_size(&self) -> usize {
        self.shared.read().as_ref().map_or(0, |s| s.size)
    }

    pub fn stats(&self) -> Option<PoolStats> {
        self.shared.read().as_ref().map(|s| PoolStats {
            count: s.count,
            size: s.size,
            in_use: s.in_use.load(Ordering::Acquire),
        })
    }

    /// Number of set bits in the slot bitmap.
    pub fn allocated_slots(&self) -> usize {
        self.shared
            .read()
            .as_ref()
            .map_or(0, |s| s.state.lock().popcount())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A buffer handed out by a [`BufferPool`]. Dropping it returns it.
pub struct PoolBuffer {
    data: Option<Box<[u8]>>,
    slot: usize,
    pool: Weak<PoolShared>,
}

impl PoolBuffer {
    /// Index of the pool slot this buffer occupies.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.deref().as_ptr()
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.upgrade()) {
            if pool.give_back(data).is_err() {
                warn!(slot = self.slot, "Pool buffer did not match any slot");
            }
        }
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("slot", &self.slot)
            .field("len", &self.len())
            .finish()
    }
}
