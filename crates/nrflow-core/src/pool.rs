//! Fixed-size block pool shared by the producer and every worker.
//!
//! Free blocks form an intrusive Treiber stack threaded through
//! `BlockHeader::next_free`. The stack head packs a 32-bit ABA tag with the
//! top index so a pop racing with a pop/push pair of the same block fails its
//! CAS instead of corrupting the list. Acquire and release are lock-free and
//! never block; an empty pool is reported as `None`.
//!
//! Every block also carries an owner tag (`OwnerState`) that is swapped on
//! each hand-off. Releasing a block that is already free is detected from the
//! previous tag, counted as a violation and refused, so the free list itself
//! can never be corrupted by a double release.

use std::fmt;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tracing::{error, warn};

use crate::arena::SharedArena;
use crate::error::PoolError;
use crate::layout::FREE_LIST_END;

const STATE_MASK: u32 = 0xFF;
const WORKER_SHIFT: u32 = 8;

const TAG_FREE: u32 = 0;
const TAG_FILLING: u32 = 1;
const TAG_IN_FLIGHT: u32 = 2;
const TAG_HELD: u32 = 3;

/// Pack an ABA tag and a top-of-stack index
#[inline]
pub(crate) const fn pack_top(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

#[inline]
const fn unpack_top(top: u64) -> (u32, u32) {
    ((top >> 32) as u32, top as u32)
}

/// Who currently owns a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerState {
    /// On the free list
    Free,
    /// Acquired by the producer, being written
    Filling,
    /// Published to a ring, not yet dequeued
    InFlight,
    /// Dequeued by the given worker
    Held(u32),
}

impl OwnerState {
    /// Encoded owner tag: state in the low byte, worker id above it
    #[must_use]
    pub const fn tag(self) -> u32 {
        match self {
            OwnerState::Free => TAG_FREE,
            OwnerState::Filling => TAG_FILLING,
            OwnerState::InFlight => TAG_IN_FLIGHT,
            OwnerState::Held(worker) => TAG_HELD | (worker << WORKER_SHIFT),
        }
    }

    /// Decode an owner tag
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag & STATE_MASK {
            TAG_FREE if tag == TAG_FREE => Some(OwnerState::Free),
            TAG_FILLING if tag == TAG_FILLING => Some(OwnerState::Filling),
            TAG_IN_FLIGHT if tag == TAG_IN_FLIGHT => Some(OwnerState::InFlight),
            TAG_HELD => Some(OwnerState::Held(tag >> WORKER_SHIFT)),
            _ => None,
        }
    }
}

impl fmt::Display for OwnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerState::Free => f.write_str("free"),
            OwnerState::Filling => f.write_str("filling"),
            OwnerState::InFlight => f.write_str("in-flight"),
            OwnerState::Held(worker) => write!(f, "held by worker {worker}"),
        }
    }
}

/// Ownership token for one block
///
/// Handles are deliberately not `Clone`: passing one on transfers
/// ownership of the block.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockHandle(u32);

impl BlockHandle {
    /// Block index within the arena
    #[must_use]
    pub fn index(&self) -> u32 {
        self.0
    }

    /// Rebuild a handle from an index read out of shared memory
    ///
    /// Used by rings and recovery paths; the owner tag still guards against
    /// misuse.
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }
}

/// Read-only view of a filled block
#[derive(Debug, Clone, Copy)]
pub struct BlockView<'a> {
    /// Block index
    pub index: u32,
    /// Ring the block was routed to
    pub ring: u32,
    /// Per-ring offer sequence
    pub seq: u64,
    /// Monotonic enqueue time, nanoseconds
    pub enqueued_at_ns: u64,
    /// Payload
    pub data: &'a [u8],
}

impl BlockView<'_> {
    /// Payload length
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Writable access to a block the caller owns
pub struct BlockMut<'a> {
    arena: &'a SharedArena,
    index: u32,
}

impl BlockMut<'_> {
    /// Block capacity in bytes
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.block_size()
    }

    /// Copy `payload` into the block and set its length
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Oversized` if the payload does not fit; the block
    /// is left untouched.
    pub fn fill(&mut self, payload: &[u8]) -> Result<usize, PoolError> {
        let capacity = self.capacity();
        if payload.len() > capacity {
            return Err(PoolError::Oversized {
                len: payload.len(),
                capacity,
            });
        }
        self.data_mut()[..payload.len()].copy_from_slice(payload);
        self.set_len(payload.len());
        Ok(payload.len())
    }

    /// Whole data area
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: the caller holds the block's handle mutably, so no other
        // participant touches this block's data (owner-tag protocol); the
        // data area is block_size bytes inside the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.arena.block_data(self.index), self.capacity()) }
    }

    /// Set the payload length (clamped to capacity)
    pub fn set_len(&mut self, len: usize) {
        let len = len.min(self.capacity()) as u32;
        self.arena
            .block_header(self.index)
            .len
            .store(len, Ordering::Relaxed);
    }

    /// Stamp routing metadata
    pub fn set_meta(&mut self, ring: u32, seq: u64, enqueued_at_ns: u64) {
        let header = self.arena.block_header(self.index);
        header.ring.store(ring, Ordering::Relaxed);
        header.seq.store(seq, Ordering::Relaxed);
        header.enqueued_at_ns.store(enqueued_at_ns, Ordering::Relaxed);
    }
}

/// Owner-state census of every block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCensus {
    /// Blocks on the free list (by owner tag)
    pub free: u32,
    /// Blocks being filled by the producer
    pub filling: u32,
    /// Blocks sitting in rings
    pub in_flight: u32,
    /// Blocks held by workers
    pub held: u32,
    /// Tags that decode to no known state
    pub unknown: u32,
    /// Total blocks
    pub total: u32,
    /// Free-list counter (should equal `free` when quiescent)
    pub free_count: u32,
}

impl PoolCensus {
    /// Whether every block is accounted for and back on the free list
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.free == self.total && self.free_count == self.total && self.unknown == 0
    }
}

/// Lock-free block allocator over an arena
#[derive(Clone, Copy)]
pub struct MemoryPool<'a> {
    arena: &'a SharedArena,
}

impl<'a> MemoryPool<'a> {
    pub(crate) fn new(arena: &'a SharedArena) -> Self {
        Self { arena }
    }

    /// Number of blocks
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.arena.block_count()
    }

    /// Usable bytes per block
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.arena.block_size()
    }

    /// Blocks currently on the free list
    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.arena.free_list().free_count.load(Ordering::Relaxed)
    }

    fn check(&self, index: u32) -> Result<(), PoolError> {
        if index >= self.capacity() {
            return Err(PoolError::InvalidHandle {
                index,
                count: self.capacity(),
            });
        }
        Ok(())
    }

    /// Pop a free block; `None` when the pool is exhausted
    ///
    /// The returned block is tagged `Filling` and has length 0.
    pub fn acquire(&self) -> Option<BlockHandle> {
        let free_list = self.arena.free_list();
        let mut top = free_list.top.load(Ordering::Acquire);

        let index = loop {
            let (tag, index) = unpack_top(top);
            if index == FREE_LIST_END {
                return None;
            }
            if index >= self.capacity() {
                error!("Free list head holds invalid block index {}", index);
                self.arena.record_violation();
                return None;
            }
            let next = self
                .arena
                .block_header(index)
                .next_free
                .load(Ordering::Acquire);
            let new_top = pack_top(tag.wrapping_add(1), next);
            match free_list.top.compare_exchange_weak(
                top,
                new_top,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break index,
                Err(actual) => top = actual,
            }
        };

        free_list.free_count.fetch_sub(1, Ordering::Relaxed);
        let header = self.arena.block_header(index);
        let previous = header.owner.swap(OwnerState::Filling.tag(), Ordering::AcqRel);
        if previous != OwnerState::Free.tag() {
            warn!(
                "Block {} popped from free list with owner tag 0x{:08X}",
                index, previous
            );
            self.arena.record_violation();
        }
        header.len.store(0, Ordering::Relaxed);
        Some(BlockHandle(index))
    }

    /// Return a block to the free list
    ///
    /// # Errors
    ///
    /// Returns `PoolError::DoubleRelease` if the block is already free (the
    /// free list is left unchanged) and `PoolError::InvalidHandle` for an
    /// index outside the pool.
    pub fn release(&self, handle: BlockHandle) -> Result<(), PoolError> {
        let index = handle.0;
        self.check(index)?;

        let header = self.arena.block_header(index);
        let previous = header.owner.swap(OwnerState::Free.tag(), Ordering::AcqRel);
        if previous == OwnerState::Free.tag() {
            self.arena.record_violation();
            error!("Double release of block {}", index);
            return Err(PoolError::DoubleRelease { index });
        }

        let free_list = self.arena.free_list();
        let mut top = free_list.top.load(Ordering::Acquire);
        loop {
            let (tag, head) = unpack_top(top);
            header.next_free.store(head, Ordering::Relaxed);
            let new_top = pack_top(tag.wrapping_add(1), index);
            match free_list.top.compare_exchange_weak(
                top,
                new_top,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => top = actual,
            }
        }
        free_list.free_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current owner of a block
    #[must_use]
    pub fn owner(&self, handle: &BlockHandle) -> Option<OwnerState> {
        self.owner_of(handle.0)
    }

    /// Current owner of block `index`
    #[must_use]
    pub fn owner_of(&self, index: u32) -> Option<OwnerState> {
        if index >= self.capacity() {
            return None;
        }
        OwnerState::from_tag(self.arena.block_header(index).owner.load(Ordering::Acquire))
    }

    /// Move a block from `from` to `to`
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidOwner` if the block was not in `from`.
    pub fn transition(
        &self,
        handle: &BlockHandle,
        from: OwnerState,
        to: OwnerState,
    ) -> Result<(), PoolError> {
        self.check(handle.0)?;
        self.arena
            .block_header(handle.0)
            .owner
            .compare_exchange(from.tag(), to.tag(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|found| {
                self.arena.record_violation();
                PoolError::InvalidOwner {
                    index: handle.0,
                    expected: from.tag(),
                    found,
                }
            })
    }

    /// Read-only view of a block
    #[must_use]
    pub fn view(&self, handle: &BlockHandle) -> BlockView<'a> {
        let arena = self.arena;
        let header = arena.block_header(handle.0);
        let len = (header.len.load(Ordering::Acquire) as usize).min(arena.block_size());
        // SAFETY: the handle proves ownership; the payload is `len` bytes of
        // the block's data area, written before the block was published.
        let data = unsafe { std::slice::from_raw_parts(arena.block_data(handle.0), len) };
        BlockView {
            index: handle.0,
            ring: header.ring.load(Ordering::Relaxed),
            seq: header.seq.load(Ordering::Relaxed),
            enqueued_at_ns: header.enqueued_at_ns.load(Ordering::Relaxed),
            data,
        }
    }

    /// Writable access to a block
    pub fn block_mut<'h>(&self, handle: &'h mut BlockHandle) -> BlockMut<'h>
    where
        'a: 'h,
    {
        BlockMut {
            arena: self.arena,
            index: handle.0,
        }
    }

    /// Count blocks by owner tag
    #[must_use]
    pub fn census(&self) -> PoolCensus {
        let mut census = PoolCensus {
            total: self.capacity(),
            free_count: self.free_count(),
            ..Default::default()
        };
        for index in 0..self.capacity() {
            match self.owner_of(index) {
                Some(OwnerState::Free) => census.free += 1,
                Some(OwnerState::Filling) => census.filling += 1,
                Some(OwnerState::InFlight) => census.in_flight += 1,
                Some(OwnerState::Held(_)) => census.held += 1,
                None => census.unknown += 1,
            }
        }
        census
    }

    /// Release every block held by `worker`; returns how many were reclaimed
    ///
    /// Only valid once the worker is known to be gone.
    pub fn reclaim_held_by(&self, worker: u32) -> u32 {
        let wanted = OwnerState::Held(worker).tag();
        let mut reclaimed = 0;
        for index in 0..self.capacity() {
            let owner = &self.arena.block_header(index).owner;
            if owner.load(Ordering::Acquire) == wanted && self.release(BlockHandle(index)).is_ok()
            {
                reclaimed += 1;
            }
        }
        reclaimed
    }
}
