//! Shared-memory arena layout.
//!
//! Every structure here is `repr(C)` and lives inside the mapped segment, so
//! it must be valid when zero-filled and must never hold a pointer. All
//! cross-process references are arena-relative offsets or block indices.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ArenaHeader (128 bytes): magic, version, state, geometry    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  FreeListHead: tagged top-of-stack, free count, violations   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  RingMeta × ring_count                                       │
//! │    tail | head | endpoints | data sem | space sem | counters │
//! │    control mailbox | worker statistics                       │
//! │    slots (ring_capacity × u32 block index)                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Blocks × block_count                                        │
//! │    BlockHeader (64 bytes) | data (block_size bytes)          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::mem::size_of;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64};

use serde::Serialize;

use crate::control::ControlMailbox;
use crate::error::ArenaError;
use crate::semaphore::ShmSemaphore;
use crate::stats::WorkerStatsBlock;

/// Magic bytes identifying an nrflow segment
pub const MAGIC: [u8; 8] = *b"NRFLOW\0\0";

/// Layout version; bump on any change to a `repr(C)` structure below
pub const LAYOUT_VERSION: u32 = 3;

/// Cache line size used for padding
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of the per-block header preceding the data bytes
pub const BLOCK_HEADER_SIZE: usize = 64;

/// Free-list terminator
pub const FREE_LIST_END: u32 = u32::MAX;

/// Upper bound on rings (and therefore workers) per arena
pub const MAX_RINGS: usize = 256;

const PAGE_SIZE: u64 = 4096;

/// Header written by the creator and checked by every attacher.
pub mod arena_state {
    /// Creator is still initializing
    pub const INITIALIZING: u32 = 0;
    /// Segment is usable
    pub const READY: u32 = 1;
    /// Creator tore the run down
    pub const TORN_DOWN: u32 = 2;
}

/// Aligns `T` to its own cache line.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T>(pub T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Arena header at offset 0
#[repr(C, align(64))]
pub struct ArenaHeader {
    /// `MAGIC`
    pub magic: [u8; 8],
    /// `LAYOUT_VERSION`
    pub version: u32,
    /// One of `arena_state::*`
    pub state: AtomicU32,
    /// Usable bytes per block
    pub block_size: u32,
    /// Number of blocks
    pub block_count: u32,
    /// Distance between consecutive blocks
    pub block_stride: u32,
    /// Number of rings
    pub ring_count: u32,
    /// Slots per ring
    pub ring_capacity: u32,
    /// Reserved
    pub _reserved: u32,
    /// Offset of the free-list head
    pub free_list_offset: u64,
    /// Offset of the first ring
    pub rings_offset: u64,
    /// Distance between consecutive rings
    pub ring_stride: u64,
    /// Offset of the first block
    pub blocks_offset: u64,
    /// Total mapped size
    pub total_size: u64,
    /// Padding to 128 bytes
    pub _pad: [u8; 48],
}

const _: () = assert!(size_of::<ArenaHeader>() == 128);

/// Free-list head: the only multi-writer structure in the arena
#[repr(C)]
pub struct FreeListHead {
    /// Packed `(aba_tag << 32) | top_index`
    pub top: CachePadded<AtomicU64>,
    /// Blocks currently on the list
    pub free_count: CachePadded<AtomicU32>,
    /// Invariant violations detected by any participant
    pub violations: CachePadded<AtomicU64>,
}

/// Per-block header
#[repr(C, align(64))]
pub struct BlockHeader {
    /// Owner tag, see `pool::OwnerState`
    pub owner: AtomicU32,
    /// Intrusive free-list link (valid only while free)
    pub next_free: AtomicU32,
    /// Bytes in use
    pub len: AtomicU32,
    /// Ring the block was routed to
    pub ring: AtomicU32,
    /// Per-ring offer sequence
    pub seq: AtomicU64,
    /// Monotonic enqueue timestamp, nanoseconds
    pub enqueued_at_ns: AtomicU64,
    /// Padding to one cache line
    pub _pad: [u8; 32],
}

const _: () = assert!(size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

/// Endpoint claims and routing state of one ring
#[repr(C)]
#[derive(Debug, Default)]
pub struct RingEndpoints {
    /// Non-zero while a `RingProducer` exists
    pub producer_claimed: AtomicU32,
    /// Non-zero while a `RingConsumer` exists
    pub consumer_claimed: AtomicU32,
    /// Non-zero while the consumer accepts new messages
    pub accepting: AtomicU32,
    /// Reserved
    pub _reserved: u32,
}

/// Producer-owned counters of one ring
#[repr(C)]
#[derive(Debug, Default)]
pub struct RingCounters {
    /// Messages routed to this ring
    pub offered: AtomicU64,
    /// Messages enqueued
    pub enqueued: AtomicU64,
    /// Dropped because the ring was full
    pub dropped_ring_full: AtomicU64,
    /// Dropped because the pool was empty
    pub dropped_pool_exhausted: AtomicU64,
}

/// Metadata block of one ring / worker pair
#[repr(C)]
pub struct RingMeta {
    /// Producer sequence (written by the producer only)
    pub tail: CachePadded<AtomicU64>,
    /// Consumer sequence (written by the consumer only)
    pub head: CachePadded<AtomicU64>,
    /// Endpoint claims
    pub endpoints: CachePadded<RingEndpoints>,
    /// Posted by the producer after an enqueue
    pub data_available: CachePadded<ShmSemaphore>,
    /// Posted by the consumer after a dequeue
    pub space_available: CachePadded<ShmSemaphore>,
    /// Producer counters
    pub counters: CachePadded<RingCounters>,
    /// Parent → worker control queue
    pub control: ControlMailbox,
    /// Worker-owned statistics
    pub stats: WorkerStatsBlock,
}

/// Geometry requested by the arena creator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaGeometry {
    /// Usable bytes per block
    pub block_size: u32,
    /// Number of blocks
    pub block_count: u32,
    /// Number of rings
    pub ring_count: u32,
    /// Slots per ring
    pub ring_capacity: u32,
}

/// Offsets computed from a geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArenaLayout {
    /// Source geometry
    pub geometry: ArenaGeometry,
    /// Offset of `FreeListHead`
    pub free_list_offset: u64,
    /// Offset of ring 0
    pub rings_offset: u64,
    /// Bytes per ring (metadata + slots)
    pub ring_stride: u64,
    /// Offset of the slot array within a ring
    pub slots_offset: u64,
    /// Offset of block 0
    pub blocks_offset: u64,
    /// Bytes per block (header + data, aligned)
    pub block_stride: u64,
    /// Total segment size, page aligned
    pub total_size: u64,
}

const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

impl ArenaLayout {
    /// Compute the layout for a geometry
    ///
    /// # Errors
    ///
    /// Returns `ArenaError::InvalidGeometry` for zero sizes, a capacity that
    /// is not a power of two, too many rings, or a segment that overflows.
    pub fn compute(geometry: ArenaGeometry) -> Result<Self, ArenaError> {
        if geometry.ring_capacity == 0 || !geometry.ring_capacity.is_power_of_two() {
            return Err(ArenaError::InvalidGeometry(format!(
                "ring capacity {} is not a power of two",
                geometry.ring_capacity
            )));
        }
        if geometry.ring_count == 0 || geometry.ring_count as usize > MAX_RINGS {
            return Err(ArenaError::InvalidGeometry(format!(
                "ring count {} outside 1..={MAX_RINGS}",
                geometry.ring_count
            )));
        }
        if geometry.block_count == 0 || geometry.block_count == FREE_LIST_END {
            return Err(ArenaError::InvalidGeometry(format!(
                "block count {} out of range",
                geometry.block_count
            )));
        }
        if geometry.block_size == 0 {
            return Err(ArenaError::InvalidGeometry("block size is zero".into()));
        }

        let line = CACHE_LINE_SIZE as u64;
        let free_list_offset = align_up(size_of::<ArenaHeader>() as u64, line);
        let rings_offset = align_up(free_list_offset + size_of::<FreeListHead>() as u64, line);
        let slots_offset = align_up(size_of::<RingMeta>() as u64, line);
        let ring_stride = align_up(
            slots_offset + u64::from(geometry.ring_capacity) * size_of::<u32>() as u64,
            line,
        );
        let blocks_offset = align_up(
            rings_offset + ring_stride * u64::from(geometry.ring_count),
            PAGE_SIZE,
        );
        let block_stride = align_up(
            BLOCK_HEADER_SIZE as u64 + u64::from(geometry.block_size),
            line,
        );
        if block_stride > u64::from(u32::MAX) {
            return Err(ArenaError::InvalidGeometry(format!(
                "block size {} too large",
                geometry.block_size
            )));
        }

        let total_size = block_stride
            .checked_mul(u64::from(geometry.block_count))
            .and_then(|blocks| blocks.checked_add(blocks_offset))
            .map(|total| align_up(total, PAGE_SIZE))
            .filter(|&total| total <= isize::MAX as u64)
            .ok_or_else(|| ArenaError::InvalidGeometry("segment size overflows".into()))?;

        Ok(Self {
            geometry,
            free_list_offset,
            rings_offset,
            ring_stride,
            slots_offset,
            blocks_offset,
            block_stride,
            total_size,
        })
    }

    /// Offset of ring `ring`'s metadata
    #[must_use]
    pub fn ring_offset(&self, ring: u32) -> u64 {
        self.rings_offset + self.ring_stride * u64::from(ring)
    }

    /// Offset of block `index`'s header
    #[must_use]
    pub fn block_offset(&self, index: u32) -> u64 {
        self.blocks_offset + self.block_stride * u64::from(index)
    }

    /// Check a header written by another process against this layout
    pub(crate) fn matches_header(&self, header: &ArenaHeader) -> Result<(), ArenaError> {
        let checks = [
            ("free_list_offset", self.free_list_offset, header.free_list_offset),
            ("rings_offset", self.rings_offset, header.rings_offset),
            ("ring_stride", self.ring_stride, header.ring_stride),
            ("blocks_offset", self.blocks_offset, header.blocks_offset),
            ("block_stride", self.block_stride, u64::from(header.block_stride)),
            ("total_size", self.total_size, header.total_size),
        ];
        for (field, ours, theirs) in checks {
            if ours != theirs {
                return Err(ArenaError::LayoutMismatch(format!(
                    "{field}: computed {ours}, header says {theirs}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> ArenaGeometry {
        ArenaGeometry {
            block_size: 2048,
            block_count: 64,
            ring_count: 4,
            ring_capacity: 16,
        }
    }

    #[test]
    fn test_layout_regions_do_not_overlap() {
        let layout = ArenaLayout::compute(geometry()).unwrap();

        assert!(layout.free_list_offset >= size_of::<ArenaHeader>() as u64);
        assert!(layout.rings_offset >= layout.free_list_offset + size_of::<FreeListHead>() as u64);
        assert!(layout.ring_offset(3) + layout.ring_stride <= layout.blocks_offset);
        assert!(layout.block_offset(63) + layout.block_stride <= layout.total_size);
        assert_eq!(layout.total_size % PAGE_SIZE, 0);
    }

    #[test]
    fn test_layout_alignment() {
        let layout = ArenaLayout::compute(geometry()).unwrap();

        assert_eq!(layout.rings_offset % CACHE_LINE_SIZE as u64, 0);
        assert_eq!(layout.ring_stride % CACHE_LINE_SIZE as u64, 0);
        assert_eq!(layout.block_stride % CACHE_LINE_SIZE as u64, 0);
        assert_eq!(layout.block_stride, 64 + 2048);
    }

    #[test]
    fn test_slots_follow_metadata() {
        let layout = ArenaLayout::compute(geometry()).unwrap();
        assert!(layout.slots_offset >= size_of::<RingMeta>() as u64);
        assert!(layout.slots_offset + 16 * 4 <= layout.ring_stride);
    }

    #[test]
    fn test_invalid_geometry() {
        let mut g = geometry();
        g.ring_capacity = 12;
        assert!(ArenaLayout::compute(g).is_err());

        let mut g = geometry();
        g.ring_count = 0;
        assert!(ArenaLayout::compute(g).is_err());

        let mut g = geometry();
        g.ring_count = MAX_RINGS as u32 + 1;
        assert!(ArenaLayout::compute(g).is_err());

        let mut g = geometry();
        g.block_count = FREE_LIST_END;
        assert!(ArenaLayout::compute(g).is_err());
    }

    #[test]
    fn test_cache_padded_size() {
        assert_eq!(size_of::<CachePadded<AtomicU64>>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::align_of::<CachePadded<AtomicU32>>(), CACHE_LINE_SIZE);
    }
}
