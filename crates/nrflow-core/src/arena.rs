//! Shared-memory arena: creation, attach, teardown.
//!
//! The arena is one contiguous mapping holding the header, the free list,
//! every ring's metadata and all blocks (see `layout`). It is created once by
//! the parent before any worker exists. Workers either inherit the mapping
//! across `fork` (anonymous backing) or attach to it by name (POSIX shared
//! memory or a plain file), in which case the header is validated before
//! anything else is read.
//!
//! ## Example
//!
//! ```
//! use nrflow_core::arena::{SegmentBacking, SharedArena};
//! use nrflow_core::layout::ArenaGeometry;
//!
//! let geometry = ArenaGeometry {
//!     block_size: 256,
//!     block_count: 8,
//!     ring_count: 1,
//!     ring_capacity: 4,
//! };
//! let arena = SharedArena::create(geometry, SegmentBacking::Anonymous).unwrap();
//! assert_eq!(arena.pool().free_count(), 8);
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ArenaError, RingError};
use crate::layout::{
    ArenaGeometry, ArenaHeader, ArenaLayout, BlockHeader, FREE_LIST_END, FreeListHead,
    LAYOUT_VERSION, MAGIC, RingMeta, arena_state,
};
use crate::pool::{MemoryPool, OwnerState, pack_top};

/// Where the arena's memory comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "location")]
pub enum SegmentBacking {
    /// `MAP_SHARED | MAP_ANONYMOUS`; shared only with forked children
    Anonymous,
    /// POSIX shared memory object (`shm_open`), name starts with `/`
    Named(String),
    /// Regular file
    File(PathBuf),
}

impl SegmentBacking {
    fn describe(&self) -> String {
        match self {
            SegmentBacking::Anonymous => "anonymous".into(),
            SegmentBacking::Named(name) => format!("shm:{name}"),
            SegmentBacking::File(path) => format!("file:{}", path.display()),
        }
    }
}

/// Owned `mmap` region
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Mapping {
    fn anonymous(len: usize) -> Result<Self, ArenaError> {
        // SAFETY: anonymous shared mapping with a valid length; the result is
        // checked against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_raw(addr, len, "anonymous")
    }

    fn file(file: &File, len: usize, segment: &str) -> Result<Self, ArenaError> {
        // SAFETY: the descriptor is open for read/write and at least `len`
        // bytes long (callers size or check it first).
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        Self::from_raw(addr, len, segment)
    }

    fn from_raw(addr: *mut libc::c_void, len: usize, segment: &str) -> Result<Self, ArenaError> {
        if addr == libc::MAP_FAILED {
            return Err(ArenaError::Map {
                segment: segment.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(addr.cast::<u8>()).ok_or_else(|| ArenaError::Map {
            segment: segment.to_string(),
            source: io::Error::other("mmap returned null"),
        })?;
        Ok(Self { base, len })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping created by Mapping::*.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

/// A mapped nrflow arena
pub struct SharedArena {
    mapping: Mapping,
    layout: ArenaLayout,
    backing: SegmentBacking,
    creator_pid: Option<u32>,
    unlinked: AtomicBool,
}

// SAFETY: all shared state inside the mapping is accessed through atomics;
// non-atomic header fields are written once before READY is published and
// never again. Block data access is serialized by the owner-tag protocol.
unsafe impl Send for SharedArena {}
// SAFETY: see above.
unsafe impl Sync for SharedArena {}

impl SharedArena {
    /// Create and initialize a new arena
    ///
    /// # Errors
    ///
    /// Returns `ArenaError::InvalidGeometry` for an impossible geometry and
    /// `ArenaError::Map`/`Io` if the segment cannot be created. A named or
    /// file segment that already exists is an error, never reused.
    pub fn create(geometry: ArenaGeometry, backing: SegmentBacking) -> Result<Self, ArenaError> {
        let layout = ArenaLayout::compute(geometry)?;
        let len = usize::try_from(layout.total_size)
            .map_err(|_| ArenaError::InvalidGeometry("segment too large".into()))?;

        let mapping = match &backing {
            SegmentBacking::Anonymous => Mapping::anonymous(len)?,
            SegmentBacking::Named(name) => {
                let file = open_named(name, true)?;
                file.set_len(layout.total_size)?;
                Mapping::file(&file, len, &backing.describe())?
            }
            SegmentBacking::File(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(path)?;
                file.set_len(layout.total_size)?;
                Mapping::file(&file, len, &backing.describe())?
            }
        };

        let arena = Self {
            mapping,
            layout,
            backing,
            creator_pid: Some(std::process::id()),
            unlinked: AtomicBool::new(false),
        };
        arena.initialize();

        info!(
            "Created arena {} ({} bytes, {} blocks x {} bytes, {} rings x {} slots)",
            arena.backing.describe(),
            layout.total_size,
            geometry.block_count,
            geometry.block_size,
            geometry.ring_count,
            geometry.ring_capacity
        );

        Ok(arena)
    }

    /// Attach to an existing named or file-backed arena
    ///
    /// # Errors
    ///
    /// Fails fast with `BadMagic`, `VersionMismatch`, `NotReady` or
    /// `LayoutMismatch` if the segment is not one this build can interpret.
    pub fn attach(backing: SegmentBacking) -> Result<Self, ArenaError> {
        let file = match &backing {
            SegmentBacking::Anonymous => {
                return Err(ArenaError::Unsupported(
                    "anonymous arenas are inherited, not attached",
                ));
            }
            SegmentBacking::Named(name) => open_named(name, false)?,
            SegmentBacking::File(path) => OpenOptions::new().read(true).write(true).open(path)?,
        };

        let actual = file.metadata()?.len();
        if actual < size_of::<ArenaHeader>() as u64 {
            return Err(ArenaError::LayoutMismatch(format!(
                "segment is {actual} bytes, smaller than the header"
            )));
        }
        let len = usize::try_from(actual)
            .map_err(|_| ArenaError::LayoutMismatch("segment too large".into()))?;
        let mapping = Mapping::file(&file, len, &backing.describe())?;

        // SAFETY: the mapping is at least one header long and page aligned.
        let header = unsafe { &*mapping.base.as_ptr().cast::<ArenaHeader>() };
        let layout = validate_header(header, actual)?;

        debug!(
            "Attached to arena {} (version {}, {} rings)",
            backing.describe(),
            header.version,
            header.ring_count
        );

        Ok(Self {
            mapping,
            layout,
            backing,
            creator_pid: None,
            unlinked: AtomicBool::new(false),
        })
    }

    fn initialize(&self) {
        let geometry = self.layout.geometry;
        let header = ArenaHeader {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            state: AtomicU32::new(arena_state::INITIALIZING),
            block_size: geometry.block_size,
            block_count: geometry.block_count,
            block_stride: self.layout.block_stride as u32,
            ring_count: geometry.ring_count,
            ring_capacity: geometry.ring_capacity,
            _reserved: 0,
            free_list_offset: self.layout.free_list_offset,
            rings_offset: self.layout.rings_offset,
            ring_stride: self.layout.ring_stride,
            blocks_offset: self.layout.blocks_offset,
            total_size: self.layout.total_size,
            _pad: [0; 48],
        };
        // SAFETY: offset 0 is inside the fresh mapping and no other party can
        // observe it before READY is published below.
        unsafe {
            ptr::write(self.mapping.base.as_ptr().cast::<ArenaHeader>(), header);
        }

        // The mapping is zero-filled: rings, counters, semaphores and
        // mailboxes are already in their initial state. Only the free list
        // needs threading.
        for index in 0..geometry.block_count {
            let block = self.block_header(index);
            let next = if index + 1 < geometry.block_count {
                index + 1
            } else {
                FREE_LIST_END
            };
            block.next_free.store(next, Ordering::Relaxed);
            block.owner.store(OwnerState::Free.tag(), Ordering::Relaxed);
        }

        let free_list = self.free_list();
        free_list.top.store(pack_top(0, 0), Ordering::Relaxed);
        free_list
            .free_count
            .store(geometry.block_count, Ordering::Relaxed);

        self.header()
            .state
            .store(arena_state::READY, Ordering::Release);
    }

    /// Re-check the header (cheap; used by workers right after spawning)
    ///
    /// # Errors
    ///
    /// Same conditions as `attach`.
    pub fn validate(&self) -> Result<(), ArenaError> {
        validate_header(self.header(), self.mapping.len as u64).map(|_| ())
    }

    /// Arena header
    pub fn header(&self) -> &ArenaHeader {
        // SAFETY: offset 0 always holds an initialized header.
        unsafe { &*self.mapping.base.as_ptr().cast::<ArenaHeader>() }
    }

    /// Computed layout
    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    /// Geometry
    pub fn geometry(&self) -> ArenaGeometry {
        self.layout.geometry
    }

    /// Backing description
    pub fn backing(&self) -> &SegmentBacking {
        &self.backing
    }

    /// Number of rings
    pub fn ring_count(&self) -> u32 {
        self.layout.geometry.ring_count
    }

    /// Number of blocks
    pub fn block_count(&self) -> u32 {
        self.layout.geometry.block_count
    }

    /// Usable bytes per block
    pub fn block_size(&self) -> usize {
        self.layout.geometry.block_size as usize
    }

    /// Memory pool over this arena's blocks
    pub fn pool(&self) -> MemoryPool<'_> {
        MemoryPool::new(self)
    }

    /// Metadata of ring `ring`
    ///
    /// # Errors
    ///
    /// Returns `RingError::NoSuchRing` when `ring` is out of range.
    pub fn ring(&self, ring: u32) -> Result<&RingMeta, RingError> {
        if ring >= self.ring_count() {
            return Err(RingError::NoSuchRing {
                ring,
                count: self.ring_count(),
            });
        }
        Ok(self.ring_meta(ring))
    }

    /// Metadata of ring `ring`
    ///
    /// # Panics
    ///
    /// Panics if `ring` is out of range; use `ring()` for untrusted ids.
    pub fn ring_meta(&self, ring: u32) -> &RingMeta {
        assert!(ring < self.ring_count(), "ring {ring} out of range");
        // SAFETY: ring < ring_count, so the offset lies inside the rings
        // region computed by ArenaLayout, which is 64-byte aligned.
        unsafe { &*self.at::<RingMeta>(self.layout.ring_offset(ring)) }
    }

    /// Slot array of ring `ring`
    pub(crate) fn ring_slots(&self, ring: u32) -> &[AtomicU32] {
        assert!(ring < self.ring_count(), "ring {ring} out of range");
        let offset = self.layout.ring_offset(ring) + self.layout.slots_offset;
        // SAFETY: the slot array of ring_capacity u32s lies inside the ring's
        // stride (checked by ArenaLayout::compute); AtomicU32 has the layout
        // of u32 and zero is a valid value.
        unsafe {
            std::slice::from_raw_parts(
                self.at::<AtomicU32>(offset),
                self.layout.geometry.ring_capacity as usize,
            )
        }
    }

    pub(crate) fn free_list(&self) -> &FreeListHead {
        // SAFETY: fixed offset inside the mapping, 64-byte aligned.
        unsafe { &*self.at::<FreeListHead>(self.layout.free_list_offset) }
    }

    /// Header of block `index`
    pub(crate) fn block_header(&self, index: u32) -> &BlockHeader {
        debug_assert!(index < self.block_count());
        // SAFETY: callers validate index < block_count.
        unsafe { &*self.at::<BlockHeader>(self.layout.block_offset(index)) }
    }

    /// Data pointer of block `index`
    pub(crate) fn block_data(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.block_count());
        let offset = self.layout.block_offset(index) + size_of::<BlockHeader>() as u64;
        self.at::<u8>(offset)
    }

    fn at<T>(&self, offset: u64) -> *mut T {
        debug_assert!(offset as usize + size_of::<T>() <= self.mapping.len);
        // SAFETY: offsets come from ArenaLayout and are within the mapping.
        unsafe { self.mapping.base.as_ptr().add(offset as usize).cast::<T>() }
    }

    /// Record an invariant violation in the shared counter
    pub fn record_violation(&self) {
        self.free_list().violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Invariant violations recorded by any participant
    pub fn violations(&self) -> u64 {
        self.free_list().violations.load(Ordering::Relaxed)
    }

    /// Segment name for force-cleanup registration, if the arena has one
    pub fn segment_name(&self) -> Option<String> {
        match &self.backing {
            SegmentBacking::Anonymous => None,
            SegmentBacking::Named(name) => Some(name.clone()),
            SegmentBacking::File(path) => Some(path.display().to_string()),
        }
    }

    /// Mark the arena torn down and remove its name from the system
    ///
    /// Idempotent: only the first call does anything; returns whether this
    /// call performed the unlink. Existing mappings stay valid until dropped.
    ///
    /// # Errors
    ///
    /// Returns the OS error if removal fails for a reason other than the
    /// name already being gone.
    pub fn unlink(&self) -> Result<bool, ArenaError> {
        if self.unlinked.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.header()
            .state
            .store(arena_state::TORN_DOWN, Ordering::Release);

        let result = match &self.backing {
            SegmentBacking::Anonymous => Ok(()),
            SegmentBacking::Named(name) => unlink_named(name),
            SegmentBacking::File(path) => std::fs::remove_file(path),
        };
        match result {
            Ok(()) => {
                debug!("Unlinked arena {}", self.backing.describe());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(ArenaError::Io(e)),
        }
    }

    /// Whether this process created the arena
    pub fn is_creator(&self) -> bool {
        self.creator_pid == Some(std::process::id())
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        if self.is_creator() {
            if let Err(e) = self.unlink() {
                warn!("Failed to unlink arena {}: {}", self.backing.describe(), e);
            }
        }
    }
}

fn validate_header(header: &ArenaHeader, mapped: u64) -> Result<ArenaLayout, ArenaError> {
    if header.magic != MAGIC {
        return Err(ArenaError::BadMagic);
    }
    if header.version != LAYOUT_VERSION {
        return Err(ArenaError::VersionMismatch {
            expected: LAYOUT_VERSION,
            found: header.version,
        });
    }
    let state = header.state.load(Ordering::Acquire);
    if state != arena_state::READY {
        return Err(ArenaError::NotReady(state));
    }

    let layout = ArenaLayout::compute(ArenaGeometry {
        block_size: header.block_size,
        block_count: header.block_count,
        ring_count: header.ring_count,
        ring_capacity: header.ring_capacity,
    })
    .map_err(|e| ArenaError::LayoutMismatch(e.to_string()))?;
    layout.matches_header(header)?;
    if layout.total_size > mapped {
        return Err(ArenaError::LayoutMismatch(format!(
            "header describes {} bytes but segment is {}",
            layout.total_size, mapped
        )));
    }
    Ok(layout)
}

#[cfg(target_os = "linux")]
fn open_named(name: &str, create: bool) -> Result<File, ArenaError> {
    use std::ffi::CString;
    use std::os::unix::io::{FromRawFd, OwnedFd};

    if !name.starts_with('/') || name[1..].contains('/') {
        return Err(ArenaError::InvalidGeometry(format!(
            "shared memory name {name:?} must be of the form /name"
        )));
    }
    let c_name = CString::new(name)
        .map_err(|_| ArenaError::InvalidGeometry("segment name contains NUL".into()))?;

    let flags = if create {
        libc::O_CREAT | libc::O_EXCL | libc::O_RDWR
    } else {
        libc::O_RDWR
    };
    // SAFETY: c_name is a valid NUL-terminated string; the returned
    // descriptor is checked and immediately wrapped in an OwnedFd.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, 0o600 as libc::mode_t) };
    if fd < 0 {
        return Err(ArenaError::Map {
            segment: format!("shm:{name}"),
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: fd is a fresh descriptor we own.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(File::from(owned))
}

#[cfg(not(target_os = "linux"))]
fn open_named(_name: &str, _create: bool) -> Result<File, ArenaError> {
    Err(ArenaError::Unsupported("named shared memory requires Linux"))
}

#[cfg(target_os = "linux")]
fn unlink_named(name: &str) -> io::Result<()> {
    let c_name = std::ffi::CString::new(name).map_err(io::Error::other)?;
    // SAFETY: valid NUL-terminated name.
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn unlink_named(_name: &str) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> ArenaGeometry {
        ArenaGeometry {
            block_size: 512,
            block_count: 16,
            ring_count: 2,
            ring_capacity: 8,
        }
    }

    #[test]
    fn test_create_anonymous() {
        let arena = SharedArena::create(geometry(), SegmentBacking::Anonymous).unwrap();

        assert_eq!(arena.header().magic, MAGIC);
        assert_eq!(arena.header().version, LAYOUT_VERSION);
        assert_eq!(arena.ring_count(), 2);
        assert_eq!(arena.block_count(), 16);
        assert_eq!(arena.pool().free_count(), 16);
        assert!(arena.validate().is_ok());
        assert!(arena.is_creator());
    }

    #[test]
    fn test_attach_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.shm");
        let backing = SegmentBacking::File(path.clone());

        let creator = SharedArena::create(geometry(), backing.clone()).unwrap();
        let attached = SharedArena::attach(backing).unwrap();

        assert_eq!(attached.geometry(), creator.geometry());
        assert!(!attached.is_creator());

        // Both views share the same memory
        let handle = creator.pool().acquire().unwrap();
        assert_eq!(attached.pool().free_count(), 15);
        creator.pool().release(handle).unwrap();
        assert_eq!(attached.pool().free_count(), 16);
    }

    #[test]
    fn test_attach_rejects_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.shm");
        let backing = SegmentBacking::File(path.clone());
        let creator = SharedArena::create(geometry(), backing.clone()).unwrap();

        // Simulate a segment written by a future layout
        // SAFETY: test-only write to the version field of our own mapping.
        unsafe {
            let header = creator.mapping.base.as_ptr().cast::<ArenaHeader>();
            (*header).version = LAYOUT_VERSION + 1;
        }

        match SharedArena::attach(backing) {
            Err(ArenaError::VersionMismatch { expected, found }) => {
                assert_eq!(expected, LAYOUT_VERSION);
                assert_eq!(found, LAYOUT_VERSION + 1);
            }
            other => panic!("expected version mismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_attach_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.bin");
        std::fs::write(&path, vec![0xA5u8; 8192]).unwrap();

        assert!(matches!(
            SharedArena::attach(SegmentBacking::File(path)),
            Err(ArenaError::BadMagic)
        ));
    }

    #[test]
    fn test_attach_anonymous_unsupported() {
        assert!(matches!(
            SharedArena::attach(SegmentBacking::Anonymous),
            Err(ArenaError::Unsupported(_))
        ));
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.shm");
        std::fs::write(&path, b"busy").unwrap();
        assert!(SharedArena::create(geometry(), SegmentBacking::File(path)).is_err());
    }

    #[test]
    fn test_unlink_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.shm");
        let arena = SharedArena::create(geometry(), SegmentBacking::File(path.clone())).unwrap();

        assert!(arena.unlink().unwrap());
        assert!(!path.exists());
        assert!(!arena.unlink().unwrap());
        assert_eq!(
            arena.header().state.load(Ordering::Acquire),
            arena_state::TORN_DOWN
        );
    }

    #[test]
    fn test_ring_out_of_range() {
        let arena = SharedArena::create(geometry(), SegmentBacking::Anonymous).unwrap();
        assert!(arena.ring(1).is_ok());
        assert!(matches!(
            arena.ring(2),
            Err(RingError::NoSuchRing { ring: 2, count: 2 })
        ));
    }

    #[test]
    fn test_fresh_rings_are_empty() {
        let arena = SharedArena::create(geometry(), SegmentBacking::Anonymous).unwrap();
        for ring in 0..arena.ring_count() {
            let meta = arena.ring_meta(ring);
            assert_eq!(meta.head.load(Ordering::Relaxed), 0);
            assert_eq!(meta.tail.load(Ordering::Relaxed), 0);
            assert_eq!(arena.ring_slots(ring).len(), 8);
        }
    }
}
