//! Size-classed buffer pool
//!
//! Read buffers are drawn from a small set of fixed tiers so that the
//! allocator only ever sees a handful of distinct sizes. Each tier keeps a
//! bounded lock-free free list; workers on different threads allocate and
//! release concurrently without a global lock.
//!
//! ```text
//!  allocate(n):  class = smallest tier >= n
//!                free_list[class].pop()  ──hit──▶ reuse (not zeroed)
//!                         │ miss
//!                         ▼
//!                fresh allocation of tier size
//!
//!  release(b):   free_list[b.class].push(b) ──full──▶ drop (high-water mark)
//! ```
//!
//! Requests above the largest tier get an exact-size buffer that is never
//! pooled. Allocation never fails; an empty free list degrades to a fresh
//! allocation.
//!
//! # Ownership
//!
//! `release` takes the [`Buffer`] by value, so a released buffer cannot be
//! touched again by its previous owner and cannot be released twice. Handing
//! a buffer to a pool it was not drawn from is a precondition violation:
//! debug builds assert, release builds drop the storage.

use crossbeam_queue::ArrayQueue;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Capacity of each size class, smallest first.
pub const SIZE_CLASSES: [usize; 6] = [64, 256, 1024, 4096, 16 * 1024, 64 * 1024];

/// Number of size classes.
pub const NUM_CLASSES: usize = SIZE_CLASSES.len();

/// Default free-list high-water mark per class.
///
/// Small buffers are cheap to keep around; the 64 KiB tier is capped at
/// 4 MiB of idle memory.
pub const DEFAULT_HIGH_WATER: [usize; NUM_CLASSES] = [4096, 4096, 2048, 1024, 256, 64];

const UNPOOLED: u8 = u8::MAX;

// ── Size class ───────────────────────────────────────────────────────

/// A pool tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    /// Smallest class whose capacity is at least `size`.
    ///
    /// Returns `None` when `size` exceeds the largest tier.
    #[inline]
    pub fn for_size(size: usize) -> Option<SizeClass> {
        SIZE_CLASSES
            .iter()
            .position(|&cap| cap >= size)
            .map(|idx| SizeClass(idx as u8))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn capacity(self) -> usize {
        SIZE_CLASSES[self.0 as usize]
    }
}

// ── Buffer ───────────────────────────────────────────────────────────

/// A byte buffer with a valid-length marker.
///
/// The full backing storage is reachable through [`Buffer::spare_mut`] for
/// reading into; `len` bytes at the front are the valid payload and are
/// what `Deref` exposes.
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
    class: u8,
}

impl Buffer {
    /// An unpooled buffer of exactly `capacity` bytes.
    ///
    /// Useful for custom allocation hooks that do not use a pool. Releasing
    /// it to a pool simply drops it.
    pub fn unpooled(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            class: UNPOOLED,
        }
    }

    fn fresh(class: SizeClass) -> Self {
        Self {
            data: vec![0u8; class.capacity()].into_boxed_slice(),
            len: 0,
            class: class.0,
        }
    }

    fn reused(data: Box<[u8]>, class: SizeClass) -> Self {
        Self { data, len: 0, class: class.0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the first `len` bytes as valid.
    ///
    /// # Panics
    ///
    /// If `len` exceeds the capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.data.len(), "buffer length {} exceeds capacity {}", len, self.data.len());
        self.len = len;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// The whole backing storage, for reading into.
    ///
    /// Contents are unspecified on reuse: pooled buffers are not zeroed.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The valid bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The class this buffer was drawn from, if any.
    #[inline]
    pub fn class(&self) -> Option<SizeClass> {
        if self.class == UNPOOLED {
            None
        } else {
            Some(SizeClass(self.class))
        }
    }

    /// Address of the backing storage (identity only, for diagnostics and tests).
    #[inline]
    pub fn storage_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .field("class", &self.class())
            .finish()
    }
}

// ── Pool ─────────────────────────────────────────────────────────────

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created by a fresh allocation.
    pub fresh: usize,
    /// Allocations served from a free list.
    pub reused: usize,
    /// Releases that dropped the storage (free list full, oversize, foreign).
    pub dropped: usize,
    /// Buffers handed out and not yet released.
    pub outstanding: usize,
}

/// Size-classed pool of reusable byte buffers.
///
/// Safe to share across threads; every free list is an `ArrayQueue`.
pub struct BufferPool {
    classes: Vec<ArrayQueue<Box<[u8]>>>,
    fresh: AtomicUsize,
    reused: AtomicUsize,
    dropped: AtomicUsize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Pool with the default per-class high-water marks.
    pub fn new() -> Self {
        Self::with_high_water(DEFAULT_HIGH_WATER)
    }

    /// Pool with an explicit free-list cap per class.
    ///
    /// A cap of zero is raised to one (`ArrayQueue` needs a non-zero capacity).
    pub fn with_high_water(limits: [usize; NUM_CLASSES]) -> Self {
        Self {
            classes: limits.iter().map(|&cap| ArrayQueue::new(cap.max(1))).collect(),
            fresh: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Same free-list cap for every class.
    pub fn with_uniform_high_water(limit: usize) -> Self {
        Self::with_high_water([limit; NUM_CLASSES])
    }

    /// Process-wide pool used by the engine's default buffer hooks.
    pub fn global() -> &'static BufferPool {
        static GLOBAL: OnceLock<BufferPool> = OnceLock::new();
        GLOBAL.get_or_init(BufferPool::new)
    }

    /// Get a buffer with capacity of at least `size_hint` bytes.
    ///
    /// The returned buffer has length zero. Its storage may hold bytes from
    /// a previous owner.
    pub fn allocate(&self, size_hint: usize) -> Buffer {
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        let class = match SizeClass::for_size(size_hint) {
            Some(class) => class,
            None => {
                self.fresh.fetch_add(1, Ordering::Relaxed);
                return Buffer::unpooled(size_hint);
            }
        };

        match self.classes[class.index()].pop() {
            Some(data) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                Buffer::reused(data, class)
            }
            None => {
                self.fresh.fetch_add(1, Ordering::Relaxed);
                Buffer::fresh(class)
            }
        }
    }

    /// Return a buffer to its class free list.
    ///
    /// The storage is dropped instead when the list is at its high-water
    /// mark or the buffer is not poolable.
    pub fn release(&self, buf: Buffer) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        let class = match buf.class() {
            Some(class) => class,
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        debug_assert_eq!(
            buf.capacity(),
            class.capacity(),
            "buffer capacity does not match its size class"
        );
        if buf.capacity() != class.capacity() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.classes[class.index()].push(buf.data).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Buffers currently idle in a class free list.
    pub fn idle(&self, class: SizeClass) -> usize {
        self.classes[class.index()].len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            fresh: self.fresh.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate from the global pool.
#[inline]
pub fn malloc(size: usize) -> Buffer {
    BufferPool::global().allocate(size)
}

/// Release to the global pool.
#[inline]
pub fn free(buf: Buffer) {
    BufferPool::global().release(buf)
}
