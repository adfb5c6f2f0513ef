//! A bump allocator over a fixed block of memory.
//!
//! Arenas hand out disjoint regions of a single reserved block. Nothing is
//! freed individually; the whole arena is reclaimed at once by a reset, which
//! also advances the arena's *epoch*. Handles into arena memory record the
//! epoch they were issued in, so stale handles can be told apart from live
//! ones.
//!
//! Allocation takes `&self` and is lock-free, so one arena may be shared by
//! many threads. Reset takes `&mut self`.

use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::cell::Cell;
use core::fmt;
use core::ptr::{self, NonNull};
use core::slice;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread_local;

use crossbeam_utils::CachePadded;

use crate::error::AllocError;

/// The alignment of every arena's base address.
const BASE_ALIGN: usize = 16;

// -----------------------------------------------------------------------------
// Arena

/// A fixed-capacity bump allocator.
///
/// ```
/// use gantry::Arena;
///
/// let mut arena = Arena::new(1024);
/// let value = arena.alloc(7_u64);
/// *value += 1;
/// assert_eq!(*value, 8);
///
/// let epoch = arena.epoch();
/// arena.reset();
/// assert_eq!(arena.used(), 0);
/// assert_eq!(arena.epoch(), epoch + 1);
/// ```
pub struct Arena {
    /// Start of the reserved block.
    base: NonNull<u8>,
    /// Size of the reserved block in bytes.
    capacity: usize,
    /// Offset of the first free byte.
    cursor: CachePadded<AtomicUsize>,
    /// Number of resets, plus one. Never zero.
    epoch: AtomicU32,
    /// The layout to free the block with, or `None` if the block was carved
    /// from another arena.
    owned: Option<Layout>,
}

// SAFETY: The only mutable state shared between threads is the cursor, which
// is atomic. Regions handed out by `bump` are disjoint.
unsafe impl Send for Arena {}

// SAFETY: See above.
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserves a zeroed block of `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the block cannot be reserved. See [`try_new`](Self::try_new).
    pub fn new(capacity: usize) -> Arena {
        match Arena::try_new(capacity) {
            Ok(arena) => arena,
            Err(err) => panic!("{err}"),
        }
    }

    /// Reserves a zeroed block of `capacity` bytes, failing if `capacity`
    /// overflows `isize` or the system allocator refuses the request.
    pub fn try_new(capacity: usize) -> Result<Arena, AllocError> {
        let refused = AllocError {
            requested: capacity,
            align: BASE_ALIGN,
            remaining: 0,
            capacity: 0,
        };
        let layout = Layout::from_size_align(capacity.max(1), BASE_ALIGN).map_err(|_| refused)?;
        // SAFETY: The layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(refused)?;
        Ok(Arena {
            base,
            capacity,
            cursor: CachePadded::new(AtomicUsize::new(0)),
            epoch: AtomicU32::new(1),
            owned: Some(layout),
        })
    }

    /// Carves a child arena of `capacity` bytes out of this one.
    ///
    /// # Safety
    ///
    /// The child borrows this arena's memory without a lifetime. The caller
    /// must ensure the child is dropped before this arena is reset or dropped.
    pub(crate) unsafe fn carve(&self, capacity: usize) -> Result<Arena, AllocError> {
        let layout = Layout::from_size_align(capacity.max(1), BASE_ALIGN)
            .map_err(|_| self.exhausted(usize::MAX, BASE_ALIGN))?;
        let base = self.bump(layout)?;
        Ok(Arena {
            base,
            capacity,
            cursor: CachePadded::new(AtomicUsize::new(0)),
            epoch: AtomicU32::new(1),
            owned: None,
        })
    }

    /// Total size of the reserved block.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out since the last reset, including alignment padding.
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used()
    }

    /// The number of times this arena has been reset, plus one. Never zero.
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Returns true if `ptr` points into this arena's block.
    pub fn contains<T>(&self, ptr: *const T) -> bool {
        let start = self.base.as_ptr().addr();
        (start..start + self.capacity).contains(&ptr.addr())
    }

    // -------------------------------------------------------------------------
    // Allocation

    /// Reserves space for `layout` without initializing it.
    pub(crate) fn bump(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let start = self.base.as_ptr().addr();
        let mut cursor = self.cursor.load(Ordering::Relaxed);
        loop {
            let offset = (start + cursor).next_multiple_of(layout.align()) - start;
            let end = offset
                .checked_add(layout.size())
                .filter(|&end| end <= self.capacity)
                .ok_or_else(|| self.exhausted(layout.size(), layout.align()))?;
            match self.cursor.compare_exchange_weak(
                cursor,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                // SAFETY: `offset <= end <= capacity`, so the result is within
                // (or one past the end of) the reserved block.
                Ok(_) => return Ok(unsafe { self.base.add(offset) }),
                Err(actual) => cursor = actual,
            }
        }
    }

    fn exhausted(&self, requested: usize, align: usize) -> AllocError {
        AllocError {
            requested,
            align,
            remaining: self.remaining(),
            capacity: self.capacity,
        }
    }

    /// Allocates zeroed memory for `layout`.
    pub fn try_alloc_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.bump(layout)?;
        // SAFETY: `bump` returned a region of `layout.size()` bytes that no one
        // else has been handed since the last reset.
        unsafe { ptr.write_bytes(0, layout.size()) };
        Ok(ptr)
    }

    /// Moves `value` into the arena. The value's destructor never runs.
    #[allow(clippy::mut_from_ref)]
    pub fn try_alloc<T>(&self, value: T) -> Result<&mut T, AllocError> {
        let ptr = self.bump(Layout::new::<T>())?.cast::<T>();
        // SAFETY: The region is sized and aligned for `T`, and is disjoint from
        // every other allocation, so it is sound to hand out a unique reference
        // to it for as long as `self` is borrowed.
        unsafe {
            ptr.write(value);
            Ok(&mut *ptr.as_ptr())
        }
    }

    /// Moves `value` into the arena.
    ///
    /// # Panics
    ///
    /// Panics if the arena is exhausted.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc<T>(&self, value: T) -> &mut T {
        match self.try_alloc(value) {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// Allocates `count` default-initialized values.
    #[allow(clippy::mut_from_ref)]
    pub fn try_alloc_slice_default<T: Default>(&self, count: usize) -> Result<&mut [T], AllocError> {
        let layout = Layout::array::<T>(count)
            .map_err(|_| self.exhausted(usize::MAX, align_of::<T>()))?;
        let ptr = self.bump(layout)?.cast::<T>();
        for i in 0..count {
            // SAFETY: `i < count`, and the region holds `count` values of `T`.
            unsafe { ptr.add(i).write(T::default()) };
        }
        // SAFETY: All `count` elements were initialized above.
        Ok(unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), count) })
    }

    /// Allocates `count` default-initialized values.
    ///
    /// # Panics
    ///
    /// Panics if the arena is exhausted.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_slice_default<T: Default>(&self, count: usize) -> &mut [T] {
        match self.try_alloc_slice_default(count) {
            Ok(slice) => slice,
            Err(err) => panic!("{err}"),
        }
    }

    // -------------------------------------------------------------------------
    // Reset

    /// Reclaims every allocation and advances the epoch.
    pub fn reset(&mut self) {
        // SAFETY: The exclusive borrow guarantees no references into the arena
        // are alive.
        unsafe { self.reset_unchecked() };
    }

    /// Reclaims every allocation through a shared reference.
    ///
    /// # Safety
    ///
    /// The caller must ensure that nothing still references memory handed out
    /// by this arena, and that no allocation runs concurrently.
    pub(crate) unsafe fn reset_unchecked(&self) {
        self.cursor.store(0, Ordering::Relaxed);
        let next = self.epoch.load(Ordering::Relaxed).wrapping_add(1).max(1);
        self.epoch.store(next, Ordering::Release);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(layout) = self.owned {
            // SAFETY: The block was allocated in `new` with this layout.
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .field("epoch", &self.epoch())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Current arena

thread_local! {
    static CURRENT_ARENA: Cell<*const Arena> = const { Cell::new(ptr::null()) };
}

/// Restores the previously current arena, even when unwinding.
struct Restore(*const Arena);

impl Drop for Restore {
    fn drop(&mut self) {
        CURRENT_ARENA.with(|current| current.set(self.0));
    }
}

impl Arena {
    /// Makes this the calling thread's current arena while `f` runs.
    ///
    /// Calls nest: when `f` returns, the previous current arena (if any) is
    /// restored. Workers run every job inside their scratch arena this way.
    pub fn enter<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let outer = CURRENT_ARENA.with(|current| current.replace(self));
        let _restore = Restore(outer);
        f()
    }

    /// Calls `f` with the calling thread's current arena, if there is one.
    ///
    /// ```
    /// use gantry::Arena;
    ///
    /// let arena = Arena::new(64);
    /// assert!(Arena::with_current(|current| current.is_none()));
    /// arena.enter(|| {
    ///     Arena::with_current(|current| {
    ///         let current = current.unwrap();
    ///         assert_eq!(*current.alloc(3_u8), 3);
    ///     });
    /// });
    /// ```
    pub fn with_current<F, R>(f: F) -> R
    where
        F: FnOnce(Option<&Arena>) -> R,
    {
        let arena_ptr = CURRENT_ARENA.with(Cell::get);
        if arena_ptr.is_null() {
            f(None)
        } else {
            // SAFETY: The pointer is only set by `enter`, which borrows the
            // arena for longer than the pointer stays set. The reference is
            // passed to a closure so it cannot outlive that borrow.
            f(Some(unsafe { &*arena_ptr }))
        }
    }
}
