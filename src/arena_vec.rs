//! A growable vector whose storage comes from an [`Arena`].

use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use core::slice;

use crate::arena::Arena;
use crate::error::AllocError;

/// A vector backed by arena memory.
///
/// Growing allocates a block twice the size from the arena and moves the
/// elements over. The old block is abandoned until the arena is reset. Element
/// destructors run when the vector is cleared or dropped; the storage itself is
/// never freed.
///
/// ```
/// use gantry::{Arena, ArenaVec};
///
/// let arena = Arena::new(1024);
/// let mut values = ArenaVec::with_capacity(&arena, 2);
/// for i in 0..5 {
///     values.push(i);
/// }
/// assert_eq!(&values[..], &[0, 1, 2, 3, 4]);
/// assert!(values.capacity() >= 5);
/// ```
pub struct ArenaVec<'a, T> {
    arena: &'a Arena,
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,
    _marker: PhantomData<T>,
}

// SAFETY: The vector owns its elements, and the arena is `Sync`.
unsafe impl<T: Send> Send for ArenaVec<'_, T> {}

// SAFETY: Shared access only hands out shared references to elements.
unsafe impl<T: Sync> Sync for ArenaVec<'_, T> {}

impl<'a, T> ArenaVec<'a, T> {
    /// Creates an empty vector. Nothing is allocated until the first push.
    pub fn new(arena: &'a Arena) -> ArenaVec<'a, T> {
        ArenaVec {
            arena,
            ptr: NonNull::dangling(),
            len: 0,
            capacity: if size_of::<T>() == 0 { usize::MAX } else { 0 },
            _marker: PhantomData,
        }
    }

    /// Creates an empty vector with room for `capacity` elements.
    pub fn try_with_capacity(arena: &'a Arena, capacity: usize) -> Result<ArenaVec<'a, T>, AllocError> {
        let mut vec = ArenaVec::new(arena);
        vec.try_reserve(capacity)?;
        Ok(vec)
    }

    /// Creates an empty vector with room for `capacity` elements.
    ///
    /// # Panics
    ///
    /// Panics if the arena is exhausted.
    pub fn with_capacity(arena: &'a Arena, capacity: usize) -> ArenaVec<'a, T> {
        match ArenaVec::try_with_capacity(arena, capacity) {
            Ok(vec) => vec,
            Err(err) => panic!("{err}"),
        }
    }

    /// The arena this vector allocates from.
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements the current block can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Makes room for at least `additional` more elements.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), AllocError> {
        let required = self.len.checked_add(additional).ok_or(AllocError {
            requested: usize::MAX,
            align: align_of::<T>(),
            remaining: self.arena.remaining(),
            capacity: self.arena.capacity(),
        })?;
        if required <= self.capacity {
            return Ok(());
        }
        let capacity = required.max(self.capacity * 2).max(2);
        let layout = Layout::array::<T>(capacity).map_err(|_| AllocError {
            requested: usize::MAX,
            align: align_of::<T>(),
            remaining: self.arena.remaining(),
            capacity: self.arena.capacity(),
        })?;
        let ptr = self.arena.bump(layout)?.cast::<T>();
        // SAFETY: The new block holds at least `len` elements and cannot
        // overlap the old one. The old elements are moved, not copied: the old
        // block is never read again.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr(), ptr.as_ptr(), self.len) };
        self.ptr = ptr;
        self.capacity = capacity;
        Ok(())
    }

    /// Appends `value`, growing if needed.
    ///
    /// # Panics
    ///
    /// Panics if the vector must grow and the arena is exhausted.
    pub fn push(&mut self, value: T) {
        if let Err(err) = self.try_reserve(1) {
            panic!("{err}");
        }
        if self.try_push_within_capacity(value).is_err() {
            unreachable!("capacity was reserved above");
        }
    }

    /// Appends `value` if there is room for it, handing it back otherwise.
    pub fn try_push_within_capacity(&mut self, value: T) -> Result<(), T> {
        if self.len == self.capacity {
            return Err(value);
        }
        // SAFETY: `len < capacity`, so the slot is inside the block and
        // currently uninitialized.
        unsafe { self.ptr.add(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Removes and returns the last element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: The element at the old `len - 1` is initialized, and is no
        // longer counted by `len`, so it is read exactly once.
        Some(unsafe { self.ptr.add(self.len).read() })
    }

    /// Drops every element, keeping the storage.
    pub fn clear(&mut self) {
        let elements = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // Update the length first so a panicking destructor cannot cause a
        // double drop.
        self.len = 0;
        // SAFETY: The slice covers exactly the initialized elements.
        unsafe { ptr::drop_in_place(elements) };
    }
}

impl<T> Deref for ArenaVec<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: The first `len` elements are initialized.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for ArenaVec<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: The first `len` elements are initialized, and `&mut self`
        // guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for ArenaVec<'_, T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: fmt::Debug> fmt::Debug for ArenaVec<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
