use super::backing::{BackingAllocator, SystemBacking};
use super::error::AllocError;
use super::policy::{LockPolicy, SingleThreaded};
use super::small_object::SmallObjectAllocator;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Owning pointer to a `T` living in a block of a [`SmallObjectAllocator`].
///
/// The allocator is borrowed for the box's lifetime, so it cannot be dropped
/// while any of its boxes are alive.
pub struct PoolBox<'a, T, L: LockPolicy = SingleThreaded, B: BackingAllocator = SystemBacking> {
    ptr: NonNull<T>,
    alloc: &'a SmallObjectAllocator<L, B>,
    _owns: PhantomData<T>,
}

// Safety: the box owns its `T`; moving it to another thread also moves the
// shared borrow of the allocator, which needs the allocator to be `Sync`.
unsafe impl<T: Send, L: LockPolicy, B: BackingAllocator> Send for PoolBox<'_, T, L, B> where
    SmallObjectAllocator<L, B>: Sync
{
}
// Safety: `&PoolBox` only hands out `&T`.
unsafe impl<T: Sync, L: LockPolicy, B: BackingAllocator> Sync for PoolBox<'_, T, L, B> where
    SmallObjectAllocator<L, B>: Sync
{
}

impl<'a, T, L: LockPolicy, B: BackingAllocator> PoolBox<'a, T, L, B> {
    /// Move `value` into a block from `alloc`.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::UnsupportedAlignment` if `T` needs more alignment
    /// than the allocator guarantees, or the allocator's error if no block is
    /// available.
    pub fn new_in(value: T, alloc: &'a SmallObjectAllocator<L, B>) -> Result<Self, AllocError> {
        if mem::align_of::<T>() > alloc.alignment() {
            return Err(AllocError::UnsupportedAlignment {
                align: mem::align_of::<T>(),
                supported: alloc.alignment(),
            });
        }
        let ptr = alloc.allocate(mem::size_of::<T>())?.cast::<T>();
        // Safety: the block holds at least size_of::<T>() bytes and is aligned
        // to alloc.alignment() >= align_of::<T>().
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            alloc,
            _owns: PhantomData,
        })
    }

    /// Move the value out and return its block.
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);
        // Safety: the value is initialised and read exactly once; `Drop` is
        // suppressed.
        let value = unsafe { this.ptr.as_ptr().read() };
        // Safety: the block came from `allocate(size_of::<T>())` on `alloc`.
        unsafe { this.alloc.deallocate(this.ptr.cast(), mem::size_of::<T>()) };
        value
    }
}

impl<T, L: LockPolicy, B: BackingAllocator> Deref for PoolBox<'_, T, L, B> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the value stays initialised for the box's lifetime.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, L: LockPolicy, B: BackingAllocator> DerefMut for PoolBox<'_, T, L, B> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the box owns the value uniquely.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, L: LockPolicy, B: BackingAllocator> Drop for PoolBox<'_, T, L, B> {
    fn drop(&mut self) {
        // Safety: the value is initialised and dropped exactly once; the block
        // came from `allocate(size_of::<T>())` on `alloc`.
        unsafe {
            self.ptr.as_ptr().drop_in_place();
            self.alloc.deallocate(self.ptr.cast(), mem::size_of::<T>());
        }
    }
}

impl<T: fmt::Debug, L: LockPolicy, B: BackingAllocator> fmt::Debug for PoolBox<'_, T, L, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
