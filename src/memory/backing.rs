use super::error::AllocError;
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::Arc;
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Source of the large buffers (buddy arenas, slabs, bypass blocks) that the
/// allocators in this crate carve up.
///
/// Implementations are cheap handles: every allocator keeps its own clone and
/// returns each buffer through the same handle that produced it.
pub trait BackingAllocator: Clone {
    /// Obtain a buffer for `layout`. `layout.size()` is never zero.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::OutOfMemory` when the request cannot be met, or an
    /// implementation-specific error (e.g. `AllocError::Vm`).
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Return a buffer.
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this handle (or a clone of it) with
    /// the same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Hint that the bytes in `[ptr, ptr + size)` are unused and their physical
    /// pages may be handed back to the OS. The range stays valid for reads and
    /// writes; its contents become unspecified.
    ///
    /// Returns `true` if any pages were actually advised.
    ///
    /// # Safety
    /// The range must lie inside a live buffer from this backing and must not
    /// hold data anyone still needs.
    unsafe fn purge(&self, _ptr: NonNull<u8>, _size: usize) -> bool {
        false
    }
}

/// The global Rust allocator (`std::alloc`).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBacking;

impl BackingAllocator for SystemBacking {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError::OutOfMemory { size: 0 });
        }
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: upheld by caller.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Page-granular buffers straight from the OS virtual-memory layer.
///
/// Every buffer is its own reservation, rounded up to whole pages and
/// committed in full. Supports `purge` on page-aligned sub-ranges.
#[derive(Clone, Copy, Debug, Default)]
pub struct VmBacking;

impl VmBacking {
    fn mapped_len(layout: Layout) -> Option<usize> {
        layout
            .size()
            .checked_next_multiple_of(PlatformVmOps::page_size())
    }
}

impl BackingAllocator for VmBacking {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let page = PlatformVmOps::page_size();
        if layout.align() > page {
            return Err(AllocError::UnsupportedAlignment {
                align: layout.align(),
                supported: page,
            });
        }
        if layout.size() == 0 {
            return Err(AllocError::OutOfMemory { size: 0 });
        }
        let len = Self::mapped_len(layout).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
        })?;

        // Safety: FFI call to reserve memory.
        let ptr = unsafe { PlatformVmOps::reserve(len)? };
        // Safety: ptr/len describe the reservation made above.
        if let Err(e) = unsafe { PlatformVmOps::commit(ptr, len) } {
            // Safety: ptr/len describe the reservation made above.
            if let Err(release) = unsafe { PlatformVmOps::release(ptr, len) } {
                log::warn!("VmBacking: release after failed commit also failed: {release}");
            }
            return Err(e.into());
        }
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let Some(len) = Self::mapped_len(layout) else {
            return;
        };
        // Safety: upheld by caller; len matches the reservation.
        if let Err(e) = unsafe { PlatformVmOps::release(ptr, len) } {
            log::warn!("VmBacking: failed to release {len} bytes at {ptr:p}: {e}");
        }
    }

    unsafe fn purge(&self, ptr: NonNull<u8>, size: usize) -> bool {
        let page = PlatformVmOps::page_size();
        let start = ptr.as_ptr() as usize;
        let Some(first) = start.checked_next_multiple_of(page) else {
            return false;
        };
        let end = (start + size) & !(page - 1);
        if end <= first {
            return false;
        }
        // Safety: [first, end) lies inside [ptr, ptr + size), which the caller
        // guarantees is part of a live committed buffer.
        let aligned = unsafe { ptr.add(first - start) };
        // Safety: see above.
        match unsafe { PlatformVmOps::purge(aligned, end - first) } {
            Ok(()) => true,
            Err(e) => {
                log::warn!("VmBacking: purge of {} bytes failed: {e}", end - first);
                false
            }
        }
    }
}

/// Caps the bytes a wrapped backing may hand out.
///
/// Clones share one budget, so every allocator built from the same
/// `Budgeted` draws from the same pool. Useful for bounding a subsystem and
/// for driving the exhaustion paths in tests.
#[derive(Debug)]
pub struct Budgeted<B> {
    inner: B,
    remaining: Arc<AtomicUsize>,
}

impl<B: Clone> Clone for Budgeted<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            remaining: Arc::clone(&self.remaining),
        }
    }
}

impl<B: BackingAllocator> Budgeted<B> {
    pub fn new(inner: B, budget: usize) -> Self {
        Self {
            inner,
            remaining: Arc::new(AtomicUsize::new(budget)),
        }
    }

    /// Bytes still available to all clones of this handle.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    fn charge(&self, size: usize) -> bool {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_sub(size) else {
                return false;
            };
            match self.remaining.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn refund(&self, size: usize) {
        self.remaining.fetch_add(size, Ordering::AcqRel);
    }
}

impl<B: BackingAllocator> BackingAllocator for Budgeted<B> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if !self.charge(layout.size()) {
            log::warn!(
                "Budgeted: {} byte request denied, {} bytes left",
                layout.size(),
                self.remaining()
            );
            return Err(AllocError::OutOfMemory {
                size: layout.size(),
            });
        }
        self.inner.allocate(layout).inspect_err(|_| {
            self.refund(layout.size());
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: upheld by caller.
        unsafe { self.inner.deallocate(ptr, layout) };
        self.refund(layout.size());
    }

    unsafe fn purge(&self, ptr: NonNull<u8>, size: usize) -> bool {
        // Safety: upheld by caller.
        unsafe { self.inner.purge(ptr, size) }
    }
}
