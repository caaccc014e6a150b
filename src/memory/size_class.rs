use super::backing::BackingAllocator;
use super::block_pool::{FixedBlockPool, SlabGeometry};
use super::error::Corruption;
use std::ptr::NonNull;

/// Growable set of same-sized slabs serving one size class.
///
/// Three non-owning hints avoid scanning on the hot paths:
/// - `alloc_hint`: slab the last allocation came from.
/// - `dealloc_hint`: slab the last deallocation went to; owner searches start here.
/// - `empty_hint`: the single fully-empty slab kept around to absorb alloc/free
///   churn at zero occupancy. Any second empty slab is released at once.
pub(crate) struct SizeClassPool<B: BackingAllocator> {
    geo: SlabGeometry,
    slabs: Vec<FixedBlockPool>,
    alloc_hint: Option<usize>,
    dealloc_hint: Option<usize>,
    empty_hint: Option<usize>,
    backing: B,
}

impl<B: BackingAllocator> SizeClassPool<B> {
    pub fn new(block_size: usize, page_size: usize, align: usize, backing: B) -> Self {
        Self {
            geo: SlabGeometry::for_page(block_size, page_size, align),
            slabs: Vec::new(),
            alloc_hint: None,
            dealloc_hint: None,
            empty_hint: None,
            backing,
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.geo.block_size
    }

    #[inline]
    pub fn blocks_per_slab(&self) -> usize {
        usize::from(self.geo.block_count)
    }

    #[inline]
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.slabs.iter().map(FixedBlockPool::blocks_available).sum()
    }

    /// Allocate one block, growing by a slab if every slab is full. `None` if
    /// the backing cannot provide a new slab.
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let index = match self.alloc_hint {
            Some(i) if !self.slabs[i].is_full() => i,
            _ => match self.empty_hint {
                Some(e) => e,
                None => match self.slabs.iter().position(|s| !s.is_full()) {
                    Some(i) => i,
                    None => self.grow()?,
                },
            },
        };

        self.alloc_hint = Some(index);
        if self.empty_hint == Some(index) {
            self.empty_hint = None;
        }
        self.slabs[index].allocate(&self.geo)
    }

    fn grow(&mut self) -> Option<usize> {
        if self.slabs.len() == self.slabs.capacity() {
            let additional = self.slabs.len().max(8);
            if self.slabs.try_reserve(additional).is_err() {
                log::warn!("size class {}: slab table growth failed", self.geo.block_size);
                return None;
            }
        }
        let slab = match FixedBlockPool::init(&self.backing, &self.geo) {
            Ok(slab) => slab,
            Err(e) => {
                log::warn!("size class {}: new slab failed: {e}", self.geo.block_size);
                return None;
            }
        };
        self.slabs.push(slab);
        if self.dealloc_hint.is_none() {
            self.dealloc_hint = Some(0);
        }
        Some(self.slabs.len() - 1)
    }

    /// Index of the slab owning `ptr`.
    ///
    /// Probes the dealloc hint first, then alternates one slab below and one
    /// above, moving outward, so recently touched neighbourhoods are found
    /// quickly.
    pub fn has_block(&self, ptr: NonNull<u8>) -> Option<usize> {
        let len = self.slabs.len();
        if len == 0 {
            return None;
        }
        let center = self.dealloc_hint.unwrap_or(0).min(len - 1);
        let mut lo = Some(center);
        let mut hi = center + 1;
        loop {
            if let Some(l) = lo {
                if self.slabs[l].has_block(ptr, &self.geo) {
                    return Some(l);
                }
                lo = l.checked_sub(1);
            }
            if hi < len {
                if self.slabs[hi].has_block(ptr, &self.geo) {
                    return Some(hi);
                }
                hi += 1;
            }
            if lo.is_none() && hi >= len {
                return None;
            }
        }
    }

    /// Return a block. `slab_hint` names the owning slab if the caller already
    /// knows it. Returns `false` if no slab owns `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live block from `allocate` on this pool.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, slab_hint: Option<usize>) -> bool {
        let index = match slab_hint {
            Some(i) if i < self.slabs.len() && self.slabs[i].has_block(ptr, &self.geo) => i,
            _ => match self.has_block(ptr) {
                Some(i) => i,
                None => return false,
            },
        };
        self.dealloc_hint = Some(index);

        #[cfg(debug_assertions)]
        assert!(
            !self.slabs[index].is_block_available(ptr, &self.geo),
            "size class {}: double free of {ptr:p}",
            self.geo.block_size
        );

        // Safety: ptr is an allocated block of slab `index` (caller contract).
        unsafe { self.slabs[index].deallocate(ptr, &self.geo) };
        if self.slabs[index].is_empty(&self.geo) {
            self.retire(index);
        }
        true
    }

    /// Slab `index` just became empty: retain it, or if another empty slab is
    /// already retained, release one of the two.
    fn retire(&mut self, index: usize) {
        let Some(retained) = self.empty_hint else {
            self.empty_hint = Some(index);
            return;
        };
        debug_assert_ne!(retained, index);

        // Release whichever of the two sits last so the other keeps its index.
        let last = self.slabs.len() - 1;
        let (victim, kept) = if last == index {
            (index, retained)
        } else {
            (retained, index)
        };
        self.remove_slab(victim);

        self.dealloc_hint = Some(kept);
        self.empty_hint = Some(kept);
        if self.alloc_hint.is_none_or(|a| self.slabs[a].is_full()) {
            self.alloc_hint = Some(kept);
        }
    }

    /// Swap-remove slab `index`, release it, and fix up hints: hints to the
    /// removed slab become `None`, hints to the moved last slab follow it.
    fn remove_slab(&mut self, index: usize) {
        let last = self.slabs.len() - 1;
        let slab = self.slabs.swap_remove(index);
        slab.release(&self.backing, &self.geo);

        let remap = |hint: Option<usize>| match hint {
            Some(h) if h == index => None,
            Some(h) if h == last => Some(index),
            other => other,
        };
        self.alloc_hint = remap(self.alloc_hint);
        self.dealloc_hint = remap(self.dealloc_hint);
        self.empty_hint = remap(self.empty_hint);
    }

    /// Release the retained empty slab, if any.
    pub fn free_empty_chunk(&mut self) -> bool {
        let Some(empty) = self.empty_hint else {
            return false;
        };
        self.remove_slab(empty);

        if self.slabs.is_empty() {
            self.alloc_hint = None;
            self.dealloc_hint = None;
        } else {
            self.dealloc_hint = self.dealloc_hint.or(Some(0));
            self.alloc_hint = self.alloc_hint.or(Some(self.slabs.len() - 1));
        }
        true
    }

    /// Drop spare capacity of the slab table.
    pub fn shrink_to_fit(&mut self) -> bool {
        if self.slabs.capacity() > self.slabs.len() {
            self.slabs.shrink_to_fit();
            return true;
        }
        false
    }

    /// Number of fully-empty slabs. `fast` trusts the retained-empty hint
    /// instead of inspecting every slab.
    pub fn empty_slab_count(&self, fast: bool) -> usize {
        if fast {
            return usize::from(self.empty_hint.is_some());
        }
        self.slabs.iter().filter(|s| s.is_empty(&self.geo)).count()
    }

    /// Verify hints, the one-empty-slab rule, and every slab's free list.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn check_integrity(&self) -> Result<(), Corruption> {
        let slabs = self.slabs.len();
        let hints = [
            ("alloc", self.alloc_hint),
            ("dealloc", self.dealloc_hint),
            ("empty", self.empty_hint),
        ];
        for (hint, value) in hints {
            match value {
                Some(_) if slabs == 0 => return Err(Corruption::DanglingHint { hint }),
                Some(index) if index >= slabs => {
                    return Err(Corruption::HintOutOfBounds { hint, index, slabs });
                }
                _ => {}
            }
        }

        let empty = self.empty_slab_count(false);
        if empty != usize::from(self.empty_hint.is_some()) {
            return Err(Corruption::EmptySlabMismatch {
                empty,
                retained: self.empty_hint,
            });
        }
        if let Some(index) = self.empty_hint {
            let slab = &self.slabs[index];
            if !slab.is_empty(&self.geo) {
                return Err(Corruption::RetainedSlabNotEmpty {
                    index,
                    available: slab.blocks_available(),
                    block_count: self.blocks_per_slab(),
                });
            }
        }

        for (i, slab) in self.slabs.iter().enumerate() {
            slab.check_integrity(&self.geo, true)
                .map_err(|e| e.in_slab(i))?;
        }
        Ok(())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_corrupt(&self) -> bool {
        self.check_integrity().is_err()
    }
}

impl<B: BackingAllocator> Drop for SizeClassPool<B> {
    fn drop(&mut self) {
        for slab in self.slabs.drain(..) {
            slab.release(&self.backing, &self.geo);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::backing::{Budgeted, SystemBacking};

    /// 64-byte blocks, 8 per slab.
    fn pool() -> SizeClassPool<SystemBacking> {
        SizeClassPool::new(64, 512, 4, SystemBacking)
    }

    #[test]
    fn test_slab_retirement_keeps_one_empty() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        assert_eq!(pool.blocks_per_slab(), 8);

        let ptrs: Vec<_> = (0..16).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.slab_count(), 2);
        assert!(!pool.is_corrupt());

        for &p in &ptrs {
            // Safety: Test code.
            assert!(unsafe { pool.deallocate(p, None) });
            assert!(!pool.is_corrupt());
        }
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.empty_slab_count(false), 1);
        assert_eq!(pool.empty_slab_count(true), 1);

        assert!(pool.free_empty_chunk());
        assert_eq!(pool.slab_count(), 0);
        assert!(!pool.free_empty_chunk());
        assert!(!pool.is_corrupt());
    }

    #[test]
    fn test_free_empty_chunk_moves_last_slab_and_its_hints() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        let ptrs: Vec<_> = (0..24).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.slab_count(), 3);

        // Empty slab 0 while slabs 1 and 2 stay occupied.
        for &p in &ptrs[..8] {
            // Safety: Test code.
            assert!(unsafe { pool.deallocate(p, None) });
        }
        // Point the dealloc hint at the last slab.
        // Safety: Test code.
        assert!(unsafe { pool.deallocate(ptrs[23], None) });
        assert_eq!(pool.empty_hint, Some(0));
        assert_eq!(pool.alloc_hint, Some(2));
        assert_eq!(pool.dealloc_hint, Some(2));

        assert!(pool.free_empty_chunk());
        assert_eq!(pool.slab_count(), 2);
        assert_eq!(pool.empty_hint, None);
        assert_eq!(pool.alloc_hint, Some(0));
        assert_eq!(pool.dealloc_hint, Some(0));
        assert!(!pool.is_corrupt());

        // The former last slab now sits at index 0 and still owns its blocks.
        assert_eq!(pool.has_block(ptrs[16]), Some(0));
        assert_eq!(pool.has_block(ptrs[8]), Some(1));
        assert_eq!(pool.allocate(), Some(ptrs[23]));
        assert_eq!(pool.slab_count(), 2);
        assert!(!pool.is_corrupt());
    }

    #[test]
    fn test_retirement_in_reverse_order() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        let ptrs: Vec<_> = (0..24).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.slab_count(), 3);

        for &p in ptrs.iter().rev() {
            // Safety: Test code.
            assert!(unsafe { pool.deallocate(p, None) });
            assert!(!pool.is_corrupt(), "{:?}", pool.check_integrity());
        }
        assert_eq!(pool.slab_count(), 1);
    }

    #[test]
    fn test_retained_empty_slab_is_reused() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        let a = pool.allocate().unwrap();
        // Safety: Test code.
        unsafe { pool.deallocate(a, None) };
        assert_eq!(pool.empty_slab_count(true), 1);

        let b = pool.allocate().unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.empty_slab_count(true), 0);
        assert!(!pool.is_corrupt());
    }

    #[test]
    fn test_interleaved_frees_across_slabs() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        let mut live: Vec<_> = (0..40).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.slab_count(), 5);

        // Free every other block, then the rest, checking the pool each step.
        let odd: Vec<_> = live.iter().copied().skip(1).step_by(2).collect();
        live.retain(|p| !odd.contains(p));
        for p in odd.into_iter().chain(live) {
            // Safety: Test code.
            assert!(unsafe { pool.deallocate(p, None) });
            assert!(!pool.is_corrupt(), "{:?}", pool.check_integrity());
        }
        assert_eq!(pool.slab_count(), 1);
        assert_eq!(pool.free_blocks(), 8);
    }

    #[test]
    fn test_has_block_finds_owner_from_any_hint() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        let ptrs: Vec<_> = (0..32).map(|_| pool.allocate().unwrap()).collect();

        for hint in 0..4 {
            pool.dealloc_hint = Some(hint);
            for (i, &p) in ptrs.iter().enumerate() {
                let owner = pool.has_block(p).unwrap();
                assert!(pool.slabs[owner].has_block(p, &pool.geo), "block {i}");
            }
        }
        let mut outside = 0u64;
        assert!(pool.has_block(NonNull::from(&mut outside).cast()).is_none());

        for p in ptrs {
            // Safety: Test code.
            unsafe { pool.deallocate(p, None) };
        }
    }

    #[test]
    fn test_deallocate_with_slab_hint() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        let ptrs: Vec<_> = (0..9).map(|_| pool.allocate().unwrap()).collect();
        let owner = pool.has_block(ptrs[8]).unwrap();
        // Safety: Test code.
        unsafe {
            assert!(pool.deallocate(ptrs[8], Some(owner)));
            // A wrong hint falls back to the search.
            assert!(pool.deallocate(ptrs[0], Some(owner)));
        }
        let mut outside = 0u64;
        // Safety: Test code (pointer is rejected before any write).
        assert!(!unsafe { pool.deallocate(NonNull::from(&mut outside).cast(), None) });
        assert!(!pool.is_corrupt());
    }

    #[test]
    fn test_backing_exhaustion_returns_none() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // Room for exactly one 512-byte slab.
        let mut pool = SizeClassPool::new(64, 512, 4, Budgeted::new(SystemBacking, 600));
        let ptrs: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
        assert!(pool.allocate().is_none());
        assert!(!pool.is_corrupt());

        // Safety: Test code.
        unsafe { pool.deallocate(ptrs[0], None) };
        assert!(pool.allocate().is_some());
    }

    #[test]
    fn test_shrink_to_fit_reports_release() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        let a = pool.allocate().unwrap();
        assert!(pool.shrink_to_fit());
        assert!(!pool.shrink_to_fit());
        // Safety: Test code.
        unsafe { pool.deallocate(a, None) };
    }

    #[test]
    fn test_integrity_reports_bad_hints() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut pool = pool();
        pool.alloc_hint = Some(0);
        assert_eq!(
            pool.check_integrity(),
            Err(Corruption::DanglingHint { hint: "alloc" })
        );
        pool.alloc_hint = None;

        let a = pool.allocate().unwrap();
        pool.dealloc_hint = Some(3);
        assert_eq!(
            pool.check_integrity(),
            Err(Corruption::HintOutOfBounds {
                hint: "dealloc",
                index: 3,
                slabs: 1
            })
        );
        pool.dealloc_hint = Some(0);

        pool.empty_hint = Some(0);
        assert_eq!(
            pool.check_integrity(),
            Err(Corruption::EmptySlabMismatch {
                empty: 0,
                retained: Some(0)
            })
        );
        pool.empty_hint = None;

        // Safety: Test code.
        unsafe { pool.deallocate(a, None) };
        assert!(!pool.is_corrupt());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics_in_debug() {
        let mut pool = pool();
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        // Safety: Test code (deliberate misuse).
        unsafe {
            pool.deallocate(a, None);
            pool.deallocate(a, None);
        }
    }
}
