use super::backing::BackingAllocator;
use super::error::{AllocError, Corruption};
use super::stats;
use fixedbitset::FixedBitSet;
use std::alloc::Layout;
use std::ptr::NonNull;

/// Fewest blocks a slab is ever carved into.
pub const MIN_BLOCKS_PER_SLAB: usize = 8;
/// Most blocks a slab can index with its one-byte links.
pub const MAX_BLOCKS_PER_SLAB: usize = u8::MAX as usize;

/// Shape shared by every slab of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlabGeometry {
    pub block_size: usize,
    pub block_count: u8,
    pub align: usize,
}

impl SlabGeometry {
    /// Carve `page_size` bytes into `block_size` blocks, keeping the block count
    /// within `MIN_BLOCKS_PER_SLAB..=MAX_BLOCKS_PER_SLAB`.
    pub fn for_page(block_size: usize, page_size: usize, align: usize) -> Self {
        debug_assert!(block_size > 0 && block_size.is_multiple_of(align));
        let count = (page_size / block_size).clamp(MIN_BLOCKS_PER_SLAB, MAX_BLOCKS_PER_SLAB);
        Self {
            block_size,
            block_count: u8::try_from(count).unwrap_or(u8::MAX),
            align,
        }
    }

    #[inline]
    pub fn slab_len(&self) -> usize {
        self.block_size * usize::from(self.block_count)
    }

    pub fn layout(&self) -> Result<Layout, AllocError> {
        Layout::from_size_align(self.slab_len(), self.align)
            .map_err(|e| AllocError::InvalidConfig(e.to_string()))
    }
}

/// One slab: `block_count` equal blocks threaded on an intrusive free list.
///
/// The first byte of each free block holds the index of the next free block.
/// The chain is bounded by `blocks_available`, not by a sentinel, so the link
/// in the last free block is never read.
///
/// The slab does not know its own geometry; the owning pool passes the same
/// `SlabGeometry` to every call.
#[derive(Debug)]
pub(crate) struct FixedBlockPool {
    data: NonNull<u8>,
    first_available: u8,
    blocks_available: u8,
}

// Safety: the slab exclusively owns its buffer.
unsafe impl Send for FixedBlockPool {}

impl FixedBlockPool {
    /// Obtain a slab from `backing` and thread all of its blocks in ascending
    /// order.
    ///
    /// # Errors
    ///
    /// Returns the backing's error if the slab cannot be obtained.
    pub fn init<B: BackingAllocator>(backing: &B, geo: &SlabGeometry) -> Result<Self, AllocError> {
        let layout = geo.layout()?;
        let data = backing.allocate(layout)?;
        let mut slab = Self {
            data,
            first_available: 0,
            blocks_available: 0,
        };
        slab.reset(geo);

        stats::TOTAL_RESERVED.add(layout.size());
        stats::SLAB_COMMITTED.add(layout.size());
        stats::SLABS_LIVE.add(1);
        log::debug!(
            "slab: {} x {} byte blocks at {data:p}",
            geo.block_count,
            geo.block_size
        );
        Ok(slab)
    }

    /// Return the buffer to `backing`.
    pub fn release<B: BackingAllocator>(self, backing: &B, geo: &SlabGeometry) {
        let Ok(layout) = geo.layout() else {
            return;
        };
        // Safety: `data` came from `backing` with this layout in `init`.
        unsafe { backing.deallocate(self.data, layout) };

        stats::sub_saturating(&stats::TOTAL_RESERVED, layout.size());
        stats::sub_saturating(&stats::SLAB_COMMITTED, layout.size());
        stats::sub_saturating(&stats::SLABS_LIVE, 1);
        log::debug!("slab: released {} byte blocks at {:p}", geo.block_size, self.data);
    }

    /// Mark every block free again, links in ascending order.
    pub fn reset(&mut self, geo: &SlabGeometry) {
        for index in 0..geo.block_count {
            // Safety: index < block_count, so the block lies inside the slab.
            // The last block stores block_count, which is never followed.
            unsafe { self.block(index, geo).as_ptr().write(index.wrapping_add(1)) };
        }
        self.first_available = 0;
        self.blocks_available = geo.block_count;
    }

    #[inline]
    fn block(&self, index: u8, geo: &SlabGeometry) -> NonNull<u8> {
        // Safety: callers pass index < block_count.
        unsafe { self.data.add(usize::from(index) * geo.block_size) }
    }

    /// Index of the block starting at `ptr`.
    #[inline]
    fn index_of(&self, ptr: NonNull<u8>, geo: &SlabGeometry) -> usize {
        (ptr.as_ptr() as usize - self.data.as_ptr() as usize) / geo.block_size
    }

    #[inline]
    pub fn blocks_available(&self) -> usize {
        usize::from(self.blocks_available)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.blocks_available == 0
    }

    #[inline]
    pub fn is_empty(&self, geo: &SlabGeometry) -> bool {
        self.blocks_available == geo.block_count
    }

    /// Pop the head of the free list.
    pub fn allocate(&mut self, geo: &SlabGeometry) -> Option<NonNull<u8>> {
        if self.is_full() {
            return None;
        }
        let ptr = self.block(self.first_available, geo);
        // Safety: a free block always holds its link byte.
        self.first_available = unsafe { ptr.as_ptr().read() };
        self.blocks_available -= 1;
        Some(ptr)
    }

    /// Push a block back onto the head of the free list.
    ///
    /// # Safety
    /// `ptr` must be a block of this slab that is currently allocated.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, geo: &SlabGeometry) {
        debug_assert!(self.has_block(ptr, geo), "slab: foreign pointer {ptr:p}");
        let index = self.index_of(ptr, geo);
        debug_assert!(
            self.data.as_ptr() as usize + index * geo.block_size == ptr.as_ptr() as usize,
            "slab: {ptr:p} is not the start of a block"
        );
        debug_assert!(!self.is_empty(geo), "slab: free into a slab with nothing allocated");

        // Safety: ptr is a block of this slab (caller contract).
        unsafe { ptr.as_ptr().write(self.first_available) };
        self.first_available = u8::try_from(index).unwrap_or(u8::MAX);
        self.blocks_available += 1;
    }

    #[inline]
    pub fn has_block(&self, ptr: NonNull<u8>, geo: &SlabGeometry) -> bool {
        let start = self.data.as_ptr() as usize;
        (start..start + geo.slab_len()).contains(&(ptr.as_ptr() as usize))
    }

    /// Whether `ptr`'s block is already on the free list. Walks the chain.
    #[cfg_attr(not(any(test, debug_assertions)), allow(dead_code))]
    pub fn is_block_available(&self, ptr: NonNull<u8>, geo: &SlabGeometry) -> bool {
        if !self.has_block(ptr, geo) {
            return false;
        }
        let target = self.index_of(ptr, geo);
        let mut index = self.first_available;
        for _ in 0..self.blocks_available {
            if usize::from(index) == target {
                return true;
            }
            if index >= geo.block_count {
                return false;
            }
            // Safety: index < block_count.
            index = unsafe { self.block(index, geo).as_ptr().read() };
        }
        false
    }

    /// Verify the free-list bookkeeping. With `check_indexes`, also walk the
    /// chain for `blocks_available` hops, requiring every index in range and
    /// none repeated.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn check_integrity(&self, geo: &SlabGeometry, check_indexes: bool) -> Result<(), Corruption> {
        let block_count = usize::from(geo.block_count);
        let available = self.blocks_available();
        if available > block_count {
            return Err(Corruption::AvailableCountExceeded {
                available,
                block_count,
            });
        }
        if available == 0 {
            return Ok(());
        }
        if usize::from(self.first_available) >= block_count {
            return Err(Corruption::IndexOutOfRange {
                index: usize::from(self.first_available),
                block_count,
            });
        }
        if !check_indexes {
            return Ok(());
        }

        let mut seen = FixedBitSet::with_capacity(block_count);
        let mut index = self.first_available;
        for hop in 0..available {
            let at = usize::from(index);
            if at >= block_count {
                return Err(Corruption::IndexOutOfRange {
                    index: at,
                    block_count,
                });
            }
            if seen.put(at) {
                return Err(Corruption::RepeatedIndex { index: at });
            }
            if hop + 1 < available {
                // Safety: index < block_count.
                index = unsafe { self.block(index, geo).as_ptr().read() };
            }
        }
        Ok(())
    }
}
