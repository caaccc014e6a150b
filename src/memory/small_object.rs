use super::backing::{BackingAllocator, SystemBacking};
use super::error::{AllocError, Corruption};
use super::policy::{LockPolicy, PolicyCell, SingleThreaded};
use super::size_class::SizeClassPool;
use super::stats;
use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Construction-time knobs of a [`SmallObjectAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SmallObjectConfig {
    /// Target slab size in bytes; each size class carves slabs of roughly this size.
    pub page_size: usize,
    /// Largest request served from size classes; anything bigger bypasses
    /// straight to the backing allocator.
    pub max_object_size: usize,
    /// Size-class granularity and the alignment of every returned block.
    pub alignment: usize,
}

impl Default for SmallObjectConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_object_size: 256,
            alignment: 4,
        }
    }
}

impl SmallObjectConfig {
    fn validate(&self) -> Result<(), AllocError> {
        if !self.alignment.is_power_of_two() {
            return Err(AllocError::InvalidConfig(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.max_object_size == 0 {
            return Err(AllocError::InvalidConfig(
                "max_object_size must be non-zero".to_string(),
            ));
        }
        if self.page_size < self.alignment {
            return Err(AllocError::InvalidConfig(format!(
                "page_size {} is smaller than alignment {}",
                self.page_size, self.alignment
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.max_object_size.div_ceil(self.alignment)
    }
}

/// Size-class allocator for small objects.
///
/// Requests up to `max_object_size` bytes are served from one
/// [`SizeClassPool`] per `alignment`-sized bucket, each behind its own lock.
/// Larger requests go straight to the backing allocator and are tracked so that
/// [`deallocate_unsized`](Self::deallocate_unsized) can route them back.
///
/// No call holds two locks at once.
pub struct SmallObjectAllocator<L: LockPolicy = SingleThreaded, B: BackingAllocator = SystemBacking> {
    config: SmallObjectConfig,
    buckets: Box<[PolicyCell<SizeClassPool<B>, L>]>,
    // addr -> requested size of every live bypass block
    bypass: PolicyCell<HashMap<usize, usize>, L>,
    backing: B,
}

impl<L: LockPolicy> SmallObjectAllocator<L, SystemBacking> {
    /// # Errors
    ///
    /// Never fails with the default configuration; kept fallible for symmetry
    /// with [`with_config`](Self::with_config).
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(SmallObjectConfig::default())
    }

    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if `config` is inconsistent.
    pub fn with_config(config: SmallObjectConfig) -> Result<Self, AllocError> {
        Self::with_backing(config, SystemBacking)
    }
}

impl<L: LockPolicy, B: BackingAllocator> SmallObjectAllocator<L, B> {
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` if `config` is inconsistent.
    pub fn with_backing(config: SmallObjectConfig, backing: B) -> Result<Self, AllocError> {
        config.validate()?;
        let buckets = (0..config.bucket_count())
            .map(|i| {
                PolicyCell::new(SizeClassPool::new(
                    (i + 1) * config.alignment,
                    config.page_size,
                    config.alignment,
                    backing.clone(),
                ))
            })
            .collect();
        log::debug!(
            "small objects: {} size classes up to {} bytes, {}-byte alignment",
            config.bucket_count(),
            config.max_object_size,
            config.alignment
        );
        Ok(Self {
            config,
            buckets,
            bypass: PolicyCell::new(HashMap::new()),
            backing,
        })
    }

    #[inline]
    pub fn max_object_size(&self) -> usize {
        self.config.max_object_size
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.config.alignment
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Size class serving `size`, or `None` if it bypasses the pools. Zero is
    /// treated as one byte.
    #[inline]
    pub fn bucket_index(&self, size: usize) -> Option<usize> {
        if size > self.config.max_object_size {
            return None;
        }
        Some(size.max(1).div_ceil(self.config.alignment) - 1)
    }

    fn bypass_layout(&self, size: usize) -> Result<Layout, AllocError> {
        Layout::from_size_align(size, self.config.alignment)
            .map_err(|_| AllocError::TooLarge {
                size,
                capacity: isize::MAX as usize,
            })
    }

    fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let Some(bucket) = self.bucket_index(size) else {
            let layout = self.bypass_layout(size)?;
            let ptr = self.backing.allocate(layout)?;
            self.bypass.with(|table| table.insert(ptr.as_ptr() as usize, size));
            stats::TOTAL_RESERVED.add(size);
            stats::BYPASS_LIVE.add(size);
            return Ok(ptr);
        };
        self.buckets[bucket]
            .with(SizeClassPool::allocate)
            .ok_or(AllocError::OutOfMemory { size })
    }

    /// Allocate at least `size` bytes aligned to `alignment()`.
    ///
    /// On failure, runs one reclamation pass over all size classes (outside
    /// any lock) and retries once.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::OutOfMemory` if the retry fails too, or
    /// `AllocError::TooLarge` for a size no layout can describe.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.try_allocate(size) {
            Ok(ptr) => Ok(ptr),
            Err(e @ AllocError::TooLarge { .. }) => Err(e),
            Err(first) => {
                log::warn!("small objects: {size} byte request failed ({first}), reclaiming and retrying");
                self.try_to_free_up_some_memory();
                self.try_allocate(size).map_err(|e| {
                    log::warn!("small objects: out of memory for {size} bytes: {e}");
                    match e {
                        AllocError::TooLarge { .. } => e,
                        _ => AllocError::OutOfMemory { size },
                    }
                })
            }
        }
    }

    /// [`allocate`](Self::allocate), escalating failure to
    /// `std::alloc::handle_alloc_error`.
    pub fn allocate_or_abort(&self, size: usize) -> NonNull<u8> {
        match self.allocate(size) {
            Ok(ptr) => ptr,
            Err(_) => {
                let layout = Layout::from_size_align(size.max(1), self.config.alignment)
                    .unwrap_or(Layout::new::<u8>());
                std::alloc::handle_alloc_error(layout)
            }
        }
    }

    /// Return a block, routing by `size`.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(size)` on this allocator with the same
    /// `size`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let Some(bucket) = self.bucket_index(size) else {
            let recorded = self.bypass.with(|table| table.remove(&(ptr.as_ptr() as usize)));
            debug_assert_eq!(
                recorded,
                Some(size),
                "small objects: {ptr:p} is not a live {size} byte bypass block"
            );
            // Safety: upheld by caller.
            unsafe { self.release_bypass(ptr, size) };
            return;
        };
        // Safety: upheld by caller.
        let found = self.buckets[bucket].with(|pool| unsafe { pool.deallocate(ptr, None) });
        debug_assert!(found, "small objects: foreign pointer {ptr:p} for size {size}");
    }

    /// Return a block without knowing its size. Probes every size class, then
    /// the bypass table; slower than [`deallocate`](Self::deallocate).
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator and must not be used
    /// afterwards.
    pub unsafe fn deallocate_unsized(&self, ptr: NonNull<u8>) {
        for bucket in &self.buckets {
            let freed = bucket.with(|pool| {
                pool.has_block(ptr)
                    // Safety: the pool owns `ptr`; liveness is the caller's contract.
                    .map(|slab| unsafe { pool.deallocate(ptr, Some(slab)) })
            });
            if freed.is_some() {
                return;
            }
        }

        match self.bypass.with(|table| table.remove(&(ptr.as_ptr() as usize))) {
            // Safety: the table recorded this block with `size`.
            Some(size) => unsafe { self.release_bypass(ptr, size) },
            None => debug_assert!(false, "small objects: foreign pointer {ptr:p}"),
        }
    }

    /// # Safety
    /// `ptr` must be a bypass block of `size` bytes already removed from the table.
    unsafe fn release_bypass(&self, ptr: NonNull<u8>, size: usize) {
        let Ok(layout) = self.bypass_layout(size) else {
            return;
        };
        // Safety: allocated from `backing` with this layout in `try_allocate`.
        unsafe { self.backing.deallocate(ptr, layout) };
        stats::sub_saturating(&stats::TOTAL_RESERVED, size);
        stats::sub_saturating(&stats::BYPASS_LIVE, size);
    }

    /// Release every retained empty slab, then trim slab tables. Returns
    /// whether anything was released.
    pub fn try_to_free_up_some_memory(&self) -> bool {
        let mut freed = false;
        for bucket in &self.buckets {
            freed |= bucket.with(SizeClassPool::free_empty_chunk);
        }
        for bucket in &self.buckets {
            freed |= bucket.with(SizeClassPool::shrink_to_fit);
        }
        if freed {
            log::debug!("small objects: reclaimed idle slabs");
        }
        freed
    }

    /// Free blocks currently held by each size class.
    pub fn free_blocks_per_bucket(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .map(|bucket| bucket.with(|pool| pool.free_blocks()))
            .collect()
    }

    /// Requested bytes of all live bypass blocks.
    pub fn bypass_live_bytes(&self) -> usize {
        self.bypass.with(|table| table.values().sum())
    }

    /// Verify every size class.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant, tagged with its bucket.
    pub fn check_integrity(&self) -> Result<(), Corruption> {
        for (i, bucket) in self.buckets.iter().enumerate() {
            let expected = (i + 1) * self.config.alignment;
            bucket
                .with(|pool| {
                    if pool.block_size() != expected {
                        return Err(Corruption::BlockSizeMismatch {
                            bucket: i,
                            actual: pool.block_size(),
                            expected,
                        });
                    }
                    pool.check_integrity()
                })
                .map_err(|e| e.in_bucket(i))?;
        }
        Ok(())
    }

    pub fn is_corrupt(&self) -> bool {
        self.check_integrity().is_err()
    }
}

impl<L: LockPolicy, B: BackingAllocator> Drop for SmallObjectAllocator<L, B> {
    fn drop(&mut self) {
        let live: Vec<(usize, usize)> = self.bypass.get_mut().drain().collect();
        if !live.is_empty() {
            log::debug!("small objects: releasing {} leaked bypass blocks", live.len());
        }
        for (addr, size) in live {
            let Some(ptr) = NonNull::new(addr as *mut u8) else {
                continue;
            };
            // Safety: the table only holds live bypass blocks.
            unsafe { self.release_bypass(ptr, size) };
        }
    }
}
