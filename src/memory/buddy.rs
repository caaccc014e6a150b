use super::backing::{BackingAllocator, SystemBacking};
use super::error::{AllocError, Corruption};
use super::policy::{LockPolicy, PolicyCell, SingleThreaded};
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use fixedbitset::FixedBitSet;
use std::alloc::Layout;
use std::collections::BTreeSet;
use std::ptr::NonNull;

/// Geometry of a [`BinaryBlockTree`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuddyConfig {
    /// The arena holds `2^max_order` bytes.
    pub max_order: u32,
    /// The smallest block handed out is `2^min_order` bytes.
    pub min_order: u32,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        Self {
            max_order: 20,
            min_order: 6,
        }
    }
}

impl BuddyConfig {
    fn validate(&self) -> Result<(), AllocError> {
        if self.max_order >= usize::BITS - 1 {
            return Err(AllocError::InvalidConfig(format!(
                "max_order {} must be below {}",
                self.max_order,
                usize::BITS - 1
            )));
        }
        if self.min_order > self.max_order {
            return Err(AllocError::InvalidConfig(format!(
                "min_order {} exceeds max_order {}",
                self.min_order, self.max_order
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn arena_size(&self) -> usize {
        1 << self.max_order
    }

    #[inline]
    pub fn min_block_size(&self) -> usize {
        1 << self.min_order
    }

    /// Number of tree levels, root included.
    #[inline]
    pub fn levels(&self) -> usize {
        (self.max_order - self.min_order) as usize + 1
    }
}

/// First node index of `level` in the implicit tree.
#[inline]
const fn level_start(level: usize) -> usize {
    (1 << level) - 1
}

#[inline]
const fn parent(index: usize) -> usize {
    (index - 1) / 2
}

#[inline]
const fn sibling(index: usize) -> usize {
    if index % 2 == 1 { index + 1 } else { index - 1 }
}

/// Bit shared by a node and its sibling.
#[inline]
const fn pair_bit(index: usize) -> usize {
    (index + 1) >> 1
}

/// Free-node bookkeeping of the tree.
///
/// `free[level]` holds the free node indices of that level; ordered sets keep
/// insert, remove and lowest-first pops at O(log n).
/// Bit `pair_bit(i)` of `pairs` is the XOR of "i is free" and "sibling(i) is
/// free", where free means listed in `free`. Every insert or removal of a
/// non-root node flips that bit, so after freeing a node a clear bit means its
/// buddy is free too and the two must merge.
#[derive(Debug)]
struct TreeState {
    free: Vec<BTreeSet<usize>>,
    pairs: FixedBitSet,
}

impl TreeState {
    fn new(levels: usize) -> Self {
        let mut free: Vec<BTreeSet<usize>> = (0..levels).map(|_| BTreeSet::new()).collect();
        free[0].insert(0);
        Self {
            free,
            // Highest node is level_start(levels) - 1, whose pair bit is
            // level_start(levels - 1).
            pairs: FixedBitSet::with_capacity(1 << (levels - 1)),
        }
    }

    #[inline]
    fn flip(&mut self, index: usize) {
        if index != 0 {
            self.pairs.toggle(pair_bit(index));
        }
    }

    /// Returns `false` if the node was already listed.
    fn insert(&mut self, level: usize, index: usize) -> bool {
        if !self.free[level].insert(index) {
            return false;
        }
        self.flip(index);
        true
    }

    fn remove(&mut self, level: usize, index: usize) -> bool {
        if !self.free[level].remove(&index) {
            return false;
        }
        self.flip(index);
        true
    }

    fn pop_lowest(&mut self, level: usize) -> Option<usize> {
        let index = self.free[level].pop_first()?;
        self.flip(index);
        Some(index)
    }

    fn is_free(&self, level: usize, index: usize) -> bool {
        self.free[level].contains(&index)
    }

    /// Split the nearest free ancestor level down until `target` has a node.
    fn split_to_level(&mut self, target: usize) -> bool {
        let Some(mut level) = (0..target).rev().find(|&l| !self.free[l].is_empty()) else {
            return false;
        };
        while level < target {
            let Some(node) = self.pop_lowest(level) else {
                return false;
            };
            self.insert(level + 1, 2 * node + 1);
            self.insert(level + 1, 2 * node + 2);
            log::trace!("buddy: split node {node} at level {level}");
            level += 1;
        }
        true
    }

    fn take(&mut self, level: usize) -> Option<usize> {
        if let Some(index) = self.pop_lowest(level) {
            return Some(index);
        }
        if !self.split_to_level(level) {
            return None;
        }
        self.pop_lowest(level)
    }

    /// Insert `index` and merge upward while the buddy is free.
    fn release(&mut self, mut level: usize, mut index: usize) {
        loop {
            let inserted = self.insert(level, index);
            debug_assert!(inserted, "buddy: double free of node {index} at level {level}");
            if index == 0 || self.pairs.contains(pair_bit(index)) {
                return;
            }
            let buddy = sibling(index);
            self.remove(level, index);
            self.remove(level, buddy);
            log::trace!("buddy: merged nodes {index} and {buddy} at level {level}");
            index = parent(index);
            level -= 1;
        }
    }

    /// Nearest strict ancestor of `index` that is listed as free.
    fn has_free_ancestor(&self, mut level: usize, mut index: usize) -> Option<usize> {
        while index != 0 {
            index = parent(index);
            level -= 1;
            if self.is_free(level, index) {
                return Some(index);
            }
        }
        None
    }

    fn check(&self) -> Result<(), Corruption> {
        let levels = self.free.len();
        let mut listed = FixedBitSet::with_capacity(level_start(levels));

        for (level, list) in self.free.iter().enumerate() {
            let range = level_start(level)..level_start(level + 1);
            for &index in list {
                if !range.contains(&index) {
                    return Err(Corruption::NodeOutOfLevel { level, index });
                }
                listed.insert(index);
            }
        }

        for (level, list) in self.free.iter().enumerate() {
            for &index in list {
                if index != 0 {
                    let buddy = sibling(index);
                    if index < buddy && listed.contains(buddy) {
                        return Err(Corruption::UnmergedBuddies {
                            level,
                            left: index,
                            right: buddy,
                        });
                    }
                }
                if let Some(ancestor) = self.has_free_ancestor(level, index) {
                    return Err(Corruption::OverlappingFreeNodes {
                        level,
                        index,
                        ancestor,
                    });
                }
            }
        }

        for position in 1..self.pairs.len() {
            let left = 2 * position - 1;
            let expected = listed.contains(left) ^ listed.contains(left + 1);
            if self.pairs.contains(position) != expected {
                return Err(Corruption::PairBitMismatch { position });
            }
        }
        Ok(())
    }
}

/// Buddy allocator over one fixed `2^max_order`-byte arena.
///
/// Blocks are power-of-two sized, between `2^min_order` bytes and the whole
/// arena, and aligned to their size (capped at the page size). Exhaustion is
/// reported as `None`. Every public call runs in one critical section of `L`.
pub struct BinaryBlockTree<L: LockPolicy = SingleThreaded, B: BackingAllocator = SystemBacking> {
    base: NonNull<u8>,
    config: BuddyConfig,
    layout: Layout,
    state: PolicyCell<TreeState, L>,
    backing: B,
}

// Safety: the arena is exclusively owned; all mutation goes through `state`.
unsafe impl<L: LockPolicy + Send, B: BackingAllocator + Send> Send for BinaryBlockTree<L, B> {}
// Safety: `base`, `config` and `layout` are immutable after construction;
// `state` is `Sync` exactly when `L` is.
unsafe impl<L: LockPolicy + Sync, B: BackingAllocator + Sync> Sync for BinaryBlockTree<L, B> {}

impl<L: LockPolicy> BinaryBlockTree<L, SystemBacking> {
    /// Tree with the default geometry (1 MiB arena, 64-byte blocks).
    ///
    /// # Errors
    ///
    /// Returns `AllocError` if the arena cannot be obtained.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(BuddyConfig::default())
    }

    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` for a bad geometry, or the backing's
    /// error if the arena cannot be obtained.
    pub fn with_config(config: BuddyConfig) -> Result<Self, AllocError> {
        Self::with_backing(config, SystemBacking)
    }
}

impl<L: LockPolicy, B: BackingAllocator> BinaryBlockTree<L, B> {
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` for a bad geometry, or the backing's
    /// error if the arena cannot be obtained.
    pub fn with_backing(config: BuddyConfig, backing: B) -> Result<Self, AllocError> {
        config.validate()?;
        let arena = config.arena_size();
        let align = arena.min(PlatformVmOps::page_size());
        let layout = Layout::from_size_align(arena, align)
            .map_err(|e| AllocError::InvalidConfig(e.to_string()))?;
        let base = backing.allocate(layout)?;

        stats::TOTAL_RESERVED.add(arena);
        stats::BUDDY_ARENA_RESERVED.add(arena);
        log::debug!(
            "buddy: arena of {arena} bytes at {base:p}, blocks {}..={arena} bytes",
            config.min_block_size()
        );

        Ok(Self {
            base,
            config,
            layout,
            state: PolicyCell::new(TreeState::new(config.levels())),
            backing,
        })
    }

    #[inline]
    pub fn arena_size(&self) -> usize {
        self.config.arena_size()
    }

    #[inline]
    pub fn min_block_size(&self) -> usize {
        self.config.min_block_size()
    }

    #[inline]
    pub fn levels(&self) -> usize {
        self.config.levels()
    }

    #[inline]
    fn block_size(&self, level: usize) -> usize {
        self.arena_size() >> level
    }

    /// Level serving `size`, or `None` if no block is big enough.
    fn level_for(&self, size: usize) -> Option<usize> {
        let rounded = size.max(self.min_block_size()).checked_next_power_of_two()?;
        if rounded > self.arena_size() {
            return None;
        }
        Some((self.config.max_order - rounded.trailing_zeros()) as usize)
    }

    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        (start..start + self.arena_size()).contains(&(ptr.as_ptr() as usize))
    }

    fn node_ptr(&self, level: usize, index: usize) -> NonNull<u8> {
        let offset = (index - level_start(level)) * self.block_size(level);
        // Safety: every node of the tree lies inside the arena.
        unsafe { self.base.add(offset) }
    }

    /// Allocate a block of at least `size` bytes (zero counts as one).
    ///
    /// Always takes the lowest-addressed fitting block, splitting a larger one
    /// if needed. Returns `None` if the request exceeds the arena or no free
    /// block is left.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let Some(level) = self.level_for(size) else {
            log::warn!(
                "buddy: request of {size} bytes exceeds arena of {} bytes",
                self.arena_size()
            );
            return None;
        };
        let Some(index) = self.state.with(|s| s.take(level)) else {
            log::warn!(
                "buddy: out of memory for {} byte block",
                self.block_size(level)
            );
            return None;
        };
        Some(self.node_ptr(level, index))
    }

    /// Return a block and merge it with any free buddies.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(size)` on this tree (any `size` rounding
    /// to the same block size will do) and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(self.contains(ptr), "buddy: foreign pointer {ptr:p}");
        let Some(level) = self.level_for(size) else {
            debug_assert!(false, "buddy: size {size} was never allocatable");
            return;
        };
        let block = self.block_size(level);
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert!(
            offset.is_multiple_of(block),
            "buddy: {ptr:p} is not the start of a {block} byte block"
        );
        let index = offset / block + level_start(level);

        self.state.with(|s| {
            #[cfg(debug_assertions)]
            if let Some(ancestor) = s.has_free_ancestor(level, index) {
                panic!("buddy: double free of node {index}, already inside free node {ancestor}");
            }
            s.release(level, index);
        });
    }

    /// Number of free nodes on each level, root first.
    pub fn free_nodes_per_level(&self) -> Vec<usize> {
        self.state.with(|s| s.free.iter().map(BTreeSet::len).collect())
    }

    /// Verify the free-list and pair-bit bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn check_integrity(&self) -> Result<(), Corruption> {
        self.state.with(|s| s.check())
    }

    pub fn is_corrupt(&self) -> bool {
        self.check_integrity().is_err()
    }

    /// Hand the pages of free blocks of at least one page back to the OS via
    /// the backing's `purge`. Returns the bytes advised; zero if the backing
    /// cannot purge.
    pub fn release_idle_memory(&self) -> usize {
        let page = PlatformVmOps::page_size();
        self.state.with(|s| {
            let mut released = 0;
            for (level, list) in s.free.iter().enumerate() {
                let block = self.block_size(level);
                if block < page {
                    break;
                }
                for &index in list {
                    // Safety: a listed node is unused arena memory.
                    if unsafe { self.backing.purge(self.node_ptr(level, index), block) } {
                        released += block;
                    }
                }
            }
            if released > 0 {
                log::debug!("buddy: purged {released} idle bytes");
            }
            released
        })
    }
}

impl<L: LockPolicy, B: BackingAllocator> Drop for BinaryBlockTree<L, B> {
    fn drop(&mut self) {
        // Safety: the arena came from this backing with this layout.
        unsafe { self.backing.deallocate(self.base, self.layout) };
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.layout.size());
        stats::sub_saturating(&stats::BUDDY_ARENA_RESERVED, self.layout.size());
    }
}
