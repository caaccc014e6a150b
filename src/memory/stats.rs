//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-allocator counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes obtained from backing allocators by every allocator in this crate
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}

// Breakdown by allocator
crate::sync::static_atomic! {
    pub static BUDDY_ARENA_RESERVED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static SLAB_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static SLABS_LIVE: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static BYPASS_LIVE: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time copy of the process-wide allocator gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub buddy_arena_reserved: usize,
    pub slab_committed: usize,
    pub slabs_live: usize,
    pub bypass_live: usize,
}

impl MemoryStats {
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            total_reserved: TOTAL_RESERVED.load(Ordering::Relaxed),
            buddy_arena_reserved: BUDDY_ARENA_RESERVED.load(Ordering::Relaxed),
            slab_committed: SLAB_COMMITTED.load(Ordering::Relaxed),
            slabs_live: SLABS_LIVE.load(Ordering::Relaxed),
            bypass_live: BYPASS_LIVE.load(Ordering::Relaxed),
        }
    }
}
