use thiserror::Error;

/// Failures of the virtual-memory layer backing [`VmBacking`](super::backing::VmBacking).
#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] std::io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] std::io::Error),
    #[error("VM purge failed: {0}")]
    PurgeFailed(#[source] std::io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] std::io::Error),
}

/// Errors surfaced by constructors and by the small-object facade.
///
/// The buddy allocator never returns these from its hot path: exhaustion there
/// is reported as `None`.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Managed memory (and, for the facade, one reclaim-then-retry pass) could
    /// not satisfy the request.
    #[error("out of memory: request of {size} bytes could not be satisfied")]
    OutOfMemory { size: usize },

    /// Request can never be satisfied by this allocator.
    #[error("request of {size} bytes exceeds capacity of {capacity} bytes")]
    TooLarge { size: usize, capacity: usize },

    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),

    #[error("alignment {align} exceeds the supported block alignment {supported}")]
    UnsupportedAlignment { align: usize, supported: usize },

    #[error(transparent)]
    Vm(#[from] VmError),
}

/// An internal invariant violation found by one of the `check_integrity`
/// diagnostics.
///
/// Any of these means a double free, a foreign pointer handed to `deallocate`,
/// a write through a dangling pointer, or a bug in the allocator itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Corruption {
    #[error("{available} blocks marked available but slab only holds {block_count}")]
    AvailableCountExceeded { available: usize, block_count: usize },

    #[error("free-list index {index} out of range for {block_count} blocks")]
    IndexOutOfRange { index: usize, block_count: usize },

    #[error("free-list index {index} visited twice (cycle or double free)")]
    RepeatedIndex { index: usize },

    #[error("{hint} hint {index} out of bounds for {slabs} slabs")]
    HintOutOfBounds { hint: &'static str, index: usize, slabs: usize },

    #[error("{hint} hint set on an allocator with no slabs")]
    DanglingHint { hint: &'static str },

    #[error("{empty} fully-empty slabs but retained-empty hint is {retained:?}")]
    EmptySlabMismatch { empty: usize, retained: Option<usize> },

    #[error("retained empty slab {index} has {available} of {block_count} blocks available")]
    RetainedSlabNotEmpty { index: usize, available: usize, block_count: usize },

    #[error("bucket {bucket} serves {actual}-byte blocks, expected {expected}")]
    BlockSizeMismatch { bucket: usize, actual: usize, expected: usize },

    #[error("node {index} tracked at level {level} does not belong to that level")]
    NodeOutOfLevel { level: usize, index: usize },

    #[error("buddies {left} and {right} at level {level} are both free but unmerged")]
    UnmergedBuddies { level: usize, left: usize, right: usize },

    #[error("free node {index} at level {level} lies inside free ancestor {ancestor}")]
    OverlappingFreeNodes { level: usize, index: usize, ancestor: usize },

    #[error("pair bit {position} disagrees with the free state of its buddies")]
    PairBitMismatch { position: usize },

    #[error("slab {slab}: {source}")]
    Slab {
        slab: usize,
        #[source]
        source: Box<Corruption>,
    },

    #[error("bucket {bucket}: {source}")]
    Bucket {
        bucket: usize,
        #[source]
        source: Box<Corruption>,
    },
}

impl Corruption {
    pub(crate) fn in_slab(self, slab: usize) -> Self {
        Corruption::Slab { slab, source: Box::new(self) }
    }

    pub(crate) fn in_bucket(self, bucket: usize) -> Self {
        Corruption::Bucket { bucket, source: Box::new(self) }
    }
}
