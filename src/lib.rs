pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::buddy::{BinaryBlockTree, BuddyConfig};
pub use memory::pool_box::PoolBox;
pub use memory::small_object::{SmallObjectAllocator, SmallObjectConfig};

// strategies
pub use memory::backing::{BackingAllocator, Budgeted, SystemBacking, VmBacking};
pub use memory::policy::{LockPolicy, MultiThreaded, PolicyCell, SingleThreaded};

// stats
pub use memory::stats::{Counter, MemoryStats};

// errors
pub use memory::error::{AllocError, Corruption, VmError};
