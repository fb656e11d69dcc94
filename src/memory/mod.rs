//! Sub-allocation of device memory.
//!
//! [`MemoryAllocator`] is the entry point. It picks a memory type for each
//! request and hands it to a [`Pool`] of blocks, a [`FrameAllocator`] ring or a
//! dedicated reservation. The block strategies underneath are usable on their
//! own through [`Block`].

mod allocation;
pub use allocation::*;

mod allocator;
pub use allocator::*;

mod block;
pub use block::*;

mod budget;
pub use budget::*;

mod context;
pub use context::*;

mod counters;
pub use counters::*;

mod dedicated;
pub use dedicated::*;

mod error;
pub use error::*;

mod frame_allocator;
pub use frame_allocator::*;

mod memory_type;
pub use memory_type::*;

mod pool;
pub use pool::*;

mod statistics;
pub use statistics::*;
