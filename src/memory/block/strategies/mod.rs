mod free_list;
pub use free_list::*;

mod first_fit;
pub use first_fit::*;

mod best_fit;
pub use best_fit::*;

mod buddy;
pub use buddy::*;

mod linear;
pub use linear::*;

/// How a block carves allocations out of its memory. Fixed per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocationStrategy {
    /// Lowest-offset free node that fits.
    FirstFit,
    /// Smallest free node that fits.
    #[default]
    BestFit,
    /// Power-of-two splitting and merging.
    Buddy,
    /// Bump pointer, reclaimed only by resetting the whole block.
    Linear,
}

impl AllocationStrategy {
    /// Whether allocations can be freed one by one.
    pub fn supports_free(&self) -> bool {
        !matches!(self, AllocationStrategy::Linear)
    }

    /// Whether compaction plans can be computed for the block.
    pub fn supports_defragmentation(&self) -> bool {
        matches!(
            self,
            AllocationStrategy::FirstFit | AllocationStrategy::BestFit
        )
    }
}

/// One free range of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeNode {
    pub offset: u64,
    pub size: u64,
    /// Set for buddy nodes only.
    pub order: Option<u32>,
}

impl FreeNode {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Where a strategy decided to put an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub offset: u64,
    pub aligned_size: u64,
}

/// Free-space bookkeeping of a block, one variant per strategy.
#[derive(Debug)]
pub(crate) enum FreeSpace {
    FirstFit(FreeList),
    BestFit(FreeList),
    Buddy(BuddyFreeLists),
    Linear(LinearCursor),
}

impl FreeSpace {
    pub fn new(strategy: AllocationStrategy, total_size: u64, buddy_granularity: u64) -> Self {
        match strategy {
            AllocationStrategy::FirstFit => FreeSpace::FirstFit(FreeList::new(total_size)),
            AllocationStrategy::BestFit => FreeSpace::BestFit(FreeList::new(total_size)),
            AllocationStrategy::Buddy => {
                FreeSpace::Buddy(BuddyFreeLists::new(total_size, buddy_granularity))
            }
            AllocationStrategy::Linear => FreeSpace::Linear(LinearCursor::new(total_size)),
        }
    }

    /// Cheap check run under the read lock before committing to the write lock.
    pub fn may_fit(&self, size: u64, alignment: u64) -> bool {
        match self {
            FreeSpace::FirstFit(list) | FreeSpace::BestFit(list) => list.largest() >= size,
            FreeSpace::Buddy(lists) => lists.may_fit(size, alignment),
            FreeSpace::Linear(cursor) => cursor.may_fit(size, alignment),
        }
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<Placement> {
        match self {
            FreeSpace::FirstFit(list) => {
                let aligned_size = crate::util::align_up(size, alignment);
                let (node, placement) = first_fit(list, aligned_size, alignment)?;
                list.carve(node, placement);
                Some(placement)
            }
            FreeSpace::BestFit(list) => {
                let aligned_size = crate::util::align_up(size, alignment);
                let (node, placement) = best_fit(list, aligned_size, alignment)?;
                list.carve(node, placement);
                Some(placement)
            }
            FreeSpace::Buddy(lists) => lists.allocate(size, alignment),
            FreeSpace::Linear(cursor) => cursor.allocate(size, alignment),
        }
    }

    pub fn free(&mut self, offset: u64, aligned_size: u64) {
        match self {
            FreeSpace::FirstFit(list) | FreeSpace::BestFit(list) => {
                list.insert_coalesced(offset, aligned_size)
            }
            FreeSpace::Buddy(lists) => lists.free(offset, aligned_size),
            FreeSpace::Linear(_) => unreachable!("linear blocks are only reclaimed by reset"),
        }
    }

    pub fn nodes(&self, total_size: u64) -> Vec<FreeNode> {
        match self {
            FreeSpace::FirstFit(list) | FreeSpace::BestFit(list) => list.nodes(),
            FreeSpace::Buddy(lists) => lists.nodes(),
            FreeSpace::Linear(cursor) => {
                let head = cursor.head();
                if head < total_size {
                    vec![FreeNode {
                        offset: head,
                        size: total_size - head,
                        order: None,
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    pub fn node_count(&self, total_size: u64) -> usize {
        match self {
            FreeSpace::FirstFit(list) | FreeSpace::BestFit(list) => list.len(),
            FreeSpace::Buddy(lists) => lists.len(),
            FreeSpace::Linear(cursor) => usize::from(cursor.head() < total_size),
        }
    }

    pub fn largest(&self, total_size: u64) -> u64 {
        match self {
            FreeSpace::FirstFit(list) | FreeSpace::BestFit(list) => list.largest(),
            FreeSpace::Buddy(lists) => lists.largest(),
            FreeSpace::Linear(cursor) => total_size - cursor.head().min(total_size),
        }
    }

    pub fn total(&self, total_size: u64) -> u64 {
        match self {
            FreeSpace::FirstFit(list) | FreeSpace::BestFit(list) => list.total(),
            FreeSpace::Buddy(lists) => lists.total(),
            FreeSpace::Linear(cursor) => total_size - cursor.head().min(total_size),
        }
    }
}
