use super::block::SubAllocation;
use super::{
    Allocation, AllocationStrategy, Block, BlockDesc, BlockId, BlockStatistics, DefragMove,
    MemoryContext, MemoryError, MemoryUsage, ReleasedMemory, DEFAULT_BUDDY_GRANULARITY,
};
use ash::vk;
use parking_lot::RwLock;
use std::panic::Location;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PoolDesc {
    pub memory_type_index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
    /// Size of new blocks unless a single request needs more.
    pub block_size: u64,
    pub strategy: AllocationStrategy,
    pub buddy_granularity: u64,
}

impl Default for PoolDesc {
    fn default() -> Self {
        Self {
            memory_type_index: 0,
            property_flags: vk::MemoryPropertyFlags::empty(),
            block_size: 64 * 1024 * 1024,
            strategy: AllocationStrategy::default(),
            buddy_granularity: DEFAULT_BUDDY_GRANULARITY,
        }
    }
}

impl PoolDesc {
    /// Bytes a new block reserves when it has to fit `size` at `alignment`.
    pub fn block_size_for(&self, size: u64, alignment: u64) -> u64 {
        let block_size = self.block_size.max(size.max(alignment).next_power_of_two());
        match self.strategy {
            AllocationStrategy::Buddy => block_size
                .max(self.buddy_granularity)
                .next_power_of_two(),
            _ => block_size,
        }
    }
}

/// Compaction plan of one block.
#[derive(Debug, Clone)]
pub struct BlockDefragPlan {
    pub block_id: BlockId,
    pub moves: Vec<DefragMove>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolStatistics {
    pub memory_type_index: u32,
    pub strategy: AllocationStrategy,
    pub block_count: usize,
    pub reserved_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub allocation_count: usize,
    pub blocks: Vec<BlockStatistics>,
}

/// Blocks of one memory type, grown on demand.
pub struct Pool {
    desc: PoolDesc,
    context: Arc<MemoryContext>,
    blocks: RwLock<Vec<Block>>,
}

impl Drop for Pool {
    fn drop(&mut self) {
        for block in self.blocks.get_mut().drain(..) {
            self.context.destroy_block(block);
        }
    }
}

impl Pool {
    pub fn new(desc: PoolDesc, context: Arc<MemoryContext>) -> Self {
        assert!(
            desc.strategy.supports_free(),
            "pools need a strategy with individual frees, got {:?}",
            desc.strategy
        );
        Self {
            desc,
            context,
            blocks: RwLock::new(Vec::new()),
        }
    }

    pub fn desc(&self) -> &PoolDesc {
        &self.desc
    }

    pub fn memory_type_index(&self) -> u32 {
        self.desc.memory_type_index
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    #[track_caller]
    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
        debug_name: &str,
    ) -> Result<Allocation, MemoryError> {
        self.allocate_with(
            &SubAllocation {
                size,
                alignment,
                usage: MemoryUsage::Unknown,
                debug_name,
                location: Location::caller(),
            },
            true,
        )
    }

    /// Tries every block, then grows the pool when `can_grow` is set.
    pub(crate) fn allocate_with(
        &self,
        request: &SubAllocation<'_>,
        can_grow: bool,
    ) -> Result<Allocation, MemoryError> {
        if let Some(allocation) = Self::try_blocks(&self.blocks.read(), request) {
            return Ok(allocation);
        }
        if !can_grow {
            return Err(self.exhausted(request.size));
        }

        let mut blocks = self.blocks.write();
        // someone may have grown the pool while we waited for the lock
        if let Some(allocation) = Self::try_blocks(&blocks, request) {
            return Ok(allocation);
        }

        let block = self.context.create_block(&BlockDesc {
            size: self.desc.block_size_for(request.size, request.alignment),
            memory_type_index: self.desc.memory_type_index,
            property_flags: self.desc.property_flags,
            strategy: self.desc.strategy,
            buddy_granularity: self.desc.buddy_granularity,
        })?;
        log::info!(
            "Pool of memory type {} grew to {} blocks with block {} ({} bytes)",
            self.desc.memory_type_index,
            blocks.len() + 1,
            block.id(),
            block.size()
        );

        let allocation = block.allocate_with(request);
        blocks.push(block);
        allocation.ok_or_else(|| self.exhausted(request.size))
    }

    fn try_blocks(blocks: &[Block], request: &SubAllocation<'_>) -> Option<Allocation> {
        blocks.iter().find_map(|block| block.allocate_with(request))
    }

    fn exhausted(&self, size: u64) -> MemoryError {
        MemoryError::Exhausted {
            size,
            memory_type_index: self.desc.memory_type_index,
        }
    }

    /// Panics when the allocation's block is not part of this pool.
    pub fn free(&self, allocation: &Allocation) {
        let blocks = self.blocks.read();
        match blocks.iter().find(|b| b.id() == allocation.block_id()) {
            Some(block) => block.free(allocation),
            None => panic!(
                "allocation '{}' names block {} which is not part of the pool for memory type {}",
                allocation.debug_name(),
                allocation.block_id(),
                self.desc.memory_type_index
            ),
        }
    }

    /// Destroys empty blocks, always keeping the first one.
    pub fn defragment(&self) -> ReleasedMemory {
        let mut blocks = self.blocks.write();
        let mut released = ReleasedMemory::default();

        for (index, block) in std::mem::take(&mut *blocks).into_iter().enumerate() {
            if index > 0 && block.is_empty() {
                released.count += 1;
                released.bytes += block.size();
                self.context.destroy_block(block);
            } else {
                blocks.push(block);
            }
        }

        if released.count > 0 {
            log::info!(
                "Pool of memory type {} released {} empty blocks ({} bytes)",
                self.desc.memory_type_index,
                released.count,
                released.bytes
            );
        }
        released
    }

    /// Compaction plans of the blocks that are fragmented enough to need one.
    pub fn plan_defragmentation(&self) -> Vec<BlockDefragPlan> {
        self.blocks
            .read()
            .iter()
            .filter(|block| block.needs_defragmentation())
            .map(|block| BlockDefragPlan {
                block_id: block.id(),
                moves: block.plan_defragmentation(),
            })
            .filter(|plan| !plan.moves.is_empty())
            .collect()
    }

    /// Runs `Block::validate` on every block.
    pub fn validate(&self) {
        for block in self.blocks.read().iter() {
            block.validate();
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        let blocks = self
            .blocks
            .read()
            .iter()
            .map(Block::statistics)
            .collect::<Vec<_>>();
        PoolStatistics {
            memory_type_index: self.desc.memory_type_index,
            strategy: self.desc.strategy,
            block_count: blocks.len(),
            reserved_bytes: blocks.iter().map(|b| b.size).sum(),
            allocated_bytes: blocks.iter().map(|b| b.allocated_bytes).sum(),
            free_bytes: blocks.iter().map(|b| b.free_bytes).sum(),
            allocation_count: blocks.iter().map(|b| b.allocation_count).sum(),
            blocks,
        }
    }
}
