use super::{Block, BlockDesc, BlockId, BlockIdSource, BudgetTracker, MemoryError};
use crate::backend::{DeviceBackend, MemoryHeap, MemoryType};
use std::sync::Arc;
use std::time::Duration;

/// State shared by every pool, frame ring and dedicated table of one
/// allocator: the backend, the device layout, block ids and heap usage.
pub struct MemoryContext {
    backend: Arc<dyn DeviceBackend>,
    memory_types: Vec<MemoryType>,
    memory_heaps: Vec<MemoryHeap>,
    ids: BlockIdSource,
    budget: BudgetTracker,
}

impl MemoryContext {
    pub fn new(backend: Arc<dyn DeviceBackend>, budget_refresh_interval: Duration) -> Self {
        Self {
            memory_types: backend.memory_types(),
            memory_heaps: backend.memory_heaps(),
            ids: BlockIdSource::default(),
            budget: BudgetTracker::new(backend.clone(), budget_refresh_interval),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    pub fn memory_heaps(&self) -> &[MemoryHeap] {
        &self.memory_heaps
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn heap_index_of(&self, memory_type_index: u32) -> u32 {
        self.memory_types[memory_type_index as usize].heap_index
    }

    pub fn next_block_id(&self) -> BlockId {
        self.ids.next()
    }

    /// Creates a block and charges its memory to the owning heap.
    pub fn create_block(&self, desc: &BlockDesc) -> Result<Block, MemoryError> {
        let block = Block::new(self.next_block_id(), desc, self.backend.clone())?;
        self.budget
            .record_reserve(self.heap_index_of(desc.memory_type_index), block.size());
        Ok(block)
    }

    pub fn destroy_block(&self, block: Block) {
        self.budget
            .record_release(self.heap_index_of(block.memory_type_index()), block.size());
        drop(block);
    }
}
