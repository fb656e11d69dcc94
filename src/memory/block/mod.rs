use super::allocation::{AllocationInfo, MappedPtr};
use super::{Allocation, AllocationKind, MemoryCounters, MemoryError, MemoryUsage};
use crate::backend::{DeviceBackend, DeviceMemory};
use crate::util::{align_up, normalize_alignment};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

mod strategies;
pub use strategies::*;

/// Fragmentation ratio (`1 - largest_free / total_free`) above which a block
/// is worth compacting.
pub const DEFRAGMENTATION_THRESHOLD: f64 = 0.5;
/// Blocks with this many free nodes or fewer are never flagged.
pub const DEFRAGMENTATION_MIN_FREE_NODES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out unique block ids for one allocator.
#[derive(Debug)]
pub struct BlockIdSource(AtomicU64);

impl Default for BlockIdSource {
    fn default() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl BlockIdSource {
    pub fn next(&self) -> BlockId {
        BlockId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct BlockDesc {
    pub size: u64,
    pub memory_type_index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
    pub strategy: AllocationStrategy,
    /// Smallest buddy node; only read by the buddy strategy.
    pub buddy_granularity: u64,
}

impl Default for BlockDesc {
    fn default() -> Self {
        Self {
            size: 64 * 1024 * 1024,
            memory_type_index: 0,
            property_flags: vk::MemoryPropertyFlags::empty(),
            strategy: AllocationStrategy::default(),
            buddy_granularity: DEFAULT_BUDDY_GRANULARITY,
        }
    }
}

/// One request travelling down from the allocator to a block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubAllocation<'a> {
    pub size: u64,
    pub alignment: u64,
    pub usage: MemoryUsage,
    pub debug_name: &'a str,
    pub location: &'static Location<'static>,
}

/// A planned relocation; executing it (copying the bytes on the device and
/// rebinding resources) is the caller's job.
#[derive(Debug, Clone)]
pub struct DefragMove {
    pub allocation: Allocation,
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Allocations and bytes handed back in one go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleasedMemory {
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockStatistics {
    pub id: BlockId,
    pub strategy: AllocationStrategy,
    pub size: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub allocation_count: usize,
    pub free_node_count: usize,
    pub largest_free_node: u64,
    pub needs_defragmentation: bool,
}

struct BlockState {
    free: FreeSpace,
    // keyed by offset, linear blocks keep theirs in `linear_live`
    live: BTreeMap<u64, Allocation>,
}

/// A contiguous reservation of device memory carved up by one strategy.
pub struct Block {
    id: BlockId,
    size: u64,
    memory_type_index: u32,
    property_flags: vk::MemoryPropertyFlags,
    strategy: AllocationStrategy,
    memory: DeviceMemory,
    mapped: Option<MappedPtr>,
    base_address: Option<u64>,
    backend: Arc<dyn DeviceBackend>,
    state: RwLock<BlockState>,
    linear_live: Mutex<Vec<Allocation>>,
    counters: MemoryCounters,
}

impl Drop for Block {
    fn drop(&mut self) {
        let mut leaked = self.state.get_mut().live.values().cloned().collect::<Vec<_>>();
        leaked.append(self.linear_live.get_mut());
        if !leaked.is_empty() {
            log::warn!(
                "Destroying block {} with {} live allocations",
                self.id,
                leaked.len()
            );
            for allocation in leaked {
                log::warn!(
                    "  leaked '{}' at offset {} ({} bytes), allocated at {}",
                    allocation.debug_name(),
                    allocation.offset(),
                    allocation.size(),
                    allocation.allocation_site()
                );
                allocation.mark_freed();
            }
        }

        if self.mapped.is_some() {
            self.backend.unmap(self.memory);
        }
        self.backend.release(self.memory);
        log::debug!("Destroyed block {} ({} bytes)", self.id, self.size);
    }
}

impl Debug for Block {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block {{ id: {}, strategy: {:?}, size: {}, allocations: {}, free_nodes: {} }}",
            self.id,
            self.strategy,
            self.size,
            self.allocation_count(),
            self.free_node_count()
        )
    }
}

impl Block {
    /// Reserves (and, for host-visible types, maps) the backing memory.
    ///
    /// Buddy blocks are rounded up to a power of two of at least one granule.
    pub fn new(
        id: BlockId,
        desc: &BlockDesc,
        backend: Arc<dyn DeviceBackend>,
    ) -> Result<Self, MemoryError> {
        let size = match desc.strategy {
            AllocationStrategy::Buddy => desc
                .size
                .max(desc.buddy_granularity)
                .next_power_of_two(),
            _ => desc.size,
        };
        if size == 0 {
            return Err(MemoryError::InvalidRequest(
                "block size must be non-zero".into(),
            ));
        }

        let memory = backend.reserve(size, desc.memory_type_index)?;
        let mapped = if desc
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            match backend.map(memory) {
                Ok(ptr) => Some(MappedPtr::new(ptr)),
                Err(e) => {
                    backend.release(memory);
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        let base_address = backend.device_address(memory);

        log::debug!(
            "Created {:?} block {} of {} bytes in memory type {}",
            desc.strategy,
            id,
            size,
            desc.memory_type_index
        );

        Ok(Self {
            id,
            size,
            memory_type_index: desc.memory_type_index,
            property_flags: desc.property_flags,
            strategy: desc.strategy,
            memory,
            mapped,
            base_address,
            backend,
            state: RwLock::new(BlockState {
                free: FreeSpace::new(desc.strategy, size, desc.buddy_granularity),
                live: BTreeMap::new(),
            }),
            linear_live: Mutex::new(Vec::new()),
            counters: MemoryCounters::new(),
        })
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.property_flags
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn memory(&self) -> DeviceMemory {
        self.memory
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Carves `size` bytes aligned to `alignment`; `None` when nothing fits.
    #[track_caller]
    pub fn allocate(&self, size: u64, alignment: u64, debug_name: &str) -> Option<Allocation> {
        self.allocate_with(&SubAllocation {
            size,
            alignment,
            usage: MemoryUsage::Unknown,
            debug_name,
            location: Location::caller(),
        })
    }

    pub(crate) fn allocate_with(&self, request: &SubAllocation<'_>) -> Option<Allocation> {
        assert!(
            request.size > 0,
            "zero-sized allocation '{}' in block {}",
            request.debug_name,
            self.id
        );
        let alignment = normalize_alignment(request.alignment);
        if request.size > self.size {
            return None;
        }

        let allocation = if let AllocationStrategy::Linear = self.strategy {
            // bumps run concurrently under the read lock, reset takes the write lock
            let state = self.state.read();
            let FreeSpace::Linear(cursor) = &state.free else {
                unreachable!("linear block without a cursor");
            };
            let placement = cursor.allocate(request.size, alignment)?;
            let allocation = self.make_allocation(placement, alignment, request);
            self.linear_live.lock().push(allocation.clone());
            allocation
        } else {
            if !self.state.read().free.may_fit(request.size, alignment) {
                return None;
            }
            let mut state = self.state.write();
            let placement = state.free.allocate(request.size, alignment)?;
            let allocation = self.make_allocation(placement, alignment, request);
            state.live.insert(placement.offset, allocation.clone());
            allocation
        };

        self.counters.record_allocation(allocation.aligned_size());
        Some(allocation)
    }

    fn make_allocation(
        &self,
        placement: Placement,
        alignment: u64,
        request: &SubAllocation<'_>,
    ) -> Allocation {
        let kind = match self.strategy {
            AllocationStrategy::Linear => AllocationKind::Linear,
            _ => AllocationKind::Pooled,
        };
        Allocation::new(AllocationInfo {
            offset: placement.offset,
            size: request.size,
            aligned_size: placement.aligned_size,
            alignment,
            block_id: self.id,
            kind,
            strategy: Some(self.strategy),
            usage: request.usage,
            memory_type_index: self.memory_type_index,
            property_flags: self.property_flags,
            memory: self.memory,
            memory_size: self.size,
            mapped_base: self.mapped,
            base_address: self.base_address,
            backend: &self.backend,
            debug_name: request.debug_name,
            location: request.location,
        })
    }

    /// Returns an allocation's range to the free space.
    ///
    /// Panics when the allocation belongs to another block, was already freed
    /// or lives in a linear block.
    pub fn free(&self, allocation: &Allocation) {
        if allocation.block_id() != self.id {
            panic!(
                "allocation '{}' of block {} freed through block {}",
                allocation.debug_name(),
                allocation.block_id(),
                self.id
            );
        }
        if !self.strategy.supports_free() {
            panic!(
                "allocation '{}' in linear block {} cannot be freed on its own, reset the block instead",
                allocation.debug_name(),
                self.id
            );
        }

        let mut state = self.state.write();
        if allocation.is_freed() {
            panic!(
                "double free of allocation '{}' in block {} at offset {}",
                allocation.debug_name(),
                self.id,
                allocation.offset()
            );
        }
        // a handle from another allocator can carry the same block id
        match state.live.get(&allocation.offset()) {
            Some(record) if record.ptr_eq(allocation) => {}
            _ => panic!(
                "allocation '{}' at offset {} is not live in block {}",
                allocation.debug_name(),
                allocation.offset(),
                self.id
            ),
        }
        state.live.remove(&allocation.offset());
        allocation.mark_freed();
        state
            .free
            .free(allocation.offset(), allocation.aligned_size());
        drop(state);

        self.counters.record_free(allocation.aligned_size());
    }

    /// Rewinds a linear block, marking every outstanding allocation freed.
    pub fn reset(&self) -> ReleasedMemory {
        assert_eq!(
            self.strategy,
            AllocationStrategy::Linear,
            "reset called on block {}",
            self.id
        );

        let state = self.state.write();
        let released = std::mem::take(&mut *self.linear_live.lock());
        for allocation in &released {
            allocation.mark_freed();
        }
        if let FreeSpace::Linear(cursor) = &state.free {
            cursor.reset();
        }
        drop(state);

        let bytes = released.iter().map(Allocation::aligned_size).sum();
        let count = released.len() as u64;
        self.counters.record_bulk_free(count, bytes);
        ReleasedMemory { count, bytes }
    }

    /// Free ranges ordered by offset.
    pub fn free_nodes(&self) -> Vec<FreeNode> {
        self.state.read().free.nodes(self.size)
    }

    pub fn free_node_count(&self) -> usize {
        self.state.read().free.node_count(self.size)
    }

    pub fn largest_free_node(&self) -> u64 {
        self.state.read().free.largest(self.size)
    }

    pub fn free_bytes(&self) -> u64 {
        self.state.read().free.total(self.size)
    }

    /// Bytes not available for new allocations. For linear blocks this
    /// includes alignment padding below the head.
    pub fn allocated_bytes(&self) -> u64 {
        match &self.state.read().free {
            FreeSpace::Linear(cursor) => cursor.head(),
            _ => self.counters.allocated_bytes(),
        }
    }

    pub fn allocation_count(&self) -> usize {
        match self.strategy {
            AllocationStrategy::Linear => self.linear_live.lock().len(),
            _ => self.state.read().live.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allocation_count() == 0
    }

    /// Live allocations ordered by offset.
    pub fn live_allocations(&self) -> Vec<Allocation> {
        match self.strategy {
            AllocationStrategy::Linear => {
                let mut live = self.linear_live.lock().clone();
                live.sort_by_key(Allocation::offset);
                live
            }
            _ => self.state.read().live.values().cloned().collect(),
        }
    }

    /// Free space exists but is scattered over many small nodes.
    pub fn needs_defragmentation(&self) -> bool {
        if self.strategy == AllocationStrategy::Linear {
            return false;
        }
        let state = self.state.read();
        let total = state.free.total(self.size);
        let count = state.free.node_count(self.size);
        if total == 0 || count <= DEFRAGMENTATION_MIN_FREE_NODES {
            return false;
        }
        let largest = state.free.largest(self.size);
        1.0 - largest as f64 / total as f64 > DEFRAGMENTATION_THRESHOLD
    }

    /// Moves that would pack every live allocation towards offset zero,
    /// keeping their order. Empty for buddy and linear blocks.
    pub fn plan_defragmentation(&self) -> Vec<DefragMove> {
        if !self.strategy.supports_defragmentation() {
            return Vec::new();
        }
        let state = self.state.read();
        let mut cursor = 0;
        let mut moves = Vec::new();
        for (&offset, allocation) in state.live.iter() {
            let target = align_up(cursor, allocation.alignment());
            if target != offset {
                moves.push(DefragMove {
                    allocation: allocation.clone(),
                    src_offset: offset,
                    dst_offset: target,
                    size: allocation.aligned_size(),
                });
            }
            cursor = target + allocation.aligned_size();
        }
        moves
    }

    /// Checks that free nodes and live allocations tile `[0, size)` exactly.
    ///
    /// Linear blocks only check that allocations are disjoint and below the
    /// head. Panics on any violation.
    pub fn validate(&self) {
        let state = self.state.read();

        if let FreeSpace::Linear(cursor) = &state.free {
            let head = cursor.head();
            let mut live = self.linear_live.lock().clone();
            live.sort_by_key(Allocation::offset);
            let mut end = 0;
            for allocation in live {
                if allocation.offset() < end {
                    panic!(
                        "allocation '{}' at offset {} overlaps the previous one ending at {} in block {}",
                        allocation.debug_name(),
                        allocation.offset(),
                        end,
                        self.id
                    );
                }
                end = allocation.offset() + allocation.aligned_size();
            }
            assert!(end <= head, "linear block {} has allocations past its head", self.id);
            return;
        }

        let mut ranges = state
            .free
            .nodes(self.size)
            .into_iter()
            .map(|node| (node.offset, node.size, "<free>"))
            .chain(
                state
                    .live
                    .values()
                    .map(|a| (a.offset(), a.aligned_size(), a.debug_name())),
            )
            .collect::<Vec<_>>();
        ranges.sort_by_key(|&(offset, _, _)| offset);

        let mut cursor = 0;
        for (offset, size, name) in ranges {
            if offset < cursor {
                panic!(
                    "range '{}' at offset {} overlaps the previous range ending at {} in block {}",
                    name, offset, cursor, self.id
                );
            }
            if offset > cursor {
                panic!(
                    "bytes {}..{} of block {} are neither free nor allocated",
                    cursor, offset, self.id
                );
            }
            cursor = offset + size;
        }
        assert_eq!(
            cursor, self.size,
            "block {} ranges end at {} instead of {}",
            self.id, cursor, self.size
        );
    }

    pub fn statistics(&self) -> BlockStatistics {
        BlockStatistics {
            id: self.id,
            strategy: self.strategy,
            size: self.size,
            allocated_bytes: self.allocated_bytes(),
            free_bytes: self.free_bytes(),
            allocation_count: self.allocation_count(),
            free_node_count: self.free_node_count(),
            largest_free_node: self.largest_free_node(),
            needs_defragmentation: self.needs_defragmentation(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockBackendDesc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn test_block(strategy: AllocationStrategy, size: u64) -> Block {
        let backend: Arc<dyn DeviceBackend> =
            Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let desc = BlockDesc {
            size,
            strategy,
            ..Default::default()
        };
        Block::new(BlockId::new(1), &desc, backend).unwrap()
    }

    fn assert_conserved(block: &Block) {
        assert_eq!(block.allocated_bytes() + block.free_bytes(), block.size());
    }

    fn node(offset: u64, size: u64) -> FreeNode {
        FreeNode {
            offset,
            size,
            order: None,
        }
    }

    #[test]
    fn test_first_fit_scenario() {
        let block = test_block(AllocationStrategy::FirstFit, 1024);
        let a = block.allocate(300, 1, "a").unwrap();
        let b = block.allocate(300, 1, "b").unwrap();
        let c = block.allocate(300, 1, "c").unwrap();
        assert_eq!((a.offset(), b.offset(), c.offset()), (0, 300, 600));
        assert_eq!(block.free_bytes(), 124);

        // The hole left by `b` is isolated from the tail at 900.
        block.free(&b);
        assert_eq!(block.free_nodes(), vec![node(300, 300), node(900, 124)]);
        assert_conserved(&block);

        // Freeing `c` bridges the hole and the tail.
        block.free(&c);
        assert_eq!(block.free_nodes(), vec![node(300, 724)]);
        block.validate();
    }

    #[test]
    fn test_coalescing_adjacent_frees_yields_one_node() {
        let block = test_block(AllocationStrategy::BestFit, 1000);
        let a = block.allocate(100, 1, "a").unwrap();
        let b = block.allocate(100, 1, "b").unwrap();
        let c = block.allocate(100, 1, "c").unwrap();
        let _d = block.allocate(700, 1, "d").unwrap();
        assert_eq!(block.free_node_count(), 0);

        block.free(&a);
        block.free(&c);
        assert_eq!(block.free_node_count(), 2);
        block.free(&b);
        assert_eq!(block.free_nodes(), vec![node(0, 300)]);
    }

    #[test]
    fn test_buddy_scenario() {
        let block = test_block(AllocationStrategy::Buddy, 1024);
        let a = block.allocate(100, 1, "a").unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.aligned_size(), 256);
        assert_eq!(
            block.free_nodes(),
            vec![
                FreeNode { offset: 256, size: 256, order: Some(0) },
                FreeNode { offset: 512, size: 512, order: Some(1) },
            ]
        );
        assert_conserved(&block);

        block.free(&a);
        assert_eq!(
            block.free_nodes(),
            vec![FreeNode { offset: 0, size: 1024, order: Some(2) }]
        );
    }

    #[test]
    fn test_buddy_merges_only_up_to_occupied_subtree() {
        let block = test_block(AllocationStrategy::Buddy, 1024);
        let a = block.allocate(256, 1, "a").unwrap();
        let b = block.allocate(256, 1, "b").unwrap();
        let c = block.allocate(256, 1, "c").unwrap();
        assert_eq!((a.offset(), b.offset(), c.offset()), (0, 256, 512));

        block.free(&a);
        block.free(&b);
        // `c` still lives in the upper half, so the merge stops at order 1.
        assert_eq!(
            block.free_nodes(),
            vec![
                FreeNode { offset: 0, size: 512, order: Some(1) },
                FreeNode { offset: 768, size: 256, order: Some(0) },
            ]
        );

        block.free(&c);
        assert_eq!(
            block.free_nodes(),
            vec![FreeNode { offset: 0, size: 1024, order: Some(2) }]
        );
    }

    #[test]
    fn test_buddy_block_size_is_rounded_up() {
        let block = test_block(AllocationStrategy::Buddy, 1000);
        assert_eq!(block.size(), 1024);
        block.validate();
    }

    #[test]
    fn test_linear_scenario() {
        let block = test_block(AllocationStrategy::Linear, 4096);
        let a = block.allocate(1000, 1, "a").unwrap();
        let b = block.allocate(1000, 1, "b").unwrap();
        let c = block.allocate(1000, 1, "c").unwrap();
        assert_eq!((a.offset(), b.offset(), c.offset()), (0, 1000, 2000));
        assert!(block.allocate(1100, 1, "d").is_none());
        assert_eq!(block.allocation_count(), 3);
        block.validate();

        let released = block.reset();
        assert_eq!(released, ReleasedMemory { count: 3, bytes: 3000 });
        assert!(a.is_freed() && b.is_freed() && c.is_freed());

        let e = block.allocate(1000, 1, "e").unwrap();
        assert_eq!(e.offset(), 0);
        assert_eq!(e.kind(), AllocationKind::Linear);
    }

    #[test]
    #[should_panic(expected = "cannot be freed on its own")]
    fn test_linear_individual_free_panics() {
        let block = test_block(AllocationStrategy::Linear, 4096);
        let a = block.allocate(10, 1, "a").unwrap();
        block.free(&a);
    }

    #[test]
    #[should_panic(expected = "reset called on block")]
    fn test_reset_on_pooled_block_panics() {
        let block = test_block(AllocationStrategy::FirstFit, 4096);
        block.reset();
    }

    #[test]
    fn test_best_fit_scenario() {
        let block = test_block(AllocationStrategy::BestFit, 1100);
        let x1 = block.allocate(500, 1, "x1").unwrap();
        let _x2 = block.allocate(100, 1, "x2").unwrap();
        let x3 = block.allocate(50, 1, "x3").unwrap();
        let _x4 = block.allocate(450, 1, "x4").unwrap();
        block.free(&x1);
        block.free(&x3);
        assert_eq!(block.free_nodes(), vec![node(0, 500), node(600, 50)]);

        let small = block.allocate(40, 1, "small").unwrap();
        assert_eq!(small.offset(), 600);
        assert_eq!(block.free_nodes(), vec![node(0, 500), node(640, 10)]);
    }

    #[test]
    fn test_alignment_padding_becomes_free_node() {
        let block = test_block(AllocationStrategy::FirstFit, 4096);
        let a = block.allocate(10, 1, "a").unwrap();
        let b = block.allocate(100, 256, "b").unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 256);
        assert_eq!(b.aligned_size(), 256);
        assert_eq!(block.free_nodes(), vec![node(10, 246), node(512, 3584)]);
        block.validate();
        assert_conserved(&block);
    }

    #[test]
    #[should_panic(expected = "double free of allocation 'twice'")]
    fn test_double_free_panics() {
        let block = test_block(AllocationStrategy::BestFit, 1024);
        let a = block.allocate(64, 1, "twice").unwrap();
        block.free(&a);
        block.free(&a);
    }

    #[test]
    #[should_panic(expected = "freed through block")]
    fn test_foreign_free_panics() {
        let backend: Arc<dyn DeviceBackend> =
            Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let desc = BlockDesc {
            size: 1024,
            ..Default::default()
        };
        let first = Block::new(BlockId::new(1), &desc, backend.clone()).unwrap();
        let second = Block::new(BlockId::new(2), &desc, backend).unwrap();
        let a = first.allocate(64, 1, "foreign").unwrap();
        second.free(&a);
    }

    #[test]
    fn test_colliding_block_id_leaves_allocation_live() {
        // Two allocators hand out the same ids.
        let ours = test_block(AllocationStrategy::BestFit, 1024);
        let theirs = test_block(AllocationStrategy::BestFit, 1024);
        let a = theirs.allocate(64, 1, "theirs").unwrap();
        assert_eq!(a.block_id(), ours.id());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| ours.free(&a)));
        assert!(result.is_err());
        assert!(!a.is_freed());
        assert_eq!(theirs.allocation_count(), 1);

        theirs.free(&a);
        assert!(a.is_freed());
        assert!(theirs.is_empty());
    }

    #[test]
    fn test_exhaustion_is_a_value() {
        let block = test_block(AllocationStrategy::FirstFit, 1024);
        assert!(block.allocate(2048, 1, "too big").is_none());
        let _a = block.allocate(1024, 1, "all").unwrap();
        assert!(block.allocate(1, 1, "one more").is_none());
    }

    #[test]
    fn test_defragmentation_plan() {
        let block = test_block(AllocationStrategy::FirstFit, 1024);
        let allocations = (0..10)
            .map(|i| block.allocate(100, 1, &format!("a{}", i)).unwrap())
            .collect::<Vec<_>>();
        assert!(!block.needs_defragmentation());

        for allocation in allocations.iter().skip(1).step_by(2) {
            block.free(allocation);
        }
        // Five free nodes, largest 124 of 524 free bytes.
        assert_eq!(block.free_node_count(), 5);
        assert!(block.needs_defragmentation());

        let plan = block.plan_defragmentation();
        let moves = plan
            .iter()
            .map(|m| (m.src_offset, m.dst_offset))
            .collect::<Vec<_>>();
        assert_eq!(moves, vec![(200, 100), (400, 200), (600, 300), (800, 400)]);
        assert_eq!(plan[0].allocation.debug_name(), "a2");
    }

    #[test]
    fn test_defragmentation_plan_respects_alignment() {
        let block = test_block(AllocationStrategy::FirstFit, 4096);
        let a = block.allocate(10, 1, "a").unwrap();
        let _b = block.allocate(100, 1, "b").unwrap();
        let _c = block.allocate(64, 64, "c").unwrap();
        block.free(&a);

        let moves = block
            .plan_defragmentation()
            .iter()
            .map(|m| (m.src_offset, m.dst_offset))
            .collect::<Vec<_>>();
        // `b` slides to 0, `c` already sits on the first 64-byte boundary after it.
        assert_eq!(moves, vec![(10, 0)]);
    }

    #[test]
    fn test_buddy_and_linear_have_no_plan() {
        let buddy = test_block(AllocationStrategy::Buddy, 4096);
        let a = buddy.allocate(10, 1, "a").unwrap();
        let _b = buddy.allocate(10, 1, "b").unwrap();
        buddy.free(&a);
        assert!(buddy.plan_defragmentation().is_empty());

        let linear = test_block(AllocationStrategy::Linear, 4096);
        let _c = linear.allocate(10, 1, "c").unwrap();
        assert!(linear.plan_defragmentation().is_empty());
        assert!(!linear.needs_defragmentation());
    }

    #[test]
    fn test_random_alloc_free_keeps_invariants() {
        let alignments = [1u64, 4, 16, 256];
        for strategy in [
            AllocationStrategy::FirstFit,
            AllocationStrategy::BestFit,
            AllocationStrategy::Buddy,
        ] {
            let block = test_block(strategy, 1 << 20);
            let mut rng = StdRng::seed_from_u64(0x5eed);
            let mut live: Vec<Allocation> = Vec::new();

            for _ in 0..2000 {
                if live.is_empty() || rng.random_bool(0.6) {
                    let size = rng.random_range(1..=8192u64);
                    let alignment = alignments[rng.random_range(0..alignments.len())];
                    if let Some(a) = block.allocate(size, alignment, "random") {
                        assert_eq!(a.offset() % alignment, 0);
                        assert!(a.size() <= a.aligned_size());
                        live.push(a);
                    }
                } else {
                    let index = rng.random_range(0..live.len());
                    block.free(&live.swap_remove(index));
                }
                block.validate();
                assert_conserved(&block);
            }

            for a in live.drain(..) {
                block.free(&a);
            }
            assert_eq!(block.free_node_count(), 1);
            assert_eq!(block.largest_free_node(), block.size());
            assert!(block.is_empty());
        }
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let block = test_block(AllocationStrategy::BestFit, 1 << 20);
        std::thread::scope(|s| {
            for t in 0..4 {
                let block = &block;
                s.spawn(move || {
                    let mut mine = (0..64)
                        .map(|i| block.allocate(256 + i, 16, &format!("t{}", t)).unwrap())
                        .collect::<Vec<_>>();
                    for a in mine.drain(..32) {
                        block.free(&a);
                    }
                });
            }
        });
        // Each thread kept 32 allocations live.
        assert_eq!(block.allocation_count(), 128);
        block.validate();
        assert_conserved(&block);
    }

    #[test]
    fn test_mapped_block_shares_view() {
        let backend: Arc<dyn DeviceBackend> =
            Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let desc = BlockDesc {
            size: 4096,
            memory_type_index: 1,
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            strategy: AllocationStrategy::FirstFit,
            ..Default::default()
        };
        let block = Block::new(BlockId::new(3), &desc, backend).unwrap();
        assert!(block.is_mapped());

        let a = block.allocate(16, 16, "a").unwrap();
        let b = block.allocate(16, 16, "b").unwrap();
        a.write_bytes(0, &[0xaa; 16]).unwrap();
        b.write_bytes(0, &[0xbb; 16]).unwrap();
        assert_eq!(a.read_bytes(0, 16).unwrap(), vec![0xaa; 16]);
        assert_eq!(b.read_bytes(0, 16).unwrap(), vec![0xbb; 16]);
    }

    #[test]
    fn test_device_local_block_is_not_mapped() {
        let block = test_block(AllocationStrategy::FirstFit, 4096);
        let a = block.allocate(16, 1, "gpu only").unwrap();
        assert!(!block.is_mapped());
        assert!(matches!(
            a.mapped_view(0, 4),
            Err(MemoryError::NotHostVisible { .. })
        ));
    }

    #[test]
    fn test_dropping_block_releases_memory() {
        let mock = Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let backend: Arc<dyn DeviceBackend> = mock.clone();
        let desc = BlockDesc {
            size: 4096,
            ..Default::default()
        };
        let block = Block::new(BlockId::new(1), &desc, backend).unwrap();
        let leaked = block.allocate(16, 1, "leaked").unwrap();
        assert_eq!(mock.live_reservations(), 1);

        drop(block);
        assert_eq!(mock.live_reservations(), 0);
        assert!(leaked.is_freed());
    }
}
