use super::block::SubAllocation;
use super::{
    select_memory_type, Allocation, AllocationFlags, AllocationKind, AllocationStrategy,
    AllocatorStatistics, BlockDefragPlan, DedicatedAllocations, FrameAllocator,
    FrameAllocatorDesc, HeapBudget, MemoryContext, MemoryCounters, MemoryError, MemoryTypeQuery,
    MemoryUsage, Pool, PoolDesc, ReleasedMemory, DEFAULT_BUDDY_GRANULARITY,
};
use crate::backend::{DeviceBackend, MemoryType, ResourceHandle};
use ash::vk;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Heaps up to this size get blocks of an eighth of the heap at most.
pub const SMALL_HEAP_LIMIT: u64 = 1024 * MIB;

#[derive(Debug, Clone)]
pub struct AllocatorDesc {
    /// Preferred size of pool blocks.
    pub block_size: u64,
    /// Strategy of pool blocks; `Linear` is reserved for frame rings.
    pub strategy: AllocationStrategy,
    /// Requests of at least this many bytes get a dedicated reservation.
    pub dedicated_threshold: u64,
    pub frames_in_flight: usize,
    pub frame_block_size: u64,
    /// Reject requests the heap budget has no room for.
    pub budget_aware: bool,
    pub budget_refresh_interval: Duration,
    pub buddy_min_granularity: u64,
}

impl Default for AllocatorDesc {
    fn default() -> Self {
        Self {
            block_size: 64 * MIB,
            strategy: AllocationStrategy::BestFit,
            dedicated_threshold: 32 * MIB,
            frames_in_flight: 2,
            frame_block_size: 8 * MIB,
            budget_aware: true,
            budget_refresh_interval: Duration::from_millis(500),
            buddy_min_granularity: DEFAULT_BUDDY_GRANULARITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub size: u64,
    pub alignment: u64,
    /// Memory types the resource can live in, one bit per type.
    pub memory_type_bits: u32,
    pub usage: MemoryUsage,
    /// Added to what `usage` requires.
    pub required_flags: vk::MemoryPropertyFlags,
    /// Added to what `usage` prefers.
    pub preferred_flags: vk::MemoryPropertyFlags,
    pub flags: AllocationFlags,
    /// Residency priority in `0.0..=1.0`, dedicated allocations only.
    pub priority: Option<f32>,
    pub debug_name: String,
}

impl Default for AllocationRequest {
    fn default() -> Self {
        Self {
            size: 0,
            alignment: 1,
            memory_type_bits: u32::MAX,
            usage: MemoryUsage::Unknown,
            required_flags: vk::MemoryPropertyFlags::empty(),
            preferred_flags: vk::MemoryPropertyFlags::empty(),
            flags: AllocationFlags::empty(),
            priority: None,
            debug_name: String::new(),
        }
    }
}

impl AllocationRequest {
    pub fn new(debug_name: &str, size: u64, usage: MemoryUsage) -> Self {
        Self {
            size,
            usage,
            debug_name: debug_name.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_memory_type_bits(mut self, memory_type_bits: u32) -> Self {
        self.memory_type_bits = memory_type_bits;
        self
    }

    pub fn with_required_flags(mut self, flags: vk::MemoryPropertyFlags) -> Self {
        self.required_flags = flags;
        self
    }

    pub fn with_preferred_flags(mut self, flags: vk::MemoryPropertyFlags) -> Self {
        self.preferred_flags = flags;
        self
    }

    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_priority(mut self, priority: f32) -> Self {
        self.priority = Some(priority);
        self
    }

    fn required(&self) -> vk::MemoryPropertyFlags {
        let mut required = self.required_flags | self.usage.required_flags();
        if self.flags.contains(AllocationFlags::MAPPED) {
            required |= vk::MemoryPropertyFlags::HOST_VISIBLE;
        }
        required
    }

    fn preferred(&self) -> vk::MemoryPropertyFlags {
        self.preferred_flags | self.usage.preferred_flags()
    }
}

/// Which component serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRoute {
    Pooled,
    Linear,
    Dedicated,
}

#[derive(Debug, Clone, Default)]
pub struct DefragmentationReport {
    pub released: ReleasedMemory,
    pub plans: Vec<BlockDefragPlan>,
}

/// Entry point: picks a memory type, routes the request and keeps the books.
pub struct MemoryAllocator {
    desc: AllocatorDesc,
    context: Arc<MemoryContext>,
    pools: Vec<OnceCell<Pool>>,
    frame_rings: Vec<OnceCell<FrameAllocator>>,
    dedicated: DedicatedAllocations,
    counters: MemoryCounters,
}

impl MemoryAllocator {
    pub fn new(backend: Arc<dyn DeviceBackend>, desc: AllocatorDesc) -> Result<Self, MemoryError> {
        if !desc.strategy.supports_free() {
            return Err(MemoryError::InvalidRequest(format!(
                "{:?} cannot back pools, it is only used by frame rings",
                desc.strategy
            )));
        }
        if !desc.buddy_min_granularity.is_power_of_two() {
            return Err(MemoryError::InvalidRequest(format!(
                "buddy granularity {} is not a power of two",
                desc.buddy_min_granularity
            )));
        }

        let context = Arc::new(MemoryContext::new(backend, desc.budget_refresh_interval));
        let type_count = context.memory_types().len();
        log::info!(
            "Memory allocator over {} memory types and {} heaps ({:?} pools)",
            type_count,
            context.memory_heaps().len(),
            desc.strategy
        );

        Ok(Self {
            pools: (0..type_count).map(|_| OnceCell::new()).collect(),
            frame_rings: (0..type_count).map(|_| OnceCell::new()).collect(),
            dedicated: DedicatedAllocations::new(context.clone()),
            counters: MemoryCounters::new(),
            context,
            desc,
        })
    }

    pub fn desc(&self) -> &AllocatorDesc {
        &self.desc
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        self.context.backend()
    }

    pub fn memory_types(&self) -> &[MemoryType] {
        self.context.memory_types()
    }

    /// Best memory type for the flags, see [`select_memory_type`].
    pub fn find_memory_type(
        &self,
        memory_type_bits: u32,
        required: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
        size: u64,
    ) -> Option<u32> {
        select_memory_type(
            self.context.memory_types(),
            &self.context.budget().heap_budgets(),
            &MemoryTypeQuery {
                memory_type_bits,
                required,
                preferred,
                size,
                budget_aware: self.desc.budget_aware,
            },
        )
    }

    pub fn route_for(&self, request: &AllocationRequest) -> AllocationRoute {
        if request.flags.contains(AllocationFlags::DEDICATED)
            || request.size >= self.desc.dedicated_threshold
        {
            AllocationRoute::Dedicated
        } else if request.usage.is_frame_transient() {
            AllocationRoute::Linear
        } else {
            AllocationRoute::Pooled
        }
    }

    fn validate_request(request: &AllocationRequest) -> Result<(), MemoryError> {
        if request.size == 0 {
            return Err(MemoryError::InvalidRequest(format!(
                "'{}' asks for zero bytes",
                request.debug_name
            )));
        }
        if request.alignment != 0 && !request.alignment.is_power_of_two() {
            return Err(MemoryError::InvalidRequest(format!(
                "'{}' asks for alignment {} which is not a power of two",
                request.debug_name, request.alignment
            )));
        }
        if request.priority.is_some_and(|p| !(0.0..=1.0).contains(&p)) {
            return Err(MemoryError::InvalidRequest(format!(
                "'{}' has a priority outside 0..=1",
                request.debug_name
            )));
        }
        Ok(())
    }

    fn pool_desc(&self, memory_type: &MemoryType) -> PoolDesc {
        let heap_size = self.context.memory_heaps()[memory_type.heap_index as usize].size;
        let block_size = if heap_size <= SMALL_HEAP_LIMIT {
            self.desc.block_size.min(heap_size / 8)
        } else {
            self.desc.block_size
        };
        PoolDesc {
            memory_type_index: memory_type.index,
            property_flags: memory_type.property_flags,
            block_size,
            strategy: self.desc.strategy,
            buddy_granularity: self.desc.buddy_min_granularity,
        }
    }

    fn pool(&self, memory_type: &MemoryType) -> &Pool {
        self.pools[memory_type.index as usize]
            .get_or_init(|| Pool::new(self.pool_desc(memory_type), self.context.clone()))
    }

    fn frame_ring(&self, memory_type: &MemoryType) -> Result<&FrameAllocator, MemoryError> {
        self.frame_rings[memory_type.index as usize].get_or_try_init(|| {
            FrameAllocator::new(
                FrameAllocatorDesc {
                    memory_type_index: memory_type.index,
                    property_flags: memory_type.property_flags,
                    frames_in_flight: self.desc.frames_in_flight,
                    block_size: self.desc.frame_block_size,
                },
                self.context.clone(),
            )
        })
    }

    /// Bytes the backend has to reserve to serve `request` from `memory_type`
    /// when the memory already reserved there cannot.
    fn reservation_size(
        &self,
        route: AllocationRoute,
        request: &AllocationRequest,
        memory_type: &MemoryType,
    ) -> u64 {
        match route {
            AllocationRoute::Dedicated => request.size,
            AllocationRoute::Linear => {
                if self.frame_rings[memory_type.index as usize].get().is_some() {
                    0
                } else {
                    self.desc.frames_in_flight as u64 * self.desc.frame_block_size
                }
            }
            AllocationRoute::Pooled => self
                .pool_desc(memory_type)
                .block_size_for(request.size, request.alignment),
        }
    }

    /// Serves the request from memory that is already reserved.
    ///
    /// `None` means new memory is needed. A frame ring that exists answers
    /// for itself, it never falls through to a new ring.
    fn allocate_from_reserved(
        &self,
        route: AllocationRoute,
        memory_type: &MemoryType,
        sub: &SubAllocation<'_>,
    ) -> Option<Result<Allocation, MemoryError>> {
        let index = memory_type.index as usize;
        match route {
            AllocationRoute::Dedicated => None,
            AllocationRoute::Linear => self.frame_rings[index]
                .get()
                .map(|ring| ring.allocate_with(sub)),
            AllocationRoute::Pooled => self.pools[index]
                .get()
                .and_then(|pool| pool.allocate_with(sub, false).ok())
                .map(Ok),
        }
    }

    /// Picks the memory type new memory is reserved from.
    ///
    /// Types whose heap cannot take the whole reservation are skipped in
    /// favour of the next best one.
    fn select_for_growth(
        &self,
        route: AllocationRoute,
        request: &AllocationRequest,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32, MemoryError> {
        let enforce_budget =
            self.desc.budget_aware && !request.flags.contains(AllocationFlags::BUDGET_EXEMPT);
        let budget = self.context.budget();
        let heap_budgets = budget.heap_budgets();
        let mut memory_type_bits = request.memory_type_bits;
        let mut rejected = None;

        while let Some(index) = select_memory_type(
            self.context.memory_types(),
            &heap_budgets,
            &MemoryTypeQuery {
                memory_type_bits,
                required,
                preferred: request.preferred(),
                size: request.size,
                budget_aware: self.desc.budget_aware,
            },
        ) {
            if !enforce_budget {
                return Ok(index);
            }
            let memory_type = self.context.memory_types()[index as usize];
            let reservation = self.reservation_size(route, request, &memory_type);
            let available = budget.heap_budget(memory_type.heap_index).available();
            if available >= reservation {
                return Ok(index);
            }
            rejected.get_or_insert(MemoryError::BudgetExceeded {
                heap_index: memory_type.heap_index,
                requested: reservation,
                available,
            });
            memory_type_bits &= !(1 << index);
        }

        Err(rejected.unwrap_or(MemoryError::NoCompatibleMemoryType {
            memory_type_bits: request.memory_type_bits,
            required,
        }))
    }

    #[track_caller]
    pub fn allocate(&self, request: &AllocationRequest) -> Result<Allocation, MemoryError> {
        let location = Location::caller();
        Self::validate_request(request)?;

        match self.allocate_at(request, location) {
            Ok(allocation) => {
                self.counters.record_allocation(allocation.aligned_size());
                Ok(allocation)
            }
            Err(e) => {
                log::warn!(
                    "Failed to allocate '{}' ({} bytes, {:?}): {}",
                    request.debug_name,
                    request.size,
                    self.route_for(request),
                    e
                );
                Err(e)
            }
        }
    }

    fn allocate_at(
        &self,
        request: &AllocationRequest,
        location: &'static Location<'static>,
    ) -> Result<Allocation, MemoryError> {
        if self.desc.budget_aware {
            self.context.budget().refresh(false);
        }

        let required = request.required();
        let route = self.route_for(request);
        let sub = SubAllocation {
            size: request.size,
            alignment: request.alignment,
            usage: request.usage,
            debug_name: &request.debug_name,
            location,
        };

        // reserved memory is used whatever the budget says
        let preferred_index = select_memory_type(
            self.context.memory_types(),
            &[],
            &MemoryTypeQuery {
                memory_type_bits: request.memory_type_bits,
                required,
                preferred: request.preferred(),
                size: request.size,
                budget_aware: false,
            },
        )
        .ok_or(MemoryError::NoCompatibleMemoryType {
            memory_type_bits: request.memory_type_bits,
            required,
        })?;
        let preferred = self.context.memory_types()[preferred_index as usize];
        if let Some(result) = self.allocate_from_reserved(route, &preferred, &sub) {
            return result;
        }
        if request.flags.contains(AllocationFlags::NEVER_ALLOCATE) {
            return Err(MemoryError::Exhausted {
                size: request.size,
                memory_type_index: preferred_index,
            });
        }

        let memory_type_index = match self.select_for_growth(route, request, required) {
            Err(MemoryError::BudgetExceeded { .. }) => {
                // the cached budget may be stale, look again before giving up
                self.context.budget().refresh(true);
                self.select_for_growth(route, request, required)?
            }
            result => result?,
        };
        let memory_type = self.context.memory_types()[memory_type_index as usize];

        match route {
            AllocationRoute::Dedicated => {
                self.dedicated
                    .allocate(&sub, memory_type_index, request.priority)
            }
            AllocationRoute::Linear => self
                .frame_ring(&memory_type)
                .and_then(|ring| ring.allocate_with(&sub)),
            AllocationRoute::Pooled => self.pool(&memory_type).allocate_with(&sub, true),
        }
    }

    /// Allocates memory fitting the resource and binds it.
    #[track_caller]
    pub fn allocate_for_resource(
        &self,
        resource: ResourceHandle,
        usage: MemoryUsage,
        debug_name: &str,
    ) -> Result<Allocation, MemoryError> {
        let requirements = self.backend().memory_requirements(resource)?;
        let mut flags = AllocationFlags::empty();
        if requirements.requires_dedicated || requirements.prefers_dedicated {
            flags |= AllocationFlags::DEDICATED;
        }
        let request = AllocationRequest {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            usage,
            flags,
            debug_name: debug_name.to_owned(),
            ..Default::default()
        };

        let allocation = self.allocate(&request)?;
        if let Err(e) =
            self.backend()
                .bind_memory(resource, allocation.memory(), allocation.offset())
        {
            self.free(&allocation);
            return Err(e.into());
        }
        Ok(allocation)
    }

    /// Hands an allocation back.
    ///
    /// Frame transient allocations are reclaimed by [`Self::begin_frame`] and
    /// freeing them here does nothing.
    pub fn free(&self, allocation: &Allocation) {
        match allocation.kind() {
            AllocationKind::Pooled => {
                let pool = self
                    .pools
                    .get(allocation.memory_type_index() as usize)
                    .and_then(OnceCell::get);
                match pool {
                    Some(pool) => pool.free(allocation),
                    None => panic!(
                        "allocation '{}' (block {}) was not made by this allocator",
                        allocation.debug_name(),
                        allocation.block_id()
                    ),
                }
            }
            AllocationKind::Dedicated => self.dedicated.free(allocation),
            AllocationKind::Linear => return,
        }
        self.counters.record_free(allocation.aligned_size());
    }

    /// Advances every frame ring, resetting the slot it moves to, and
    /// refreshes the heap budgets when the refresh interval has passed.
    pub fn begin_frame(&self) -> ReleasedMemory {
        let mut released = ReleasedMemory::default();
        for ring in self.frame_rings.iter().filter_map(OnceCell::get) {
            let reset = ring.begin_frame();
            released.count += reset.count;
            released.bytes += reset.bytes;
        }
        self.counters.record_bulk_free(released.count, released.bytes);
        self.context.budget().refresh(false);
        released
    }

    /// Plans compaction of fragmented blocks, then releases empty ones.
    pub fn defragment(&self) -> DefragmentationReport {
        let mut report = DefragmentationReport::default();
        for pool in self.pools.iter().filter_map(OnceCell::get) {
            report.plans.extend(pool.plan_defragmentation());
            let released = pool.defragment();
            report.released.count += released.count;
            report.released.bytes += released.bytes;
        }
        report
    }

    pub fn heap_budgets(&self) -> Vec<HeapBudget> {
        self.context.budget().heap_budgets()
    }

    /// Queries the backend for budgets now, ignoring the refresh interval.
    pub fn refresh_budgets(&self) -> Vec<HeapBudget> {
        self.context.budget().refresh(true);
        self.heap_budgets()
    }

    pub fn statistics(&self) -> AllocatorStatistics {
        let pools = self
            .pools
            .iter()
            .filter_map(OnceCell::get)
            .map(|pool| (pool.memory_type_index(), pool.statistics()))
            .collect::<IndexMap<_, _>>();
        let frames = self
            .frame_rings
            .iter()
            .filter_map(OnceCell::get)
            .map(|ring| (ring.memory_type_index(), ring.statistics()))
            .collect::<IndexMap<_, _>>();
        AllocatorStatistics {
            pools,
            frames,
            heaps: self.heap_budgets(),
            dedicated: self.dedicated.statistics(),
            totals: self.counters.snapshot(),
        }
    }

    /// Runs the block coverage check on every pool.
    pub fn validate(&self) {
        for pool in self.pools.iter().filter_map(OnceCell::get) {
            pool.validate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryRequirements, MockBackend, MockBackendDesc};

    fn test_allocator(desc: AllocatorDesc) -> (Arc<MockBackend>, MemoryAllocator) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mock = Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let backend: Arc<dyn DeviceBackend> = mock.clone();
        (mock, MemoryAllocator::new(backend, desc).unwrap())
    }

    fn small_blocks() -> AllocatorDesc {
        AllocatorDesc {
            block_size: MIB,
            dedicated_threshold: 4 * MIB,
            frame_block_size: 64 * 1024,
            budget_refresh_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[test]
    fn test_routing() {
        let (_mock, allocator) = test_allocator(small_blocks());
        let pooled = AllocationRequest::new("vertices", 1024, MemoryUsage::GpuOnly);
        let forced = AllocationRequest::new("image", 1024, MemoryUsage::GpuOnly)
            .with_flags(AllocationFlags::DEDICATED);
        let large = AllocationRequest::new("atlas", 4 * MIB, MemoryUsage::GpuOnly);
        let transient = AllocationRequest::new("uniforms", 256, MemoryUsage::FrameTransient);

        assert_eq!(allocator.route_for(&pooled), AllocationRoute::Pooled);
        assert_eq!(allocator.route_for(&forced), AllocationRoute::Dedicated);
        assert_eq!(allocator.route_for(&large), AllocationRoute::Dedicated);
        assert_eq!(allocator.route_for(&transient), AllocationRoute::Linear);

        assert_eq!(allocator.allocate(&pooled).unwrap().kind(), AllocationKind::Pooled);
        assert_eq!(allocator.allocate(&forced).unwrap().kind(), AllocationKind::Dedicated);
        assert_eq!(allocator.allocate(&large).unwrap().kind(), AllocationKind::Dedicated);
        let uniforms = allocator.allocate(&transient).unwrap();
        assert_eq!(uniforms.kind(), AllocationKind::Linear);
        assert!(uniforms.is_host_visible());
    }

    #[test]
    fn test_budget_redirects_to_other_heap() {
        let (mock, allocator) = test_allocator(small_blocks());
        // Heap 0 holds both device-local types and has no budget left.
        mock.set_budget(0, 256 * MIB, 256 * MIB);
        allocator.refresh_budgets();

        let request = AllocationRequest::new("mesh", 4096, MemoryUsage::GpuOnly);
        let allocation = allocator.allocate(&request).unwrap();
        assert_eq!(allocation.memory_type_index(), 1);
        assert_eq!(allocator.memory_types()[1].heap_index, 1);
    }

    #[test]
    fn test_budget_exceeded_after_forced_refresh() {
        let (mock, allocator) = test_allocator(small_blocks());
        mock.set_budget(0, 256 * MIB, 256 * MIB);
        mock.set_budget(1, 512 * MIB, 512 * MIB);
        allocator.refresh_budgets();
        let queries = mock.budget_queries();

        let request = AllocationRequest::new("mesh", 4096, MemoryUsage::GpuOnly);
        assert!(matches!(
            allocator.allocate(&request),
            Err(MemoryError::BudgetExceeded {
                heap_index: 0,
                requested: MIB,
                available: 0
            })
        ));
        // The retry re-read the budget once.
        assert_eq!(mock.budget_queries(), queries + 1);

        let exempt = request.with_flags(AllocationFlags::BUDGET_EXEMPT);
        assert!(allocator.allocate(&exempt).is_ok());
    }

    #[test]
    fn test_pool_growth_stays_within_budget() {
        let desc = AllocatorDesc {
            budget_refresh_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (mock, allocator) = test_allocator(desc);
        // 6 MiB left on heap 0, a new block there would take 32 MiB.
        mock.set_budget(0, 256 * MIB, 250 * MIB);
        allocator.refresh_budgets();

        let request = AllocationRequest::new("mesh", 4096, MemoryUsage::GpuOnly);
        let allocation = allocator.allocate(&request).unwrap();
        assert_eq!(allocation.memory_type_index(), 1);
        assert_eq!(mock.reserved_bytes_in_heap(0), 0);

        allocator.refresh_budgets();
        let heaps = allocator.heap_budgets();
        assert!(!heaps[0].is_over_budget());
        assert_eq!(heaps[1].usage, 64 * MIB);
        assert!(heaps.iter().all(|heap| heap.usage <= heap.budget));
    }

    #[test]
    fn test_budget_rejection_reports_reservation_size() {
        let desc = AllocatorDesc {
            budget_refresh_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let (mock, allocator) = test_allocator(desc);
        mock.set_budget(0, 256 * MIB, 250 * MIB);
        allocator.refresh_budgets();

        // Only heap 0 is allowed and its next block does not fit.
        let request = AllocationRequest::new("mesh", 4096, MemoryUsage::GpuOnly)
            .with_memory_type_bits(0b0001);
        assert!(matches!(
            allocator.allocate(&request),
            Err(MemoryError::BudgetExceeded {
                heap_index: 0,
                requested,
                available,
            }) if requested == 32 * MIB && available == 6 * MIB
        ));
        assert_eq!(mock.live_reservations(), 0);
    }

    #[test]
    fn test_frame_ring_creation_stays_within_budget() {
        let (mock, allocator) = test_allocator(small_blocks());
        // Heap 0 still scores best, but two 64 KiB frame blocks exceed its
        // 96 KiB budget.
        mock.set_budget(0, 96 * 1024, 0);
        allocator.refresh_budgets();

        let request = AllocationRequest::new("uniforms", 1024, MemoryUsage::FrameTransient);
        let uniforms = allocator.allocate(&request).unwrap();
        assert_eq!(uniforms.memory_type_index(), 1);
        assert_eq!(mock.reserved_bytes_in_heap(0), 0);
        assert_eq!(mock.reserved_bytes_in_heap(1), 2 * 64 * 1024);

        let stats = allocator.statistics();
        assert!(stats.frames.contains_key(&1));
        assert!(!stats.frames.contains_key(&3));
    }

    #[test]
    fn test_reserved_memory_ignores_budget() {
        let (mock, allocator) = test_allocator(small_blocks());
        let request = AllocationRequest::new("mesh", 4096, MemoryUsage::GpuOnly);
        let warm = allocator.allocate(&request).unwrap();
        assert_eq!(warm.memory_type_index(), 0);

        mock.set_budget(0, 256 * MIB, 256 * MIB);
        allocator.refresh_budgets();
        let queries = mock.budget_queries();

        // The warm block still has room, nothing new is reserved.
        let next = allocator.allocate(&request).unwrap();
        assert_eq!(next.memory_type_index(), 0);
        assert_eq!(next.block_id(), warm.block_id());
        assert_eq!(mock.live_reservations(), 1);
        assert_eq!(mock.budget_queries(), queries);
    }

    #[test]
    fn test_budget_recovers_on_retry() {
        let (mock, allocator) = test_allocator(small_blocks());
        mock.set_budget(0, 256 * MIB, 256 * MIB);
        mock.set_budget(1, 512 * MIB, 512 * MIB);
        allocator.refresh_budgets();

        // Memory was freed elsewhere; the forced refresh sees it.
        mock.set_budget(0, 256 * MIB, 0);
        let request = AllocationRequest::new("mesh", 4096, MemoryUsage::GpuOnly);
        let allocation = allocator.allocate(&request).unwrap();
        assert_eq!(allocation.memory_type_index(), 0);
    }

    #[test]
    fn test_invalid_requests() {
        let (_mock, allocator) = test_allocator(small_blocks());
        let zero = AllocationRequest::new("zero", 0, MemoryUsage::GpuOnly);
        assert!(matches!(allocator.allocate(&zero), Err(MemoryError::InvalidRequest(_))));

        let misaligned = AllocationRequest::new("odd", 64, MemoryUsage::GpuOnly).with_alignment(48);
        assert!(matches!(allocator.allocate(&misaligned), Err(MemoryError::InvalidRequest(_))));

        let impossible = AllocationRequest::new("nowhere", 64, MemoryUsage::CpuToGpu)
            .with_memory_type_bits(0b0001);
        assert!(matches!(
            allocator.allocate(&impossible),
            Err(MemoryError::NoCompatibleMemoryType { memory_type_bits: 1, .. })
        ));
    }

    #[test]
    fn test_linear_strategy_rejected_for_pools() {
        let backend: Arc<dyn DeviceBackend> =
            Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let desc = AllocatorDesc {
            strategy: AllocationStrategy::Linear,
            ..Default::default()
        };
        assert!(matches!(
            MemoryAllocator::new(backend, desc),
            Err(MemoryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_never_allocate_uses_existing_blocks_only() {
        let (mock, allocator) = test_allocator(small_blocks());
        let request = AllocationRequest::new("probe", 256, MemoryUsage::GpuOnly)
            .with_flags(AllocationFlags::NEVER_ALLOCATE);
        assert!(matches!(
            allocator.allocate(&request),
            Err(MemoryError::Exhausted { .. })
        ));
        assert_eq!(mock.live_reservations(), 0);

        let _warm = allocator
            .allocate(&AllocationRequest::new("warm", 256, MemoryUsage::GpuOnly))
            .unwrap();
        assert!(allocator.allocate(&request).is_ok());
        assert_eq!(mock.live_reservations(), 1);
    }

    #[test]
    fn test_free_returns_memory_to_pool() {
        let (_mock, allocator) = test_allocator(small_blocks());
        let a = allocator
            .allocate(&AllocationRequest::new("a", 1000, MemoryUsage::GpuOnly).with_alignment(256))
            .unwrap();
        assert_eq!(a.offset() % 256, 0);
        assert_eq!(allocator.statistics().totals.allocation_count, 1);

        allocator.free(&a);
        assert!(a.is_freed());
        let stats = allocator.statistics();
        assert_eq!(stats.totals.allocation_count, 0);
        assert_eq!(stats.totals.total_frees, 1);
        assert_eq!(stats.pools[&0].allocation_count, 0);
        allocator.validate();
    }

    #[test]
    fn test_begin_frame_reclaims_transient_memory() {
        let desc = AllocatorDesc {
            frames_in_flight: 2,
            ..small_blocks()
        };
        let (_mock, allocator) = test_allocator(desc);
        let request = AllocationRequest::new("per-frame", 1000, MemoryUsage::FrameTransient);

        let first = allocator.allocate(&request).unwrap();
        // Individual frees of transient memory are ignored.
        allocator.free(&first);
        assert!(!first.is_freed());

        assert_eq!(allocator.begin_frame(), ReleasedMemory::default());
        let second = allocator.allocate(&request).unwrap();
        let released = allocator.begin_frame();
        assert_eq!(released, ReleasedMemory { count: 1, bytes: 1000 });
        assert!(first.is_freed());
        assert!(!second.is_freed());
        assert_eq!(allocator.statistics().totals.allocation_count, 1);
    }

    #[test]
    fn test_allocate_for_resource_binds_memory() {
        let (mock, allocator) = test_allocator(small_blocks());
        let buffer = mock.create_buffer(MemoryRequirements {
            size: 10_000,
            alignment: 256,
            memory_type_bits: 0b1001,
            prefers_dedicated: false,
            requires_dedicated: false,
        });
        let allocation = allocator
            .allocate_for_resource(buffer, MemoryUsage::GpuOnly, "buffer")
            .unwrap();
        assert_eq!(allocation.kind(), AllocationKind::Pooled);
        assert_eq!(
            mock.binding_of(buffer),
            Some((allocation.memory(), allocation.offset()))
        );

        let image = mock.create_buffer(MemoryRequirements {
            size: 4096,
            alignment: 4096,
            memory_type_bits: u32::MAX,
            prefers_dedicated: false,
            requires_dedicated: true,
        });
        let dedicated = allocator
            .allocate_for_resource(image, MemoryUsage::GpuOnly, "image")
            .unwrap();
        assert_eq!(dedicated.kind(), AllocationKind::Dedicated);
        assert_eq!(mock.binding_of(image), Some((dedicated.memory(), 0)));
    }

    #[test]
    fn test_bind_failure_frees_the_allocation() {
        let (mock, allocator) = test_allocator(small_blocks());
        let requirements = MemoryRequirements {
            size: 10_000,
            alignment: 256,
            memory_type_bits: u32::MAX,
            prefers_dedicated: false,
            requires_dedicated: false,
        };
        let buffer = mock.create_buffer(requirements);
        mock.fail_next_binds(1);
        assert!(matches!(
            allocator.allocate_for_resource(buffer, MemoryUsage::GpuOnly, "buffer"),
            Err(MemoryError::Backend(_))
        ));
        assert_eq!(mock.binding_of(buffer), None);
        let stats = allocator.statistics();
        assert_eq!(stats.totals.allocation_count, 0);
        assert_eq!(stats.pools[&0].allocation_count, 0);

        let image = mock.create_buffer(MemoryRequirements {
            requires_dedicated: true,
            ..requirements
        });
        let reservations = mock.live_reservations();
        mock.fail_next_binds(1);
        assert!(allocator
            .allocate_for_resource(image, MemoryUsage::GpuOnly, "image")
            .is_err());
        assert_eq!(mock.live_reservations(), reservations);
        assert_eq!(allocator.statistics().dedicated.allocation_count, 0);
        assert_eq!(allocator.statistics().totals.allocation_count, 0);
    }

    #[test]
    fn test_allocation_site_is_the_caller() {
        let (_mock, allocator) = test_allocator(small_blocks());
        let request = AllocationRequest::new("traced", 64, MemoryUsage::GpuOnly);
        let line = line!() + 1;
        let allocation = allocator.allocate(&request).unwrap();
        assert_eq!(allocation.allocation_site().file(), file!());
        assert_eq!(allocation.allocation_site().line(), line);
    }

    #[test]
    fn test_defragment_releases_empty_blocks() {
        let (mock, allocator) = test_allocator(small_blocks());
        let requests = (0..3)
            .map(|i| AllocationRequest::new(&format!("big{}", i), 3 * MIB, MemoryUsage::GpuOnly))
            .collect::<Vec<_>>();
        let allocations = requests
            .iter()
            .map(|r| allocator.allocate(r).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(mock.live_reservations(), 3);

        for a in &allocations[1..] {
            allocator.free(a);
        }
        let report = allocator.defragment();
        assert_eq!(report.released.count, 2);
        assert_eq!(mock.live_reservations(), 1);
    }

    #[test]
    fn test_concurrent_mixed_traffic() {
        let (_mock, allocator) = test_allocator(small_blocks());
        std::thread::scope(|s| {
            for t in 0..8 {
                let allocator = &allocator;
                s.spawn(move || {
                    let usage = if t % 2 == 0 {
                        MemoryUsage::GpuOnly
                    } else {
                        MemoryUsage::CpuToGpu
                    };
                    let mut live = Vec::new();
                    for i in 0..200u64 {
                        let request =
                            AllocationRequest::new("mixed", 256 + (i * 37) % 4096, usage)
                                .with_alignment(1 << (i % 9));
                        live.push(allocator.allocate(&request).unwrap());
                        if i % 3 == 0 {
                            allocator.free(&live.swap_remove(0));
                        }
                    }
                    for a in live {
                        allocator.free(&a);
                    }
                });
            }
        });

        allocator.validate();
        let stats = allocator.statistics();
        assert_eq!(stats.totals.allocation_count, 0);
        assert_eq!(stats.totals.allocated_bytes, 0);
        assert_eq!(stats.totals.total_allocations, 8 * 200);
    }

    #[test]
    fn test_statistics_table_lists_every_source() {
        let (_mock, allocator) = test_allocator(small_blocks());
        let _a = allocator
            .allocate(&AllocationRequest::new("a", 1024, MemoryUsage::GpuOnly))
            .unwrap();
        let _b = allocator
            .allocate(&AllocationRequest::new("b", 1024, MemoryUsage::FrameTransient))
            .unwrap();
        let stats = allocator.statistics();
        stats.log_summary();

        let rendered = stats.to_table().to_string();
        assert!(rendered.contains("pool type 0"));
        assert!(rendered.contains("frames type 3"));
        assert!(rendered.contains("heap 1"));
        assert!(rendered.contains("total"));
    }
}
