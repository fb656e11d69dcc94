use super::{
    BackendError, DeviceBackend, DeviceMemory, HeapBudgetReport, MemoryHeap, MemoryRequirements,
    MemoryType, ResourceHandle,
};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const MIB: u64 = 1024 * 1024;

/// Device layout the mock backend pretends to have.
#[derive(Debug, Clone)]
pub struct MockBackendDesc {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
    pub non_coherent_atom_size: u64,
    /// Hand out fake device addresses for every reservation.
    pub device_addresses: bool,
    /// Answer `query_budget` (with the values set through `set_budget`).
    pub report_budget: bool,
}

impl Default for MockBackendDesc {
    fn default() -> Self {
        Self::discrete()
    }
}

impl MockBackendDesc {
    /// A discrete GPU: 256 MiB of VRAM and 512 MiB of system memory.
    ///
    /// - type 0: DEVICE_LOCAL (heap 0)
    /// - type 1: HOST_VISIBLE | HOST_COHERENT (heap 1)
    /// - type 2: HOST_VISIBLE | HOST_COHERENT | HOST_CACHED (heap 1)
    /// - type 3: DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT (heap 0)
    pub fn discrete() -> Self {
        use vk::MemoryPropertyFlags as F;
        Self {
            memory_types: vec![
                mock_type(0, F::DEVICE_LOCAL, 0),
                mock_type(1, F::HOST_VISIBLE | F::HOST_COHERENT, 1),
                mock_type(2, F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED, 1),
                mock_type(3, F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT, 0),
            ],
            memory_heaps: vec![
                MemoryHeap {
                    index: 0,
                    size: 256 * MIB,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    index: 1,
                    size: 512 * MIB,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
            non_coherent_atom_size: 64,
            device_addresses: true,
            report_budget: true,
        }
    }

    /// A single heap where everything is host visible but nothing is coherent.
    pub fn non_coherent() -> Self {
        use vk::MemoryPropertyFlags as F;
        Self {
            memory_types: vec![mock_type(0, F::DEVICE_LOCAL | F::HOST_VISIBLE, 0)],
            memory_heaps: vec![MemoryHeap {
                index: 0,
                size: 256 * MIB,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            }],
            non_coherent_atom_size: 64,
            device_addresses: false,
            report_budget: false,
        }
    }
}

fn mock_type(index: u32, property_flags: vk::MemoryPropertyFlags, heap_index: u32) -> MemoryType {
    MemoryType {
        index,
        property_flags,
        heap_index,
    }
}

/// Host allocation standing in for device memory.
struct HostMemory(NonNull<[u8]>);

// the mock hands the pointer out through `map`, access discipline is the caller's
unsafe impl Send for HostMemory {}

impl HostMemory {
    fn new(size: u64) -> Self {
        let data = vec![0u8; size as usize].into_boxed_slice();
        Self(NonNull::from(Box::leak(data)))
    }

    fn as_ptr(&self) -> NonNull<u8> {
        self.0.cast()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.0.as_ptr())) };
    }
}

struct MockMemory {
    size: u64,
    memory_type_index: u32,
    host: Option<HostMemory>,
    mapped: bool,
    priority: Option<f32>,
}

#[derive(Default)]
struct MockState {
    memories: HashMap<DeviceMemory, MockMemory>,
    budgets: HashMap<u32, HeapBudgetReport>,
    resources: HashMap<ResourceHandle, MemoryRequirements>,
    bindings: HashMap<ResourceHandle, (DeviceMemory, u64)>,
    flushes: Vec<(DeviceMemory, u64, u64)>,
    invalidations: Vec<(DeviceMemory, u64, u64)>,
    failing_reserves: usize,
    failing_binds: usize,
}

/// In-process backend that serves "device memory" from the host heap.
pub struct MockBackend {
    desc: MockBackendDesc,
    state: Mutex<MockState>,
    next_handle: AtomicU64,
    budget_queries: AtomicUsize,
}

impl MockBackend {
    pub fn new(desc: MockBackendDesc) -> Self {
        Self {
            desc,
            state: Mutex::new(MockState::default()),
            next_handle: AtomicU64::new(1),
            budget_queries: AtomicUsize::new(0),
        }
    }

    pub fn desc(&self) -> &MockBackendDesc {
        &self.desc
    }

    /// Overrides what `query_budget` reports for `heap_index`.
    pub fn set_budget(&self, heap_index: u32, budget: u64, usage: u64) {
        self.state.lock().budgets.insert(
            heap_index,
            HeapBudgetReport {
                heap_index,
                budget,
                usage,
            },
        );
    }

    /// Makes the next `count` calls to `reserve` fail with out-of-memory.
    pub fn fail_next_reserves(&self, count: usize) {
        self.state.lock().failing_reserves = count;
    }

    /// Makes the next `count` calls to `bind_memory` fail.
    pub fn fail_next_binds(&self, count: usize) {
        self.state.lock().failing_binds = count;
    }

    /// Registers a fake buffer that `allocate_for_resource` can query.
    pub fn create_buffer(&self, requirements: MemoryRequirements) -> ResourceHandle {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let resource = ResourceHandle::Buffer(vk::Buffer::from_raw(raw));
        self.state.lock().resources.insert(resource, requirements);
        resource
    }

    pub fn binding_of(&self, resource: ResourceHandle) -> Option<(DeviceMemory, u64)> {
        self.state.lock().bindings.get(&resource).copied()
    }

    pub fn live_reservations(&self) -> usize {
        self.state.lock().memories.len()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().memories.values().map(|m| m.size).sum()
    }

    pub fn reserved_bytes_in_heap(&self, heap_index: u32) -> u64 {
        let state = self.state.lock();
        state
            .memories
            .values()
            .filter(|m| {
                self.desc.memory_types[m.memory_type_index as usize].heap_index == heap_index
            })
            .map(|m| m.size)
            .sum()
    }

    pub fn is_mapped(&self, memory: DeviceMemory) -> bool {
        self.state
            .lock()
            .memories
            .get(&memory)
            .is_some_and(|m| m.mapped)
    }

    pub fn priority_of(&self, memory: DeviceMemory) -> Option<f32> {
        self.state
            .lock()
            .memories
            .get(&memory)
            .and_then(|m| m.priority)
    }

    pub fn budget_queries(&self) -> usize {
        self.budget_queries.load(Ordering::Relaxed)
    }

    pub fn flushed_ranges(&self) -> Vec<(DeviceMemory, u64, u64)> {
        self.state.lock().flushes.clone()
    }

    pub fn invalidated_ranges(&self) -> Vec<(DeviceMemory, u64, u64)> {
        self.state.lock().invalidations.clone()
    }

    fn check_range(
        state: &MockState,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let mem = state
            .memories
            .get(&memory)
            .ok_or(BackendError::UnknownMemory(memory))?;
        assert!(
            offset + size <= mem.size,
            "range {}..{} exceeds reservation of {} bytes",
            offset,
            offset + size,
            mem.size
        );
        Ok(())
    }
}

impl DeviceBackend for MockBackend {
    fn reserve(&self, size: u64, memory_type_index: u32) -> Result<DeviceMemory, BackendError> {
        let memory_type = self.desc.memory_types[memory_type_index as usize];
        let heap_size = self.desc.memory_heaps[memory_type.heap_index as usize].size;

        let mut state = self.state.lock();
        if state.failing_reserves > 0 {
            state.failing_reserves -= 1;
            return Err(BackendError::OutOfDeviceMemory {
                size,
                memory_type_index,
            });
        }

        let heap_used: u64 = state
            .memories
            .values()
            .filter(|m| {
                self.desc.memory_types[m.memory_type_index as usize].heap_index
                    == memory_type.heap_index
            })
            .map(|m| m.size)
            .sum();
        if heap_used + size > heap_size {
            return Err(BackendError::OutOfDeviceMemory {
                size,
                memory_type_index,
            });
        }

        let memory = DeviceMemory::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let host = memory_type.is_host_visible().then(|| HostMemory::new(size));
        state.memories.insert(
            memory,
            MockMemory {
                size,
                memory_type_index,
                host,
                mapped: false,
                priority: None,
            },
        );
        Ok(memory)
    }

    fn release(&self, memory: DeviceMemory) {
        let removed = self.state.lock().memories.remove(&memory);
        match removed {
            Some(mem) => assert!(!mem.mapped, "releasing mapped memory {:?}", memory),
            None => panic!("releasing unknown memory {:?}", memory),
        }
    }

    fn map(&self, memory: DeviceMemory) -> Result<NonNull<u8>, BackendError> {
        let mut state = self.state.lock();
        let mem = state
            .memories
            .get_mut(&memory)
            .ok_or(BackendError::UnknownMemory(memory))?;
        let ptr = mem
            .host
            .as_ref()
            .map(HostMemory::as_ptr)
            .ok_or(BackendError::NotHostVisible(memory))?;
        mem.mapped = true;
        Ok(ptr)
    }

    fn unmap(&self, memory: DeviceMemory) {
        if let Some(mem) = self.state.lock().memories.get_mut(&memory) {
            mem.mapped = false;
        }
    }

    fn memory_types(&self) -> Vec<MemoryType> {
        self.desc.memory_types.clone()
    }

    fn memory_heaps(&self) -> Vec<MemoryHeap> {
        self.desc.memory_heaps.clone()
    }

    fn query_budget(&self) -> Option<Vec<HeapBudgetReport>> {
        if !self.desc.report_budget {
            return None;
        }
        self.budget_queries.fetch_add(1, Ordering::Relaxed);

        let state = self.state.lock();
        let reports = self
            .desc
            .memory_heaps
            .iter()
            .map(|heap| match state.budgets.get(&heap.index) {
                Some(report) => *report,
                None => HeapBudgetReport {
                    heap_index: heap.index,
                    budget: heap.size,
                    usage: state
                        .memories
                        .values()
                        .filter(|m| {
                            self.desc.memory_types[m.memory_type_index as usize].heap_index
                                == heap.index
                        })
                        .map(|m| m.size)
                        .sum(),
                },
            })
            .collect();
        Some(reports)
    }

    fn device_address(&self, memory: DeviceMemory) -> Option<u64> {
        // pretend every reservation lives in its own 4 GiB window
        self.desc
            .device_addresses
            .then(|| memory.as_raw() << 32)
    }

    fn set_priority(&self, memory: DeviceMemory, priority: f32) {
        if let Some(mem) = self.state.lock().memories.get_mut(&memory) {
            mem.priority = Some(priority.clamp(0.0, 1.0));
        }
    }

    fn non_coherent_atom_size(&self) -> u64 {
        self.desc.non_coherent_atom_size
    }

    fn flush_range(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        Self::check_range(&state, memory, offset, size)?;
        state.flushes.push((memory, offset, size));
        Ok(())
    }

    fn invalidate_range(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        Self::check_range(&state, memory, offset, size)?;
        state.invalidations.push((memory, offset, size));
        Ok(())
    }

    fn memory_requirements(
        &self,
        resource: ResourceHandle,
    ) -> Result<MemoryRequirements, BackendError> {
        self.state
            .lock()
            .resources
            .get(&resource)
            .copied()
            .ok_or(BackendError::UnknownResource(resource))
    }

    fn bind_memory(
        &self,
        resource: ResourceHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.failing_binds > 0 {
            state.failing_binds -= 1;
            return Err(BackendError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        if !state.resources.contains_key(&resource) {
            return Err(BackendError::UnknownResource(resource));
        }
        if !state.memories.contains_key(&memory) {
            return Err(BackendError::UnknownMemory(memory));
        }
        state.bindings.insert(resource, (memory, offset));
        Ok(())
    }
}
