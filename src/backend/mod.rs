//! The device side of the allocator: whatever actually reserves, maps and
//! releases physical memory.

use ash::vk;
use std::ptr::NonNull;
use thiserror::Error;

mod mock;
pub use mock::*;

mod vulkan;
pub use vulkan::*;

/// Opaque handle of one backend memory reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceMemory(u64);

impl DeviceMemory {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl From<vk::DeviceMemory> for DeviceMemory {
    fn from(memory: vk::DeviceMemory) -> Self {
        use ash::vk::Handle;
        Self(memory.as_raw())
    }
}

impl From<DeviceMemory> for vk::DeviceMemory {
    fn from(memory: DeviceMemory) -> Self {
        use ash::vk::Handle;
        vk::DeviceMemory::from_raw(memory.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

impl MemoryType {
    pub fn is_host_visible(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_device_local(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub index: u32,
    pub size: u64,
    pub flags: vk::MemoryHeapFlags,
}

/// Budget as reported by the device for one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBudgetReport {
    pub heap_index: u32,
    pub budget: u64,
    pub usage: u64,
}

/// A resource that memory can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("out of device memory reserving {size} bytes from memory type {memory_type_index}")]
    OutOfDeviceMemory { size: u64, memory_type_index: u32 },

    #[error("device memory {0:?} is not host visible")]
    NotHostVisible(DeviceMemory),

    #[error("unknown device memory {0:?}")]
    UnknownMemory(DeviceMemory),

    #[error("unknown resource {0:?}")]
    UnknownResource(ResourceHandle),

    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
}

/// Raw memory provider consumed by the allocator.
///
/// Implementations are shared between threads; every method may be called
/// concurrently.
pub trait DeviceBackend: Send + Sync {
    /// Reserves `size` bytes of memory type `memory_type_index`.
    fn reserve(&self, size: u64, memory_type_index: u32) -> Result<DeviceMemory, BackendError>;

    /// Reserves memory that starts out with a residency priority.
    fn reserve_with_priority(
        &self,
        size: u64,
        memory_type_index: u32,
        priority: f32,
    ) -> Result<DeviceMemory, BackendError> {
        let memory = self.reserve(size, memory_type_index)?;
        self.set_priority(memory, priority);
        Ok(memory)
    }

    /// Returns a reservation to the device. The memory must be unmapped.
    fn release(&self, memory: DeviceMemory);

    /// Maps the whole reservation and returns the host pointer to its start.
    fn map(&self, memory: DeviceMemory) -> Result<NonNull<u8>, BackendError>;

    fn unmap(&self, memory: DeviceMemory);

    fn memory_types(&self) -> Vec<MemoryType>;

    fn memory_heaps(&self) -> Vec<MemoryHeap>;

    /// Current per-heap budgets, `None` when the device cannot report them.
    fn query_budget(&self) -> Option<Vec<HeapBudgetReport>> {
        None
    }

    /// Address usable by shaders for bindless access to the start of `memory`.
    fn device_address(&self, _memory: DeviceMemory) -> Option<u64> {
        None
    }

    /// Residency hint in `0.0..=1.0` for live memory. Backends that can only
    /// take a priority at allocation time ignore it.
    fn set_priority(&self, _memory: DeviceMemory, _priority: f32) {}

    /// Granularity that flush and invalidate ranges are aligned to.
    fn non_coherent_atom_size(&self) -> u64 {
        1
    }

    fn flush_range(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<(), BackendError>;

    fn invalidate_range(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<(), BackendError>;

    fn memory_requirements(
        &self,
        resource: ResourceHandle,
    ) -> Result<MemoryRequirements, BackendError>;

    fn bind_memory(
        &self,
        resource: ResourceHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), BackendError>;
}
