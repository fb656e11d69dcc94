pub mod backend;
pub mod memory;
pub mod util;

pub use backend::{DeviceBackend, MockBackend, MockBackendDesc, VulkanBackend, VulkanBackendDesc};
pub use memory::{
    Allocation, AllocationFlags, AllocationRequest, AllocationStrategy, AllocatorDesc,
    MemoryAllocator, MemoryError, MemoryUsage,
};
