use super::{
    BackendError, DeviceBackend, DeviceMemory, HeapBudgetReport, MemoryHeap, MemoryRequirements,
    MemoryType, ResourceHandle,
};
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Priority Vulkan gives memory allocated without an explicit one.
const DEFAULT_MEMORY_PRIORITY: f32 = 0.5;

/// Device features the backend may use. Each one must be enabled on the
/// device the backend is created over.
#[derive(Debug, Clone, Copy, Default)]
pub struct VulkanBackendDesc {
    /// `VK_EXT_memory_budget`.
    pub memory_budget: bool,
    /// `bufferDeviceAddress`: reservations get a shader-visible address.
    pub buffer_device_address: bool,
    /// `VK_EXT_memory_priority`: priorities are passed at allocation time.
    pub memory_priority: bool,
}

/// Buffer spanning a whole reservation, kept only for its device address.
struct AddressBuffer {
    buffer: vk::Buffer,
    address: u64,
}

/// Backend over a live Vulkan device.
///
/// The instance and device stay owned by the caller; they must outlive the
/// backend and every allocation made through it.
pub struct VulkanBackend {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    desc: VulkanBackendDesc,
    memory_types: Vec<MemoryType>,
    memory_heaps: Vec<MemoryHeap>,
    non_coherent_atom_size: u64,
    address_buffers: Mutex<HashMap<DeviceMemory, AddressBuffer>>,
}

impl VulkanBackend {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
        desc: VulkanBackendDesc,
    ) -> Self {
        let props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let limits = unsafe { instance.get_physical_device_properties(physical_device) }.limits;

        let memory_types = (0..props.memory_type_count)
            .map(|i| {
                let ty = props.memory_types[i as usize];
                MemoryType {
                    index: i,
                    property_flags: ty.property_flags,
                    heap_index: ty.heap_index,
                }
            })
            .collect::<Vec<_>>();
        let memory_heaps = (0..props.memory_heap_count)
            .map(|i| {
                let heap = props.memory_heaps[i as usize];
                MemoryHeap {
                    index: i,
                    size: heap.size,
                    flags: heap.flags,
                }
            })
            .collect::<Vec<_>>();

        log::debug!(
            "Vulkan memory backend: {} memory types, {} heaps, atom size {}",
            memory_types.len(),
            memory_heaps.len(),
            limits.non_coherent_atom_size
        );

        Self {
            instance: instance.clone(),
            physical_device,
            device: device.clone(),
            desc,
            memory_types,
            memory_heaps,
            non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
            address_buffers: Mutex::new(HashMap::new()),
        }
    }

    fn mapped_range(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> vk::MappedMemoryRange<'static> {
        vk::MappedMemoryRange::default()
            .memory(memory.into())
            .offset(offset)
            .size(size)
    }

    fn allocate(
        &self,
        size: u64,
        memory_type_index: u32,
        priority: f32,
    ) -> Result<DeviceMemory, BackendError> {
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut priority_info = vk::MemoryPriorityAllocateInfoEXT::default().priority(priority);
        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        if self.desc.buffer_device_address {
            allocate_info = allocate_info.push_next(&mut flags_info);
        }
        if self.desc.memory_priority {
            allocate_info = allocate_info.push_next(&mut priority_info);
        }

        let result = unsafe { self.device.allocate_memory(&allocate_info, None) };
        let memory = match result {
            Ok(memory) => DeviceMemory::from(memory),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                return Err(BackendError::OutOfDeviceMemory {
                    size,
                    memory_type_index,
                })
            }
            Err(e) => return Err(e.into()),
        };

        if self.desc.buffer_device_address {
            match self.create_address_buffer(memory, size, memory_type_index) {
                Ok(Some(buffer)) => {
                    self.address_buffers.lock().insert(memory, buffer);
                }
                Ok(None) => log::debug!(
                    "Memory type {} cannot back a buffer, {:?} has no device address",
                    memory_type_index,
                    memory
                ),
                Err(e) => log::warn!("No device address for {:?}: {}", memory, e),
            }
        }
        Ok(memory)
    }

    /// Binds a buffer over the whole reservation to read its device address.
    ///
    /// `None` when no buffer can live in this memory type.
    fn create_address_buffer(
        &self,
        memory: DeviceMemory,
        size: u64,
        memory_type_index: u32,
    ) -> Result<Option<AddressBuffer>, vk::Result> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::UNIFORM_BUFFER
                    | vk::BufferUsageFlags::VERTEX_BUFFER
                    | vk::BufferUsageFlags::INDEX_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let buffer = self.device.create_buffer(&buffer_info, None)?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);
            if requirements.memory_type_bits & (1 << memory_type_index) == 0
                || requirements.size > size
            {
                self.device.destroy_buffer(buffer, None);
                return Ok(None);
            }
            if let Err(e) = self.device.bind_buffer_memory(buffer, memory.into(), 0) {
                self.device.destroy_buffer(buffer, None);
                return Err(e);
            }
            let address_info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            let address = self.device.get_buffer_device_address(&address_info);
            Ok(Some(AddressBuffer { buffer, address }))
        }
    }
}

impl DeviceBackend for VulkanBackend {
    fn reserve(&self, size: u64, memory_type_index: u32) -> Result<DeviceMemory, BackendError> {
        self.allocate(size, memory_type_index, DEFAULT_MEMORY_PRIORITY)
    }

    fn reserve_with_priority(
        &self,
        size: u64,
        memory_type_index: u32,
        priority: f32,
    ) -> Result<DeviceMemory, BackendError> {
        self.allocate(size, memory_type_index, priority)
    }

    fn release(&self, memory: DeviceMemory) {
        if let Some(address_buffer) = self.address_buffers.lock().remove(&memory) {
            unsafe { self.device.destroy_buffer(address_buffer.buffer, None) };
        }
        unsafe { self.device.free_memory(memory.into(), None) };
    }

    fn map(&self, memory: DeviceMemory) -> Result<NonNull<u8>, BackendError> {
        let ptr = unsafe {
            self.device.map_memory(
                memory.into(),
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )?
        };
        NonNull::new(ptr.cast::<u8>()).ok_or(BackendError::NotHostVisible(memory))
    }

    fn unmap(&self, memory: DeviceMemory) {
        unsafe { self.device.unmap_memory(memory.into()) };
    }

    fn memory_types(&self) -> Vec<MemoryType> {
        self.memory_types.clone()
    }

    fn memory_heaps(&self) -> Vec<MemoryHeap> {
        self.memory_heaps.clone()
    }

    fn query_budget(&self) -> Option<Vec<HeapBudgetReport>> {
        if !self.desc.memory_budget {
            return None;
        }

        let mut budget_props = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
        let mut props2 =
            vk::PhysicalDeviceMemoryProperties2::default().push_next(&mut budget_props);
        unsafe {
            self.instance
                .get_physical_device_memory_properties2(self.physical_device, &mut props2)
        };

        let reports = self
            .memory_heaps
            .iter()
            .map(|heap| HeapBudgetReport {
                heap_index: heap.index,
                budget: budget_props.heap_budget[heap.index as usize],
                usage: budget_props.heap_usage[heap.index as usize],
            })
            .collect();
        Some(reports)
    }

    fn device_address(&self, memory: DeviceMemory) -> Option<u64> {
        self.address_buffers
            .lock()
            .get(&memory)
            .map(|address_buffer| address_buffer.address)
    }

    fn non_coherent_atom_size(&self) -> u64 {
        self.non_coherent_atom_size
    }

    fn flush_range(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let range = self.mapped_range(memory, offset, size);
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn invalidate_range(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let range = self.mapped_range(memory, offset, size);
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn memory_requirements(
        &self,
        resource: ResourceHandle,
    ) -> Result<MemoryRequirements, BackendError> {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let requirements = {
            let mut requirements2 = vk::MemoryRequirements2::default().push_next(&mut dedicated);
            match resource {
                ResourceHandle::Buffer(buffer) => unsafe {
                    let info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
                    self.device
                        .get_buffer_memory_requirements2(&info, &mut requirements2);
                },
                ResourceHandle::Image(image) => unsafe {
                    let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
                    self.device
                        .get_image_memory_requirements2(&info, &mut requirements2);
                },
            }
            requirements2.memory_requirements
        };

        Ok(MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
            requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
        })
    }

    fn bind_memory(
        &self,
        resource: ResourceHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), BackendError> {
        unsafe {
            match resource {
                ResourceHandle::Buffer(buffer) => {
                    self.device
                        .bind_buffer_memory(buffer, memory.into(), offset)?
                }
                ResourceHandle::Image(image) => {
                    self.device.bind_image_memory(image, memory.into(), offset)?
                }
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_defaults_to_core_features_only() {
        let desc = VulkanBackendDesc::default();
        assert!(!desc.memory_budget);
        assert!(!desc.buffer_device_address);
        assert!(!desc.memory_priority);
    }
}
