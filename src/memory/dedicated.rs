use super::allocation::{AllocationInfo, MappedPtr};
use super::block::SubAllocation;
use super::{Allocation, AllocationKind, MemoryContext, MemoryCounters, MemoryError};
use crate::backend::DeviceMemory;
use crate::util::normalize_alignment;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedicatedStatistics {
    pub allocation_count: usize,
    pub bytes: u64,
}

struct DedicatedEntry {
    allocation: Allocation,
    mapped: bool,
}

/// Allocations that own a whole backend reservation, keyed by that
/// reservation.
pub struct DedicatedAllocations {
    context: Arc<MemoryContext>,
    entries: RwLock<HashMap<DeviceMemory, DedicatedEntry>>,
    counters: MemoryCounters,
}

impl Drop for DedicatedAllocations {
    fn drop(&mut self) {
        for (memory, entry) in std::mem::take(self.entries.get_mut()) {
            log::warn!(
                "Releasing leaked dedicated allocation '{}' ({} bytes), allocated at {}",
                entry.allocation.debug_name(),
                entry.allocation.size(),
                entry.allocation.allocation_site()
            );
            entry.allocation.mark_freed();
            self.release(memory, &entry);
        }
    }
}

impl DedicatedAllocations {
    pub fn new(context: Arc<MemoryContext>) -> Self {
        Self {
            context,
            entries: RwLock::new(HashMap::new()),
            counters: MemoryCounters::new(),
        }
    }

    pub(crate) fn allocate(
        &self,
        request: &SubAllocation<'_>,
        memory_type_index: u32,
        priority: Option<f32>,
    ) -> Result<Allocation, MemoryError> {
        let backend = self.context.backend();
        let memory_type = self.context.memory_types()[memory_type_index as usize];
        let memory = match priority {
            Some(priority) => {
                backend.reserve_with_priority(request.size, memory_type_index, priority)?
            }
            None => backend.reserve(request.size, memory_type_index)?,
        };

        let mapped = if memory_type.is_host_visible() {
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

        let allocation = Allocation::new(AllocationInfo {
            offset: 0,
            size: request.size,
            aligned_size: request.size,
            alignment: normalize_alignment(request.alignment),
            block_id: self.context.next_block_id(),
            kind: AllocationKind::Dedicated,
            strategy: None,
            usage: request.usage,
            memory_type_index,
            property_flags: memory_type.property_flags,
            memory,
            memory_size: request.size,
            mapped_base: mapped,
            base_address: backend.device_address(memory),
            backend,
            debug_name: request.debug_name,
            location: request.location,
        });
        self.context
            .budget()
            .record_reserve(memory_type.heap_index, request.size);
        self.counters.record_allocation(request.size);

        log::debug!(
            "Dedicated allocation '{}' of {} bytes in memory type {}",
            request.debug_name,
            request.size,
            memory_type_index
        );
        self.entries.write().insert(
            memory,
            DedicatedEntry {
                allocation: allocation.clone(),
                mapped: mapped.is_some(),
            },
        );
        Ok(allocation)
    }

    /// Panics on a double free or when the allocation is not one of ours.
    pub fn free(&self, allocation: &Allocation) {
        let entry = {
            let mut entries = self.entries.write();
            if allocation.is_freed() {
                panic!(
                    "double free of dedicated allocation '{}' (block {})",
                    allocation.debug_name(),
                    allocation.block_id()
                );
            }
            let is_live = entries
                .get(&allocation.memory())
                .is_some_and(|entry| entry.allocation.ptr_eq(allocation));
            if !is_live {
                panic!(
                    "allocation '{}' (block {}) is not a live dedicated allocation",
                    allocation.debug_name(),
                    allocation.block_id()
                );
            }
            let Some(entry) = entries.remove(&allocation.memory()) else {
                unreachable!("live dedicated entry vanished under the write lock");
            };
            allocation.mark_freed();
            entry
        };
        self.release(allocation.memory(), &entry);
        self.counters.record_free(allocation.size());
    }

    fn release(&self, memory: DeviceMemory, entry: &DedicatedEntry) {
        let backend = self.context.backend();
        if entry.mapped {
            backend.unmap(memory);
        }
        backend.release(memory);
        self.context.budget().record_release(
            self.context
                .heap_index_of(entry.allocation.memory_type_index()),
            entry.allocation.size(),
        );
    }

    pub fn contains(&self, allocation: &Allocation) -> bool {
        self.entries
            .read()
            .get(&allocation.memory())
            .is_some_and(|entry| entry.allocation.ptr_eq(allocation))
    }

    pub fn statistics(&self) -> DedicatedStatistics {
        let snapshot = self.counters.snapshot();
        DedicatedStatistics {
            allocation_count: snapshot.allocation_count as usize,
            bytes: snapshot.allocated_bytes,
        }
    }
}
