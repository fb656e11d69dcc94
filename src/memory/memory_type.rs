use super::HeapBudget;
use crate::backend::MemoryType;
use ash::vk;
use bitflags::bitflags;

/// Points per preferred flag a memory type carries.
pub const PREFERRED_FLAG_SCORE: u32 = 4;
/// Bonus for device-local memory.
pub const DEVICE_LOCAL_SCORE: u32 = 2;
/// Score of a heap with its whole budget still available.
pub const MAX_BUDGET_SCORE: u32 = 4;

/// What the caller intends to do with the memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    #[default]
    Unknown,
    /// Only touched by the device.
    GpuOnly,
    /// Written by the host, read by the device.
    CpuToGpu,
    /// Written by the device, read back by the host.
    GpuToCpu,
    /// Rewritten every frame, served from the frame ring.
    FrameTransient,
}

impl MemoryUsage {
    pub fn required_flags(&self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryUsage::Unknown | MemoryUsage::GpuOnly => vk::MemoryPropertyFlags::empty(),
            MemoryUsage::CpuToGpu | MemoryUsage::GpuToCpu | MemoryUsage::FrameTransient => {
                vk::MemoryPropertyFlags::HOST_VISIBLE
            }
        }
    }

    pub fn preferred_flags(&self) -> vk::MemoryPropertyFlags {
        use vk::MemoryPropertyFlags as F;
        match self {
            MemoryUsage::Unknown => F::empty(),
            MemoryUsage::GpuOnly => F::DEVICE_LOCAL,
            MemoryUsage::CpuToGpu => F::HOST_COHERENT | F::DEVICE_LOCAL,
            MemoryUsage::GpuToCpu => F::HOST_CACHED | F::HOST_COHERENT,
            MemoryUsage::FrameTransient => F::HOST_COHERENT,
        }
    }

    pub fn is_frame_transient(&self) -> bool {
        matches!(self, MemoryUsage::FrameTransient)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocationFlags: u32 {
        /// Give the allocation its own backend reservation.
        const DEDICATED = 1 << 0;
        /// The allocation must be host visible and mapped.
        const MAPPED = 1 << 1;
        /// Only sub-allocate from memory that is already reserved.
        const NEVER_ALLOCATE = 1 << 2;
        /// Skip the heap budget check.
        const BUDGET_EXEMPT = 1 << 3;
    }
}

/// Inputs of one memory type lookup.
#[derive(Debug, Clone, Copy)]
pub struct MemoryTypeQuery {
    pub memory_type_bits: u32,
    pub required: vk::MemoryPropertyFlags,
    pub preferred: vk::MemoryPropertyFlags,
    pub size: u64,
    /// Exclude heaps that cannot take `size` more bytes.
    pub budget_aware: bool,
}

fn is_candidate(memory_type: &MemoryType, query: &MemoryTypeQuery) -> bool {
    query.memory_type_bits & (1 << memory_type.index) != 0
        && memory_type.property_flags.contains(query.required)
}

fn budget_score(budget: &HeapBudget) -> u32 {
    if budget.budget == 0 {
        return 0;
    }
    let headroom = budget.available() as f64 / budget.budget as f64;
    (headroom * MAX_BUDGET_SCORE as f64).round() as u32
}

/// Scores every type that satisfies the query and returns the best one.
///
/// Types whose heap is over budget (or, when budget aware, cannot fit the
/// request) do not take part in scoring; if that leaves nothing, the first
/// type with the required flags is returned anyway.
pub fn select_memory_type(
    memory_types: &[MemoryType],
    heap_budgets: &[HeapBudget],
    query: &MemoryTypeQuery,
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;

    for memory_type in memory_types.iter().filter(|t| is_candidate(t, query)) {
        let budget = heap_budgets
            .iter()
            .find(|b| b.heap_index == memory_type.heap_index);
        if let Some(budget) = budget {
            if budget.is_over_budget() || (query.budget_aware && budget.available() < query.size) {
                continue;
            }
        }

        let matched = (memory_type.property_flags & query.preferred).as_raw().count_ones();
        let mut score = matched * PREFERRED_FLAG_SCORE;
        if memory_type.is_device_local() {
            score += DEVICE_LOCAL_SCORE;
        }
        score += budget.map(budget_score).unwrap_or(0);

        // strictly greater keeps the lowest index on ties
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((memory_type.index, score)),
        }
    }

    best.map(|(index, _)| index).or_else(|| {
        memory_types
            .iter()
            .find(|t| is_candidate(t, query))
            .map(|t| t.index)
    })
}
