use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free allocation counters.
///
/// Updated alongside (never under) the allocator locks so statistics reads do
/// not contend with allocation traffic.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    allocated_bytes: AtomicU64,
    allocation_count: AtomicU64,
    peak_bytes: AtomicU64,
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub allocated_bytes: u64,
    pub allocation_count: u64,
    pub peak_bytes: u64,
    pub total_allocations: u64,
    pub total_frees: u64,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocation(&self, bytes: u64) {
        let now = self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(now, Ordering::Relaxed);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self, bytes: u64) {
        self.record_bulk_free(1, bytes);
    }

    pub fn record_bulk_free(&self, count: u64, bytes: u64) {
        if count == 0 {
            return;
        }
        self.allocated_bytes.fetch_sub(bytes, Ordering::Relaxed);
        self.allocation_count.fetch_sub(count, Ordering::Relaxed);
        self.total_frees.fetch_add(count, Ordering::Relaxed);
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
        }
    }
}
