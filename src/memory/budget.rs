use crate::backend::{DeviceBackend, HeapBudgetReport, MemoryHeap};
use crate::util::RateLimiter;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Share of a heap assumed usable when the device reports no budget.
pub const DEFAULT_BUDGET_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBudget {
    pub heap_index: u32,
    pub heap_size: u64,
    pub budget: u64,
    pub usage: u64,
}

impl HeapBudget {
    pub fn available(&self) -> u64 {
        self.budget.saturating_sub(self.usage)
    }

    pub fn is_over_budget(&self) -> bool {
        self.usage >= self.budget
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    report: Option<HeapBudgetReport>,
    // our own reservations at the time of the report, so later ones can be
    // added on top without querying again
    reserved_at_refresh: u64,
}

/// Per-heap usage as seen by this allocator plus the last device report.
pub struct BudgetTracker {
    backend: Arc<dyn DeviceBackend>,
    heaps: Vec<MemoryHeap>,
    reserved: Vec<AtomicU64>,
    snapshots: RwLock<Vec<Snapshot>>,
    limiter: RateLimiter,
}

impl BudgetTracker {
    pub fn new(backend: Arc<dyn DeviceBackend>, refresh_interval: Duration) -> Self {
        let heaps = backend.memory_heaps();
        let tracker = Self {
            reserved: heaps.iter().map(|_| AtomicU64::new(0)).collect(),
            snapshots: RwLock::new(vec![Snapshot::default(); heaps.len()]),
            heaps,
            backend,
            limiter: RateLimiter::new(refresh_interval),
        };
        tracker.refresh(true);
        tracker
    }

    pub fn record_reserve(&self, heap_index: u32, bytes: u64) {
        self.reserved[heap_index as usize].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_release(&self, heap_index: u32, bytes: u64) {
        self.reserved[heap_index as usize].fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Bytes this allocator currently holds in the heap.
    pub fn reserved_bytes(&self, heap_index: u32) -> u64 {
        self.reserved[heap_index as usize].load(Ordering::Relaxed)
    }

    /// Queries the backend again, at most once per refresh interval unless
    /// `force` is set. Returns whether a query happened.
    pub fn refresh(&self, force: bool) -> bool {
        if force {
            self.limiter.mark();
        } else if !self.limiter.try_acquire() {
            return false;
        }

        let reports = self.backend.query_budget();
        let mut snapshots = self.snapshots.write();
        for (heap, snapshot) in self.heaps.iter().zip(snapshots.iter_mut()) {
            *snapshot = Snapshot {
                report: reports
                    .as_ref()
                    .and_then(|r| r.iter().find(|r| r.heap_index == heap.index).copied()),
                reserved_at_refresh: self.reserved_bytes(heap.index),
            };
        }
        log::debug!(
            "Refreshed heap budgets ({})",
            if reports.is_some() { "reported" } else { "estimated" }
        );
        true
    }

    pub fn heap_budget(&self, heap_index: u32) -> HeapBudget {
        let heap = &self.heaps[heap_index as usize];
        let snapshot = self.snapshots.read()[heap_index as usize];
        let reserved = self.reserved_bytes(heap_index);

        match snapshot.report {
            Some(report) => HeapBudget {
                heap_index,
                heap_size: heap.size,
                budget: report.budget,
                usage: (report.usage + reserved).saturating_sub(snapshot.reserved_at_refresh),
            },
            None => HeapBudget {
                heap_index,
                heap_size: heap.size,
                budget: (heap.size as f64 * DEFAULT_BUDGET_FRACTION) as u64,
                usage: reserved,
            },
        }
    }

    pub fn heap_budgets(&self) -> Vec<HeapBudget> {
        self.heaps.iter().map(|h| self.heap_budget(h.index)).collect()
    }
}
