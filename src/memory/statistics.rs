use super::{CounterSnapshot, DedicatedStatistics, FrameStatistics, HeapBudget, PoolStatistics};
use comfy_table::{Cell, Table};
use indexmap::IndexMap;

/// Everything the allocator knows about its memory at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorStatistics {
    /// Keyed by memory type, in the order pools were first used.
    pub pools: IndexMap<u32, PoolStatistics>,
    pub frames: IndexMap<u32, FrameStatistics>,
    pub heaps: Vec<HeapBudget>,
    pub dedicated: DedicatedStatistics,
    pub totals: CounterSnapshot,
}

fn mib(bytes: u64) -> String {
    format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
}

impl AllocatorStatistics {
    pub fn reserved_bytes(&self) -> u64 {
        self.pools.values().map(|p| p.reserved_bytes).sum::<u64>()
            + self
                .frames
                .values()
                .map(|f| f.block_size * f.frames_in_flight as u64)
                .sum::<u64>()
            + self.dedicated.bytes
    }

    /// One row per pool, frame ring and heap, followed by the totals.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.set_header(vec![
            Cell::new("Source"),
            Cell::new("Blocks"),
            Cell::new("Allocations"),
            Cell::new("Used"),
            Cell::new("Reserved"),
            Cell::new("Note"),
        ]);

        for (memory_type, pool) in &self.pools {
            let fragmented = pool
                .blocks
                .iter()
                .filter(|b| b.needs_defragmentation)
                .count();
            table.add_row(vec![
                Cell::new(format!("pool type {}", memory_type)),
                Cell::new(pool.block_count),
                Cell::new(pool.allocation_count),
                Cell::new(mib(pool.allocated_bytes)),
                Cell::new(mib(pool.reserved_bytes)),
                Cell::new(format!("{:?}, {} fragmented", pool.strategy, fragmented)),
            ]);
        }

        for (memory_type, frame) in &self.frames {
            table.add_row(vec![
                Cell::new(format!("frames type {}", memory_type)),
                Cell::new(frame.frames_in_flight),
                Cell::new(frame.current_frame_allocations),
                Cell::new(mib(frame.current_frame_bytes)),
                Cell::new(mib(frame.block_size * frame.frames_in_flight as u64)),
                Cell::new(format!("frame {}", frame.frame_index)),
            ]);
        }

        table.add_row(vec![
            Cell::new("dedicated"),
            Cell::new(self.dedicated.allocation_count),
            Cell::new(self.dedicated.allocation_count),
            Cell::new(mib(self.dedicated.bytes)),
            Cell::new(mib(self.dedicated.bytes)),
            Cell::new(""),
        ]);

        for heap in &self.heaps {
            table.add_row(vec![
                Cell::new(format!("heap {}", heap.heap_index)),
                Cell::new("-"),
                Cell::new("-"),
                Cell::new(mib(heap.usage)),
                Cell::new(mib(heap.heap_size)),
                Cell::new(format!("budget {}", mib(heap.budget))),
            ]);
        }

        table.add_row(vec![
            Cell::new("total"),
            Cell::new("-"),
            Cell::new(self.totals.allocation_count),
            Cell::new(mib(self.totals.allocated_bytes)),
            Cell::new(mib(self.reserved_bytes())),
            Cell::new(format!("peak {}", mib(self.totals.peak_bytes))),
        ]);
        table
    }

    pub fn log_summary(&self) {
        log::debug!("\n{}", self.to_table());
    }
}
