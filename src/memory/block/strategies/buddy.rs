use super::{FreeNode, Placement};
use std::collections::BTreeSet;

pub const DEFAULT_BUDDY_GRANULARITY: u64 = 256;

/// Power-of-two free sets, one per order.
///
/// A node of order `k` is `min_granularity << k` bytes and always starts at a
/// multiple of its own size, so its buddy is `offset ^ size`.
#[derive(Debug, Clone)]
pub struct BuddyFreeLists {
    min_granularity: u64,
    max_order: u32,
    free: Vec<BTreeSet<u64>>,
}

impl BuddyFreeLists {
    /// `total_size` and `min_granularity` must be powers of two with
    /// `total_size >= min_granularity`.
    pub fn new(total_size: u64, min_granularity: u64) -> Self {
        assert!(min_granularity.is_power_of_two());
        assert!(total_size.is_power_of_two() && total_size >= min_granularity);

        let max_order = (total_size / min_granularity).trailing_zeros();
        let mut free = vec![BTreeSet::new(); max_order as usize + 1];
        free[max_order as usize].insert(0);
        Self {
            min_granularity,
            max_order,
            free,
        }
    }

    pub fn min_granularity(&self) -> u64 {
        self.min_granularity
    }

    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    pub fn order_size(&self, order: u32) -> u64 {
        self.min_granularity << order
    }

    /// `log2(size) - log2(min_granularity)` after rounding `size` up to a
    /// power of two of at least one granule.
    pub fn order_for(&self, size: u64, alignment: u64) -> u32 {
        let size = size
            .max(alignment)
            .max(self.min_granularity)
            .next_power_of_two();
        size.trailing_zeros() - self.min_granularity.trailing_zeros()
    }

    /// Smallest non-empty order at or above `order`.
    fn smallest_free_order(&self, order: u32) -> Option<u32> {
        (order..=self.max_order).find(|&o| !self.free[o as usize].is_empty())
    }

    pub fn may_fit(&self, size: u64, alignment: u64) -> bool {
        let order = self.order_for(size, alignment);
        order <= self.max_order && self.smallest_free_order(order).is_some()
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<Placement> {
        let order = self.order_for(size, alignment);
        if order > self.max_order {
            return None;
        }

        let mut current = self.smallest_free_order(order)?;
        let offset = self.free[current as usize].pop_first()?;

        // split down, handing the upper halves back to the free sets
        while current > order {
            current -= 1;
            let half = self.order_size(current);
            self.free[current as usize].insert(offset + half);
        }

        Some(Placement {
            offset,
            aligned_size: self.order_size(order),
        })
    }

    /// Returns a node and merges it with its buddy for as long as the buddy is
    /// free too.
    pub fn free(&mut self, offset: u64, aligned_size: u64) {
        debug_assert!(aligned_size.is_power_of_two());
        let mut order = aligned_size.trailing_zeros() - self.min_granularity.trailing_zeros();
        let mut offset = offset;

        while order < self.max_order {
            let buddy = offset ^ self.order_size(order);
            if !self.free[order as usize].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            order += 1;
        }

        let inserted = self.free[order as usize].insert(offset);
        assert!(inserted, "buddy node at offset {} of order {} freed twice", offset, order);
    }

    pub fn nodes(&self) -> Vec<FreeNode> {
        let mut nodes = self
            .free
            .iter()
            .enumerate()
            .flat_map(|(order, set)| {
                let order = order as u32;
                let size = self.order_size(order);
                set.iter().map(move |&offset| FreeNode {
                    offset,
                    size,
                    order: Some(order),
                })
            })
            .collect::<Vec<_>>();
        nodes.sort_by_key(|n| n.offset);
        nodes
    }

    pub fn len(&self) -> usize {
        self.free.iter().map(BTreeSet::len).sum()
    }

    pub fn largest(&self) -> u64 {
        (0..=self.max_order)
            .rev()
            .find(|&o| !self.free[o as usize].is_empty())
            .map(|o| self.order_size(o))
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.free
            .iter()
            .enumerate()
            .map(|(order, set)| set.len() as u64 * self.order_size(order as u32))
            .sum()
    }
}
