use super::{FreeNode, Placement};
use crate::util::align_up;
use std::collections::{BTreeMap, BTreeSet};

/// Free ranges of a block indexed both by offset and by size.
///
/// Adjacent ranges never coexist once inserted through `insert_coalesced`.
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    by_offset: BTreeMap<u64, u64>,
    by_size: BTreeSet<(u64, u64)>,
}

impl FreeList {
    /// A list holding a single node that spans `[0, total_size)`.
    pub fn new(total_size: u64) -> Self {
        let mut list = Self::default();
        list.insert(0, total_size);
        list
    }

    fn insert(&mut self, offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.by_offset.insert(offset, size);
        self.by_size.insert((size, offset));
    }

    fn remove(&mut self, offset: u64) -> Option<u64> {
        let size = self.by_offset.remove(&offset)?;
        self.by_size.remove(&(size, offset));
        Some(size)
    }

    /// Inserts a freed range, merging it with the free neighbours it touches.
    pub fn insert_coalesced(&mut self, offset: u64, size: u64) {
        let mut start = offset;
        let mut end = offset + size;

        let prev = self
            .by_offset
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = prev {
            debug_assert!(
                prev_offset + prev_size <= offset,
                "free range overlaps its predecessor"
            );
            if prev_offset + prev_size == offset {
                self.remove(prev_offset);
                start = prev_offset;
            }
        }

        let next = self.by_offset.range(end..).next().map(|(&o, &s)| (o, s));
        if let Some((next_offset, next_size)) = next {
            if next_offset == end {
                self.remove(next_offset);
                end += next_size;
            }
        }

        self.insert(start, end - start);
    }

    /// Takes `placement` out of the node at `node_offset`, putting the front
    /// padding and the back remainder back as free nodes.
    pub fn carve(&mut self, node_offset: u64, placement: Placement) {
        let node_size = self
            .remove(node_offset)
            .expect("carving from a node that is not free");
        let node_end = node_offset + node_size;
        let alloc_end = placement.offset + placement.aligned_size;
        debug_assert!(placement.offset >= node_offset && alloc_end <= node_end);

        // both neighbours of the node are allocated, so no coalescing is needed
        self.insert(node_offset, placement.offset - node_offset);
        self.insert(alloc_end, node_end - alloc_end);
    }

    /// Where an allocation would land inside a node, if it fits at all.
    pub fn fit_in_node(
        node_offset: u64,
        node_size: u64,
        aligned_size: u64,
        alignment: u64,
    ) -> Option<Placement> {
        let offset = align_up(node_offset, alignment);
        let end = offset.checked_add(aligned_size)?;
        (end <= node_offset + node_size).then_some(Placement {
            offset,
            aligned_size,
        })
    }

    pub fn iter_by_offset(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_offset.iter().map(|(&o, &s)| (o, s))
    }

    /// Nodes of at least `min_size` bytes, smallest first.
    pub fn iter_by_size_from(&self, min_size: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.by_size.range((min_size, 0)..).map(|&(s, o)| (o, s))
    }

    pub fn nodes(&self) -> Vec<FreeNode> {
        self.iter_by_offset()
            .map(|(offset, size)| FreeNode {
                offset,
                size,
                order: None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }

    pub fn largest(&self) -> u64 {
        self.by_size.last().map(|&(size, _)| size).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.by_offset.values().sum()
    }
}
