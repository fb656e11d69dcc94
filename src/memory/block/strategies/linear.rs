use super::Placement;
use crate::util::align_up;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bump pointer advanced with compare-and-swap.
#[derive(Debug)]
pub struct LinearCursor {
    capacity: u64,
    head: AtomicU64,
}

impl LinearCursor {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            head: AtomicU64::new(0),
        }
    }

    /// Claims `size` bytes after the head, retrying in place on contention.
    pub fn allocate(&self, size: u64, alignment: u64) -> Option<Placement> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let offset = align_up(head, alignment);
            let end = offset.checked_add(size)?;
            if end > self.capacity {
                return None;
            }
            match self
                .head
                .compare_exchange_weak(head, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    return Some(Placement {
                        offset,
                        aligned_size: size,
                    })
                }
                Err(current) => head = current,
            }
        }
    }

    pub fn may_fit(&self, size: u64, alignment: u64) -> bool {
        align_up(self.head(), alignment).saturating_add(size) <= self.capacity
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.head.store(0, Ordering::Release);
    }
}
