use super::block::SubAllocation;
use super::{
    Allocation, AllocationStrategy, Block, BlockDesc, MemoryContext, MemoryError, ReleasedMemory,
};
use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct FrameAllocatorDesc {
    pub memory_type_index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
    pub frames_in_flight: usize,
    /// Capacity of each frame's linear block.
    pub block_size: u64,
}

impl Default for FrameAllocatorDesc {
    fn default() -> Self {
        Self {
            memory_type_index: 0,
            property_flags: vk::MemoryPropertyFlags::empty(),
            frames_in_flight: 2,
            block_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatistics {
    pub memory_type_index: u32,
    pub frames_in_flight: usize,
    pub frame_index: u64,
    pub block_size: u64,
    /// Bytes used in the slot of the current frame.
    pub current_frame_bytes: u64,
    pub current_frame_allocations: usize,
}

/// Ring of linear blocks, one per frame in flight.
///
/// Allocations go to the current slot. `begin_frame` moves to the next slot
/// and resets it, so an allocation stays valid for `frames_in_flight - 1`
/// further frames.
pub struct FrameAllocator {
    desc: FrameAllocatorDesc,
    context: Arc<MemoryContext>,
    blocks: Vec<Block>,
    current: AtomicUsize,
    frame_index: AtomicU64,
    advance: Mutex<()>,
}

impl Drop for FrameAllocator {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            self.context.destroy_block(block);
        }
    }
}

impl FrameAllocator {
    /// Reserves every slot up front.
    pub fn new(desc: FrameAllocatorDesc, context: Arc<MemoryContext>) -> Result<Self, MemoryError> {
        if desc.frames_in_flight == 0 {
            return Err(MemoryError::InvalidRequest(
                "a frame ring needs at least one frame in flight".into(),
            ));
        }

        let mut blocks = Vec::with_capacity(desc.frames_in_flight);
        for _ in 0..desc.frames_in_flight {
            let block = context.create_block(&BlockDesc {
                size: desc.block_size,
                memory_type_index: desc.memory_type_index,
                property_flags: desc.property_flags,
                strategy: AllocationStrategy::Linear,
                ..Default::default()
            });
            match block {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    for block in blocks {
                        context.destroy_block(block);
                    }
                    return Err(e);
                }
            }
        }
        log::info!(
            "Created frame ring of {} x {} bytes in memory type {}",
            desc.frames_in_flight,
            desc.block_size,
            desc.memory_type_index
        );

        Ok(Self {
            desc,
            context,
            blocks,
            current: AtomicUsize::new(0),
            frame_index: AtomicU64::new(0),
            advance: Mutex::new(()),
        })
    }

    pub fn memory_type_index(&self) -> u32 {
        self.desc.memory_type_index
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index.load(Ordering::Acquire)
    }

    fn current_block(&self) -> &Block {
        &self.blocks[self.current.load(Ordering::Acquire)]
    }

    pub(crate) fn allocate_with(
        &self,
        request: &SubAllocation<'_>,
    ) -> Result<Allocation, MemoryError> {
        self.current_block()
            .allocate_with(request)
            .ok_or(MemoryError::Exhausted {
                size: request.size,
                memory_type_index: self.desc.memory_type_index,
            })
    }

    /// Moves to the next slot and resets it, returning what was reclaimed.
    pub fn begin_frame(&self) -> ReleasedMemory {
        let _advance = self.advance.lock();
        let next = (self.current.load(Ordering::Acquire) + 1) % self.blocks.len();
        let released = self.blocks[next].reset();
        self.current.store(next, Ordering::Release);
        self.frame_index.fetch_add(1, Ordering::AcqRel);
        released
    }

    pub fn statistics(&self) -> FrameStatistics {
        let block = self.current_block();
        FrameStatistics {
            memory_type_index: self.desc.memory_type_index,
            frames_in_flight: self.desc.frames_in_flight,
            frame_index: self.frame_index(),
            block_size: self.desc.block_size,
            current_frame_bytes: block.allocated_bytes(),
            current_frame_allocations: block.allocation_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceBackend, MockBackend, MockBackendDesc};
    use crate::memory::MemoryUsage;
    use std::panic::Location;
    use std::time::Duration;

    fn request(size: u64) -> SubAllocation<'static> {
        SubAllocation {
            size,
            alignment: 1,
            usage: MemoryUsage::FrameTransient,
            debug_name: "transient",
            location: Location::caller(),
        }
    }

    fn test_ring(frames_in_flight: usize) -> (Arc<MockBackend>, FrameAllocator) {
        let mock = Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let backend: Arc<dyn DeviceBackend> = mock.clone();
        let context = Arc::new(MemoryContext::new(backend, Duration::ZERO));
        let ring = FrameAllocator::new(
            FrameAllocatorDesc {
                memory_type_index: 1,
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                frames_in_flight,
                block_size: 4096,
            },
            context,
        )
        .unwrap();
        (mock, ring)
    }

    #[test]
    fn test_slot_is_reset_when_ring_wraps() {
        let (mock, ring) = test_ring(2);
        assert_eq!(mock.live_reservations(), 2);

        let first = ring.allocate_with(&request(1000)).unwrap();
        first.write_bytes(0, &[1; 16]).unwrap();

        // Frame 1 uses the other slot; frame 0's data stays valid.
        assert_eq!(ring.begin_frame(), ReleasedMemory::default());
        let second = ring.allocate_with(&request(1000)).unwrap();
        assert_eq!(second.offset(), 0);
        assert_ne!(second.block_id(), first.block_id());
        assert!(!first.is_freed());

        // Frame 2 is back on slot 0, which gets reset.
        let released = ring.begin_frame();
        assert_eq!(released, ReleasedMemory { count: 1, bytes: 1000 });
        assert!(first.is_freed());
        assert!(!second.is_freed());
        assert_eq!(ring.frame_index(), 2);
    }

    #[test]
    fn test_full_slot_reports_exhaustion() {
        let (_mock, ring) = test_ring(2);
        ring.allocate_with(&request(4000)).unwrap();
        assert!(matches!(
            ring.allocate_with(&request(100)),
            Err(MemoryError::Exhausted { size: 100, memory_type_index: 1 })
        ));
        ring.begin_frame();
        assert!(ring.allocate_with(&request(100)).is_ok());
    }

    #[test]
    fn test_zero_frames_is_rejected() {
        let backend: Arc<dyn DeviceBackend> =
            Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let context = Arc::new(MemoryContext::new(backend, Duration::ZERO));
        let desc = FrameAllocatorDesc {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(
            FrameAllocator::new(desc, context),
            Err(MemoryError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_failed_reservation_releases_earlier_slots() {
        let mock = Arc::new(MockBackend::new(MockBackendDesc::discrete()));
        let backend: Arc<dyn DeviceBackend> = mock.clone();
        let context = Arc::new(MemoryContext::new(backend, Duration::ZERO));
        // The first slot takes all of heap 0, the second one cannot fit.
        let desc = FrameAllocatorDesc {
            frames_in_flight: 2,
            block_size: 256 * 1024 * 1024,
            memory_type_index: 0,
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        assert!(FrameAllocator::new(desc, context).is_err());
        assert_eq!(mock.live_reservations(), 0);
    }

    #[test]
    fn test_concurrent_transient_allocations() {
        let (_mock, ring) = test_ring(3);
        let all = std::thread::scope(|s| {
            let handles = (0..4)
                .map(|_| {
                    let ring = &ring;
                    s.spawn(move || {
                        (0..10)
                            .map(|_| ring.allocate_with(&request(64)).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        let mut offsets = all.iter().map(Allocation::offset).collect::<Vec<_>>();
        offsets.sort();
        offsets.dedup();
        assert_eq!(offsets.len(), 40);
        assert_eq!(ring.statistics().current_frame_bytes, 40 * 64);
    }
}
