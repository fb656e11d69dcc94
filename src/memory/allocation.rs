use super::{AllocationStrategy, BlockId, MemoryError, MemoryUsage};
use crate::backend::{DeviceBackend, DeviceMemory};
use crate::util::{align_down, align_up};
use ash::vk;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Host pointer into mapped device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MappedPtr(NonNull<u8>);

// the allocator hands out disjoint ranges, synchronizing access to one range is
// left to the owner of the allocation
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub(crate) fn add(self, offset: u64) -> Self {
        Self(unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset as usize)) })
    }

    pub(crate) fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Where an allocation came from, which decides how it is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Carved from a pool block, freed individually.
    Pooled,
    /// Carved from a frame ring block, freed when the ring slot is reset.
    Linear,
    /// A backend reservation of its own.
    Dedicated,
}

pub(crate) struct AllocationInfo<'a> {
    pub offset: u64,
    pub size: u64,
    pub aligned_size: u64,
    pub alignment: u64,
    pub block_id: BlockId,
    pub kind: AllocationKind,
    pub strategy: Option<AllocationStrategy>,
    pub usage: MemoryUsage,
    pub memory_type_index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
    pub memory: DeviceMemory,
    pub memory_size: u64,
    /// Mapped pointer to the start of the backing memory, not of the allocation.
    pub mapped_base: Option<MappedPtr>,
    /// Device address of the start of the backing memory.
    pub base_address: Option<u64>,
    pub backend: &'a Arc<dyn DeviceBackend>,
    pub debug_name: &'a str,
    pub location: &'static Location<'static>,
}

struct AllocationInner {
    offset: u64,
    size: u64,
    aligned_size: u64,
    alignment: u64,
    block_id: BlockId,
    kind: AllocationKind,
    strategy: Option<AllocationStrategy>,
    usage: MemoryUsage,
    memory_type_index: u32,
    property_flags: vk::MemoryPropertyFlags,
    memory: DeviceMemory,
    memory_size: u64,
    mapped: Option<MappedPtr>,
    device_address: Option<u64>,
    backend: Arc<dyn DeviceBackend>,
    debug_name: String,
    location: &'static Location<'static>,
    ref_count: AtomicI64,
    freed: AtomicBool,
}

/// Handle to one claimed region of device memory.
///
/// Cloning the handle is free and does not touch the reference count; the
/// count is driven explicitly through [`Allocation::add_ref`] and
/// [`Allocation::release`]. Releasing never frees memory: when `release`
/// reports zero it is up to the caller to hand the allocation back to the
/// allocator.
#[derive(Clone)]
pub struct Allocation(Arc<AllocationInner>);

impl Allocation {
    pub(crate) fn new(info: AllocationInfo<'_>) -> Self {
        debug_assert!(info.size <= info.aligned_size);
        debug_assert_eq!(info.offset % info.alignment.max(1), 0);
        Self(Arc::new(AllocationInner {
            offset: info.offset,
            size: info.size,
            aligned_size: info.aligned_size,
            alignment: info.alignment,
            block_id: info.block_id,
            kind: info.kind,
            strategy: info.strategy,
            usage: info.usage,
            memory_type_index: info.memory_type_index,
            property_flags: info.property_flags,
            memory: info.memory,
            memory_size: info.memory_size,
            mapped: info.mapped_base.map(|base| base.add(info.offset)),
            device_address: info.base_address.map(|base| base + info.offset),
            backend: info.backend.clone(),
            debug_name: info.debug_name.to_owned(),
            location: info.location,
            ref_count: AtomicI64::new(1),
            freed: AtomicBool::new(false),
        }))
    }

    /// Byte offset inside the backing device memory.
    pub fn offset(&self) -> u64 {
        self.0.offset
    }

    /// Size the caller asked for.
    pub fn size(&self) -> u64 {
        self.0.size
    }

    /// Bytes the owning block set aside, at least `size`.
    pub fn aligned_size(&self) -> u64 {
        self.0.aligned_size
    }

    pub fn alignment(&self) -> u64 {
        self.0.alignment
    }

    pub fn block_id(&self) -> BlockId {
        self.0.block_id
    }

    pub fn kind(&self) -> AllocationKind {
        self.0.kind
    }

    /// Strategy of the owning block, `None` for dedicated allocations.
    pub fn strategy(&self) -> Option<AllocationStrategy> {
        self.0.strategy
    }

    pub fn usage(&self) -> MemoryUsage {
        self.0.usage
    }

    pub fn memory_type_index(&self) -> u32 {
        self.0.memory_type_index
    }

    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.0.property_flags
    }

    /// Backend memory to bind resources to, together with `offset`.
    pub fn memory(&self) -> DeviceMemory {
        self.0.memory
    }

    pub fn device_address(&self) -> Option<u64> {
        self.assert_live();
        self.0.device_address
    }

    pub fn debug_name(&self) -> &str {
        &self.0.debug_name
    }

    /// Source location of the call that made this allocation.
    pub fn allocation_site(&self) -> &'static Location<'static> {
        self.0.location
    }

    pub fn is_freed(&self) -> bool {
        self.0.freed.load(Ordering::Acquire)
    }

    pub fn is_host_visible(&self) -> bool {
        self.0.mapped.is_some()
    }

    pub fn is_host_coherent(&self) -> bool {
        self.0
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    pub fn ref_count(&self) -> i64 {
        self.0.ref_count.load(Ordering::Acquire)
    }

    /// Takes one more reference and returns a handle for it.
    pub fn add_ref(&self) -> Allocation {
        self.assert_live();
        self.0.ref_count.fetch_add(1, Ordering::AcqRel);
        self.clone()
    }

    /// Drops one reference; true when none are left.
    ///
    /// The allocation stays live either way.
    pub fn release(&self) -> bool {
        let previous = self.0.ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            panic!(
                "reference count of allocation '{}' (block {}, offset {}) dropped below zero, allocated at {}",
                self.0.debug_name, self.0.block_id, self.0.offset, self.0.location
            );
        }
        previous == 1
    }

    /// Same allocation, not just an equal one.
    pub fn ptr_eq(&self, other: &Allocation) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Bounds-checked view of `len` bytes starting `offset` bytes into the
    /// allocation.
    pub fn mapped_view(&self, offset: u64, len: u64) -> Result<MappedView<'_>, MemoryError> {
        self.assert_live();
        let mapped = self.0.mapped.ok_or_else(|| MemoryError::NotHostVisible {
            name: self.0.debug_name.clone(),
        })?;
        let end = offset.checked_add(len).unwrap_or(u64::MAX);
        if end > self.0.size {
            return Err(MemoryError::OutOfBounds {
                name: self.0.debug_name.clone(),
                offset,
                end,
                size: self.0.size,
            });
        }
        Ok(MappedView {
            ptr: mapped.add(offset),
            len: len as usize,
            _allocation: PhantomData,
        })
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.mapped_view(offset, data.len() as u64)?.write(data);
        Ok(())
    }

    pub fn write_floats(&self, offset: u64, data: &[f32]) -> Result<(), MemoryError> {
        self.write_slice(offset, data)
    }

    pub fn write_u32s(&self, offset: u64, data: &[u32]) -> Result<(), MemoryError> {
        self.write_slice(offset, data)
    }

    pub fn write_slice<T: bytemuck::Pod>(
        &self,
        offset: u64,
        data: &[T],
    ) -> Result<(), MemoryError> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    pub fn write_pod<T: bytemuck::Pod>(&self, offset: u64, value: &T) -> Result<(), MemoryError> {
        self.write_bytes(offset, bytemuck::bytes_of(value))
    }

    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>, MemoryError> {
        let view = self.mapped_view(offset, len)?;
        let mut out = vec![0u8; view.len()];
        view.read(&mut out);
        Ok(out)
    }

    /// Makes host writes in the range visible to the device.
    pub fn flush(&self, offset: u64, len: u64) -> Result<(), MemoryError> {
        match self.non_coherent_range(offset, len)? {
            Some((start, size)) => Ok(self.0.backend.flush_range(self.0.memory, start, size)?),
            None => Ok(()),
        }
    }

    /// Makes device writes in the range visible to the host.
    pub fn invalidate(&self, offset: u64, len: u64) -> Result<(), MemoryError> {
        match self.non_coherent_range(offset, len)? {
            Some((start, size)) => Ok(self
                .0
                .backend
                .invalidate_range(self.0.memory, start, size)?),
            None => Ok(()),
        }
    }

    /// Range in backing memory widened to the atom size, `None` when coherent.
    fn non_coherent_range(&self, offset: u64, len: u64) -> Result<Option<(u64, u64)>, MemoryError> {
        // validates liveness, mapping and bounds
        self.mapped_view(offset, len)?;
        if self.is_host_coherent() || len == 0 {
            return Ok(None);
        }
        let atom = self.0.backend.non_coherent_atom_size().max(1);
        let start = align_down(self.0.offset + offset, atom);
        let end = align_up(self.0.offset + offset + len, atom).min(self.0.memory_size);
        Ok(Some((start, end - start)))
    }

    /// Flags the allocation freed, returns whether it already was.
    pub(crate) fn mark_freed(&self) -> bool {
        self.0.freed.swap(true, Ordering::AcqRel)
    }

    fn assert_live(&self) {
        if self.is_freed() {
            panic!(
                "use of freed allocation '{}' (block {}, offset {}), allocated at {}",
                self.0.debug_name, self.0.block_id, self.0.offset, self.0.location
            );
        }
    }
}

impl Debug for Allocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("name", &self.0.debug_name)
            .field("block", &self.0.block_id)
            .field("kind", &self.0.kind)
            .field("offset", &self.0.offset)
            .field("size", &self.0.size)
            .field("aligned_size", &self.0.aligned_size)
            .field("memory_type_index", &self.0.memory_type_index)
            .field("ref_count", &self.ref_count())
            .field("freed", &self.is_freed())
            .finish()
    }
}

/// Window into the host-mapped bytes of one allocation.
pub struct MappedView<'a> {
    ptr: MappedPtr,
    len: usize,
    _allocation: PhantomData<&'a Allocation>,
}

impl MappedView<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Copies `data` to the start of the view. Panics if it does not fit.
    pub fn write(&self, data: &[u8]) {
        assert!(
            data.len() <= self.len,
            "write of {} bytes into a view of {}",
            data.len(),
            self.len
        );
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.as_ptr(), data.len()) };
    }

    /// Copies the start of the view into `out`. Panics if `out` is longer.
    pub fn read(&self, out: &mut [u8]) {
        assert!(out.len() <= self.len, "read of {} bytes from a view of {}", out.len(), self.len);
        unsafe { std::ptr::copy_nonoverlapping(self.as_ptr(), out.as_mut_ptr(), out.len()) };
    }

    /// # Safety
    ///
    /// No one may write the same bytes (host or device) while the slice lives.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(), self.len)
    }

    /// # Safety
    ///
    /// No one else may access the same bytes while the slice lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_ptr(), self.len)
    }
}
