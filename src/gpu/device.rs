use std::{fmt, ops::Range, ptr::NonNull};

use crate::error::{MappingError, OutOfMemory};

bitflags::bitflags! {
    /// Properties of a device memory type.
    ///
    /// Bit values match the Vulkan memory property flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MemoryPropertyFlags: u32 {
        /// Fastest memory for device access; may not be host-accessible.
        const DEVICE_LOCAL = 0x1;
        /// Host-mappable.
        const HOST_VISIBLE = 0x2;
        /// Host writes are visible to the device without explicit flushes.
        const HOST_COHERENT = 0x4;
        /// Host reads go through the CPU cache; fast readback.
        const HOST_CACHED = 0x8;
    }
}

/// One memory type reported by the driver.
#[derive(Clone, Copy, Debug)]
pub struct MemoryTypeInfo {
    /// Properties this type supports.
    pub properties: MemoryPropertyFlags,
    /// Heap the type allocates from.
    pub heap_index: u32,
}

/// Snapshot of the driver's memory topology, taken once at allocator
/// construction and treated as immutable afterwards.
#[derive(Clone, Debug, Default)]
pub struct MemoryProperties {
    /// Available memory types; a type's index is its position here.
    pub types: Vec<MemoryTypeInfo>,
    /// Heap sizes in bytes.
    pub heaps: Vec<u64>,
}

/// Size, alignment and allowed memory types for a buffer or image.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRequirements {
    /// Required allocation size in bytes.
    pub size: u64,
    /// Required offset alignment; a power of two.
    pub alignment: u64,
    /// Allowed memory types, one bit per type index.
    pub type_mask: u32,
}

/// Driver seam for device-memory allocation and mapping.
///
/// Implemented for the Vulkan device behind the `vulkan` feature; tests run
/// against a mock. Calls may block inside the driver but never call back
/// into the allocator.
pub trait Device {
    /// Driver memory object. A cheap handle, compared when routing
    /// deallocations.
    type Memory: Copy + PartialEq + fmt::Debug;

    /// Buffer handle used by the memory-requirements query.
    type Buffer;

    /// Image handle used by the memory-requirements query.
    type Image;

    /// Query memory types and heaps.
    fn memory_properties(&self) -> MemoryProperties;

    /// Allocate one driver memory object of `size` bytes from the type at
    /// `type_index`.
    ///
    /// # Safety
    ///
    /// `type_index` must be a valid index into the reported memory types.
    unsafe fn allocate(&self, type_index: u32, size: u64) -> Result<Self::Memory, OutOfMemory>;

    /// Free a driver memory object.
    ///
    /// # Safety
    ///
    /// `memory` must come from [`allocate`](Device::allocate) on this
    /// device, must be unmapped, and must not be used afterwards.
    unsafe fn free(&self, memory: Self::Memory);

    /// Map `range` of a memory object into host address space.
    ///
    /// # Safety
    ///
    /// The memory must be host-visible, not currently mapped, and `range`
    /// must lie within it.
    unsafe fn map(
        &self,
        memory: &Self::Memory,
        range: Range<u64>,
    ) -> Result<NonNull<u8>, MappingError>;

    /// Release a mapping made by [`map`](Device::map).
    ///
    /// # Safety
    ///
    /// The memory must currently be mapped.
    unsafe fn unmap(&self, memory: &Self::Memory);

    /// Make host writes to `range` available to the device.
    ///
    /// # Safety
    ///
    /// The memory must be mapped and `range` must lie within it.
    unsafe fn flush(&self, memory: &Self::Memory, range: Range<u64>) -> Result<(), OutOfMemory>;

    /// Make device writes to `range` visible to the host.
    ///
    /// # Safety
    ///
    /// The memory must be mapped and `range` must lie within it.
    unsafe fn invalidate(
        &self,
        memory: &Self::Memory,
        range: Range<u64>,
    ) -> Result<(), OutOfMemory>;

    /// Memory requirements for binding `buffer`.
    fn buffer_requirements(&self, buffer: &Self::Buffer) -> MemoryRequirements;

    /// Memory requirements for binding `image`.
    fn image_requirements(&self, image: &Self::Image) -> MemoryRequirements;
}
