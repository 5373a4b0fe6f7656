//! Device-memory sub-allocator.
//!
//! Drivers cap the number of live device-memory objects (commonly around
//! 4096), so memory is grabbed in few large blocks and sub-allocated from
//! their free-region lists. One pool per logical memory type, each behind
//! its own lock; pools are created lazily on first use.

use std::{fmt, ptr::NonNull};

use parking_lot::Mutex;

use crate::error::{AllocationError, OutOfMemory};

mod block;
mod device;
mod stats;

#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use self::{
    device::{Device, MemoryProperties, MemoryPropertyFlags, MemoryRequirements, MemoryTypeInfo},
    stats::GpuMemoryStats,
};

use self::block::MemoryBlock;

/// Logical memory types the allocator pools by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// GPU-only memory; fastest for device access. Textures, vertex and
    /// index buffers.
    DeviceLocal = 0,
    /// CPU-writable, device-readable. Staging and dynamic buffers.
    HostVisible = 1,
    /// Device-writable, CPU-readable through the cache. Readback.
    HostCached = 2,
}

impl MemoryType {
    /// All pools, in deallocation-routing order.
    const ROUTING: [MemoryType; 3] = [
        MemoryType::HostVisible,
        MemoryType::HostCached,
        MemoryType::DeviceLocal,
    ];

    /// Every memory type.
    pub const ALL: [MemoryType; 3] = [
        MemoryType::DeviceLocal,
        MemoryType::HostVisible,
        MemoryType::HostCached,
    ];

    /// The property flags a pool of this type requires.
    pub fn properties(self) -> MemoryPropertyFlags {
        match self {
            MemoryType::DeviceLocal => MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryType::HostVisible => {
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryType::HostCached => {
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED
            }
        }
    }

    fn host_visible(self) -> bool {
        !matches!(self, MemoryType::DeviceLocal)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryType::DeviceLocal => "DeviceLocal",
            MemoryType::HostVisible => "HostVisible",
            MemoryType::HostCached => "HostCached",
        })
    }
}

/// Configuration for [`GpuAllocator`].
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GpuConfig {
    /// Size of each driver block. Keep it big; the driver allocation count
    /// is the scarce resource.
    pub block_size: u64,

    /// Maximum number of blocks per pool.
    pub max_blocks: u32,

    /// Trace every sub-allocation through the log.
    pub enable_tracking: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        GpuConfig {
            block_size: 256 * 1024 * 1024,
            max_blocks: 64,
            enable_tracking: true,
        }
    }
}

/// Handle to one sub-allocation.
///
/// Exposes the driver memory object, offset, size and mapped pointer so the
/// memory can be bound to buffers or images without a further lookup. The
/// handle is consumed by [`GpuAllocator::deallocate`].
#[derive(Debug)]
pub struct GpuAllocation<M> {
    memory: M,
    offset: u64,
    size: u64,
    mapped: Option<NonNull<u8>>,
    block_index: u32,
    type_index: u32,
}

unsafe impl<M: Send> Send for GpuAllocation<M> {}
unsafe impl<M: Sync> Sync for GpuAllocation<M> {}

impl<M: Copy> GpuAllocation<M> {
    /// The driver memory object this allocation lives in.
    pub fn memory(&self) -> M {
        self.memory
    }

    /// Offset within the memory object.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Allocated size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Persistent mapping at this allocation's offset, if the memory is
    /// host-visible.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }
}

struct MemoryPool<M> {
    memory_type: MemoryType,
    type_index: u32,
    block_size: u64,
    blocks: Vec<MemoryBlock<M>>,
}

/// Thread-safe device-memory allocator.
///
/// Generic over the [`Device`] seam; construct with
/// [`vulkan::VulkanDevice`] for the real driver. Any two operations on the
/// same pool exclude each other; operations on different pools proceed in
/// parallel. Mapping, flush and invalidate do not take the pool lock.
///
/// [`vulkan::VulkanDevice`]: crate::gpu::vulkan::VulkanDevice
pub struct GpuAllocator<D: Device> {
    device: D,
    properties: MemoryProperties,
    config: GpuConfig,
    pools: [Mutex<Option<MemoryPool<D::Memory>>>; 3],
}

impl<D: Device> GpuAllocator<D> {
    /// Create an allocator over `device`, snapshotting its memory topology.
    pub fn new(device: D, config: GpuConfig) -> Self {
        let properties = device.memory_properties();
        log::info!(
            "gpu allocator initialized: {} MiB blocks, {} blocks per pool max",
            config.block_size / (1024 * 1024),
            config.max_blocks,
        );
        GpuAllocator {
            device,
            properties,
            config,
            pools: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
        }
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// First memory type allowed by `type_mask` that supports `properties`.
    fn find_memory_type(&self, type_mask: u32, properties: MemoryPropertyFlags) -> Option<u32> {
        self.properties
            .types
            .iter()
            .enumerate()
            .find(|&(index, info)| {
                type_mask & (1u32 << index) != 0 && info.properties.contains(properties)
            })
            .map(|(index, _)| index as u32)
    }

    /// Run `f` against the pool for `memory_type`, creating it on first
    /// use. `type_mask` constrains which driver types may back the pool and
    /// must admit an existing pool's resolved type.
    fn with_pool<R>(
        &self,
        memory_type: MemoryType,
        type_mask: u32,
        f: impl FnOnce(&mut MemoryPool<D::Memory>) -> Result<R, AllocationError>,
    ) -> Result<R, AllocationError> {
        let mut guard = self.pools[memory_type.index()].lock();

        if guard.is_none() {
            let required = memory_type.properties();
            let type_index = self.find_memory_type(type_mask, required).ok_or_else(|| {
                log::error!(
                    "no suitable memory type (mask {:#06x}, properties {:?})",
                    type_mask,
                    required
                );
                AllocationError::NoSuitableMemory {
                    type_mask,
                    properties: required,
                }
            })?;
            log::trace!("create {} pool: memory type index {}", memory_type, type_index);
            *guard = Some(MemoryPool {
                memory_type,
                type_index,
                block_size: self.config.block_size,
                blocks: Vec::new(),
            });
        }

        let pool = guard.as_mut().expect("pool was just created");
        if type_mask & (1u32 << pool.type_index) == 0 {
            log::error!(
                "{} pool is backed by memory type {} which mask {:#06x} excludes",
                memory_type,
                pool.type_index,
                type_mask
            );
            return Err(AllocationError::NoSuitableMemory {
                type_mask,
                properties: memory_type.properties(),
            });
        }

        f(pool)
    }

    /// Allocate `size` bytes aligned to `align` from the pool for
    /// `memory_type`.
    ///
    /// This path constrains the backing memory only by property flags; for
    /// memory that must be bound to a specific resource, prefer
    /// [`allocate_for_buffer`](GpuAllocator::allocate_for_buffer) and
    /// [`allocate_for_image`](GpuAllocator::allocate_for_image), which
    /// honor the resource's allowed-type mask.
    pub fn allocate(
        &self,
        size: u64,
        align: u64,
        memory_type: MemoryType,
    ) -> Result<GpuAllocation<D::Memory>, AllocationError> {
        assert!(size > 0, "cannot allocate 0 bytes");
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        self.with_pool(memory_type, !0u32, |pool| {
            self.allocate_from(pool, size, align)
        })
    }

    /// Allocate memory suitable for binding `buffer`.
    pub fn allocate_for_buffer(
        &self,
        buffer: &D::Buffer,
        memory_type: MemoryType,
    ) -> Result<GpuAllocation<D::Memory>, AllocationError> {
        let requirements = self.device.buffer_requirements(buffer);
        self.allocate_with_requirements(requirements, memory_type)
    }

    /// Allocate memory suitable for binding `image`.
    pub fn allocate_for_image(
        &self,
        image: &D::Image,
        memory_type: MemoryType,
    ) -> Result<GpuAllocation<D::Memory>, AllocationError> {
        let requirements = self.device.image_requirements(image);
        self.allocate_with_requirements(requirements, memory_type)
    }

    fn allocate_with_requirements(
        &self,
        requirements: MemoryRequirements,
        memory_type: MemoryType,
    ) -> Result<GpuAllocation<D::Memory>, AllocationError> {
        assert!(requirements.size > 0, "cannot allocate 0 bytes");

        self.with_pool(memory_type, requirements.type_mask, |pool| {
            self.allocate_from(pool, requirements.size, requirements.alignment.max(1))
        })
    }

    fn allocate_from(
        &self,
        pool: &mut MemoryPool<D::Memory>,
        size: u64,
        align: u64,
    ) -> Result<GpuAllocation<D::Memory>, AllocationError> {
        // Existing blocks first, in order.
        for index in 0..pool.blocks.len() {
            if let Some(offset) = pool.blocks[index].allocate(size, align) {
                return Ok(self.make_handle(&pool.blocks[index], index, offset, size));
            }
        }

        if pool.blocks.len() as u32 >= self.config.max_blocks {
            log::error!(
                "{} pool reached its block limit ({} blocks)",
                pool.memory_type,
                self.config.max_blocks
            );
            return Err(AllocationError::TooManyBlocks {
                memory_type: pool.memory_type,
                max_blocks: self.config.max_blocks,
            });
        }

        // Oversized requests get an oversized block so the first
        // allocation below cannot fail.
        let block_size = pool.block_size.max(size + align);
        self.allocate_block(pool, block_size)?;

        let index = pool.blocks.len() - 1;
        let offset = pool.blocks[index]
            .allocate(size, align)
            .expect("a fresh block always satisfies its first allocation");
        Ok(self.make_handle(&pool.blocks[index], index, offset, size))
    }

    fn allocate_block(
        &self,
        pool: &mut MemoryPool<D::Memory>,
        size: u64,
    ) -> Result<(), AllocationError> {
        let memory = unsafe { self.device.allocate(pool.type_index, size) }.map_err(|error| {
            log::error!(
                "failed to allocate {} MiB block ({}): {}",
                size / (1024 * 1024),
                pool.memory_type,
                error
            );
            error
        })?;

        let mapped = if pool.memory_type.host_visible() {
            match unsafe { self.device.map(&memory, 0..size) } {
                Ok(ptr) => Some(ptr),
                Err(error) => {
                    log::error!("failed to map fresh {} block: {}", pool.memory_type, error);
                    unsafe { self.device.free(memory) };
                    return Err(error.into());
                }
            }
        } else {
            None
        };

        log::info!(
            "allocated new {} block: {} MiB",
            pool.memory_type,
            size / (1024 * 1024)
        );
        pool.blocks
            .push(MemoryBlock::new(memory, size, pool.type_index, mapped));
        Ok(())
    }

    fn make_handle(
        &self,
        block: &MemoryBlock<D::Memory>,
        block_index: usize,
        offset: u64,
        size: u64,
    ) -> GpuAllocation<D::Memory> {
        if self.config.enable_tracking {
            log::trace!(
                "suballocate {} B at offset {} (block {}, type {})",
                size,
                offset,
                block_index,
                block.type_index
            );
        }
        GpuAllocation {
            memory: block.memory,
            offset,
            size,
            mapped: block.mapped_at(offset),
            block_index: block_index as u32,
            type_index: block.type_index,
        }
    }

    /// Return an allocation to its block and coalesce the freed region with
    /// its neighbours.
    pub fn deallocate(&self, allocation: GpuAllocation<D::Memory>) {
        for memory_type in MemoryType::ROUTING {
            let mut guard = self.pools[memory_type.index()].lock();
            let Some(pool) = guard.as_mut() else {
                continue;
            };
            if pool.type_index != allocation.type_index {
                continue;
            }

            let index = allocation.block_index as usize;
            if index >= pool.blocks.len() {
                log::error!("invalid block index {} in deallocation", index);
                return;
            }

            if self.config.enable_tracking {
                log::trace!(
                    "free {} B at offset {} (block {}, type {})",
                    allocation.size,
                    allocation.offset,
                    index,
                    allocation.type_index
                );
            }
            pool.blocks[index].deallocate(allocation.offset, allocation.size);
            return;
        }

        log::error!(
            "deallocation does not match any live pool (memory type index {})",
            allocation.type_index
        );
    }

    /// The persistent mapping for a host-visible allocation; `None` for
    /// device-local memory.
    pub fn map(&self, allocation: &GpuAllocation<D::Memory>) -> Option<NonNull<u8>> {
        if allocation.mapped.is_none() {
            log::warn!("mapping non-host-visible memory is not supported");
        }
        allocation.mapped
    }

    /// No-op; mappings are persistent for the lifetime of their block.
    pub fn unmap(&self, _allocation: &GpuAllocation<D::Memory>) {}

    /// Make host writes to the allocation available to the device.
    pub fn flush(&self, allocation: &GpuAllocation<D::Memory>) -> Result<(), OutOfMemory> {
        if allocation.mapped.is_none() {
            return Ok(());
        }
        unsafe {
            self.device.flush(
                &allocation.memory,
                allocation.offset..allocation.offset + allocation.size,
            )
        }
    }

    /// Make device writes to the allocation visible to the host.
    pub fn invalidate(&self, allocation: &GpuAllocation<D::Memory>) -> Result<(), OutOfMemory> {
        if allocation.mapped.is_none() {
            return Ok(());
        }
        unsafe {
            self.device.invalidate(
                &allocation.memory,
                allocation.offset..allocation.offset + allocation.size,
            )
        }
    }

    /// Usage statistics for the pool of `memory_type`. Zeroes if the pool
    /// has not been created yet.
    pub fn stats(&self, memory_type: MemoryType) -> GpuMemoryStats {
        let guard = self.pools[memory_type.index()].lock();
        match guard.as_ref() {
            None => GpuMemoryStats::default(),
            Some(pool) => {
                let block_count = pool.blocks.len();
                let fragmentation = if block_count == 0 {
                    0.0
                } else {
                    pool.blocks
                        .iter()
                        .map(MemoryBlock::fragmentation)
                        .sum::<f32>()
                        / block_count as f32
                };
                GpuMemoryStats {
                    allocated_bytes: pool.blocks.iter().map(|block| block.used).sum(),
                    total_bytes: pool.blocks.iter().map(|block| block.size).sum(),
                    allocation_count: pool.blocks.iter().map(|block| block.allocations).sum(),
                    block_count,
                    fragmentation_ratio: fragmentation,
                }
            }
        }
    }

    /// Dump per-pool statistics through the logger.
    pub fn print_stats(&self) {
        log::info!("=== GPU memory statistics ===");
        for memory_type in MemoryType::ALL {
            if self.pools[memory_type.index()].lock().is_none() {
                continue;
            }
            log::info!("{}: {}", memory_type, self.stats(memory_type));
        }
    }

    /// Every block must be exactly tiled by its allocations and free
    /// regions.
    #[cfg(test)]
    pub(crate) fn assert_block_conservation(&self, memory_type: MemoryType) {
        let guard = self.pools[memory_type.index()].lock();
        if let Some(pool) = guard.as_ref() {
            for block in &pool.blocks {
                assert_eq!(block.used + block.free_bytes(), block.size);
            }
        }
    }
}

impl<D: Device> Drop for GpuAllocator<D> {
    fn drop(&mut self) {
        for slot in &self.pools {
            let mut guard = slot.lock();
            if let Some(pool) = guard.take() {
                for block in pool.blocks {
                    unsafe {
                        if block.mapped.is_some() {
                            self.device.unmap(&block.memory);
                        }
                        self.device.free(block.memory);
                    }
                }
            }
        }
        log::info!("gpu allocator shut down");
    }
}
