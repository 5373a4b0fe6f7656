//! Errors returned by the device-memory sub-allocator.
//!
//! The CPU allocators report capacity exhaustion as `None` and never produce
//! error values; these enums cover the GPU path, where the driver itself can
//! fail.

use crate::gpu::{MemoryPropertyFlags, MemoryType};

/// Host or device memory exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OutOfMemory {
    /// Host memory exhausted.
    #[error("out of host memory")]
    Host,

    /// Device memory exhausted.
    #[error("out of device memory")]
    Device,
}

/// Possible cause of mapping failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// Attempt to map memory without the host-visible property.
    #[error("memory is not host-visible and cannot be mapped")]
    HostInvisible,

    /// Attempt to map memory out of bounds.
    #[error("mapping range is out of bounds")]
    OutOfBounds,

    /// Unable to allocate an appropriately sized contiguous virtual address
    /// range.
    #[error("virtual memory mapping failed")]
    MappingFailed,

    /// Out of either host or device memory.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
}

/// Possible cause of allocation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Out of either host or device memory.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    /// No memory type among the requested ones supports the required
    /// properties.
    #[error("no memory type among {type_mask:#06x} supports {properties:?}")]
    NoSuitableMemory {
        /// Allowed memory types, one bit per type index.
        type_mask: u32,
        /// Properties the memory type must support.
        properties: MemoryPropertyFlags,
    },

    /// The pool already holds the configured maximum number of driver
    /// blocks.
    #[error("{memory_type} pool reached its block limit ({max_blocks})")]
    TooManyBlocks {
        /// Pool that ran out of blocks.
        memory_type: MemoryType,
        /// Configured limit.
        max_blocks: u32,
    },

    /// A fresh block could not be mapped for host access.
    #[error(transparent)]
    Mapping(#[from] MappingError),
}
