//! Memory management for the Kiln engine.
//!
//! Two families of allocators, each trading generality for predictability:
//!
//! - [`allocator`] — single-threaded CPU allocators over fixed page-backed
//!   regions: linear and stack bump allocators, a fixed-size object pool, a
//!   size-class slab and a power-of-two buddy system. All of them share the
//!   [`Allocator`] contract, return `None` instead of growing or falling
//!   back to the system heap, and cost O(1) or O(log n) per operation.
//! - [`gpu`] — a thread-safe device-memory sub-allocator that grabs few
//!   large driver blocks and hands out sub-ranges with first-fit placement
//!   and free-region coalescing, keeping the process well under the
//!   driver's allocation-count ceiling. Backed by Vulkan through `ash`
//!   behind the `vulkan` feature.

#![deny(unused_must_use)]

mod page;
mod util;

pub mod allocator;
pub mod error;
pub mod gpu;

pub use crate::{
    allocator::{
        Allocator, BuddyAllocator, LinearAllocator, Marker, PoolAllocator, SlabAllocator,
        StackAllocator, StackMarker,
    },
    error::{AllocationError, MappingError, OutOfMemory},
    gpu::{
        Device, GpuAllocation, GpuAllocator, GpuConfig, GpuMemoryStats, MemoryProperties,
        MemoryPropertyFlags, MemoryRequirements, MemoryType, MemoryTypeInfo,
    },
};

#[cfg(test)]
mod test;
