//! CPU-side fixed-region allocators.
//!
//! Each allocator owns one page-layer region and implements a distinct
//! policy for handing out pieces of it. They are strictly single-threaded:
//! every operation takes `&mut self` and callers provide any external
//! synchronization. None of them fall back to the system heap; an exhausted
//! allocator returns `None` and leaves its state untouched.

use std::ptr::NonNull;

mod buddy;
mod linear;
mod pool;
mod slab;
mod stack;

pub use self::{
    buddy::BuddyAllocator,
    linear::{LinearAllocator, Marker},
    pool::PoolAllocator,
    slab::SlabAllocator,
    stack::{StackAllocator, StackMarker},
};

pub(crate) use self::pool::RawPool;

/// Largest fundamental alignment the allocators serve without generating
/// extra padding (16 on 64-bit targets).
pub(crate) const MAX_NATIVE_ALIGN: usize = 2 * std::mem::size_of::<usize>();

/// Contract shared by every CPU allocator.
///
/// Concrete allocators are meant to be used monomorphically on hot paths;
/// the trait exists for the places that hold a heterogeneous set of them.
pub trait Allocator {
    /// Allocate `size` bytes aligned to `align`.
    ///
    /// Returns `None` when the request cannot be satisfied; the allocator
    /// state is unchanged and the call may be retried after freeing.
    ///
    /// `size` must be non-zero and `align` a power of two; violations are
    /// programming errors and panic.
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Return a pointer to the allocator.
    ///
    /// Bump allocators document this as a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator and
    /// must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Bytes currently allocated, including any alignment padding the
    /// policy cannot recover.
    fn used_memory(&self) -> usize;

    /// Total capacity in bytes.
    fn total_memory(&self) -> usize;

    /// Allocator name for diagnostics.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocators_are_usable_through_the_trait() {
        let mut allocators: Vec<Box<dyn Allocator>> = vec![
            Box::new(LinearAllocator::new(4096)),
            Box::new(StackAllocator::new(4096)),
            Box::new(PoolAllocator::<[u64; 8]>::new(64)),
            Box::new(SlabAllocator::new(16, &[32, 64, 128])),
            Box::new(BuddyAllocator::new(4096)),
        ];

        for alloc in &mut allocators {
            let ptr = alloc.allocate(32, 8).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 8, 0);
            assert!(alloc.used_memory() > 0);
            assert!(alloc.used_memory() <= alloc.total_memory());
            unsafe { alloc.deallocate(ptr) };
        }
    }
}
