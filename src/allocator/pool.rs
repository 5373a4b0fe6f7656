use std::{marker::PhantomData, mem, ptr::NonNull};

use crate::{allocator::Allocator, page::PageBlock};

/// Link written into the first word of every free slot.
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

/// Untyped pool of equally sized slots with an intrusive free list.
///
/// The list is threaded through the first word of each free slot, so a free
/// cell costs nothing beyond the slot itself. Backs [`PoolAllocator`] and
/// the per-class pools of [`SlabAllocator`].
///
/// [`SlabAllocator`]: crate::allocator::SlabAllocator
pub(crate) struct RawPool {
    region: PageBlock,
    head: Option<NonNull<FreeSlot>>,
    slot_size: usize,
    capacity: usize,
    used_count: usize,
}

impl RawPool {
    pub(crate) fn new(slot_size: usize, capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be non-zero");
        // A free slot stores the list link in place of the object.
        assert!(slot_size >= mem::size_of::<*mut u8>());

        let region = PageBlock::allocate(slot_size * capacity)
            .expect("failed to reserve pages for pool");
        let mut pool = RawPool {
            region,
            head: None,
            slot_size,
            capacity,
            used_count: 0,
        };
        pool.rebuild_free_list();
        pool
    }

    /// Thread every slot onto the free list, front to back. Leaves the pool
    /// in its initial state; in-use objects are not dropped.
    ///
    /// Link accesses are unaligned: an odd slot size places slots off the
    /// pointer alignment, and the link must not widen the slot.
    pub(crate) fn rebuild_free_list(&mut self) {
        let base = self.region.as_ptr().as_ptr();
        unsafe {
            for i in 0..self.capacity {
                let slot = base.add(i * self.slot_size) as *mut FreeSlot;
                let next = if i + 1 < self.capacity {
                    NonNull::new(base.add((i + 1) * self.slot_size) as *mut FreeSlot)
                } else {
                    None
                };
                slot.write_unaligned(FreeSlot { next });
            }
            self.head = Some(NonNull::new_unchecked(base as *mut FreeSlot));
        }
        self.used_count = 0;
    }

    /// Pop the free-list head. `None` when the pool is exhausted.
    pub(crate) fn allocate(&mut self) -> Option<NonNull<u8>> {
        let slot = self.head?;
        self.head = unsafe { slot.as_ptr().read_unaligned().next };
        self.used_count += 1;
        Some(slot.cast())
    }

    /// Push a slot back onto the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must be a slot previously returned by `allocate` on this pool.
    pub(crate) unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        assert!(
            self.used_count > 0,
            "deallocate called more times than allocate"
        );
        let slot = ptr.cast::<FreeSlot>();
        slot.as_ptr().write_unaligned(FreeSlot { next: self.head });
        self.head = Some(slot);
        self.used_count -= 1;
    }

    pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(ptr.as_ptr() as usize)
    }

    pub(crate) fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn used_count(&self) -> usize {
        self.used_count
    }

    pub(crate) fn free_count(&self) -> usize {
        self.capacity - self.used_count
    }
}

/// Fixed-size object pool with O(1) allocation and deallocation.
///
/// Pre-allocates `capacity` slots of `max(size_of::<T>, pointer)` bytes and
/// recycles them through the intrusive free list. There is no fragmentation
/// and no per-object metadata; an exhausted pool returns `None` rather than
/// allocating elsewhere. Suited to entities, components, particles and
/// other objects with a churning, uniform lifecycle.
pub struct PoolAllocator<T> {
    pool: RawPool,
    _marker: PhantomData<T>,
}

impl<T> PoolAllocator<T> {
    /// Create a pool with room for `capacity` objects.
    pub fn new(capacity: usize) -> Self {
        let slot_size = mem::size_of::<T>().max(mem::size_of::<*mut u8>());
        log::trace!(
            "create PoolAllocator: {} slots of {} bytes",
            capacity,
            slot_size
        );
        PoolAllocator {
            pool: RawPool::new(slot_size, capacity),
            _marker: PhantomData,
        }
    }

    /// Allocate a slot and move `value` into it.
    ///
    /// Returns `None` when the pool is exhausted; `value` is dropped in
    /// that case.
    pub fn alloc_value(&mut self, value: T) -> Option<NonNull<T>> {
        let ptr = self.pool.allocate()?.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Some(ptr)
    }

    /// Drop the object in place and return its slot to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc_value`](PoolAllocator::alloc_value) on
    /// this pool and must not be used afterwards.
    pub unsafe fn free_value(&mut self, ptr: NonNull<T>) {
        ptr.as_ptr().drop_in_place();
        self.pool.deallocate(ptr.cast());
    }

    /// Mark every slot free again. Does not drop in-use objects.
    pub fn reset(&mut self) {
        self.pool.rebuild_free_list();
    }

    /// Maximum number of objects.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Objects currently allocated.
    pub fn used_count(&self) -> usize {
        self.pool.used_count()
    }

    /// Objects still available.
    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }
}

impl<T> Allocator for PoolAllocator<T> {
    /// Hand out one slot. `size` and `align` are validated against `T` and
    /// otherwise ignored; the pool only serves whole slots.
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(
            size <= mem::size_of::<T>(),
            "pool can only allocate up to size_of::<T>() bytes"
        );
        assert!(
            align <= mem::align_of::<T>(),
            "pool alignment is limited to align_of::<T>()"
        );
        self.pool.allocate()
    }

    /// No ownership validation is performed; returning a pointer that does
    /// not belong to this pool is undefined.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.pool.deallocate(ptr);
    }

    fn used_memory(&self) -> usize {
        self.pool.used_count() * mem::size_of::<T>()
    }

    fn total_memory(&self) -> usize {
        self.pool.capacity() * mem::size_of::<T>()
    }

    fn name(&self) -> &'static str {
        "PoolAllocator"
    }
}
