use std::{mem, ptr::NonNull};

use crate::allocator::{Allocator, RawPool, MAX_NATIVE_ALIGN};

/// Size-class allocator built from one pool per class.
///
/// Size classes are rounded up to powers of two at construction and must
/// come out strictly ascending. Each class owns an independent pool of
/// `objects_per_slab` slots; requests route to the smallest class that
/// fits. A request larger than every class, or one that hits an exhausted
/// class, returns `None` — there is no spill into larger classes and no
/// fallback allocation.
///
/// Deallocation finds the owning pool by address range, an `O(K)` scan over
/// the class array rather than anything proportional to the number of live
/// allocations.
pub struct SlabAllocator {
    slabs: Vec<RawPool>,
    classes: Vec<usize>,
}

impl SlabAllocator {
    /// Create one pool of `objects_per_slab` slots per size class.
    ///
    /// Panics if `size_classes` is empty, contains zero, or is not strictly
    /// ascending once rounded to powers of two.
    pub fn new(objects_per_slab: usize, size_classes: &[usize]) -> Self {
        assert!(objects_per_slab > 0, "objects_per_slab must be non-zero");
        assert!(
            !size_classes.is_empty(),
            "at least one size class is required"
        );

        let classes: Vec<usize> = size_classes
            .iter()
            .map(|&class| {
                assert!(class > 0, "size classes must be non-zero");
                class.next_power_of_two().max(mem::size_of::<*mut u8>())
            })
            .collect();
        assert!(
            classes.windows(2).all(|pair| pair[0] < pair[1]),
            "size classes must be sorted ascending"
        );

        log::trace!(
            "create SlabAllocator: {} objects per slab, classes {:?}",
            objects_per_slab,
            classes
        );

        let slabs = classes
            .iter()
            .map(|&class| RawPool::new(class, objects_per_slab))
            .collect();

        SlabAllocator { slabs, classes }
    }

    fn class_index(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|&class| size <= class)
    }

    /// Mark every slot in every slab free again. In-use objects are not
    /// dropped.
    pub fn reset(&mut self) {
        for slab in &mut self.slabs {
            slab.rebuild_free_list();
        }
    }

    /// Number of size classes.
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// The rounded size classes, ascending.
    pub fn size_classes(&self) -> &[usize] {
        &self.classes
    }

    /// Objects currently allocated from the class at `index`.
    pub fn slab_used_count(&self, index: usize) -> usize {
        self.slabs[index].used_count()
    }

    /// Slots still available in the class at `index`.
    pub fn slab_free_count(&self, index: usize) -> usize {
        self.slabs[index].free_count()
    }
}

impl Allocator for SlabAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "cannot allocate 0 bytes");
        assert!(
            align <= MAX_NATIVE_ALIGN,
            "slab alignment is limited to the largest native alignment"
        );

        let index = self.class_index(size)?;
        self.slabs[index].allocate()
    }

    /// Routes the pointer back to the pool whose region contains it.
    /// A pointer owned by no pool is a programming error and panics.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        for slab in &mut self.slabs {
            if slab.contains(ptr) {
                slab.deallocate(ptr);
                return;
            }
        }
        panic!("pointer was not allocated from this SlabAllocator");
    }

    fn used_memory(&self) -> usize {
        self.slabs
            .iter()
            .map(|slab| slab.used_count() * slab.slot_size())
            .sum()
    }

    fn total_memory(&self) -> usize {
        self.slabs
            .iter()
            .map(|slab| slab.capacity() * slab.slot_size())
            .sum()
    }

    fn name(&self) -> &'static str {
        "SlabAllocator"
    }
}
