use std::ptr::NonNull;

use crate::{allocator::Allocator, page::PageBlock, util::align_up};

/// Snapshot of a [`LinearAllocator`] cursor.
///
/// Only valid against the allocator that produced it. Resetting to a marker
/// frees everything allocated after it was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker(usize);

/// Bump allocator for frame- or parse-scoped workloads.
///
/// Allocates by advancing a cursor through a fixed region; individual
/// deallocation is a no-op. All outputs are released together through
/// [`reset`](LinearAllocator::reset) or rolled back to a [`Marker`].
/// Allocation is a pointer bump, reset is a single store.
pub struct LinearAllocator {
    region: PageBlock,
    current: usize,
}

impl LinearAllocator {
    /// Create an allocator backed by `capacity` bytes of fresh pages.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "allocator capacity must be non-zero");
        let region = PageBlock::allocate(capacity)
            .expect("failed to reserve pages for LinearAllocator");
        log::trace!("create LinearAllocator: capacity {}", capacity);
        LinearAllocator { region, current: 0 }
    }

    /// Release every allocation at once by rewinding the cursor.
    ///
    /// Does not drop previously returned objects; callers are responsible.
    pub fn reset(&mut self) {
        self.current = 0;
    }

    /// Capture the current cursor.
    pub fn marker(&self) -> Marker {
        Marker(self.current)
    }

    /// Rewind to a previously captured marker, freeing everything allocated
    /// after it.
    ///
    /// Panics if the marker does not lie within this allocator's region.
    pub fn reset_to(&mut self, marker: Marker) {
        assert!(
            marker.0 <= self.region.size(),
            "marker is outside the allocator region"
        );
        self.current = marker.0;
    }
}

impl Allocator for LinearAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "cannot allocate 0 bytes");
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        // Align the absolute address, not the offset, so the contract holds
        // for whatever base the page layer handed us.
        let current_addr = self.region.base_addr() + self.current;
        let aligned_addr = align_up(current_addr, align);
        let padding = aligned_addr - current_addr;
        let required = padding + size;

        if required > self.region.size() - self.current {
            return None;
        }

        self.current += required;
        // In range of the owned region, hence non-null.
        Some(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) })
    }

    unsafe fn deallocate(&mut self, _ptr: NonNull<u8>) {
        // Individual deallocation is a no-op; use reset or markers.
    }

    fn used_memory(&self) -> usize {
        self.current
    }

    fn total_memory(&self) -> usize {
        self.region.size()
    }

    fn name(&self) -> &'static str {
        "LinearAllocator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_initializes_correctly() {
        let allocator = LinearAllocator::new(1024);
        assert_eq!(allocator.used_memory(), 0);
        assert_eq!(allocator.total_memory(), 1024);
        assert_eq!(allocator.name(), "LinearAllocator");
    }

    #[test]
    fn allocations_are_sequential_and_counted() {
        let mut allocator = LinearAllocator::new(1024);

        let a = allocator.allocate(64, 8).unwrap();
        let b = allocator.allocate(64, 8).unwrap();
        let c = allocator.allocate(64, 8).unwrap();

        assert!((b.as_ptr() as usize) > (a.as_ptr() as usize));
        assert!((c.as_ptr() as usize) > (b.as_ptr() as usize));
        assert_eq!(allocator.used_memory(), 192);
    }

    #[test]
    fn allocate_respects_alignment() {
        let mut allocator = LinearAllocator::new(1024);
        for align in [16, 32, 64] {
            let ptr = allocator.allocate(10, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
        }
    }

    #[test]
    fn misaligned_cursor_gets_padded() {
        let mut allocator = LinearAllocator::new(1024);

        let a = allocator.allocate(1, 1).unwrap();
        let b = allocator.allocate(4, 16).unwrap();

        assert_eq!(b.as_ptr() as usize % 16, 0);
        let span = b.as_ptr() as usize - a.as_ptr() as usize;
        assert_eq!(allocator.used_memory(), span + 4);
    }

    #[test]
    fn alignment_of_one_adds_no_padding() {
        let mut allocator = LinearAllocator::new(1024);
        allocator.allocate(3, 1).unwrap();
        assert_eq!(allocator.used_memory(), 3);
        allocator.allocate(5, 1).unwrap();
        assert_eq!(allocator.used_memory(), 8);
    }

    #[test]
    fn returns_none_when_out_of_memory() {
        let mut allocator = LinearAllocator::new(128);

        assert!(allocator.allocate(100, 8).is_some());
        assert!(allocator.allocate(50, 8).is_none());
        // A failed allocation leaves the state untouched.
        assert_eq!(allocator.used_memory(), 100);
    }

    #[test]
    fn oversized_request_fails_without_mutating_state() {
        let mut allocator = LinearAllocator::new(1024);
        assert!(allocator.allocate(2048, 8).is_none());
        assert_eq!(allocator.used_memory(), 0);
    }

    #[test]
    fn reset_replays_the_same_addresses() {
        let mut allocator = LinearAllocator::new(1024);

        let first: Vec<usize> = (0..4)
            .map(|_| allocator.allocate(48, 16).unwrap().as_ptr() as usize)
            .collect();

        allocator.reset();
        assert_eq!(allocator.used_memory(), 0);

        let second: Vec<usize> = (0..4)
            .map(|_| allocator.allocate(48, 16).unwrap().as_ptr() as usize)
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn double_reset_is_idempotent() {
        let mut allocator = LinearAllocator::new(256);
        allocator.allocate(64, 8).unwrap();
        allocator.reset();
        allocator.reset();
        assert_eq!(allocator.used_memory(), 0);
    }

    #[test]
    fn marker_round_trip_is_a_noop() {
        let mut allocator = LinearAllocator::new(1024);
        allocator.allocate(100, 8).unwrap();

        let marker = allocator.marker();
        allocator.reset_to(marker);
        assert_eq!(allocator.used_memory(), 100);
    }

    #[test]
    fn marker_rolls_back_later_allocations() {
        let mut allocator = LinearAllocator::new(1024);
        allocator.allocate(100, 4).unwrap();

        let marker = allocator.marker();
        allocator.allocate(200, 4).unwrap();
        assert_eq!(allocator.used_memory(), 300);

        allocator.reset_to(marker);
        assert_eq!(allocator.used_memory(), 100);
    }

    #[test]
    #[should_panic(expected = "cannot allocate 0 bytes")]
    fn zero_size_allocation_panics() {
        let mut allocator = LinearAllocator::new(256);
        let _ = allocator.allocate(0, 8);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_alignment_panics() {
        let mut allocator = LinearAllocator::new(256);
        let _ = allocator.allocate(8, 3);
    }
}
