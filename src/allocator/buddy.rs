use std::{mem, ptr::NonNull};

use crate::{
    allocator::{Allocator, MAX_NATIVE_ALIGN},
    page::PageBlock,
};

/// Smallest block the buddy system hands out.
const MIN_BLOCK_SIZE: usize = 64;
/// Levels 0..20 cover block sizes 64 B through 32 MiB.
const MAX_LEVELS: usize = 20;

/// Header written immediately before every live allocation, recording the
/// block size so deallocation can recover the level.
#[repr(C)]
struct Header {
    size: usize,
}

const HEADER_SIZE: usize = mem::size_of::<Header>();

/// Link written into the first word of every free block.
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

/// Power-of-two buddy allocator with automatic coalescing.
///
/// Every allocation is rounded up (header included) to a power of two, no
/// smaller than [`MIN_BLOCK_SIZE`]. Each level keeps a free list of blocks
/// of its size; allocation pops the smallest suitable block and splits it
/// down, deallocation merges a block with its buddy — the sibling at
/// `offset ^ size` — for as long as that buddy is free. Work per operation
/// is bounded by the level count.
///
/// Best suited to long-lived allocations of mixed sizes, where the
/// power-of-two rounding (internal fragmentation) buys freedom from
/// external fragmentation.
pub struct BuddyAllocator {
    region: PageBlock,
    capacity: usize,
    used: usize,
    free_lists: [Option<NonNull<FreeBlock>>; MAX_LEVELS],
}

impl BuddyAllocator {
    /// Create an allocator whose capacity is `capacity` rounded up to the
    /// next power of two.
    ///
    /// The rounded capacity must lie within the level range, i.e. between
    /// 64 B and 32 MiB.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "allocator capacity must be non-zero");
        let capacity = capacity.next_power_of_two();
        assert!(
            (MIN_BLOCK_SIZE..=Self::level_block_size(MAX_LEVELS - 1)).contains(&capacity),
            "capacity must fall within the supported level range"
        );

        let region = PageBlock::allocate(capacity)
            .expect("failed to reserve pages for BuddyAllocator");
        log::trace!("create BuddyAllocator: capacity {}", capacity);

        let mut allocator = BuddyAllocator {
            region,
            capacity,
            used: 0,
            free_lists: [None; MAX_LEVELS],
        };

        // The whole region starts as one free block at the top level.
        let top = Self::level_for(capacity);
        let base = allocator.region.base_addr();
        allocator.push(top, base);
        allocator
    }

    /// Smallest level whose block size is at least `size`.
    fn level_for(size: usize) -> usize {
        let mut block_size = MIN_BLOCK_SIZE;
        let mut level = 0;
        while block_size < size && level < MAX_LEVELS {
            block_size <<= 1;
            level += 1;
        }
        level
    }

    fn level_block_size(level: usize) -> usize {
        MIN_BLOCK_SIZE << level
    }

    fn push(&mut self, level: usize, addr: usize) {
        let node = addr as *mut FreeBlock;
        unsafe { node.write(FreeBlock { next: self.free_lists[level] }) };
        self.free_lists[level] = NonNull::new(node);
    }

    /// Unlink the block at `addr` from the level's free list, if present.
    fn unlink(&mut self, level: usize, addr: usize) -> bool {
        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut curr = self.free_lists[level];

        while let Some(node) = curr {
            let next = unsafe { (*node.as_ptr()).next };
            if node.as_ptr() as usize == addr {
                match prev {
                    Some(p) => unsafe { (*p.as_ptr()).next = next },
                    None => self.free_lists[level] = next,
                }
                return true;
            }
            prev = curr;
            curr = next;
        }
        false
    }

    /// Merge upward while the buddy is free, then insert the result.
    fn coalesce_and_insert(&mut self, addr: usize, mut block_size: usize, mut level: usize) {
        let base = self.region.base_addr();
        let mut offset = addr - base;

        while level < MAX_LEVELS - 1 {
            let buddy_offset = offset ^ block_size;
            if buddy_offset >= self.capacity {
                break;
            }
            if !self.unlink(level, base + buddy_offset) {
                break;
            }
            // The merged block starts at the lower of the two offsets.
            offset = offset.min(buddy_offset);
            block_size <<= 1;
            level += 1;
        }

        self.push(level, base + offset);
    }

    /// Total bytes sitting on the free lists, for accounting checks.
    #[cfg(test)]
    fn free_list_bytes(&self) -> usize {
        (0..MAX_LEVELS)
            .map(|level| self.free_count_at(level) * Self::level_block_size(level))
            .sum()
    }

    #[cfg(test)]
    fn free_count_at(&self, level: usize) -> usize {
        let mut count = 0;
        let mut curr = self.free_lists[level];
        while let Some(node) = curr {
            count += 1;
            curr = unsafe { (*node.as_ptr()).next };
        }
        count
    }
}

impl Allocator for BuddyAllocator {
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "cannot allocate 0 bytes");
        assert!(
            align <= MAX_NATIVE_ALIGN,
            "buddy alignment is limited to the largest native alignment"
        );

        let total = size + HEADER_SIZE;
        let block_size = total.next_power_of_two().max(MIN_BLOCK_SIZE);
        let target = Self::level_for(block_size);

        // Find the smallest level at or above the target with a free block.
        let mut current = target;
        while current < MAX_LEVELS && self.free_lists[current].is_none() {
            current += 1;
        }
        if current >= MAX_LEVELS {
            return None;
        }

        let head = self.free_lists[current]?;
        self.free_lists[current] = unsafe { (*head.as_ptr()).next };
        let addr = head.as_ptr() as usize;

        // Split down, keeping the lower half and parking the upper half.
        while current > target {
            current -= 1;
            let split_size = Self::level_block_size(current);
            self.push(current, addr + split_size);
        }

        unsafe { (addr as *mut Header).write(Header { size: block_size }) };
        self.used += block_size;

        Some(unsafe { NonNull::new_unchecked((addr + HEADER_SIZE) as *mut u8) })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize - HEADER_SIZE;
        let block_size = (*(addr as *const Header)).size;
        let level = Self::level_for(block_size);

        self.used -= block_size;
        self.coalesce_and_insert(addr, block_size, level);
    }

    fn used_memory(&self) -> usize {
        self.used
    }

    fn total_memory(&self) -> usize {
        self.capacity
    }

    fn name(&self) -> &'static str {
        "BuddyAllocator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    /// Free lists plus live blocks must always account for the full region.
    fn assert_conservation(allocator: &BuddyAllocator) {
        assert_eq!(
            allocator.free_list_bytes() + allocator.used_memory(),
            allocator.total_memory()
        );
    }

    #[test]
    fn capacity_rounds_up_to_a_power_of_two() {
        let allocator = BuddyAllocator::new(1000);
        assert_eq!(allocator.total_memory(), 1024);
        assert_eq!(allocator.used_memory(), 0);
        assert_eq!(allocator.name(), "BuddyAllocator");
    }

    #[test]
    fn small_requests_round_up_to_the_minimum_block() {
        let mut allocator = BuddyAllocator::new(1024);
        allocator.allocate(1, 1).unwrap();
        assert_eq!(allocator.used_memory(), MIN_BLOCK_SIZE);
        assert_conservation(&allocator);
    }

    #[test]
    fn request_sizes_include_the_header() {
        let mut allocator = BuddyAllocator::new(1024);
        // 100 + header rounds to 128, 200 + header to 256.
        allocator.allocate(100, 8).unwrap();
        assert_eq!(allocator.used_memory(), 128);
        allocator.allocate(200, 8).unwrap();
        assert_eq!(allocator.used_memory(), 128 + 256);
        assert_conservation(&allocator);
    }

    #[test]
    fn full_round_trip_recovers_the_top_level_block() {
        let mut allocator = BuddyAllocator::new(MIB);

        let a = allocator.allocate(100, 8).unwrap();
        let b = allocator.allocate(200, 8).unwrap();
        unsafe {
            allocator.deallocate(a);
            allocator.deallocate(b);
        }

        assert_eq!(allocator.used_memory(), 0);
        // Everything coalesced back into one block covering the region.
        let top = BuddyAllocator::level_for(MIB);
        assert_eq!(allocator.free_count_at(top), 1);
        for level in 0..top {
            assert_eq!(allocator.free_count_at(level), 0);
        }

        // So the largest possible allocation must succeed again.
        let big = allocator.allocate(MIB - HEADER_SIZE, 8);
        assert!(big.is_some());
        assert_eq!(allocator.used_memory(), MIB);
    }

    #[test]
    fn splitting_parks_upper_halves_on_lower_levels() {
        let mut allocator = BuddyAllocator::new(1024);
        // One 64-byte block out of a 1024-byte region leaves one free buddy
        // on every level below the top.
        allocator.allocate(32, 8).unwrap();
        assert_eq!(allocator.free_count_at(0), 1); // 64
        assert_eq!(allocator.free_count_at(1), 1); // 128
        assert_eq!(allocator.free_count_at(2), 1); // 256
        assert_eq!(allocator.free_count_at(3), 1); // 512
        assert_conservation(&allocator);
    }

    #[test]
    fn returns_none_when_no_level_can_serve() {
        let mut allocator = BuddyAllocator::new(1024);
        assert!(allocator.allocate(2048, 8).is_none());
        assert_eq!(allocator.used_memory(), 0);

        // Fill the region, then ask again.
        let ptr = allocator.allocate(1024 - HEADER_SIZE, 8).unwrap();
        assert!(allocator.allocate(64, 8).is_none());
        unsafe { allocator.deallocate(ptr) };
        assert_eq!(allocator.used_memory(), 0);
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut allocator = BuddyAllocator::new(4096);
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for size in [32, 100, 56, 200, 17] {
            let ptr = allocator.allocate(size, 8).unwrap();
            spans.push((ptr.as_ptr() as usize, size));
        }
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
        assert_conservation(&allocator);
    }

    #[test]
    fn interleaved_frees_coalesce_with_their_buddies() {
        let mut allocator = BuddyAllocator::new(1024);

        let ptrs: Vec<_> = (0..4).map(|_| allocator.allocate(200, 8).unwrap()).collect();
        assert_eq!(allocator.used_memory(), 4 * 256);
        assert_conservation(&allocator);

        // Free in an order that exercises both buddy directions.
        unsafe {
            allocator.deallocate(ptrs[1]);
            allocator.deallocate(ptrs[0]);
            allocator.deallocate(ptrs[3]);
            allocator.deallocate(ptrs[2]);
        }

        let top = BuddyAllocator::level_for(1024);
        assert_eq!(allocator.free_count_at(top), 1);
        assert_conservation(&allocator);
    }

    #[test]
    fn conservation_holds_across_random_churn() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xB0DD);
        let mut allocator = BuddyAllocator::new(64 * 1024);
        let mut live = Vec::new();

        for _ in 0..512 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..2048);
                if let Some(ptr) = allocator.allocate(size, 8) {
                    live.push(ptr);
                }
            } else {
                let index = rng.gen_range(0..live.len());
                let ptr = live.swap_remove(index);
                unsafe { allocator.deallocate(ptr) };
            }
            assert_conservation(&allocator);
            assert!(allocator.used_memory() <= allocator.total_memory());
        }

        for ptr in live {
            unsafe { allocator.deallocate(ptr) };
        }
        assert_eq!(allocator.used_memory(), 0);
        let top = BuddyAllocator::level_for(64 * 1024);
        assert_eq!(allocator.free_count_at(top), 1);
    }

    #[test]
    #[should_panic(expected = "supported level range")]
    fn capacity_beyond_the_top_level_panics() {
        BuddyAllocator::new(64 * MIB);
    }
}
