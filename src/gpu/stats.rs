use std::fmt;

/// Memory usage of one GPU pool, as returned by
/// [`GpuAllocator::stats`](crate::gpu::GpuAllocator::stats).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GpuMemoryStats {
    /// Bytes handed out to live allocations.
    pub allocated_bytes: u64,
    /// Capacity across every block of the pool.
    pub total_bytes: u64,
    /// Live allocations.
    pub allocation_count: u64,
    /// Driver blocks backing the pool.
    pub block_count: usize,
    /// 0.0 = contiguous free space, approaching 1.0 = badly shattered.
    /// Arithmetic mean of the per-block ratios.
    pub fragmentation_ratio: f32,
}

impl fmt::Display for GpuMemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: u64 = 1024 * 1024;

        let used_percent = if self.total_bytes > 0 {
            self.allocated_bytes as f32 * 100.0 / self.total_bytes as f32
        } else {
            0.0
        };

        write!(
            f,
            "{} MiB / {} MiB ({:.1}%), {} allocations in {} blocks, {:.1}% fragmented",
            self.allocated_bytes / MIB,
            self.total_bytes / MIB,
            used_percent,
            self.allocation_count,
            self.block_count,
            self.fragmentation_ratio * 100.0,
        )
    }
}
