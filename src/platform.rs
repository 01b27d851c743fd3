//! Target platform descriptors.
//!
//! The allocators are parameterized over a platform: where the static frame
//! region lives, which zero-page bytes the allocator may hand out, and where
//! the compiler scratch cells sit.  The C64 is the reference target; other
//! Commodore machines supply their own ranges and the algorithms are
//! unchanged.

use std::ops::Range;

/// Number of consecutive zero-page bytes reserved as compiler scratch.  The
/// scratch cells are used by the runtime arithmetic helpers, by indirect
/// memory access when no zero-page pointer is available, and for breaking
/// cycles in parallel PHI copies.
pub const SCRATCH_SIZE: u8 = 4;

/// A platform configuration.
#[derive(Clone, Debug)]
pub struct Platform {
    pub name: &'static str,
    /// RAM range available for static frames.
    pub frame_region: Range<u16>,
    /// Zero-page pool the allocator draws from.  CPU-reserved bytes and the
    /// scratch cells must not be part of this range.
    pub zp_pool: Range<u8>,
    /// First of the [SCRATCH_SIZE] compiler scratch cells.
    pub scratch: u8,
    /// Warn when a non-recursive call chain is deeper than this.  The
    /// hardware stack is 256 bytes on every 6502, and each frame on it costs
    /// two bytes of return address.
    pub call_depth_warning: u32,
    /// Minimum priority score for promoting a slot without a zero-page
    /// directive.
    pub zp_score_threshold: u64,
    /// Warn when a single function frame is larger than this many bytes.
    pub large_frame_warning: u16,
}

impl Platform {
    /// The reference platform: Commodore 64.
    ///
    /// `$0000/$0001` are the CPU port, `$FB-$FE` is compiler scratch, frames
    /// live in the `$0200-$03FF` region and the allocatable zero-page pool is
    /// `$02-$8F`.
    pub fn c64() -> Platform {
        Platform {
            name: "c64",
            frame_region: 0x0200..0x0400,
            zp_pool: 0x02..0x90,
            scratch: 0xFB,
            call_depth_warning: 24,
            zp_score_threshold: 400,
            large_frame_warning: 64,
        }
    }

    /// The scratch cells, lowest first.
    pub fn scratch_cells(&self) -> [u8; SCRATCH_SIZE as usize] {
        [
            self.scratch,
            self.scratch + 1,
            self.scratch + 2,
            self.scratch + 3,
        ]
    }

    /// Total number of bytes in the frame region.
    pub fn frame_capacity(&self) -> u32 {
        self.frame_region.end as u32 - self.frame_region.start as u32
    }

    /// Total number of allocatable zero-page bytes.
    pub fn zp_capacity(&self) -> u32 {
        self.zp_pool.end as u32 - self.zp_pool.start as u32
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::c64()
    }
}
