//! # Freelist Allocators
//!
//! General-purpose best-fit allocation with block splitting and coalescing
//! over any number of upstream extents.
//!
//! Both variants run the same algorithm on the same block arena; they
//! differ in how `deallocate` finds the block that owns a handle:
//!
//! | variant                   | handle      | block lookup                             |
//! |---------------------------|-------------|------------------------------------------|
//! | [`HostFreelistAllocator`]   | `HostPtr`   | header written just before the user range |
//! | [`DeviceFreelistAllocator`] | `DeviceAddress` | linear scan of the resident list      |
//!
//! ## Allocation
//!
//! ```text
//!  free block                      chosen block        split-off tail
//! +--------------------------+    +------+--------+   +-------------+
//! |                          | => | pad  |  user  |   |    free     |
//! +--------------------------+    +------+--------+   +-------------+
//!                                 begin  ^aligned     ^user_end   end
//! ```
//!
//! Best fit keeps long-lived textures and buffers from fragmenting a heap
//! that can never be compacted.

mod block;
mod device;
mod host;

pub use device::DeviceFreelistAllocator;
pub use host::HostFreelistAllocator;

/// A snapshot of one block, for inspection and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRange<A> {
    /// First byte of the block (including any alignment padding).
    pub begin: A,
    /// Size of the block in bytes.
    pub size: u64,
    /// True if the block is on the free list.
    pub free: bool,
}
