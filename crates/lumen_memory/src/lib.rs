//! # LUMEN Memory
//!
//! Tiered allocator framework under every GPU and host resource of the
//! renderer:
//! - Best-fit freelists with splitting and coalescing
//! - Fixed-size pools with chunk-doubling growth
//! - Monotonic arenas with chunk overflow and reset
//!
//! Strategies stack on one another and run unchanged over two address
//! spaces: host memory, where an address is a real pointer, and device
//! memory, where an address is an offset into an object the host cannot read.
//!
//! ## Architecture Rules
//!
//! 1. **One contract** - every strategy is an [`Allocator`] over an upstream [`Allocator`]
//! 2. **No unsafe** - host bytes are reached through [`HostSpace`], never by casting
//! 3. **No globals** - allocators are built by a [`MemoryContext`] and passed explicitly
//! 4. **Single-threaded** - sharing goes through [`SharedAllocator`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use lumen_memory::{Allocator, DeviceFreelistAllocator, DeviceHeap, FreelistConfig,
//!                    HeapConfig, LeafAllocator, PoolAllocator, PoolConfig};
//!
//! let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
//! let heap = DeviceFreelistAllocator::new(leaf, FreelistConfig::new(64 << 20, 4096))?;
//! let mut uniforms = PoolAllocator::new(heap, PoolConfig::new(256, 256))?;
//!
//! let block = uniforms.allocate(256, 256)?;
//! uniforms.deallocate(block)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod address;
pub mod allocator;
pub mod config;
pub mod context;
pub mod error;
pub mod freelist;
pub mod leaf;
pub mod monotonic;
pub mod pool;
pub mod shared;
pub mod source;

pub use address::{Address, DeviceAddress, HostPtr, MemoryId};
pub use allocator::{chain, Allocator, AllocatorInfo, AllocatorKind, AllocatorStats, HostSpace};
pub use config::{
    DeviceClassConfig, DeviceMemoryConfig, FreelistConfig, HeapConfig, HostMemoryConfig,
    MemoryConfig, MonotonicConfig, PoolConfig,
};
pub use context::{DeviceClassAllocator, HostArena, MemoryContext, UsageClass};
pub use error::{MemoryError, MemoryResult};
pub use freelist::{BlockRange, DeviceFreelistAllocator, HostFreelistAllocator};
pub use leaf::LeafAllocator;
pub use monotonic::MonotonicAllocator;
pub use pool::PoolAllocator;
pub use shared::SharedAllocator;
pub use source::{DeviceHeap, HostHeap, MemorySource};
