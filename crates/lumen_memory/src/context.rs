//! # Memory Context
//!
//! The allocators every renderer subsystem shares, built once at startup
//! from a [`MemoryConfig`] and handed to consumers explicitly.
//!
//! ```text
//!                         host                                device
//!  scratch arenas ─┐                            ┌─ static  ─ DeviceFreelist ─ Leaf ─┐
//!  object pools  ──┼─ Shared(HostFreelist ─ Leaf ─ HostHeap)                       ├─ DeviceHeap
//!                  │                            └─ dynamic ─ DeviceFreelist ─ Leaf ─┘
//! ```

use crate::config::{MemoryConfig, PoolConfig};
use crate::error::{MemoryError, MemoryResult};
use crate::freelist::{DeviceFreelistAllocator, HostFreelistAllocator};
use crate::leaf::LeafAllocator;
use crate::monotonic::MonotonicAllocator;
use crate::pool::PoolAllocator;
use crate::shared::SharedAllocator;
use crate::source::{DeviceHeap, HostHeap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Coarse lifetime class of device allocations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageClass {
    /// Uploaded once, lives for the level (meshes, textures).
    Static,
    /// Rewritten often (per-frame uniforms, streaming buffers).
    Dynamic,
}

impl fmt::Display for UsageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => f.write_str("static"),
            Self::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// The general host arena: a freelist over one host heap extent.
pub type HostArena = HostFreelistAllocator<LeafAllocator<HostHeap>>;

/// A device usage-class allocator: a freelist over one device memory object.
pub type DeviceClassAllocator = DeviceFreelistAllocator<LeafAllocator<DeviceHeap>>;

/// Owns the shared allocators of one renderer instance.
pub struct MemoryContext {
    config: MemoryConfig,
    host: SharedAllocator<HostArena>,
    device_heap: DeviceHeap,
    device: HashMap<UsageClass, SharedAllocator<DeviceClassAllocator>>,
}

impl MemoryContext {
    /// Builds every allocator described by `config`.
    ///
    /// Nothing is requested from the heaps until the first allocation.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` or `AlignmentTooLarge` if the configuration does not
    /// describe a valid chain.
    pub fn new(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate()?;

        let host_leaf = LeafAllocator::new(HostHeap::new(config.host.heap.clone()));
        let host = SharedAllocator::new(HostFreelistAllocator::new(host_leaf, config.host.arena)?);

        let device_heap = DeviceHeap::new(config.device.heap.clone());
        let mut device = HashMap::new();
        for entry in &config.device.classes {
            let leaf = LeafAllocator::new(device_heap.clone());
            let freelist = DeviceFreelistAllocator::new(leaf, entry.freelist)?;
            device.insert(entry.class, SharedAllocator::new(freelist));

            tracing::debug!(
                "memory context: {} class with {} byte budget",
                entry.class,
                entry.freelist.initial_extent_size
            );
        }

        Ok(Self {
            config,
            host,
            device_heap,
            device,
        })
    }

    /// The configuration the context was built from.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// A handle to the general host arena.
    #[must_use]
    pub fn host(&self) -> SharedAllocator<HostArena> {
        self.host.clone()
    }

    /// A handle to the device allocator of `class`.
    ///
    /// # Errors
    ///
    /// `UnknownUsageClass` if the class was not configured.
    pub fn device(&self, class: UsageClass) -> MemoryResult<SharedAllocator<DeviceClassAllocator>> {
        self.device
            .get(&class)
            .cloned()
            .ok_or(MemoryError::UnknownUsageClass(class))
    }

    /// The device heap every usage class draws from.
    #[inline]
    #[must_use]
    pub const fn device_heap(&self) -> &DeviceHeap {
        &self.device_heap
    }

    /// A fresh scratch arena carved from the host arena.
    ///
    /// # Errors
    ///
    /// `AlignmentTooLarge` if the scratch ceiling exceeds the arena's.
    pub fn scratch_arena(&self) -> MemoryResult<MonotonicAllocator<SharedAllocator<HostArena>>> {
        MonotonicAllocator::new(self.host(), self.config.host.scratch)
    }

    /// A fresh pool of `block_size`-byte slots carved from the host arena.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` or `AlignmentTooLarge` for an unusable block shape.
    pub fn object_pool(
        &self,
        block_size: u64,
        block_alignment: u64,
    ) -> MemoryResult<PoolAllocator<SharedAllocator<HostArena>>> {
        PoolAllocator::new(self.host(), PoolConfig::new(block_size, block_alignment))
    }

    /// A pool whose slots fit one `T`.
    ///
    /// # Errors
    ///
    /// `AlignmentTooLarge` if `T` is aligned beyond the host arena ceiling.
    pub fn object_pool_for<T>(&self) -> MemoryResult<PoolAllocator<SharedAllocator<HostArena>>> {
        let size = std::mem::size_of::<T>().max(1) as u64;
        let alignment = std::mem::align_of::<T>() as u64;
        self.object_pool(size, alignment)
    }
}
