//! # External Memory Sources
//!
//! The primitives at the bottom of every chain. A [`LeafAllocator`] wraps
//! exactly one of these.
//!
//! - [`HostHeap`]: the process heap. Hands out zero-initialised buffers whose
//!   real addresses become [`HostPtr`]s.
//! - [`DeviceHeap`]: one GPU memory heap type. Hands out opaque memory
//!   objects; nothing behind them can be read by the host.
//!
//! [`LeafAllocator`]: crate::leaf::LeafAllocator

use crate::address::{align_up, validate_alignment, Address, DeviceAddress, HostPtr, MemoryId};
use crate::allocator::HostSpace;
use crate::config::HeapConfig;
use crate::error::{MemoryError, MemoryResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// An external allocation primitive.
pub trait MemorySource {
    /// The address space of the memory this source hands out.
    type Address: Address;

    /// Obtains one extent of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the heap budget or the single-extent limit is exceeded.
    fn acquire(&mut self, size: u64, alignment: u64) -> MemoryResult<Self::Address>;

    /// Returns an extent obtained from [`acquire`](Self::acquire).
    ///
    /// # Errors
    ///
    /// `InvalidHandle` if `address` is not the start of a live extent.
    fn release(&mut self, address: Self::Address) -> MemoryResult<()>;

    /// Largest alignment the source can honour.
    fn max_alignment(&self) -> u64;

    /// Largest single extent the source can hand out.
    fn max_extent_size(&self) -> u64;
}

fn check_request(config: &HeapConfig, used: u64, size: u64) -> MemoryResult<()> {
    if size > config.max_extent_size {
        return Err(MemoryError::OutOfMemory { requested: size });
    }
    if let Some(budget) = config.budget {
        if used.saturating_add(size) > budget {
            return Err(MemoryError::OutOfMemory { requested: size });
        }
    }
    Ok(())
}

// =============================================================================
// HOST HEAP
// =============================================================================

/// One buffer owned by the host heap.
struct HostRegion {
    /// Aligned address handed out.
    begin: u64,
    /// Usable size from `begin`.
    size: u64,
    /// Distance from the buffer start to `begin`.
    skew: usize,
    /// The bytes.
    storage: Box<[u8]>,
}

/// The process heap as a [`MemorySource`].
///
/// Every extent is a separate zero-initialised buffer. Buffers are reserved
/// fallibly so exhaustion surfaces as `OutOfMemory` rather than an abort.
pub struct HostHeap {
    config: HeapConfig,
    regions: Vec<HostRegion>,
    used: u64,
}

impl HostHeap {
    /// Creates an empty host heap.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        Self {
            config,
            regions: Vec::new(),
            used: 0,
        }
    }

    /// Bytes currently handed out.
    #[inline]
    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.used
    }

    /// Number of live extents.
    #[inline]
    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.regions.len()
    }

    /// Finds the buffer and start index backing `[address, address + len)`.
    fn locate(&self, address: HostPtr, len: usize) -> MemoryResult<(usize, usize)> {
        let begin = address.get();
        let end = u64::try_from(len)
            .ok()
            .and_then(|len| begin.checked_add(len))
            .ok_or_else(|| MemoryError::invalid_handle(address))?;

        let index = self
            .regions
            .iter()
            .position(|r| r.begin <= begin && end <= r.begin + r.size)
            .ok_or_else(|| MemoryError::invalid_handle(address))?;

        let region = &self.regions[index];
        let start = usize::try_from(begin - region.begin)
            .map_err(|_| MemoryError::invalid_handle(address))?;
        Ok((index, region.skew + start))
    }
}

impl std::fmt::Debug for HostHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHeap")
            .field("config", &self.config)
            .field("extents", &self.regions.len())
            .field("used", &self.used)
            .finish()
    }
}

impl MemorySource for HostHeap {
    type Address = HostPtr;

    fn acquire(&mut self, size: u64, alignment: u64) -> MemoryResult<HostPtr> {
        let alignment = validate_alignment(alignment, self.config.max_alignment)?;
        let size = size.max(1);
        check_request(&self.config, self.used, size)?;

        let out_of_memory = MemoryError::OutOfMemory { requested: size };
        let padded = size
            .checked_add(alignment - 1)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| out_of_memory.clone())?;

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(padded)
            .map_err(|_| out_of_memory.clone())?;
        buffer.resize(padded, 0u8);
        let storage = buffer.into_boxed_slice();

        let raw = storage.as_ptr() as u64;
        let begin = align_up(raw, alignment)?;
        let skew = usize::try_from(begin - raw).map_err(|_| out_of_memory)?;

        self.regions.push(HostRegion {
            begin,
            size,
            skew,
            storage,
        });
        self.used += size;

        tracing::debug!("host heap: acquired {} bytes at {:#x}", size, begin);
        Ok(HostPtr::new(begin))
    }

    fn release(&mut self, address: HostPtr) -> MemoryResult<()> {
        let index = self
            .regions
            .iter()
            .position(|r| r.begin == address.get())
            .ok_or_else(|| MemoryError::invalid_handle(address))?;

        let region = self.regions.swap_remove(index);
        self.used -= region.size;

        tracing::debug!("host heap: released {} bytes at {:#x}", region.size, region.begin);
        Ok(())
    }

    fn max_alignment(&self) -> u64 {
        self.config.max_alignment
    }

    fn max_extent_size(&self) -> u64 {
        self.config.max_extent_size
    }
}

impl HostSpace for HostHeap {
    fn read_bytes(&self, address: HostPtr, buf: &mut [u8]) -> MemoryResult<()> {
        let (index, start) = self.locate(address, buf.len())?;
        buf.copy_from_slice(&self.regions[index].storage[start..start + buf.len()]);
        Ok(())
    }

    fn write_bytes(&mut self, address: HostPtr, data: &[u8]) -> MemoryResult<()> {
        let (index, start) = self.locate(address, data.len())?;
        self.regions[index].storage[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

// =============================================================================
// DEVICE HEAP
// =============================================================================

#[derive(Debug)]
struct DeviceHeapState {
    config: HeapConfig,
    next_id: u64,
    live: HashMap<MemoryId, u64>,
    used: u64,
}

/// One GPU memory heap type as a [`MemorySource`].
///
/// Cloning yields another handle to the same heap, the way every usage
/// class in the renderer allocates from the one device. Each acquired
/// extent is a distinct memory object starting at offset 0.
#[derive(Clone, Debug)]
pub struct DeviceHeap {
    state: Arc<Mutex<DeviceHeapState>>,
}

impl DeviceHeap {
    /// Creates a device heap.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceHeapState {
                config,
                next_id: 1,
                live: HashMap::new(),
                used: 0,
            })),
        }
    }

    /// Bytes currently handed out across all handles.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Number of live memory objects.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Size of a live memory object.
    #[must_use]
    pub fn object_size(&self, memory: MemoryId) -> Option<u64> {
        self.state.lock().live.get(&memory).copied()
    }
}

impl MemorySource for DeviceHeap {
    type Address = DeviceAddress;

    fn acquire(&mut self, size: u64, alignment: u64) -> MemoryResult<DeviceAddress> {
        let mut state = self.state.lock();
        validate_alignment(alignment, state.config.max_alignment)?;
        let size = size.max(1);
        check_request(&state.config, state.used, size)?;

        let memory = MemoryId(state.next_id);
        state.next_id += 1;
        state.live.insert(memory, size);
        state.used += size;

        tracing::debug!("device heap: allocated memory {} ({} bytes)", memory, size);
        Ok(DeviceAddress::new(memory, 0))
    }

    fn release(&mut self, address: DeviceAddress) -> MemoryResult<()> {
        let mut state = self.state.lock();
        if address.offset != 0 {
            return Err(MemoryError::invalid_handle(address));
        }
        let size = state
            .live
            .remove(&address.memory)
            .ok_or_else(|| MemoryError::invalid_handle(address))?;
        state.used -= size;

        tracing::debug!("device heap: freed memory {} ({} bytes)", address.memory, size);
        Ok(())
    }

    fn max_alignment(&self) -> u64 {
        self.state.lock().config.max_alignment
    }

    fn max_extent_size(&self) -> u64 {
        self.state.lock().config.max_extent_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_config(budget: Option<u64>) -> HeapConfig {
        HeapConfig {
            budget,
            max_extent_size: 1 << 20,
            max_alignment: 4096,
        }
    }

    #[test]
    fn test_host_heap_alignment_and_access() {
        let mut heap = HostHeap::new(heap_config(None));
        let address = heap.acquire(100, 256).unwrap();
        assert!(address.is_aligned(256));

        heap.write_bytes(address.with_offset(address.get() + 10), &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 4];
        heap.read_bytes(address.with_offset(address.get() + 9), &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);

        // Past the end of the extent
        let mut tail = [0u8; 8];
        assert!(heap.read_bytes(address.with_offset(address.get() + 96), &mut tail).is_err());

        heap.release(address).unwrap();
        assert_eq!(heap.used_bytes(), 0);
        assert!(heap.release(address).is_err());
    }

    #[test]
    fn test_host_heap_budget() {
        let mut heap = HostHeap::new(heap_config(Some(1000)));
        let _a = heap.acquire(600, 16).unwrap();
        assert_eq!(
            heap.acquire(600, 16),
            Err(MemoryError::OutOfMemory { requested: 600 })
        );
        assert_eq!(heap.extent_count(), 1);
    }

    #[test]
    fn test_device_heap_objects() {
        let mut heap = DeviceHeap::new(heap_config(None));
        let mut other = heap.clone();

        let a = heap.acquire(4096, 256).unwrap();
        let b = other.acquire(8192, 256).unwrap();
        assert_ne!(a.memory, b.memory);
        assert_eq!(a.offset, 0);
        assert_eq!(heap.live_objects(), 2);
        assert_eq!(heap.object_size(b.memory), Some(8192));

        assert!(heap.release(DeviceAddress::new(a.memory, 16)).is_err());
        heap.release(a).unwrap();
        other.release(b).unwrap();
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn test_device_heap_extent_limit() {
        let mut heap = DeviceHeap::new(heap_config(None));
        assert!(matches!(
            heap.acquire(2 << 20, 16),
            Err(MemoryError::OutOfMemory { .. })
        ));
        assert!(matches!(
            heap.acquire(16, 8192),
            Err(MemoryError::AlignmentTooLarge { .. })
        ));
    }
}
