//! # Shared Allocator
//!
//! Allocators are single-threaded. When several consumers need the same
//! pool (every static mesh buffer, say, drawing on one device freelist) the
//! whole allocator goes behind one lock and every call takes it.

use crate::address::HostPtr;
use crate::allocator::{Allocator, AllocatorInfo, AllocatorKind, AllocatorStats, HostSpace};
use crate::error::MemoryResult;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// A cloneable, lock-protected handle to one allocator.
///
/// Each `allocate` / `deallocate` holds the lock for exactly that call.
///
/// # Chain Introspection
///
/// A reference to the inner allocator cannot outlive the lock, so
/// [`upstream`](AllocatorInfo::upstream) returns `None` and
/// [`chain`](crate::allocator::chain) ends at `Shared`. Call
/// [`SharedAllocator::chain`] to continue the walk under the lock.
pub struct SharedAllocator<A> {
    inner: Arc<Mutex<A>>,
}

impl<A> SharedAllocator<A> {
    /// Moves an allocator behind a lock.
    #[must_use]
    pub fn new(allocator: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    /// Locks the inner allocator for a sequence of calls.
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }

    /// Lists `Shared` followed by the kinds of the inner chain.
    #[must_use]
    pub fn chain(&self) -> Vec<AllocatorKind>
    where
        A: AllocatorInfo,
    {
        let inner = self.inner.lock();
        let mut kinds = vec![AllocatorKind::Shared];
        kinds.extend(crate::allocator::chain(&*inner));
        kinds
    }

    /// Number of handles sharing the allocator.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<A> Clone for SharedAllocator<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: AllocatorInfo> AllocatorInfo for SharedAllocator<A> {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Shared
    }

    fn max_alignment(&self) -> u64 {
        self.inner.lock().max_alignment()
    }

    fn stats(&self) -> AllocatorStats {
        self.inner.lock().stats()
    }

    fn upstream(&self) -> Option<&dyn AllocatorInfo> {
        None
    }
}

impl<A: Allocator> Allocator for SharedAllocator<A> {
    type Address = A::Address;

    fn allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<A::Address> {
        self.inner.lock().allocate(size, alignment)
    }

    fn deallocate(&mut self, address: A::Address) -> MemoryResult<()> {
        self.inner.lock().deallocate(address)
    }
}

impl<A: HostSpace> HostSpace for SharedAllocator<A> {
    fn read_bytes(&self, address: HostPtr, buf: &mut [u8]) -> MemoryResult<()> {
        self.inner.lock().read_bytes(address, buf)
    }

    fn write_bytes(&mut self, address: HostPtr, data: &[u8]) -> MemoryResult<()> {
        self.inner.lock().write_bytes(address, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FreelistConfig, HeapConfig};
    use crate::freelist::DeviceFreelistAllocator;
    use crate::leaf::LeafAllocator;
    use crate::source::DeviceHeap;
    use std::thread;

    #[test]
    fn test_shared_across_threads() {
        let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
        let freelist = DeviceFreelistAllocator::new(leaf, FreelistConfig::new(1 << 20, 256)).unwrap();
        let shared = SharedAllocator::new(freelist);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let mut handle = shared.clone();
                thread::spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..100u64 {
                        live.push(handle.allocate(64 + i, 16).unwrap());
                    }
                    for address in live {
                        handle.deallocate(address).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(shared.stats().live_allocations, 0);
        assert_eq!(shared.lock().free_blocks().len(), 1);
        assert_eq!(shared.handle_count(), 1);
    }

    #[test]
    fn test_chain_continues_under_lock() {
        let leaf = LeafAllocator::new(DeviceHeap::new(HeapConfig::default()));
        let freelist = DeviceFreelistAllocator::new(leaf, FreelistConfig::new(1 << 20, 256)).unwrap();
        let shared = SharedAllocator::new(freelist);

        assert_eq!(crate::allocator::chain(&shared), vec![AllocatorKind::Shared]);
        assert_eq!(
            shared.chain(),
            vec![AllocatorKind::Shared, AllocatorKind::DeviceFreelist, AllocatorKind::Leaf]
        );
    }
}
