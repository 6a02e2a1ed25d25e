//! Index-linked block arena shared by both freelist variants.
//!
//! Block records live in one `Vec`. The three intrusive lists of the
//! classic design (address order, free, resident) become `prev`/`next`
//! indices into that `Vec`, so neighbour lookup stays O(1) without any
//! pointer arithmetic.

use super::BlockRange;
use crate::address::Address;
use crate::allocator::AllocatorStats;

/// Index of a block record in the arena.
pub(crate) type BlockIndex = usize;

/// The three lists a block can be linked into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum List {
    /// Every block, sorted by `(region, begin)`.
    Order = 0,
    /// Free blocks only, unsorted.
    Free = 1,
    /// Allocated blocks only (device variant).
    Resident = 2,
}

#[derive(Clone, Copy, Debug, Default)]
struct Links {
    prev: Option<BlockIndex>,
    next: Option<BlockIndex>,
}

/// One sub-range of an extent.
#[derive(Clone, Debug, Default)]
struct Block {
    /// First byte (absolute address for host, offset for device).
    begin: u64,
    /// One past the last byte.
    end: u64,
    /// Index of the owning extent.
    extent: usize,
    free: bool,
    /// Aligned start handed to the caller (in-use blocks only).
    user_begin: u64,
    /// Rounded size handed to the caller (in-use blocks only).
    user_size: u64,
    links: [Links; 3],
}

impl Block {
    fn free_range(begin: u64, end: u64, extent: usize) -> Self {
        Self {
            begin,
            end,
            extent,
            free: true,
            ..Self::default()
        }
    }
}

/// One upstream extent.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Extent<A> {
    pub base: A,
    pub size: u64,
}

/// A best-fit candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Fit {
    pub block: BlockIndex,
    pub user_begin: u64,
}

/// Block bookkeeping for one freelist allocator.
pub(crate) struct BlockArena<A: Address> {
    blocks: Vec<Block>,
    /// Records released by coalescing, reused by later splits.
    spare: Vec<BlockIndex>,
    heads: [Option<BlockIndex>; 3],
    extents: Vec<Extent<A>>,
    /// A leftover must be larger than this to become its own block.
    split_threshold: u64,
    live: u64,
    bytes_in_use: u64,
}

impl<A: Address> BlockArena<A> {
    pub(crate) fn new(split_threshold: u64) -> Self {
        Self {
            blocks: Vec::new(),
            spare: Vec::new(),
            heads: [None; 3],
            extents: Vec::new(),
            split_threshold,
            live: 0,
            bytes_in_use: 0,
        }
    }

    // -------------------------------------------------------------------------
    // List plumbing
    // -------------------------------------------------------------------------

    #[inline]
    fn links(&self, list: List, index: BlockIndex) -> Links {
        self.blocks[index].links[list as usize]
    }

    #[inline]
    fn links_mut(&mut self, list: List, index: BlockIndex) -> &mut Links {
        &mut self.blocks[index].links[list as usize]
    }

    fn push_front(&mut self, list: List, index: BlockIndex) {
        let head = self.heads[list as usize];
        *self.links_mut(list, index) = Links {
            prev: None,
            next: head,
        };
        if let Some(head) = head {
            self.links_mut(list, head).prev = Some(index);
        }
        self.heads[list as usize] = Some(index);
    }

    fn insert_after(&mut self, list: List, at: BlockIndex, index: BlockIndex) {
        let next = self.links(list, at).next;
        *self.links_mut(list, index) = Links {
            prev: Some(at),
            next,
        };
        self.links_mut(list, at).next = Some(index);
        if let Some(next) = next {
            self.links_mut(list, next).prev = Some(index);
        }
    }

    fn unlink(&mut self, list: List, index: BlockIndex) {
        let Links { prev, next } = self.links(list, index);
        match prev {
            Some(prev) => self.links_mut(list, prev).next = next,
            None => self.heads[list as usize] = next,
        }
        if let Some(next) = next {
            self.links_mut(list, next).prev = prev;
        }
        *self.links_mut(list, index) = Links::default();
    }

    fn iter(&self, list: List) -> impl Iterator<Item = BlockIndex> + '_ {
        std::iter::successors(self.heads[list as usize], move |&i| self.links(list, i).next)
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    fn new_record(&mut self, block: Block) -> BlockIndex {
        if let Some(index) = self.spare.pop() {
            self.blocks[index] = block;
            index
        } else {
            self.blocks.push(block);
            self.blocks.len() - 1
        }
    }

    fn recycle(&mut self, index: BlockIndex) {
        // A recycled record reads as free so stale handles never validate.
        self.blocks[index] = Block {
            free: true,
            ..Block::default()
        };
        self.spare.push(index);
    }

    #[inline]
    fn key(&self, index: BlockIndex) -> (u64, u64) {
        let block = &self.blocks[index];
        (self.extents[block.extent].base.region(), block.begin)
    }

    #[inline]
    fn adjacent(&self, left: BlockIndex, right: BlockIndex) -> bool {
        let (l, r) = (&self.blocks[left], &self.blocks[right]);
        l.extent == r.extent && l.end == r.begin
    }

    // -------------------------------------------------------------------------
    // Algorithm
    // -------------------------------------------------------------------------

    /// Registers a new extent as one free block.
    pub(crate) fn add_extent(&mut self, base: A, size: u64) -> BlockIndex {
        let extent = self.extents.len();
        self.extents.push(Extent { base, size });

        let begin = base.offset();
        let index = self.new_record(Block::free_range(begin, begin + size, extent));

        let key = (base.region(), begin);
        let after = self.iter(List::Order).take_while(|&i| self.key(i) < key).last();
        match after {
            Some(after) => self.insert_after(List::Order, after, index),
            None => self.push_front(List::Order, index),
        }
        self.push_front(List::Free, index);
        index
    }

    /// Finds the free block that leaves the least space after
    /// `[user_begin, user_begin + size)`, where `user_begin` is the first
    /// `alignment` boundary at least `header` bytes into the block.
    pub(crate) fn best_fit(&self, size: u64, alignment: u64, header: u64) -> Option<Fit> {
        let mut best: Option<(Fit, u64)> = None;

        for index in self.iter(List::Free) {
            let block = &self.blocks[index];
            let Some(user_begin) = block
                .begin
                .checked_add(header)
                .and_then(|b| crate::address::checked_align_up(b, alignment))
            else {
                continue;
            };
            let Some(user_end) = user_begin.checked_add(size) else {
                continue;
            };
            if user_end > block.end {
                continue;
            }

            let leftover = block.end - user_end;
            if best.map_or(true, |(_, best_leftover)| leftover < best_leftover) {
                best = Some((Fit { block: index, user_begin }, leftover));
                // Nothing can beat less than one alignment unit of waste.
                if leftover < alignment {
                    break;
                }
            }
        }

        best.map(|(fit, _)| fit)
    }

    /// Marks the fitted block in use, splitting off the leftover tail.
    pub(crate) fn claim(&mut self, fit: Fit, size: u64) -> BlockIndex {
        let index = fit.block;
        self.unlink(List::Free, index);

        let user_end = fit.user_begin + size;
        let (end, extent) = {
            let block = &mut self.blocks[index];
            block.free = false;
            block.user_begin = fit.user_begin;
            block.user_size = size;
            (block.end, block.extent)
        };

        if end - user_end > self.split_threshold {
            self.blocks[index].end = user_end;
            let tail = self.new_record(Block::free_range(user_end, end, extent));
            self.insert_after(List::Order, index, tail);
            self.push_front(List::Free, tail);
            tracing::trace!("freelist: split block {} at {:#x}", index, user_end);
        }

        self.live += 1;
        self.bytes_in_use += size;
        index
    }

    /// Returns an in-use block to the free list, merging with free neighbours.
    pub(crate) fn release(&mut self, index: BlockIndex) {
        self.live -= 1;
        self.bytes_in_use -= self.blocks[index].user_size;

        let mut merged = index;

        if let Some(next) = self.links(List::Order, index).next {
            if self.blocks[next].free && self.adjacent(index, next) {
                self.blocks[index].end = self.blocks[next].end;
                self.unlink(List::Free, next);
                self.unlink(List::Order, next);
                self.recycle(next);
                tracing::trace!("freelist: merged block {} into {}", next, index);
            }
        }

        if let Some(prev) = self.links(List::Order, index).prev {
            if self.blocks[prev].free && self.adjacent(prev, index) {
                self.blocks[prev].end = self.blocks[index].end;
                self.unlink(List::Free, prev);
                self.unlink(List::Order, index);
                self.recycle(index);
                tracing::trace!("freelist: merged block {} into {}", index, prev);
                merged = prev;
            }
        }

        let block = &mut self.blocks[merged];
        block.free = true;
        block.user_begin = 0;
        block.user_size = 0;
        self.push_front(List::Free, merged);
    }

    /// Returns true if `index` is an in-use block handed out at `user_begin`.
    pub(crate) fn is_live(&self, index: BlockIndex, user_begin: u64) -> bool {
        self.blocks
            .get(index)
            .is_some_and(|b| !b.free && b.user_begin == user_begin)
    }

    /// The caller-visible address of an in-use block.
    pub(crate) fn address_of(&self, index: BlockIndex) -> A {
        let block = &self.blocks[index];
        self.extents[block.extent].base.with_offset(block.user_begin)
    }

    // -------------------------------------------------------------------------
    // Resident list
    // -------------------------------------------------------------------------

    pub(crate) fn add_resident(&mut self, index: BlockIndex) {
        self.push_front(List::Resident, index);
    }

    pub(crate) fn remove_resident(&mut self, index: BlockIndex) {
        self.unlink(List::Resident, index);
    }

    /// Linear scan for the resident block whose range contains `offset`.
    pub(crate) fn find_resident(&self, region: u64, offset: u64) -> Option<BlockIndex> {
        self.iter(List::Resident).find(|&i| {
            let block = &self.blocks[i];
            self.extents[block.extent].base.region() == region
                && block.begin <= offset
                && offset < block.end
        })
    }

    // -------------------------------------------------------------------------
    // Introspection and teardown
    // -------------------------------------------------------------------------

    fn range(&self, index: BlockIndex) -> BlockRange<A> {
        let block = &self.blocks[index];
        BlockRange {
            begin: self.extents[block.extent].base.with_offset(block.begin),
            size: block.end - block.begin,
            free: block.free,
        }
    }

    /// Every block in address order.
    pub(crate) fn blocks(&self) -> Vec<BlockRange<A>> {
        self.iter(List::Order).map(|i| self.range(i)).collect()
    }

    /// Free blocks in free-list order.
    pub(crate) fn free_blocks(&self) -> Vec<BlockRange<A>> {
        self.iter(List::Free).map(|i| self.range(i)).collect()
    }

    pub(crate) fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live_allocations: self.live,
            bytes_in_use: self.bytes_in_use,
            extents: self.extents.len() as u64,
            extent_bytes: self.extents.iter().map(|e| e.size).sum(),
        }
    }

    /// Forgets every block and hands the extents back to the caller.
    pub(crate) fn take_extents(&mut self) -> Vec<Extent<A>> {
        self.blocks.clear();
        self.spare.clear();
        self.heads = [None; 3];
        self.live = 0;
        self.bytes_in_use = 0;
        std::mem::take(&mut self.extents)
    }

    /// Checks every structural invariant.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let order: Vec<BlockIndex> = self.iter(List::Order).collect();
        for pair in order.windows(2) {
            assert!(self.key(pair[0]) < self.key(pair[1]), "order list unsorted");
            let (a, b) = (&self.blocks[pair[0]], &self.blocks[pair[1]]);
            if a.extent == b.extent {
                assert!(a.end <= b.begin, "blocks overlap");
                assert!(!(a.free && b.free && a.end == b.begin), "uncoalesced neighbours");
            }
        }
        let free: Vec<BlockIndex> = self.iter(List::Free).collect();
        let resident: Vec<BlockIndex> = self.iter(List::Resident).collect();
        for &i in &order {
            assert_eq!(self.blocks[i].free, free.contains(&i), "free flag mismatch");
            assert!(!(free.contains(&i) && resident.contains(&i)));
        }
        assert_eq!(free.len() + self.live as usize, order.len());
        let covered: u64 = order.iter().map(|&i| self.blocks[i].end - self.blocks[i].begin).sum();
        assert_eq!(covered, self.extents.iter().map(|e| e.size).sum::<u64>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{DeviceAddress, MemoryId};

    fn arena(size: u64) -> BlockArena<DeviceAddress> {
        let mut arena = BlockArena::new(16);
        arena.add_extent(DeviceAddress::new(MemoryId(1), 0), size);
        arena
    }

    fn take(arena: &mut BlockArena<DeviceAddress>, size: u64, alignment: u64) -> BlockIndex {
        let fit = arena.best_fit(size, alignment, 0).unwrap();
        arena.claim(fit, size)
    }

    #[test]
    fn test_split_and_coalesce_closure() {
        let mut arena = arena(1024);
        let a = take(&mut arena, 256, 16);
        assert_eq!(arena.blocks().len(), 2);
        arena.check_invariants();

        arena.release(a);
        arena.check_invariants();
        let free = arena.free_blocks();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size, 1024);
    }

    #[test]
    fn test_sandwich_merge() {
        let mut arena = arena(768);
        let a = take(&mut arena, 256, 16);
        let b = take(&mut arena, 256, 16);
        let c = take(&mut arena, 256, 16);
        assert_eq!(arena.free_blocks().len(), 0);

        arena.release(a);
        arena.release(c);
        assert_eq!(arena.free_blocks().len(), 2);
        arena.release(b);
        arena.check_invariants();

        let free = arena.free_blocks();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].begin.offset, 0);
        assert_eq!(free[0].size, 768);
        // Two records went back to the spare pool.
        assert_eq!(arena.spare.len(), 2);
    }

    #[test]
    fn test_best_fit_prefers_smallest_leftover() {
        let mut arena = arena(2048);
        let a = take(&mut arena, 512, 16);
        let _b = take(&mut arena, 64, 16);
        let c = take(&mut arena, 128, 16);
        let _d = take(&mut arena, 64, 16);
        arena.release(a);
        arena.release(c);

        // 128-byte hole is a tighter fit than the 512-byte hole or the tail.
        let fit = arena.best_fit(112, 16, 0).unwrap();
        assert_eq!(fit.user_begin, 576);
    }

    #[test]
    fn test_small_leftover_is_not_split() {
        let mut arena = arena(1024);
        let a = take(&mut arena, 1008, 16);
        assert_eq!(arena.blocks().len(), 1);
        arena.release(a);
        arena.check_invariants();
    }

    #[test]
    fn test_extents_do_not_merge_across_regions() {
        let mut arena = arena(256);
        arena.add_extent(DeviceAddress::new(MemoryId(2), 0), 256);
        let a = take(&mut arena, 256, 16);
        let b = take(&mut arena, 256, 16);
        arena.release(a);
        arena.release(b);
        arena.check_invariants();
        assert_eq!(arena.free_blocks().len(), 2);
    }

    #[test]
    fn test_resident_lookup() {
        let mut arena = arena(1024);
        let a = take(&mut arena, 128, 16);
        arena.add_resident(a);
        assert_eq!(arena.find_resident(1, 0), Some(a));
        assert_eq!(arena.find_resident(1, 64), Some(a));
        assert_eq!(arena.find_resident(2, 0), None);
        arena.remove_resident(a);
        assert_eq!(arena.find_resident(1, 0), None);
    }

    #[test]
    fn test_alignment_padding_stays_in_block() {
        let mut arena = arena(1024);
        let _a = take(&mut arena, 16, 16);
        let b = take(&mut arena, 64, 256);
        assert_eq!(arena.address_of(b).offset, 256);
        assert!(arena.is_live(b, 256));
        assert!(!arena.is_live(b, 16));
        arena.check_invariants();
    }
}
