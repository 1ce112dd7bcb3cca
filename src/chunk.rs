//! The device-agnostic chunk bookkeeping at the bottom of the hierarchy.
//!
//! `ChunkList` owns nothing but offsets and sizes; it never touches a
//! Vulkan handle. This keeps the first-fit/split/merge algorithm testable
//! without a device, and keeps `Pool` (the thing that actually calls
//! `vkAllocateMemory`) a thin wrapper around it.

/// Optional source-location decoration for a chunk, kept as a feature-gated
/// side table rather than a field every chunk carries.
#[cfg(feature = "track-allocations")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocSite {
    pub file: &'static str,
    pub line: u32,
}

/// Opaque handle identifying a chunk within its `ChunkList` across splits
/// and merges. Indices into the backing `Vec` shift as neighbors split or
/// coalesce, so chunks are addressed by a stable id instead, resolved with
/// a linear scan — the same approach the pool this design is modeled on
/// uses to find a chunk by identity among its siblings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct ChunkId(u64);

#[derive(Clone, Debug)]
pub(crate) struct Chunk {
    id: ChunkId,
    offset: u64,
    /// Total extent of this chunk, including any alignment padding at its
    /// front. `size - padding` is the usable region a bound resource sees.
    size: u64,
    padding: u64,
    used: bool,
    mapped: bool,
    #[cfg(feature = "track-allocations")]
    site: Option<AllocSite>,
}

impl Chunk {
    pub fn id(&self) -> ChunkId {
        self.id
    }

    #[cfg(feature = "track-allocations")]
    pub fn alloc_site(&self) -> Option<AllocSite> {
        self.site
    }

    #[cfg(feature = "track-allocations")]
    pub(crate) fn set_alloc_site(&mut self, site: Option<AllocSite>) {
        self.site = site;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset of the usable region, after padding.
    pub fn data_offset(&self) -> u64 {
        self.offset + self.padding
    }

    /// Size of the usable region, after padding.
    pub fn data_size(&self) -> u64 {
        self.size - self.padding
    }

    /// Total extent, including padding. Used for flush/invalidate ranges,
    /// which cover the whole chunk rather than just its usable region.
    pub fn extent(&self) -> u64 {
        self.size
    }

    pub fn padding(&self) -> u64 {
        self.padding
    }

    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub(crate) fn set_mapped(&mut self, mapped: bool) {
        self.mapped = mapped;
    }
}

/// An ordered, gapless list of chunks covering `[0, capacity)` of one pool.
#[derive(Debug)]
pub(crate) struct ChunkList {
    chunks: Vec<Chunk>,
    capacity: u64,
    next_id: u64,
}

impl ChunkList {
    pub fn new(capacity: u64) -> Self {
        ChunkList {
            chunks: vec![Chunk {
                id: ChunkId(0),
                offset: 0,
                size: capacity,
                padding: 0,
                used: false,
                mapped: false,
                #[cfg(feature = "track-allocations")]
                site: None,
            }],
            capacity,
            next_id: 1,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// True once this pool is back to a single, free, unmapped chunk — the
    /// precondition for releasing the whole pool back to the driver.
    pub fn is_entirely_free(&self) -> bool {
        self.chunks.len() == 1 && !self.chunks[0].used
    }

    pub fn get(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|c| c.id == id)
    }

    fn index_of(&self, id: ChunkId) -> Result<usize, crate::error::ChunkNotFound> {
        self.chunks
            .iter()
            .position(|c| c.id == id)
            .ok_or(crate::error::ChunkNotFound)
    }

    /// Find a free chunk that fits `size` bytes aligned to `align` (a power
    /// of two), splitting off the remainder when it is worth keeping as its
    /// own free chunk. `min_split_remainder` is the policy threshold below
    /// which leftover space is absorbed into the allocation instead of
    /// becoming a new free chunk (mirroring `min_allocation_size`).
    ///
    /// Returns `Ok(None)` when no free chunk fits — the caller should try
    /// another pool or create a new one — and `Err` only when growing the
    /// backing array for a split failed.
    pub fn allocate(
        &mut self,
        size: u64,
        align: u64,
        min_split_remainder: u64,
    ) -> Result<Option<ChunkId>, crate::error::OutOfHostMemory> {
        debug_assert!(align.is_power_of_two());
        let align_mask = align - 1;

        let mut found = None;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.used {
                continue;
            }

            let misalignment = chunk.offset & align_mask;
            let padding = if misalignment == 0 {
                0
            } else {
                align - misalignment
            };

            if chunk.size < padding + size {
                continue;
            }

            found = Some((index, padding));
            break;
        }

        let (index, padding) = match found {
            Some(found) => found,
            None => return Ok(None),
        };

        let chunk_offset = self.chunks[index].offset;
        let chunk_size = self.chunks[index].size;
        let left_over = chunk_size - (padding + size);

        if left_over > min_split_remainder {
            self.chunks
                .try_reserve(1)
                .map_err(|_| crate::error::OutOfHostMemory)?;

            let new_chunk = Chunk {
                id: ChunkId(self.next_id),
                offset: chunk_offset + padding + size,
                size: left_over,
                padding: 0,
                used: false,
                mapped: false,
                #[cfg(feature = "track-allocations")]
                site: None,
            };
            self.next_id += 1;
            self.chunks.insert(index + 1, new_chunk);
            self.chunks[index].size = padding + size;
        }

        let chunk = &mut self.chunks[index];
        chunk.padding = padding;
        chunk.used = true;
        Ok(Some(chunk.id))
    }

    /// Mark a chunk free and coalesce it with any free neighbors.
    pub fn deallocate(&mut self, id: ChunkId) -> Result<(), crate::error::ChunkNotFound> {
        let mut index = self.index_of(id)?;
        debug_assert!(self.chunks[index].used);

        self.chunks[index].used = false;
        self.chunks[index].padding = 0;

        while index + 1 < self.chunks.len() && !self.chunks[index + 1].used {
            self.merge(index);
        }

        while index > 0 && !self.chunks[index - 1].used {
            self.merge(index - 1);
            index -= 1;
        }

        Ok(())
    }

    /// Absorb chunk `index + 1` into chunk `index`. Both must be free and
    /// adjacent, which holds for any two neighbors in this list by
    /// construction.
    fn merge(&mut self, index: usize) {
        debug_assert!(!self.chunks[index].used);
        debug_assert!(!self.chunks[index + 1].used);
        let next = self.chunks.remove(index + 1);
        debug_assert_eq!(self.chunks[index].offset + self.chunks[index].size, next.offset);
        self.chunks[index].size += next.size;
    }

    pub(crate) fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }
}

/// Sanity check used by tests and debug assertions: chunks are contiguous,
/// gapless, and cover exactly `[0, capacity)`, and no two adjacent chunks
/// are both free.
#[cfg(test)]
pub(crate) fn check_invariants(list: &ChunkList) {
    use std::convert::TryFrom as _;

    let mut expected_offset = 0u64;
    for (index, chunk) in list.chunks().iter().enumerate() {
        assert_eq!(chunk.offset, expected_offset, "chunk {} not contiguous", index);
        assert!(chunk.size > 0, "chunk {} is empty", index);
        assert!(chunk.padding <= chunk.size, "chunk {} padding exceeds size", index);
        expected_offset += chunk.size;

        if index + 1 < list.chunks().len() {
            let next = &list.chunks()[index + 1];
            assert!(
                chunk.used || next.used,
                "adjacent free chunks {} and {} were not merged",
                index,
                index + 1
            );
        }
    }
    assert_eq!(expected_offset, list.capacity(), "chunks do not cover the whole pool");
    let _ = u64::try_from(list.chunks().len()).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_list_is_one_free_chunk_covering_capacity() {
        let list = ChunkList::new(1024);
        check_invariants(&list);
        assert_eq!(list.chunk_count(), 1);
        assert!(list.is_entirely_free());
    }

    #[test]
    fn allocate_splits_remainder_when_worth_it() {
        let mut list = ChunkList::new(1024);
        let id = list.allocate(64, 16, 0).unwrap().unwrap();
        check_invariants(&list);
        assert_eq!(list.chunk_count(), 2);
        let chunk = list.get(id).unwrap();
        assert_eq!(chunk.data_offset(), 0);
        assert_eq!(chunk.data_size(), 64);
        assert!(chunk.is_used());
    }

    #[test]
    fn allocate_absorbs_small_remainder() {
        let mut list = ChunkList::new(64);
        // Remainder of 8 bytes is not worth its own chunk at this threshold.
        let id = list.allocate(56, 8, 16).unwrap().unwrap();
        check_invariants(&list);
        assert_eq!(list.chunk_count(), 1);
        let chunk = list.get(id).unwrap();
        assert_eq!(chunk.extent(), 64);
    }

    #[test]
    fn allocate_honors_alignment_padding() {
        let mut list = ChunkList::new(1024);
        let first = list.allocate(10, 16, 0).unwrap().unwrap();
        let second = list.allocate(32, 32, 0).unwrap().unwrap();
        check_invariants(&list);

        let second_chunk = list.get(second).unwrap();
        assert_eq!(second_chunk.data_offset() % 32, 0);
        assert!(list.get(first).unwrap().data_offset() % 16 == 0);
    }

    #[test]
    fn allocate_fails_when_nothing_fits() {
        let mut list = ChunkList::new(64);
        let result = list.allocate(128, 16, 0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn deallocate_merges_with_both_neighbors() {
        let mut list = ChunkList::new(1024);
        let a = list.allocate(64, 16, 0).unwrap().unwrap();
        let b = list.allocate(64, 16, 0).unwrap().unwrap();
        let _c = list.allocate(64, 16, 0).unwrap().unwrap();
        check_invariants(&list);
        assert_eq!(list.chunk_count(), 4);

        list.deallocate(a).unwrap();
        check_invariants(&list);
        list.deallocate(b).unwrap();
        check_invariants(&list);

        // a and b were adjacent free chunks and must have merged into one.
        assert_eq!(list.chunk_count(), 3);
    }

    #[test]
    fn full_round_trip_returns_to_single_free_chunk() {
        let mut list = ChunkList::new(256);
        let a = list.allocate(64, 16, 0).unwrap().unwrap();
        let b = list.allocate(64, 16, 0).unwrap().unwrap();
        let c = list.allocate(128, 16, 0).unwrap().unwrap();
        check_invariants(&list);

        list.deallocate(b).unwrap();
        list.deallocate(a).unwrap();
        list.deallocate(c).unwrap();
        check_invariants(&list);

        assert!(list.is_entirely_free());
        assert_eq!(list.chunk_count(), 1);
    }

    #[test]
    fn deallocate_idempotent_coalescing_is_order_independent() {
        let mut forward = ChunkList::new(512);
        let f1 = forward.allocate(64, 16, 0).unwrap().unwrap();
        let f2 = forward.allocate(64, 16, 0).unwrap().unwrap();
        let f3 = forward.allocate(64, 16, 0).unwrap().unwrap();
        forward.deallocate(f1).unwrap();
        forward.deallocate(f2).unwrap();
        forward.deallocate(f3).unwrap();
        check_invariants(&forward);

        let mut backward = ChunkList::new(512);
        let b1 = backward.allocate(64, 16, 0).unwrap().unwrap();
        let b2 = backward.allocate(64, 16, 0).unwrap().unwrap();
        let b3 = backward.allocate(64, 16, 0).unwrap().unwrap();
        backward.deallocate(b3).unwrap();
        backward.deallocate(b2).unwrap();
        backward.deallocate(b1).unwrap();
        check_invariants(&backward);

        assert!(forward.is_entirely_free());
        assert!(backward.is_entirely_free());
    }
}
