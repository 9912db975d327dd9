use std::{cmp, ptr, ptr::NonNull};

use crate::{
    block::{BlockPtr, MIN_BLOCK_SIZE},
    freelist::FreeList,
    region::RegionProvider,
    tag::{align_up, Tag, DOUBLE_WORD},
    AllocError, Pointer,
};

/// Granularity of on-demand heap growth. When the free list cannot satisfy
/// a request, the window grows by at least this much so that small
/// allocations don't each pay for an extension.
const CHUNK_SIZE: usize = 4096;

/// Consecutive identical-size requests tolerated before [`Heap::find_fit`]
/// stops walking the list. Empirical, not load bearing; see `find_fit`.
const REPEAT_LIMIT: usize = 30;

/// Boundary-tagged heap allocator over a [`RegionProvider`]. One value of
/// this type owns the whole machinery: the managed byte range, the
/// explicit free list threaded through it and the first-fit policy state.
///
/// The window starts with a fixed preamble and ends with a relocating
/// epilogue word, so that block traversal never needs bounds checks in
/// either direction:
///
/// ```text
///        +-----+----------+----------+=================+----------+
///        | pad | prologue | prologue |   real blocks   | epilogue |
///        |     | header   | footer   |       ...       | header   |
///        +-----+----------+----------+=================+----------+
///        base              ^          ^                            high
///                          |          |
///                          sentinel   first payload address
/// ```
///
/// The prologue is a permanently allocated block of one double word; its
/// footer is what a backward step from the first real block lands on. The
/// epilogue is a lone header of size zero, also permanently allocated, that
/// terminates forward walks and is overwritten (and rewritten one block
/// further) by every extension.
///
/// All operations are synchronous and the value is not reentrant: callers
/// that share a [`Heap`] across threads must serialize access themselves,
/// wrapping it in whatever lock fits their use case.
pub struct Heap<R: RegionProvider> {
    /// Where the bytes come from. Only ever grows.
    pub(crate) region: R,
    /// Payload address of the first real block, right after the prologue.
    /// Fixed for the lifetime of the heap.
    pub(crate) first_block: BlockPtr,
    /// All currently free blocks, most recently freed first.
    pub(crate) free_blocks: FreeList,
    /// Adjusted size of the most recent successful fit.
    pub(crate) last_fit_size: usize,
    /// How many requests in a row asked for `last_fit_size` bytes.
    pub(crate) repeat_count: usize,
}

impl<R: RegionProvider> Heap<R> {
    /// Builds the heap over `region`: writes the prologue and epilogue
    /// sentinels and seeds the window with one free block of minimum size.
    /// Fails if the provider refuses the initial extensions.
    pub fn init(mut region: R) -> Result<Self, AllocError> {
        let Some(base) = region.extend(2 * DOUBLE_WORD) else {
            return Err(AllocError);
        };

        unsafe {
            // The first word stays as alignment padding. The prologue
            // block is header plus footer and nothing else; its payload
            // address doubles as the free list sentinel.
            let prologue = BlockPtr::new(NonNull::new_unchecked(
                base.as_ptr().add(DOUBLE_WORD),
            ));
            prologue.set_header(Tag::new(DOUBLE_WORD, true));
            prologue.set_footer(Tag::new(DOUBLE_WORD, true));

            // Epilogue, until the first extension relocates it.
            let first_block = BlockPtr::new(NonNull::new_unchecked(
                base.as_ptr().add(2 * DOUBLE_WORD),
            ));
            first_block.set_header(Tag::new(0, true));

            let mut heap = Self {
                region,
                first_block,
                free_blocks: FreeList::new(prologue),
                last_fit_size: 0,
                repeat_count: 0,
            };

            if heap.extend_heap(MIN_BLOCK_SIZE).is_none() {
                return Err(AllocError);
            }

            Ok(heap)
        }
    }

    /// Allocates `size` bytes, returning a payload address aligned to two
    /// words, or `None` when `size` is zero or the region provider refuses
    /// to grow. The payload is uninitialized.
    pub fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        // Room for header and footer, rounded up to the alignment unit.
        // Requests at or below one double word all take a minimum block.
        let asize = if size <= DOUBLE_WORD {
            2 * DOUBLE_WORD
        } else {
            align_up(size + DOUBLE_WORD)
        };

        unsafe {
            let bp = match self.find_fit(asize) {
                Some(bp) => bp,
                None => BlockPtr::new(self.extend_heap(cmp::max(asize, CHUNK_SIZE))?),
            };

            self.place(bp, asize);

            Some(bp.payload())
        }
    }

    /// Returns a block to the heap. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Heap::allocate`] or
    /// [`Heap::reallocate`] on this same heap and not freed since. Double
    /// frees and foreign pointers are undefined behavior; they are not
    /// detected here, though [`Heap::check`] can usually diagnose the
    /// aftermath.
    pub unsafe fn free(&mut self, ptr: Pointer<u8>) {
        let Some(address) = ptr else { return };

        let bp = BlockPtr::new(address);
        let size = bp.size();

        bp.set_header(Tag::new(size, false));
        bp.set_footer(Tag::new(size, false));

        self.coalesce(bp);
    }

    /// Resizes the allocation at `ptr` to hold at least `size` bytes,
    /// preserving the payload up to the smaller of the old and new sizes.
    /// The block grows in place whenever its forward neighbor can absorb
    /// the difference; only otherwise do the contents move.
    ///
    /// `None` as `ptr` delegates to [`Heap::allocate`]; `size` zero frees
    /// the block and returns `None`, which is also the result when the
    /// region provider refuses to grow (the old block stays valid in that
    /// case).
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::free`].
    pub unsafe fn reallocate(&mut self, ptr: Pointer<u8>, size: usize) -> Pointer<u8> {
        let Some(address) = ptr else {
            return self.allocate(size);
        };

        if size == 0 {
            self.free(ptr);
            return None;
        }

        let bp = BlockPtr::new(address);
        let old_size = bp.size();
        // Header and footer overhead on top of the requested payload,
        // rounded to the alignment unit.
        let new_size = align_up(size + DOUBLE_WORD);

        if new_size <= old_size {
            return Some(address);
        }

        if self.grow_in_place(bp, new_size) {
            return Some(address);
        }

        // Boxed in; move the contents to a freshly served block. The copy
        // is capped at the old payload capacity.
        let new_address = self.allocate(new_size)?;
        let count = cmp::min(old_size - DOUBLE_WORD, size);
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), count);
        self.free(Some(address));

        Some(new_address)
    }

    /// Grows the window by at least `bytes` (rounded up to the alignment
    /// unit, floored at the minimum block size) and shapes the new bytes
    /// into a free block whose header overwrites the previous epilogue. A
    /// fresh epilogue is written after it, then the block is coalesced
    /// with a trailing free neighbor if there is one. Returns the payload
    /// address of the (possibly merged) free block, or `None` if the
    /// provider refuses, in which case the heap is untouched.
    unsafe fn extend_heap(&mut self, bytes: usize) -> Pointer<u8> {
        let size = cmp::max(align_up(bytes), MIN_BLOCK_SIZE);

        let address = self.region.extend(size)?;

        // The extension starts where the old epilogue's block would have:
        // its payload address is the first new byte and its header lands
        // exactly on the old epilogue word.
        let bp = BlockPtr::new(address);
        bp.set_header(Tag::new(size, false));
        bp.set_footer(Tag::new(size, false));
        bp.next_block().set_header(Tag::new(0, true));

        Some(self.coalesce(bp).payload())
    }

    /// Boundary tag coalescing. `bp`'s header and footer must already be
    /// marked free; its neighbors decide which of the four merge cases
    /// applies. The merged block ends up on the free list and its payload
    /// address (which moves backward when the previous block is absorbed)
    /// is returned.
    unsafe fn coalesce(&mut self, mut bp: BlockPtr) -> BlockPtr {
        // A backward step that lands on the block itself means there is
        // nothing before it but the prologue region; treat it as allocated.
        let prev_allocated = bp.prev_footer().is_allocated() || bp.prev_block() == bp;
        let next = bp.next_block();
        let next_allocated = next.is_allocated();

        let mut size = bp.size();

        if prev_allocated && !next_allocated {
            self.free_blocks.remove(next);
            size += next.size();
        } else if !prev_allocated && next_allocated {
            let prev = bp.prev_block();
            self.free_blocks.remove(prev);
            size += prev.size();
            bp = prev;
        } else if !prev_allocated && !next_allocated {
            let prev = bp.prev_block();
            self.free_blocks.remove(prev);
            self.free_blocks.remove(next);
            size += prev.size() + next.size();
            bp = prev;
        }

        bp.set_header(Tag::new(size, false));
        bp.set_footer(Tag::new(size, false));
        self.free_blocks.insert(bp);

        bp
    }

    /// First-fit search for a free block of at least `asize` bytes.
    ///
    /// Long runs of identical-size requests are special cased: each one
    /// would rescan the same ever-growing list just to fail at the end, so
    /// past [`REPEAT_LIMIT`] repetitions the walk is skipped and the
    /// request is served straight from a fresh extension.
    unsafe fn find_fit(&mut self, asize: usize) -> Option<BlockPtr> {
        if asize == self.last_fit_size {
            self.repeat_count += 1;

            if self.repeat_count > REPEAT_LIMIT {
                return self
                    .extend_heap(cmp::max(asize, MIN_BLOCK_SIZE))
                    .map(BlockPtr::new);
            }
        } else {
            self.repeat_count = 0;
        }

        for bp in self.free_blocks.blocks() {
            if bp.size() >= asize {
                self.last_fit_size = asize;
                return Some(bp);
            }
        }

        None
    }

    /// Serves `asize` bytes from the free block `bp`, splitting off the
    /// remainder as a new free block when it is big enough to stand alone.
    /// Otherwise the whole block is handed out, wasting at most one double
    /// word less than the minimum block size.
    unsafe fn place(&mut self, bp: BlockPtr, asize: usize) {
        let csize = bp.size();

        if csize - asize >= MIN_BLOCK_SIZE {
            bp.set_header(Tag::new(asize, true));
            bp.set_footer(Tag::new(asize, true));
            self.free_blocks.remove(bp);

            let tail = bp.next_block();
            tail.set_header(Tag::new(csize - asize, false));
            tail.set_footer(Tag::new(csize - asize, false));
            self.coalesce(tail);
        } else {
            bp.set_header(Tag::new(csize, true));
            bp.set_footer(Tag::new(csize, true));
            self.free_blocks.remove(bp);
        }
    }

    /// Tries to grow the allocated block `bp` to `new_size` total bytes
    /// without moving it: by absorbing a free forward neighbor, and when
    /// `bp` sits at the end of the window (directly or behind one trailing
    /// free block), by extending the heap first. Returns whether the block
    /// now holds `new_size` bytes at the same address.
    unsafe fn grow_in_place(&mut self, bp: BlockPtr, new_size: usize) -> bool {
        let old_size = bp.size();
        let next = bp.next_block();

        let trailing_free = if next.is_allocated() {
            None
        } else {
            Some(next.size())
        };

        if let Some(next_size) = trailing_free {
            if old_size + next_size >= new_size {
                self.free_blocks.remove(next);
                let merged = old_size + next_size;
                bp.set_header(Tag::new(merged, true));
                bp.set_footer(Tag::new(merged, true));
                return true;
            }

            // A free neighbor that is too small only helps if the window
            // ends right behind it, so the shortfall can come from an
            // extension that will merge into it.
            if !next.next_block().header().is_epilogue() {
                return false;
            }
        } else if !next.header().is_epilogue() {
            return false;
        }

        let shortfall = new_size - old_size - trailing_free.unwrap_or(0);
        if self.extend_heap(shortfall).is_none() {
            return false;
        }

        // The extension coalesced with the trailing free block if there
        // was one, so the forward neighbor is now a single free block big
        // enough to absorb.
        let next = bp.next_block();
        self.free_blocks.remove(next);
        let merged = old_size + next.size();
        bp.set_header(Tag::new(merged, true));
        bp.set_footer(Tag::new(merged, true));

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SbrkRegion;

    fn heap() -> Heap<SbrkRegion> {
        Heap::init(SbrkRegion::new().unwrap()).unwrap()
    }

    /// The adjusted block size `allocate` computes for a payload request.
    fn adjusted(size: usize) -> usize {
        if size <= DOUBLE_WORD {
            2 * DOUBLE_WORD
        } else {
            align_up(size + DOUBLE_WORD)
        }
    }

    #[test]
    fn init_seeds_one_minimum_free_block() {
        let heap = heap();

        assert_eq!(heap.free_blocks.len(), 1);
        unsafe {
            let seed = heap.free_blocks.head();
            assert_eq!(seed, heap.first_block);
            assert_eq!(seed.size(), MIN_BLOCK_SIZE);
            assert!(!seed.is_allocated());
        }
        heap.check().unwrap();
    }

    #[test]
    fn allocations_are_aligned_and_min_sized() {
        let mut heap = heap();

        let a = heap.allocate(1).unwrap();
        assert_eq!(a.as_ptr() as usize % DOUBLE_WORD, 0);

        unsafe {
            let block = BlockPtr::new(a);
            assert_eq!(block.size(), MIN_BLOCK_SIZE);
            assert!(block.is_allocated());
        }
        heap.check().unwrap();
    }

    #[test]
    fn allocate_zero_returns_none() {
        let mut heap = heap();
        assert_eq!(heap.allocate(0), None);
        heap.check().unwrap();
    }

    #[test]
    fn free_none_is_a_noop() {
        let mut heap = heap();
        let before = heap.free_blocks.len();
        unsafe { heap.free(None) };
        assert_eq!(heap.free_blocks.len(), before);
    }

    #[test]
    fn lifo_reuse_after_free() {
        let mut heap = heap();

        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();

        unsafe {
            heap.free(Some(a));
            // Same size goes straight back to the same block: the freed
            // block is the list head and first fit takes the head.
            let c = heap.allocate(64).unwrap();
            assert_eq!(c, a);
        }
        heap.check().unwrap();
    }

    #[test]
    fn freeing_neighbors_coalesces_them() {
        let mut heap = heap();

        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();

        unsafe {
            heap.free(Some(a));
            heap.free(Some(b));
        }

        // Both blocks plus the remainder of the chunk merge into a single
        // free block.
        assert_eq!(heap.free_blocks.len(), 1);
        unsafe {
            assert!(heap.free_blocks.head().size() >= 2 * adjusted(64));
        }
        heap.check().unwrap();
    }

    #[test]
    fn payloads_do_not_overlap() {
        let mut heap = heap();

        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(32).unwrap();
        let c = heap.allocate(32).unwrap();

        unsafe {
            a.as_ptr().write_bytes(0x11, 32);
            b.as_ptr().write_bytes(0x22, 32);
            c.as_ptr().write_bytes(0x33, 32);

            for i in 0..32 {
                assert_eq!(*a.as_ptr().add(i), 0x11);
                assert_eq!(*b.as_ptr().add(i), 0x22);
                assert_eq!(*c.as_ptr().add(i), 0x33);
            }
        }
        heap.check().unwrap();
    }

    #[test]
    fn realloc_within_capacity_returns_same_pointer() {
        let mut heap = heap();

        let a = heap.allocate(100).unwrap();
        let capacity = unsafe { BlockPtr::new(a).size() } - DOUBLE_WORD;

        unsafe {
            assert_eq!(heap.reallocate(Some(a), capacity), Some(a));
            assert_eq!(heap.reallocate(Some(a), 10), Some(a));
        }
        heap.check().unwrap();
    }

    #[test]
    fn realloc_absorbs_free_forward_neighbor() {
        let mut heap = heap();

        let a = heap.allocate(32).unwrap();
        let b = heap.allocate(32).unwrap();
        // Keep the heap tail busy so absorption is the only in-place path.
        let _guard = heap.allocate(32).unwrap();

        unsafe {
            heap.free(Some(b));

            let c = heap.reallocate(Some(a), 48).unwrap();
            assert_eq!(c, a);

            // The merged block covers what used to be b.
            assert!(BlockPtr::new(a).size() >= adjusted(32) + adjusted(32));
        }
        heap.check().unwrap();
    }

    #[test]
    fn realloc_moves_and_preserves_contents() {
        let mut heap = heap();

        let a = heap.allocate(32).unwrap();
        let _b = heap.allocate(32).unwrap();

        unsafe {
            for i in 0..32 {
                *a.as_ptr().add(i) = i as u8;
            }

            let c = heap.reallocate(Some(a), 256).unwrap();
            assert_ne!(c, a);

            for i in 0..32 {
                assert_eq!(*c.as_ptr().add(i), i as u8);
            }
        }
        heap.check().unwrap();
    }

    #[test]
    fn realloc_grows_last_block_without_moving() {
        let mut heap = heap();

        let a = heap.allocate(32).unwrap();
        // `a` is followed by the free remainder of the first chunk, which
        // is itself followed by the epilogue.
        assert_eq!(heap.free_blocks.len(), 1);

        unsafe {
            // Growing far past the chunk extends the heap in place: the
            // extension merges into the remainder and `a` absorbs it.
            let c = heap.reallocate(Some(a), 3 * CHUNK_SIZE).unwrap();
            assert_eq!(c, a);
            assert!(BlockPtr::new(a).size() >= 3 * CHUNK_SIZE);
        }
        heap.check().unwrap();
    }

    #[test]
    fn realloc_extends_past_epilogue_with_no_trailing_free_block() {
        let mut heap = heap();

        // Exactly consumes the minimum-sized seed block: no split
        // remainder, the epilogue sits directly behind `a`.
        let a = heap.allocate(DOUBLE_WORD).unwrap();
        assert_eq!(heap.free_blocks.len(), 0);

        unsafe {
            let c = heap.reallocate(Some(a), 64).unwrap();
            assert_eq!(c, a);
            assert!(BlockPtr::new(a).size() >= adjusted(64));
        }
        heap.check().unwrap();
    }

    #[test]
    fn realloc_none_allocates() {
        let mut heap = heap();

        let a = unsafe { heap.reallocate(None, 64) }.unwrap();
        assert_eq!(a.as_ptr() as usize % DOUBLE_WORD, 0);
        heap.check().unwrap();
    }

    #[test]
    fn realloc_zero_frees() {
        let mut heap = heap();

        let a = heap.allocate(64).unwrap();
        let free_before = heap.free_blocks.len();

        unsafe {
            assert_eq!(heap.reallocate(Some(a), 0), None);
        }

        // The freed block merged with the chunk remainder, so the count
        // does not grow, but the head must now cover a's old address.
        assert!(heap.free_blocks.len() <= free_before + 1);
        assert_eq!(heap.free_blocks.head().payload(), a);
        heap.check().unwrap();
    }

    #[test]
    fn repeated_sizes_escape_the_list_walk() {
        let mut heap = heap();

        let mut addresses = Vec::new();
        for _ in 0..40 {
            addresses.push(heap.allocate(128).unwrap());
        }

        // Past the limit the allocator stops scanning and extends
        // directly.
        assert!(heap.repeat_count > REPEAT_LIMIT);

        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), 40);
        heap.check().unwrap();
    }

    #[test]
    fn varying_sizes_reset_the_repeat_counter() {
        let mut heap = heap();

        for _ in 0..5 {
            heap.allocate(128).unwrap();
        }
        heap.allocate(256).unwrap();

        assert_eq!(heap.repeat_count, 0);
        heap.check().unwrap();
    }

    #[test]
    fn exhaustion_reports_none_and_leaves_heap_valid() {
        let region = SbrkRegion::with_capacity(2 * CHUNK_SIZE).unwrap();
        let mut heap = Heap::init(region).unwrap();

        // Far beyond what the region can provide.
        assert_eq!(heap.allocate(4 * CHUNK_SIZE), None);
        heap.check().unwrap();

        // Smaller requests still work afterwards.
        let a = heap.allocate(512).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0x5A, 512);
        }
        heap.check().unwrap();
    }

    #[test]
    fn failed_realloc_keeps_old_block() {
        let region = SbrkRegion::with_capacity(2 * CHUNK_SIZE).unwrap();
        let mut heap = Heap::init(region).unwrap();

        let a = heap.allocate(64).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0x7E, 64);

            assert_eq!(heap.reallocate(Some(a), 4 * CHUNK_SIZE), None);

            for i in 0..64 {
                assert_eq!(*a.as_ptr().add(i), 0x7E);
            }
        }
        heap.check().unwrap();
    }

    #[test]
    fn interleaved_operations_stay_consistent() {
        let mut heap = heap();
        let mut live = Vec::new();

        for round in 1..=12usize {
            for size in [8, 24, 100, 512] {
                live.push(heap.allocate(size * round % 700 + 1).unwrap());
            }

            // Free every other block to fragment the list.
            let mut index = 0;
            live.retain(|&address| {
                index += 1;
                if index % 2 == 0 {
                    unsafe { heap.free(Some(address)) };
                    false
                } else {
                    true
                }
            });

            heap.check().unwrap();
        }

        for address in live {
            unsafe { heap.free(Some(address)) };
        }
        heap.check().unwrap();
    }
}
