use crate::block::BlockPtr;

/// Explicit free list: a doubly-linked list threaded through the payload
/// area of every free block. Since free payloads belong to nobody, the
/// first two words of each one are repurposed as the links (see
/// [`crate::block::BlockPtr::free_prev`] and
/// [`crate::block::BlockPtr::free_next`]):
///
/// ```text
///  head
///   |
///   v
/// +-------+     +-------+     +-------+     +----------+
/// | free  | --> | free  | --> | free  | --> | sentinel |
/// |       | <-- |       | <-- |       |     +----------+
/// +-------+     +-------+     +-------+
///     |
///     +--> prev link is null at the head
/// ```
///
/// Two details are inherited from the block layout rather than chosen
/// freely:
///
/// - The `next` direction is not terminated by null but by the *sentinel*:
///   the prologue's payload address, fixed for the lifetime of the heap.
///   The word right under it is the prologue header, which is permanently
///   marked allocated, so every walk can use the same loop guard ("stop at
///   the first allocated header") without a special case for the empty
///   list.
/// - The `prev` direction does use null, because nothing sits before the
///   head.
///
/// Insertion is LIFO: the most recently freed block becomes the head and is
/// therefore the first candidate of the next first-fit search. No ordering
/// by address or size is maintained.
pub(crate) struct FreeList {
    /// Most recently inserted free block, or the sentinel when empty.
    head: BlockPtr,
    /// Number of linked blocks, for tests and the consistency checker.
    len: usize,
}

impl FreeList {
    /// Builds an empty list terminated by `sentinel`, whose header word
    /// must be permanently allocated.
    pub fn new(sentinel: BlockPtr) -> Self {
        Self {
            head: sentinel,
            len: 0,
        }
    }

    #[inline]
    pub fn head(&self) -> BlockPtr {
        self.head
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// LIFO push. `bp` must be a free block inside the heap that is not
    /// currently linked; its header and footer must already be written.
    pub unsafe fn insert(&mut self, bp: BlockPtr) {
        bp.set_free_next(self.head);

        // The sentinel has no link words to update, only real free blocks
        // store a predecessor.
        if !self.head.is_allocated() {
            self.head.set_free_prev(Some(bp));
        }

        bp.set_free_prev(None);
        self.head = bp;
        self.len += 1;
    }

    /// Unlinks `bp`, which must currently be on the list.
    pub unsafe fn remove(&mut self, bp: BlockPtr) {
        let next = bp.free_next();

        match bp.free_prev() {
            Some(prev) => BlockPtr::new(prev).set_free_next(next),
            None => self.head = next,
        }

        if !next.is_allocated() {
            next.set_free_prev(bp.free_prev().map(BlockPtr::new));
        }

        self.len -= 1;
    }

    /// Iterates over the linked free blocks in LIFO order.
    pub unsafe fn blocks(&self) -> FreeBlocks {
        FreeBlocks { current: self.head }
    }
}

/// See [`FreeList::blocks`]. The iterator holds no borrow, it just chases
/// the links until it hits an allocated header (the sentinel).
pub(crate) struct FreeBlocks {
    current: BlockPtr,
}

impl Iterator for FreeBlocks {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<BlockPtr> {
        unsafe {
            if self.current.is_allocated() {
                return None;
            }

            let bp = self.current;
            self.current = bp.free_next();
            Some(bp)
        }
    }
}
