use std::{ptr, ptr::NonNull};

use crate::{
    tag::{Tag, DOUBLE_WORD, WORD_SIZE},
    Pointer,
};

/// Minimum block size in bytes: header, footer and a payload area big
/// enough for the two free-list links that are overlaid on it when the
/// block is free. See [`BlockPtr`] and [`crate::freelist::FreeList`].
pub(crate) const MIN_BLOCK_SIZE: usize = 2 * DOUBLE_WORD;

/// View of one heap block, addressed by its payload pointer. This is what
/// allocation returns to the caller and what every internal routine passes
/// around. Here's how the block it describes looks like in memory:
///
/// ```text
///               +-----------------------------+
///     bp - W    | header: size | alloc bit    |
///               +-----------------------------+  <--- bp (payload address)
///     bp        | prev free block (when free) |
///               +-----------------------------+
///     bp + W    | next free block (when free) |
///               +-----------------------------+
///               |             ...             |
///               +-----------------------------+
/// bp + size-2W  | footer: size | alloc bit    |
///               +-----------------------------+
/// bp + size - W | next block's header         |
///               +-----------------------------+
/// ```
///
/// `size` is the total byte size of the block, header and footer included,
/// and is always a multiple of [`DOUBLE_WORD`]. The footer mirrors the
/// header so that the block *before* this one can be reached by reading the
/// single word right under `bp`, without knowing anything else about it.
/// Allocated blocks keep their footer too, the payload area is simply one
/// double word smaller than the block.
///
/// While a block is allocated the payload belongs to the caller and we
/// never touch it. While it is free the first two payload words store the
/// free-list links, which is why [`MIN_BLOCK_SIZE`] can never go below two
/// double words.
///
/// This type and [`Tag`] are the only places that read or write raw heap
/// bytes; everything above them works in terms of these methods. All of
/// them require the block to live inside the managed region, so they are
/// `unsafe` and the policy layer at [`crate::heap`] is responsible for only
/// ever constructing [`BlockPtr`] values from addresses it carved out
/// itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockPtr(NonNull<u8>);

impl BlockPtr {
    #[inline]
    pub fn new(payload: NonNull<u8>) -> Self {
        Self(payload)
    }

    /// The address handed out to the allocator user.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.0
    }

    /// Payload address as an integer, for alignment checks and diagnostics.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    unsafe fn header_ptr(self) -> *mut usize {
        self.0.as_ptr().sub(WORD_SIZE).cast()
    }

    /// Footer location depends on the *current* header, so a header rewrite
    /// moves the footer with it.
    #[inline]
    unsafe fn footer_ptr(self) -> *mut usize {
        self.0.as_ptr().add(self.size() - DOUBLE_WORD).cast()
    }

    #[inline]
    pub unsafe fn header(self) -> Tag {
        Tag::from_word(*self.header_ptr())
    }

    #[inline]
    pub unsafe fn set_header(self, tag: Tag) {
        *self.header_ptr() = tag.word();
    }

    /// Reads the footer. Must not be called on the epilogue, which is a
    /// lone header word.
    #[inline]
    pub unsafe fn footer(self) -> Tag {
        Tag::from_word(*self.footer_ptr())
    }

    #[inline]
    pub unsafe fn set_footer(self, tag: Tag) {
        *self.footer_ptr() = tag.word();
    }

    /// Total block size in bytes, as recorded in the header.
    #[inline]
    pub unsafe fn size(self) -> usize {
        self.header().size()
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        self.header().is_allocated()
    }

    /// The block starting right after this one ends. Calling this on the
    /// last real block yields the epilogue pseudo-block.
    #[inline]
    pub unsafe fn next_block(self) -> BlockPtr {
        BlockPtr(NonNull::new_unchecked(self.0.as_ptr().add(self.size())))
    }

    /// The footer of the block right before this one: the single word under
    /// the payload address.
    #[inline]
    pub unsafe fn prev_footer(self) -> Tag {
        Tag::from_word(*self.0.as_ptr().sub(DOUBLE_WORD).cast::<usize>())
    }

    /// The block right before this one, reached through its footer. When
    /// the word under `bp` has size zero this degenerates to `bp` itself,
    /// which the coalescing code checks for explicitly to avoid walking off
    /// the front of the heap.
    #[inline]
    pub unsafe fn prev_block(self) -> BlockPtr {
        BlockPtr(NonNull::new_unchecked(
            self.0.as_ptr().sub(self.prev_footer().size()),
        ))
    }

    /// Free-list predecessor link, stored in the first payload word. Only
    /// meaningful while the block is free and linked. Null terminates the
    /// `prev` direction (the head of the list has no predecessor).
    #[inline]
    pub unsafe fn free_prev(self) -> Pointer<u8> {
        NonNull::new(*self.0.as_ptr().cast::<*mut u8>())
    }

    #[inline]
    pub unsafe fn set_free_prev(self, link: Option<BlockPtr>) {
        let raw = link.map_or(ptr::null_mut(), |bp| bp.0.as_ptr());
        *self.0.as_ptr().cast::<*mut u8>() = raw;
    }

    /// Free-list successor link, stored in the second payload word. Never
    /// null in a well formed list: the `next` direction is terminated by
    /// the prologue sentinel, whose header word is allocated.
    #[inline]
    pub unsafe fn free_next(self) -> BlockPtr {
        BlockPtr(NonNull::new_unchecked(self.free_next_raw()))
    }

    /// Raw successor word, for the consistency checker which must survive a
    /// corrupted (possibly null) link.
    #[inline]
    pub unsafe fn free_next_raw(self) -> *mut u8 {
        *self.0.as_ptr().add(WORD_SIZE).cast::<*mut u8>()
    }

    #[inline]
    pub unsafe fn set_free_next(self, link: BlockPtr) {
        *self.0.as_ptr().add(WORD_SIZE).cast::<*mut u8>() = link.0.as_ptr();
    }
}
