use std::mem;

/// Machine word size in bytes. Blocks are described by one-word boundary
/// tags, so this is the unit everything else in the heap is measured in.
/// 8 bytes on the 64 bit machines this will usually run on.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// The alignment unit. Every payload address we hand out is aligned to two
/// words and every block size is a multiple of this.
pub(crate) const DOUBLE_WORD: usize = 2 * WORD_SIZE;

/// Rounds `size` up to the next multiple of [`DOUBLE_WORD`].
#[inline]
pub(crate) const fn align_up(size: usize) -> usize {
    (size + DOUBLE_WORD - 1) & !(DOUBLE_WORD - 1)
}

/// A boundary tag. Each block in the heap starts and ends with one of these
/// words, which encodes the total block size together with the allocation
/// bit:
///
/// ```text
///  63                                    4  3  2  1  0
/// +--------------------------------------------------+
/// | s  s  s  s  s  s  s  .....  s  s  s  0  0  0  a  |
/// +--------------------------------------------------+
/// ```
///
/// Since sizes are always multiples of [`DOUBLE_WORD`], the low bits of the
/// size are guaranteed to be zero and the lowest one can carry the
/// allocation state. Placing the same tag at both ends of the block is what
/// makes neighbor traversal O(1) in both directions, see
/// [`crate::block::BlockPtr`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Tag(usize);

impl Tag {
    /// Packs `size` and the allocation state into one word. `size` must be
    /// a multiple of [`DOUBLE_WORD`] (zero is allowed, the epilogue tag
    /// uses it).
    #[inline]
    pub fn new(size: usize, allocated: bool) -> Self {
        debug_assert!(size % DOUBLE_WORD == 0, "unaligned block size {size}");
        Self(size | allocated as usize)
    }

    /// Reinterprets a word read from the heap as a tag.
    #[inline]
    pub fn from_word(word: usize) -> Self {
        Self(word)
    }

    /// The raw word as it is stored in the heap.
    #[inline]
    pub fn word(self) -> usize {
        self.0
    }

    /// Total block size in bytes, header and footer included.
    #[inline]
    pub fn size(self) -> usize {
        self.0 & !(DOUBLE_WORD - 1)
    }

    #[inline]
    pub fn is_allocated(self) -> bool {
        self.0 & 1 == 1
    }

    /// The epilogue is the only block with size zero; it terminates every
    /// forward walk over the heap.
    #[inline]
    pub fn is_epilogue(self) -> bool {
        self.size() == 0
    }
}
