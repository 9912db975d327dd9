use std::{error::Error, fmt, ptr::NonNull};

use crate::{
    block::{BlockPtr, MIN_BLOCK_SIZE},
    heap::Heap,
    region::RegionProvider,
    tag::{Tag, DOUBLE_WORD, WORD_SIZE},
};

/// Everything the consistency walk can complain about. Addresses are plain
/// integers because the blocks they point at are, by definition of the
/// error, not safe to keep around as pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The prologue tags are not a double word, allocated, pair.
    BadPrologue { at: usize },
    /// The heap walk did not end on an allocated size-zero header sitting
    /// on the last word of the window.
    BadEpilogue { at: usize },
    /// Payload address not aligned to two words.
    Misaligned { at: usize },
    /// Block size below the minimum or not a multiple of the alignment
    /// unit.
    BadSize { at: usize, size: usize },
    /// Header and footer disagree.
    TagMismatch { at: usize },
    /// Two adjacent free blocks; immediate coalescing should have merged
    /// them.
    AdjacentFree { at: usize },
    /// A block walk stepped outside the managed window.
    OutOfWindow { at: usize },
    /// A free-list node with a null successor, an allocated header behind
    /// it, or a predecessor link that does not point back.
    BrokenLink { at: usize },
    /// The free list and the heap walk disagree on how many free blocks
    /// exist.
    CountMismatch { walked: usize, listed: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::BadPrologue { at } => write!(f, "bad prologue at {at:#x}"),
            CheckError::BadEpilogue { at } => write!(f, "bad epilogue at {at:#x}"),
            CheckError::Misaligned { at } => {
                write!(f, "block {at:#x} is not double word aligned")
            }
            CheckError::BadSize { at, size } => {
                write!(f, "block {at:#x} has invalid size {size}")
            }
            CheckError::TagMismatch { at } => {
                write!(f, "header and footer of block {at:#x} disagree")
            }
            CheckError::AdjacentFree { at } => {
                write!(f, "block {at:#x} and its predecessor are both free")
            }
            CheckError::OutOfWindow { at } => {
                write!(f, "walk left the heap window at {at:#x}")
            }
            CheckError::BrokenLink { at } => {
                write!(f, "free list is broken at {at:#x}")
            }
            CheckError::CountMismatch { walked, listed } => {
                write!(
                    f,
                    "heap has {walked} free blocks but the free list has {listed}"
                )
            }
        }
    }
}

impl Error for CheckError {}

impl<R: RegionProvider> Heap<R> {
    /// Verifies every invariant the allocator is supposed to maintain:
    /// prologue and epilogue shape, per-block alignment, size granularity,
    /// header/footer agreement, absence of adjacent free blocks, and the
    /// integrity of the free list against the set of free blocks found by
    /// walking the heap. Not on the allocation path; meant for tests and
    /// for diagnosing heap corruption after the fact.
    pub fn check(&self) -> Result<(), CheckError> {
        let low = self.region.low().as_ptr() as usize;
        let high = self.region.high().as_ptr() as usize;

        unsafe {
            let prologue = BlockPtr::new(NonNull::new_unchecked(
                self.region.low().as_ptr().add(DOUBLE_WORD),
            ));
            let expected = Tag::new(DOUBLE_WORD, true);
            if prologue.header() != expected || prologue.footer() != expected {
                return Err(CheckError::BadPrologue {
                    at: prologue.addr(),
                });
            }

            let walked = self.walk_blocks(low, high)?;
            let listed = self.walk_free_list(low, high, walked)?;

            if listed != walked {
                return Err(CheckError::CountMismatch { walked, listed });
            }

            Ok(())
        }
    }

    /// Forward walk over every block, from the first real one to the
    /// epilogue. Returns the number of free blocks seen.
    unsafe fn walk_blocks(&self, low: usize, high: usize) -> Result<usize, CheckError> {
        let mut free_seen = 0;
        let mut previous_free = false;
        let mut bp = self.first_block;

        while !bp.header().is_epilogue() {
            if bp.addr() % DOUBLE_WORD != 0 {
                return Err(CheckError::Misaligned { at: bp.addr() });
            }

            let size = bp.size();
            if size < MIN_BLOCK_SIZE || size % DOUBLE_WORD != 0 {
                return Err(CheckError::BadSize {
                    at: bp.addr(),
                    size,
                });
            }

            if bp.header() != bp.footer() {
                return Err(CheckError::TagMismatch { at: bp.addr() });
            }

            let free = !bp.is_allocated();
            if free && previous_free {
                return Err(CheckError::AdjacentFree { at: bp.addr() });
            }
            free_seen += usize::from(free);
            previous_free = free;

            bp = bp.next_block();

            // A corrupted size could send the walk past the window; stop
            // before reading a header that is not ours.
            if bp.addr() > high || bp.addr() <= low {
                return Err(CheckError::OutOfWindow { at: bp.addr() });
            }
        }

        // The epilogue must be allocated and sit exactly on the last word.
        if !bp.header().is_allocated() || bp.addr() != high {
            return Err(CheckError::BadEpilogue { at: bp.addr() });
        }

        Ok(free_seen)
    }

    /// Walks the free list, verifying links as it goes. `expected` bounds
    /// the walk so a cyclic list cannot hang the checker. Returns the
    /// number of linked nodes.
    unsafe fn walk_free_list(
        &self,
        low: usize,
        high: usize,
        expected: usize,
    ) -> Result<usize, CheckError> {
        let mut listed = 0;
        let mut previous: Option<BlockPtr> = None;
        let mut node = self.free_blocks.head();

        loop {
            // Bounds and alignment first: the node's header word must be
            // inside the window and readable before anything else.
            if node.addr() < low + WORD_SIZE || node.addr() > high {
                return Err(CheckError::OutOfWindow { at: node.addr() });
            }
            if node.addr() % WORD_SIZE != 0 {
                return Err(CheckError::BrokenLink { at: node.addr() });
            }

            // An allocated header terminates the list; normally that is
            // the prologue sentinel.
            if node.header().is_allocated() {
                break;
            }

            if node.free_prev().map(BlockPtr::new) != previous {
                return Err(CheckError::BrokenLink { at: node.addr() });
            }

            listed += 1;
            if listed > expected {
                return Err(CheckError::CountMismatch {
                    walked: expected,
                    listed,
                });
            }

            previous = Some(node);

            let Some(next) = NonNull::new(node.free_next_raw()) else {
                return Err(CheckError::BrokenLink { at: node.addr() });
            };
            node = BlockPtr::new(next);
        }

        Ok(listed)
    }

    /// Prints every block to stderr, prologue to epilogue, free-list links
    /// included. Companion to [`Heap::check`] for staring at a broken heap.
    pub fn dump(&self) {
        let low = self.region.low().as_ptr() as usize;
        let high = self.region.high().as_ptr() as usize;

        eprintln!(
            "heap [{low:#x}, {high:#x}), {} bytes, {} free blocks listed",
            self.region.size(),
            self.free_blocks.len(),
        );

        unsafe {
            let mut bp = self.first_block;

            while !bp.header().is_epilogue() {
                let header = bp.header();
                let footer = bp.footer();

                if header.is_allocated() {
                    eprintln!(
                        "{:#x}: header [{}:{}] footer [{}:{}]",
                        bp.addr(),
                        header.size(),
                        if header.is_allocated() { 'a' } else { 'f' },
                        footer.size(),
                        if footer.is_allocated() { 'a' } else { 'f' },
                    );
                } else {
                    eprintln!(
                        "{:#x}: header [{}:f] prev {:?} next {:#x} footer [{}:{}]",
                        bp.addr(),
                        header.size(),
                        bp.free_prev().map(|p| p.as_ptr()),
                        bp.free_next_raw() as usize,
                        footer.size(),
                        if footer.is_allocated() { 'a' } else { 'f' },
                    );
                }

                bp = bp.next_block();
                if bp.addr() > high || bp.addr() <= low {
                    eprintln!("{:#x}: walk left the window, stopping", bp.addr());
                    return;
                }
            }

            eprintln!("{:#x}: epilogue", bp.addr());
        }
    }
}
