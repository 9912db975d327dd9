use std::ptr::NonNull;

use crate::{platform, AllocError, Pointer};

/// The sbrk-like collaborator the heap is built on: a single contiguous
/// byte range that can only grow upward. The heap stores its boundary tags
/// and free-list links directly inside this range, so the provider must
/// preserve previously handed out bytes verbatim across extensions.
///
/// [`low`], [`high`] and [`size`] are informational; nothing on the
/// allocation path needs them, only the consistency checker does.
///
/// [`low`]: RegionProvider::low
/// [`high`]: RegionProvider::high
/// [`size`]: RegionProvider::size
pub trait RegionProvider {
    /// Grows the managed range by `increment` bytes, returning the address
    /// of the first newly added byte, or `None` if the provider cannot
    /// grow. A refused extension must leave the range untouched.
    fn extend(&mut self, increment: usize) -> Pointer<u8>;

    /// First byte of the managed range.
    fn low(&self) -> NonNull<u8>;

    /// One past the last byte handed out so far.
    fn high(&self) -> NonNull<u8>;

    /// Number of bytes handed out so far.
    fn size(&self) -> usize;
}

/// sbrk emulation over one up-front reservation. The whole capacity is
/// mapped at construction time and [`extend`] just hands out the next
/// `increment` bytes of it, which keeps the range contiguous the way the
/// real program break would be:
///
/// ```text
/// +--------------------------------+---------------------------+
/// |  handed out (low .. high)      |  reserved, not yet usable |
/// +--------------------------------+---------------------------+
/// base                             brk                         capacity
/// ```
///
/// Touching pages beyond `high` is the heap's bug, not the provider's; the
/// pages are mapped either way, so the consistency checker is the tool
/// that catches it, not a fault.
///
/// The mapping is returned to the OS when the region is dropped, which
/// also ends the lifetime of every block the heap carved out of it.
///
/// [`extend`]: RegionProvider::extend
pub struct SbrkRegion {
    base: NonNull<u8>,
    brk: usize,
    capacity: usize,
}

impl SbrkRegion {
    /// Enough for the allocation traces this was designed around; tune
    /// with [`SbrkRegion::with_capacity`] if it isn't.
    pub const DEFAULT_CAPACITY: usize = 20 * 1024 * 1024;

    pub fn new() -> Result<Self, AllocError> {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Reserves `capacity` bytes, rounded up to whole pages. Fails if the
    /// OS refuses the mapping.
    pub fn with_capacity(capacity: usize) -> Result<Self, AllocError> {
        let page = platform::page_size();
        let capacity = capacity
            .checked_add(page - 1)
            .ok_or(AllocError)?
            / page
            * page;

        let base = unsafe { platform::request_memory(capacity)? };

        Ok(Self {
            base,
            brk: 0,
            capacity,
        })
    }

    /// Bytes still available before [`RegionProvider::extend`] starts
    /// refusing.
    pub fn remaining(&self) -> usize {
        self.capacity - self.brk
    }
}

impl RegionProvider for SbrkRegion {
    fn extend(&mut self, increment: usize) -> Pointer<u8> {
        let new_brk = self.brk.checked_add(increment)?;

        if new_brk > self.capacity {
            return None;
        }

        let address = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) };
        self.brk = new_brk;

        Some(address)
    }

    fn low(&self) -> NonNull<u8> {
        self.base
    }

    fn high(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) }
    }

    fn size(&self) -> usize {
        self.brk
    }
}

impl Drop for SbrkRegion {
    fn drop(&mut self) {
        unsafe { platform::return_memory(self.base, self.capacity) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_are_contiguous() {
        let mut region = SbrkRegion::with_capacity(platform::page_size()).unwrap();

        let first = region.extend(64).unwrap();
        let second = region.extend(128).unwrap();

        assert_eq!(first, region.low());
        assert_eq!(unsafe { first.as_ptr().add(64) }, second.as_ptr());
        assert_eq!(region.size(), 192);
        assert_eq!(unsafe { region.low().as_ptr().add(192) }, region.high().as_ptr());
    }

    #[test]
    fn earlier_bytes_survive_extension() {
        let mut region = SbrkRegion::with_capacity(platform::page_size()).unwrap();

        let first = region.extend(16).unwrap();
        unsafe {
            first.as_ptr().write_bytes(0xAB, 16);
        }

        region.extend(256).unwrap();

        for i in 0..16 {
            assert_eq!(unsafe { *first.as_ptr().add(i) }, 0xAB);
        }
    }

    #[test]
    fn refuses_past_capacity() {
        let page = platform::page_size();
        let mut region = SbrkRegion::with_capacity(page).unwrap();

        assert!(region.extend(page + 1).is_none());
        // The failed call must not consume anything.
        assert_eq!(region.size(), 0);
        assert_eq!(region.remaining(), page);

        assert!(region.extend(page).is_some());
        assert!(region.extend(1).is_none());
        assert_eq!(region.remaining(), 0);
    }

    #[test]
    fn capacity_rounds_up_to_pages() {
        let page = platform::page_size();
        let region = SbrkRegion::with_capacity(page / 2).unwrap();
        assert_eq!(region.remaining(), page);
    }
}
