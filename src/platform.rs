//! OS interface for the single mapping the heap lives in. Unlike an
//! allocator that maps and unmaps regions as they fill and drain, this
//! crate reserves the whole capacity once when [`crate::SbrkRegion`] is
//! built and releases it once when it is dropped, so each platform only
//! has to provide a reserve call, a release call and the page size.

/// Virtual memory page size, 4096 bytes on most machines. Only known at
/// runtime, so it is read once and cached.
static mut PAGE_SIZE: usize = 0;

#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = imp::page_size();
        }

        PAGE_SIZE
    }
}

pub(crate) use imp::{request_memory, return_memory};

#[cfg(unix)]
#[cfg(not(miri))]
mod imp {
    //! One anonymous private `mmap` is the whole reservation. The kernel
    //! only backs pages that actually get touched, so a generous capacity
    //! costs nothing up front.

    use std::ptr::{self, NonNull};

    use crate::AllocError;

    /// Maps `length` bytes of read-write memory.
    pub(crate) unsafe fn request_memory(length: usize) -> Result<NonNull<u8>, AllocError> {
        let protection = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
            libc::MAP_FAILED => Err(AllocError),
            address => Ok(NonNull::new_unchecked(address).cast()),
        }
    }

    /// Unmaps a mapping obtained from [`request_memory`]. `length` must be
    /// the exact length it was requested with.
    pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
        if libc::munmap(address.cast().as_ptr(), length) != 0 {
            // Nothing sensible to do; the mapping stays valid and leaks.
        }
    }

    pub(crate) fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod imp {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use crate::AllocError;

    /// Reserves and commits `length` bytes in one call. Committed pages
    /// only consume physical memory once touched, same as on unix.
    pub(crate) unsafe fn request_memory(length: usize) -> Result<NonNull<u8>, AllocError> {
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
        let address = Memory::VirtualAlloc(None, length, flags, Memory::PAGE_READWRITE);

        NonNull::new(address.cast()).ok_or(AllocError)
    }

    pub(crate) unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
        // Length zero with MEM_RELEASE gives back the whole reservation.
        let released = Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE);

        if !released.as_bool() {
            // Same story as munmap failing, the reservation leaks.
        }
    }

    pub(crate) fn page_size() -> usize {
        let mut system_info = MaybeUninit::uninit();

        unsafe {
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod imp {
    //! Miri cannot call foreign functions, so the reservation comes from
    //! the global allocator instead. A reservation that is never returned
    //! shows up in Miri's leak report, which is exactly what tests want.

    use std::{alloc, ptr::NonNull};

    use crate::AllocError;

    fn layout_for(length: usize) -> Result<alloc::Layout, AllocError> {
        alloc::Layout::from_size_align(length, page_size()).map_err(|_| AllocError)
    }

    pub(crate) unsafe fn request_memory(length: usize) -> Result<NonNull<u8>, AllocError> {
        NonNull::new(alloc::alloc(layout_for(length)?)).ok_or(AllocError)
    }

    pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
        if let Ok(layout) = layout_for(length) {
            alloc::dealloc(address.as_ptr(), layout);
        }
    }

    pub(crate) fn page_size() -> usize {
        4096
    }
}
