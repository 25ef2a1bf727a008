use std::{io, ptr};

use libc::{
    EACCES, EAGAIN, EBADF, EFAULT, EINVAL, ENFILE, ENOMEM, EPERM, ESRCH, MAP_ANONYMOUS,
    MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE,
};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::util::{hint::cold, num::round_up};

pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// The system page size
pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error("attempted to map 0 bytes")]
    Empty,
    #[error("mmap() failed, errno = {}", errno_name(*.0))]
    Map(i32),
    #[error("mprotect() failed, errno = {}", errno_name(*.0))]
    Protect(i32),
}

/// The name of the handful of errno values the mapping calls give back
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        ENOMEM => "ENOMEM", // It's basically just this one
        EACCES => "EACCES",
        EAGAIN => "EAGAIN",
        EBADF => "EBADF",
        EINVAL => "EINVAL",
        ENFILE => "ENFILE",
        EFAULT => "EFAULT",
        EPERM => "EPERM",
        ESRCH => "ESRCH",
        _ => "unknown",
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Page protection for a range of a [`MmapRegion`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults
    None,
    ReadWrite,
}

impl Protection {
    fn bits(self) -> i32 {
        match self {
            Protection::None => PROT_NONE,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        }
    }
}

/// An owned, page-aligned range of address space. Unmapped on drop.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the region is plain memory, ownership of the mapping can move
// between threads
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a private anonymous arena of at least `size` bytes (rounded up
    /// to whole pages) with the given protection. Nothing is committed until
    /// it is touched.
    pub fn reserve(size: usize, protection: Protection) -> Result<MmapRegion, MapError> {
        if size == 0 {
            return Err(MapError::Empty);
        }
        let size = round_up(size, page_size());
        // SAFETY: anonymous mapping at a kernel-chosen address, no aliasing
        // with anything we own
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                protection.bits(),
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            // super duper unlikely
            return cold(|| Err(MapError::Map(last_errno())));
        }
        Ok(MmapRegion {
            ptr: ptr.cast(),
            size,
        })
    }

    /// Read/write arena, see [`MmapRegion::reserve`]
    pub fn map_noreserve(size: usize) -> Result<MmapRegion, MapError> {
        Self::reserve(size, Protection::ReadWrite)
    }

    /// Change the protection of `len` bytes starting `offset` bytes in.
    /// `offset` must be page aligned, `len` is rounded up to whole pages.
    pub fn protect(&self, offset: usize, len: usize, protection: Protection) -> Result<(), MapError> {
        debug_assert_eq!(offset % page_size(), 0);
        let len = round_up(len, page_size());
        assert!(offset + len <= self.size, "protect() out of bounds");
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range lies inside our own mapping
        let res = unsafe { libc::mprotect(self.ptr.add(offset).cast(), len, protection.bits()) };
        if res != 0 {
            return Err(MapError::Protect(last_errno()));
        }
        Ok(())
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Give up ownership without unmapping. Rebuild with
    /// [`MmapRegion::from_raw_parts`] to release it.
    pub fn into_raw_parts(self) -> (*mut u8, usize) {
        let parts = (self.ptr, self.size);
        std::mem::forget(self);
        parts
    }

    /// # Safety
    ///
    /// `ptr` and `size` must have come from [`MmapRegion::into_raw_parts`],
    /// and the region must not be owned by anything else.
    pub unsafe fn from_raw_parts(ptr: *mut u8, size: usize) -> Self {
        Self { ptr, size }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address must be a multiple of the page size (but length
        //   need not be). This is guaranteed true because we can only construct
        //   this region as page-aligned
        // - All pages containing a part of the indicated range are unmapped.
        //   This is fine, because we own the whole region
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
        }
    }
}

/// Copy `buf.len()` bytes from `address` in our own address space, without
/// faulting if the memory isn't mapped. Returns the number of bytes read,
/// which can be short if the range runs into an unmapped page.
pub fn read_own_memory(address: usize, buf: &mut [u8]) -> io::Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: address as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // SAFETY: `local` describes our own writable buffer. The kernel validates
    // `remote` and reports EFAULT instead of faulting.
    let n = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Read one machine word at `address`, `None` if it isn't readable
pub fn read_own_word(address: usize) -> Option<usize> {
    let mut buf = [0u8; std::mem::size_of::<usize>()];
    match read_own_memory(address, &mut buf) {
        Ok(n) if n == buf.len() => Some(usize::from_ne_bytes(buf)),
        _ => None,
    }
}
