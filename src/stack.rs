//! Guarded fiber stacks.
//!
//! A [`Stack`] is a page-aligned anonymous mapping with an inaccessible
//! guard region at the low address end (stacks grow down on every
//! architecture this crate supports). Touching the guard page turns a
//! stack overflow into a `SIGSEGV` instead of silent corruption of whatever
//! happens to live past the end of the mapping.

use std::io;
use std::ptr;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
});

/// The default stack size used when a fiber is created without an explicit
/// [`crate::fiber::FiberAttr::stack_size`].
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// The default guard region size.
pub const DEFAULT_GUARD_SIZE: usize = 4096;

/// Returns the system page size.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn round_up_to_page(n: usize) -> usize {
    let page = page_size();
    (n + page - 1) / page * page
}

/// A guarded, page-aligned stack region owned by the allocator, or borrowed
/// from the user.
pub struct Stack {
    /// Base address of the whole mapping (guard page included).
    base: *mut u8,
    /// Total mapped size, guard page included.
    mapped_size: usize,
    /// Size of the usable (non-guard) region.
    usable_size: usize,
    /// Whether `base` was allocated by this crate and must be `munmap`ped.
    owned: bool,
}

// Safety: a `Stack` is only ever touched by the fiber it belongs to and by
// the allocator/deallocator; it does not expose shared mutable access.
unsafe impl Send for Stack {}

impl Stack {
    /// Allocates a new guarded stack. Both `size` and `guard_size` must be
    /// non-zero multiples of the system page size.
    pub fn new(size: usize, guard_size: usize) -> Result<Self> {
        let page = page_size();
        if size == 0 || size % page != 0 {
            return Err(Error::InvalidArgument("stack size must be a non-zero multiple of the page size"));
        }
        if guard_size % page != 0 {
            return Err(Error::InvalidArgument("guard size must be a multiple of the page size"));
        }

        let mapped_size = size + guard_size;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            return if err.raw_os_error() == Some(libc::ENOMEM) {
                Err(Error::OutOfMemory)
            } else {
                Err(Error::last_os_error())
            };
        }
        let base = base as *mut u8;

        if guard_size < mapped_size {
            let usable_base = unsafe { base.add(guard_size) };
            let rc = unsafe {
                libc::mprotect(
                    usable_base as *mut _,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if rc != 0 {
                let err = Error::last_os_error();
                unsafe { libc::munmap(base as *mut _, mapped_size) };
                return Err(err);
            }
        }

        Ok(Self {
            base,
            mapped_size,
            usable_size: size,
            owned: true,
        })
    }

    /// Wraps a user-supplied buffer as a stack. No guard page is installed;
    /// the caller is responsible for making sure the buffer is large enough
    /// and outlives the fiber.
    ///
    /// # Safety
    /// `ptr` must point to at least `size` bytes of writable memory that
    /// stays valid until the fiber relinquishes the stack.
    pub unsafe fn from_raw_parts(ptr: *mut u8, size: usize) -> Self {
        Self {
            base: ptr,
            mapped_size: size,
            usable_size: size,
            owned: false,
        }
    }

    /// Whether this stack was allocated by the crate (and will be
    /// `munmap`ped on drop) as opposed to supplied by the user.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Pointer to the highest address of the usable region. On every
    /// architecture this crate targets the stack grows down, so this is
    /// where [`crate::context::init`] starts laying out the initial frame.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped_size) }
    }

    /// Size of the usable (non-guard) region, in bytes.
    pub fn usable_size(&self) -> usize {
        self.usable_size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::munmap(self.base as *mut _, self.mapped_size);
            }
        }
    }
}

pub(crate) fn validate_sizes(stack_size: usize, guard_size: usize) -> Result<()> {
    let page = page_size();
    if stack_size % page != 0 || stack_size == 0 {
        return Err(Error::InvalidArgument("stack size must be a non-zero multiple of the page size"));
    }
    if guard_size % page != 0 {
        return Err(Error::InvalidArgument("guard size must be a multiple of the page size"));
    }
    let _ = round_up_to_page; // silence unused warning in case of future trimming
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_page_aligned() {
        let stack = Stack::new(64 * 1024, 4096).unwrap();
        assert_eq!(stack.base as usize % page_size(), 0);
        assert_eq!(stack.usable_size(), 64 * 1024);
    }

    #[test]
    fn rejects_non_page_multiples() {
        assert!(Stack::new(100, 4096).is_err());
        assert!(Stack::new(64 * 1024, 100).is_err());
    }
}
