//! Guard-paged stacks for fibers.
//!
//! Each fiber stack is an anonymous `mmap` region with one inaccessible page
//! at the low end, so an overflow faults instead of silently corrupting a
//! neighboring allocation.

use std::io;
use std::os::raw::c_void;
use std::ptr;

use once_cell::sync::Lazy;

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

pub(crate) struct FiberStack {
    base: *mut u8,
    len: usize,
}

impl FiberStack {
    /// Allocates a stack with at least `size` usable bytes plus a guard page.
    pub(crate) fn alloc(size: usize) -> io::Result<Self> {
        let page = *PAGE_SIZE;
        let usable = (size.max(page) + page - 1) / page * page;
        let len = usable + page;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Stacks grow down: the guard page sits at the low end.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(base, len) };
            return Err(err);
        }

        Ok(FiberStack {
            base: base as *mut u8,
            len,
        })
    }

    /// The lowest usable address, suitable for `ucontext_t::uc_stack.ss_sp`.
    pub(crate) fn sp(&self) -> *mut c_void {
        unsafe { self.base.add(*PAGE_SIZE) as *mut c_void }
    }

    /// Usable bytes, excluding the guard page.
    pub(crate) fn usable_len(&self) -> usize {
        self.len - *PAGE_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut c_void, self.len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_to_pages() {
        let stack = FiberStack::alloc(1).unwrap();
        assert_eq!(stack.usable_len() % *PAGE_SIZE, 0);
        assert!(stack.usable_len() >= *PAGE_SIZE);
    }

    #[test]
    fn stack_is_writable() {
        let stack = FiberStack::alloc(64 * 1024).unwrap();
        unsafe {
            let top = (stack.sp() as *mut u8).add(stack.usable_len() - 1);
            top.write(0xAB);
            assert_eq!(top.read(), 0xAB);
        }
    }
}
