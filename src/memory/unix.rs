//! Unix executable memory manager: a true W^X dual mapping via `memfd_create`.
//!
//! `alloc_unsealed` backs one anonymous, in-memory file with two independent
//! `mmap` views of the same pages: one `PROT_READ|PROT_WRITE`, one
//! `PROT_READ|PROT_EXEC`. Writes through the writable view are visible
//! through the executable view immediately (`MAP_SHARED` over the same
//! pages), so there is never a moment where the slab header embedded at the
//! front of the writable view becomes unwritable — unlike a single-mapping
//! design that `mprotect`s the one address back and forth between W and X.

use std::ffi::c_void;

use super::{Allocation, ExecutableMemory, ForeignWrite};
use crate::error::HookError;

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const PROT_EXEC: i32 = 0x4;
const MAP_SHARED: i32 = 0x01;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

const MFD_CLOEXEC: u32 = 0x0001;

const PAGE_SIZE: usize = 4096;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

    fn memfd_create(name: *const u8, flags: u32) -> i32;

    fn ftruncate(fd: i32, length: i64) -> i32;

    fn close(fd: i32) -> i32;
}

#[inline]
const fn round_up_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub struct UnixMemory;

impl ExecutableMemory for UnixMemory {
    /// No policy to carry on a plain in-process dual-mapping backend.
    type Opt = ();

    fn alloc_unsealed(size: usize, opt: ()) -> Result<Allocation<()>, HookError> {
        let mapped = round_up_page(size);

        let name = c"substrate-hook-trampoline".as_ptr().cast::<u8>();
        let fd = unsafe { memfd_create(name, MFD_CLOEXEC) };
        if fd < 0 {
            return Err(HookError::OutOfMemory);
        }
        if unsafe { ftruncate(fd, mapped as i64) } != 0 {
            unsafe { close(fd) };
            return Err(HookError::OutOfMemory);
        }

        let write_view = unsafe {
            mmap(
                std::ptr::null_mut(),
                mapped,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            )
        };
        if write_view == MAP_FAILED {
            unsafe { close(fd) };
            return Err(HookError::OutOfMemory);
        }

        let exec_view = unsafe {
            mmap(
                std::ptr::null_mut(),
                mapped,
                PROT_READ | PROT_EXEC,
                MAP_SHARED,
                fd,
                0,
            )
        };
        if exec_view == MAP_FAILED {
            unsafe {
                munmap(write_view, mapped);
                close(fd);
            }
            return Err(HookError::OutOfMemory);
        }

        // The mappings keep the backing pages alive; the descriptor itself
        // is no longer needed once both views exist.
        unsafe { close(fd) };

        let writable = write_view as usize;
        let executable = exec_view as usize;
        log::trace!(
            "dual-mapped {mapped} bytes: writable={writable:#x} executable={executable:#x}"
        );
        Ok(Allocation {
            writable,
            executable,
            size: mapped,
            opt,
        })
    }

    unsafe fn seal(_alloc: &Allocation<()>) -> Result<(), HookError> {
        // `executable` has been RX since `alloc_unsealed`; nothing to flip.
        Ok(())
    }

    unsafe fn free(alloc: &Allocation<()>) -> Result<(), HookError> {
        let rc_w = unsafe { munmap(alloc.writable as *mut c_void, alloc.size) };
        let rc_x = unsafe { munmap(alloc.executable as *mut c_void, alloc.size) };
        if rc_w != 0 || rc_x != 0 {
            return Err(HookError::PageProtectionFailed(format!(
                "munmap on dual mapping at {:#x}/{:#x} failed",
                alloc.writable, alloc.executable
            )));
        }
        Ok(())
    }

    unsafe fn foreign_write_with_pc_patch(writes: &[ForeignWrite<()>]) -> Result<(), HookError> {
        // These destinations are ordinary process code (the hooked targets),
        // not this backend's own dual-mapped trampoline memory, so there is
        // no separate writable alias to go through — each page is
        // individually unprotected, written, and resealed. This does not
        // suspend other threads; see the `ExecutableMemory` trait docs for
        // why that's an acknowledged gap in this crate's default backend.
        for w in writes {
            let page_start = w.dst & !(PAGE_SIZE - 1);
            let span = (w.dst + w.bytes.len()) - page_start;
            let span = round_up_page(span);
            let rc = unsafe {
                mprotect(
                    page_start as *mut c_void,
                    span,
                    PROT_READ | PROT_WRITE | PROT_EXEC,
                )
            };
            if rc != 0 {
                return Err(HookError::AtomicWriteFailed(format!(
                    "mprotect before patching {:#x} failed",
                    w.dst
                )));
            }
            unsafe {
                std::ptr::copy_nonoverlapping(w.bytes.as_ptr(), w.dst as *mut u8, w.bytes.len());
            }
            let rc = unsafe { mprotect(page_start as *mut c_void, span, PROT_READ | PROT_EXEC) };
            if rc != 0 {
                return Err(HookError::AtomicWriteFailed(format!(
                    "mprotect after patching {:#x} failed",
                    w.dst
                )));
            }
            log::debug!("patched {} bytes at {:#x}", w.bytes.len(), w.dst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_seal_free_roundtrip() {
        let alloc = UnixMemory::alloc_unsealed(64, ()).expect("alloc");
        assert!(alloc.writable != 0);
        assert_ne!(
            alloc.writable, alloc.executable,
            "writable and executable views must be distinct addresses"
        );
        unsafe {
            // ret
            *(alloc.writable as *mut u8) = 0xC3;
            UnixMemory::seal(&alloc).expect("seal");
            UnixMemory::free(&alloc).expect("free");
        }
    }

    #[test]
    fn writes_through_writable_view_are_visible_in_executable_view() {
        let alloc = UnixMemory::alloc_unsealed(64, ()).expect("alloc");
        unsafe {
            std::ptr::write_bytes(alloc.writable as *mut u8, 0x90, 16);
            UnixMemory::seal(&alloc).expect("seal");
            // Same physical pages: the executable alias observes the write
            // made through the writable alias before sealing.
            let byte = *(alloc.executable as *const u8);
            assert_eq!(byte, 0x90);
            UnixMemory::free(&alloc).expect("free");
        }
    }

    #[test]
    fn writable_view_stays_writable_after_seal() {
        let alloc = UnixMemory::alloc_unsealed(64, ()).expect("alloc");
        unsafe {
            UnixMemory::seal(&alloc).expect("seal");
            // A single-mapping mprotect-toggle design would fault here once
            // the page is sealed RX; the dual mapping keeps this alias RW.
            *(alloc.writable as *mut u8) = 0x42;
            assert_eq!(*(alloc.writable as *const u8), 0x42);
            UnixMemory::free(&alloc).expect("free");
        }
    }
}
