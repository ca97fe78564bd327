//! Windows executable memory manager: a true W^X dual mapping via a
//! pagefile-backed section object.
//!
//! `CreateFileMappingW(INVALID_HANDLE_VALUE, ...)` creates an anonymous,
//! pagefile-backed section; two independent `MapViewOfFile` calls against
//! that same section hand back a read-write view and a read-execute view of
//! the same physical pages, mirroring the Unix backend's `memfd_create` +
//! dual `mmap` approach.

use std::ffi::c_void;

use super::{Allocation, ExecutableMemory, ForeignWrite};
use crate::error::HookError;

const PAGE_EXECUTE_READWRITE: u32 = 0x40;
const FILE_MAP_WRITE: u32 = 0x0002;
const FILE_MAP_READ: u32 = 0x0004;
const FILE_MAP_EXECUTE: u32 = 0x0020;

const INVALID_HANDLE_VALUE: *mut c_void = !0usize as *mut c_void;

const ALLOC_GRANULARITY: usize = 65536;

unsafe extern "system" {
    #[link_name = "CreateFileMappingW"]
    fn create_file_mapping_w(
        h_file: *mut c_void,
        lp_attributes: *mut c_void,
        fl_protect: u32,
        dw_maximum_size_high: u32,
        dw_maximum_size_low: u32,
        lp_name: *const u16,
    ) -> *mut c_void;

    #[link_name = "MapViewOfFile"]
    fn map_view_of_file(
        h_file_mapping_object: *mut c_void,
        dw_desired_access: u32,
        dw_file_offset_high: u32,
        dw_file_offset_low: u32,
        dw_number_of_bytes_to_map: usize,
    ) -> *mut c_void;

    #[link_name = "UnmapViewOfFile"]
    fn unmap_view_of_file(lp_base_address: *const c_void) -> i32;

    #[link_name = "CloseHandle"]
    fn close_handle(h_object: *mut c_void) -> i32;

    #[link_name = "VirtualProtect"]
    fn virtual_protect(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_new_protect: u32,
        lpfl_old_protect: *mut u32,
    ) -> i32;
}

#[inline]
const fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

pub struct WindowsMemory;

impl ExecutableMemory for WindowsMemory {
    /// No policy to carry on a plain in-process dual-mapping backend.
    type Opt = ();

    fn alloc_unsealed(size: usize, opt: ()) -> Result<Allocation<()>, HookError> {
        let mapped = round_up(size, ALLOC_GRANULARITY);

        let section = unsafe {
            create_file_mapping_w(
                INVALID_HANDLE_VALUE,
                std::ptr::null_mut(),
                PAGE_EXECUTE_READWRITE,
                (mapped as u64 >> 32) as u32,
                (mapped as u64 & 0xFFFF_FFFF) as u32,
                std::ptr::null(),
            )
        };
        if section.is_null() {
            return Err(HookError::OutOfMemory);
        }

        let write_view = unsafe { map_view_of_file(section, FILE_MAP_WRITE, 0, 0, mapped) };
        if write_view.is_null() {
            unsafe { close_handle(section) };
            return Err(HookError::OutOfMemory);
        }

        let exec_view = unsafe {
            map_view_of_file(
                section,
                FILE_MAP_READ | FILE_MAP_EXECUTE,
                0,
                0,
                mapped,
            )
        };
        if exec_view.is_null() {
            unsafe {
                unmap_view_of_file(write_view);
                close_handle(section);
            }
            return Err(HookError::OutOfMemory);
        }

        // The mapped views keep the section alive; the handle itself is no
        // longer needed once both views exist.
        unsafe { close_handle(section) };

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
        // `executable` has been mapped FILE_MAP_EXECUTE since `alloc_unsealed`;
        // nothing to flip.
        Ok(())
    }

    unsafe fn free(alloc: &Allocation<()>) -> Result<(), HookError> {
        let rc_w = unsafe { unmap_view_of_file(alloc.writable as *const c_void) };
        let rc_x = unsafe { unmap_view_of_file(alloc.executable as *const c_void) };
        if rc_w == 0 || rc_x == 0 {
            return Err(HookError::PageProtectionFailed(format!(
                "UnmapViewOfFile on dual mapping at {:#x}/{:#x} failed",
                alloc.writable, alloc.executable
            )));
        }
        Ok(())
    }

    unsafe fn foreign_write_with_pc_patch(writes: &[ForeignWrite<()>]) -> Result<(), HookError> {
        for w in writes {
            let mut old = 0u32;
            let rc = unsafe {
                virtual_protect(
                    w.dst as *mut c_void,
                    w.bytes.len(),
                    PAGE_EXECUTE_READWRITE,
                    &mut old,
                )
            };
            if rc == 0 {
                return Err(HookError::AtomicWriteFailed(format!(
                    "VirtualProtect before patching {:#x} failed",
                    w.dst
                )));
            }
            unsafe {
                std::ptr::copy_nonoverlapping(w.bytes.as_ptr(), w.dst as *mut u8, w.bytes.len());
            }
            let mut restored = 0u32;
            let rc = unsafe {
                virtual_protect(w.dst as *mut c_void, w.bytes.len(), old, &mut restored)
            };
            if rc == 0 {
                return Err(HookError::AtomicWriteFailed(format!(
                    "VirtualProtect after patching {:#x} failed",
                    w.dst
                )));
            }
            log::debug!("patched {} bytes at {:#x}", w.bytes.len(), w.dst);
        }
        Ok(())
    }
}
