//! Executable memory manager contract.
//!
//! Backing allocations for trampolines are true W^X dual mappings: `alloc_unsealed`
//! hands back two addresses backed by the *same* physical pages — `writable`,
//! permanently read-write, and `executable`, permanently read-execute. Slab
//! bookkeeping (headers, free-slot bitmaps) lives at the writable address and
//! stays mutable forever, even after the slab's trampolines are in active use;
//! only `foreign_write_with_pc_patch` is meant to mutate already-executing,
//! possibly concurrently-executing code (the hooked target functions, which
//! live outside this crate's own dual mapping entirely). `seal` exists for
//! API symmetry with the spec's "seal a freshly allocated page" commit step,
//! but on these dual-mapping backends the executable view is already
//! executable from the moment `alloc_unsealed` returns, so it is a no-op.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod unix;
    } else if #[cfg(windows)] {
        pub mod windows;
    }
}

use crate::error::HookError;

/// One patch to apply as part of an atomic foreign write.
pub struct ForeignWrite<O> {
    /// Destination address, in the target process's own address space (this
    /// crate only supports in-process hooking, so this is just a pointer).
    pub dst: usize,
    /// Bytes to write.
    pub bytes: Vec<u8>,
    /// Opaque per-backend policy blob, forwarded from the [`crate::request::HookRequest`]
    /// (or [`crate::record::HookRecord`], on restore) that produced this write.
    pub opt: O,
}

/// A backing allocation: a writable base and its executable mirror, together
/// with the opaque policy blob it was allocated with. Every later call that
/// acts on this allocation (`seal`, `free`) receives that same blob back via
/// this struct rather than as a separate parameter, since the manager
/// produced it from the very `opt` the caller gave `alloc_unsealed`.
#[derive(Debug, Clone, Copy)]
pub struct Allocation<O> {
    pub writable: usize,
    pub executable: usize,
    pub size: usize,
    pub opt: O,
}

/// Platform executable-memory manager.
pub trait ExecutableMemory {
    /// Opaque per-backend policy blob threaded through from the caller's
    /// [`crate::request::HookRequest`]. The backends shipped in this crate
    /// have no policy to carry, so they both set this to `()`; a backend
    /// for a sandboxed or cross-process target might use it to carry a
    /// process handle or permission token instead.
    type Opt: Copy;

    /// Reserve at least `size` bytes (rounded up to this platform's
    /// granularity) as a dual mapping: `writable` and `executable` address
    /// the same physical pages with different protections, both valid from
    /// the moment this call returns.
    fn alloc_unsealed(size: usize, opt: Self::Opt) -> Result<Allocation<Self::Opt>, HookError>;

    /// No-op on a true dual-mapping backend: `alloc.executable` has been
    /// executable since `alloc_unsealed`, and `alloc.writable` stays writable
    /// for the lifetime of the allocation. Kept as an explicit step so the
    /// installer's commit phase matches the spec's "seal freshly allocated
    /// pages" description even though this backend has nothing to flip.
    ///
    /// # Safety
    /// `alloc` must be a live allocation returned by `alloc_unsealed` that
    /// has not already been freed.
    unsafe fn seal(alloc: &Allocation<Self::Opt>) -> Result<(), HookError>;

    /// Release a backing allocation (both the writable and executable views).
    ///
    /// # Safety
    /// `alloc` must be a live allocation returned by `alloc_unsealed`, not
    /// already freed, with no other live references to its addresses.
    unsafe fn free(alloc: &Allocation<Self::Opt>) -> Result<(), HookError>;

    /// Apply every write in `writes` so that no thread ever observes a
    /// partially applied batch. The default backends approximate this with
    /// a protect→copy→reprotect cycle per write; see
    /// [`crate`](crate)-level docs for the limitations of that approach
    /// under real concurrent execution.
    ///
    /// # Safety
    /// Every `dst` in `writes` must be a writable-or-previously-sealed
    /// address owned by this process, with `bytes.len()` valid bytes beyond
    /// it.
    unsafe fn foreign_write_with_pc_patch(
        writes: &[ForeignWrite<Self::Opt>],
    ) -> Result<(), HookError>;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub type DefaultMemory = unix::UnixMemory;
    } else if #[cfg(windows)] {
        pub type DefaultMemory = windows::WindowsMemory;
    }
}
