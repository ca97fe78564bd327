//! Architecture backend contract.
//!
//! Everything that depends on instruction encoding — how big a jump patch
//! is, how to emit one, how to relocate a prologue into a trampoline, and
//! how to scan for inbound branches — lives behind the [`Arch`] trait. The
//! installer and trampoline builder never hardcode an instruction encoding;
//! they only call through this seam. The crate ships one implementation,
//! [`x86_64::X86_64`], but a Thumb or AArch64 backend could be added without
//! touching `install.rs` or `trampoline.rs`.

pub mod x86_64;

use crate::error::HookError;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use x86_64::X86_64 as DefaultArch;
    }
}

bitflags::bitflags! {
    /// Flags threaded through to [`Arch::transform_prologue`] describing how
    /// strict the prologue rewrite must be.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransformFlags: u32 {
        /// Reject `call` instructions found in the prologue instead of
        /// relocating them. Set whenever thread-safety is required, since a
        /// relocated call's return address would be captured with a stale
        /// target.
        const BAN_CALLS = 1 << 0;
        /// Reject relative jump/branch instructions in the prologue rather
        /// than re-encoding them with a corrected displacement.
        const FORBID_RELATIVE_JUMPS = 1 << 1;
    }
}

/// Bookkeeping the disassembler accumulates while relocating one prologue.
/// Opaque to the installer; only `Arch` implementations read it.
#[derive(Debug, Default, Clone)]
pub struct ArchContext {
    /// Registers the rewritten prologue is known to clobber, beyond what the
    /// original prologue clobbered. Reserved for backends where relocation
    /// needs a scratch register (not needed by the x86-64 backend).
    pub regs_possibly_written: u32,
}

/// The outcome of relocating a prologue into trampoline space.
#[derive(Debug)]
pub struct TransformResult {
    /// Number of bytes written into the trampoline's writable cursor.
    pub written: usize,
    /// The (possibly extended) end of the patched region in the target,
    /// i.e. `patch_end` may grow past the original estimate when the last
    /// relocated instruction straddles the initially measured boundary.
    pub patch_end: usize,
}

/// Per-architecture disassembler, jump-patch emitter, and branch scanner.
pub trait Arch {
    /// Maximum size in bytes of a forward jump patch this backend ever
    /// emits. Bounds the per-hook scratch buffer.
    const MAX_JUMP_PATCH_SIZE: usize;
    /// Generous upper bound on how many bytes a relocated prologue plus its
    /// jump-back can occupy. Bounds trampoline reservation size.
    const TD_MAX_REWRITTEN_SIZE: usize;
    /// Alignment every trampoline's start address and size must respect.
    const MAX_CODE_ALIGNMENT: usize;

    /// Strip this architecture's pointer mode bit (e.g. ARM32 Thumb's bit
    /// 0), returning the cleared address and whether the bit was set.
    /// Identity on architectures without a mode bit.
    fn strip_mode_bit(addr: usize) -> (usize, bool);

    /// Reapply a previously stripped mode bit. Identity on architectures
    /// without a mode bit.
    fn apply_mode_bit(addr: usize, set: bool) -> usize;

    /// Bytes required to jump from `from_pc` to `to_pc`. `is_trampoline`
    /// distinguishes the forward patch (at the hook site) from the
    /// trampoline's back-jump, since some backends size them differently.
    fn jump_patch_size(from_pc: usize, to_pc: usize, is_trampoline: bool) -> usize;

    /// Emit a jump from `from_pc` to `to_pc` into `out`, returning the
    /// number of bytes written. `out` must be at least
    /// `jump_patch_size(from_pc, to_pc, is_trampoline)` bytes.
    fn make_jump_patch(out: &mut [u8], from_pc: usize, to_pc: usize, is_trampoline: bool) -> usize;

    /// Relocate whichever instructions at `code` cover at least
    /// `min_patch_len` bytes into `out` (written as if `out` executed at
    /// `out_addr`), rejecting anything this backend cannot safely relocate.
    ///
    /// # Safety
    /// `code` must point at `min_patch_len + Self::TD_MAX_REWRITTEN_SIZE` or
    /// more readable bytes of real, executable instructions — backends may
    /// decode past the nominal boundary when the covering instruction
    /// straddles it.
    unsafe fn transform_prologue(
        code: *const u8,
        min_patch_len: usize,
        out: &mut [u8],
        out_addr: usize,
        flags: TransformFlags,
        ctx: &mut ArchContext,
    ) -> Result<TransformResult, HookError>;

    /// Scan the function body starting at `code` for any branch whose
    /// target lands inside `[patch_start, patch_end)`.
    ///
    /// # Safety
    /// `code` must point at a readable, valid instruction stream of at
    /// least `scan_window` bytes.
    unsafe fn scan_inbound_jumps(
        code: *const u8,
        scan_window: usize,
        patch_start: usize,
        patch_end: usize,
    ) -> Result<(), HookError>;
}
