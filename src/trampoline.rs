//! Per-hook trampoline preparation (spec step sequence: measure, patch,
//! reserve, relocate, validate, back-jump).
//!
//! Grounded on the prepare loop in the original `substitute_hook_functions`:
//! this crate's `prepare_one` plays the role of that loop's body, but
//! allocates its scratch state on the heap (one `HookInternal` per request,
//! collected into a `Vec` sized from the batch up front) rather than via
//! `alloca`, and defers populating `old_ptr` until after a successful
//! commit (see `install.rs`; REDESIGN FLAG RF-1).

use crate::arch::{Arch, ArchContext, TransformFlags};
use crate::error::HookError;
use crate::memory::{Allocation, ExecutableMemory};
use crate::options::HookOptions;
use crate::slab::SlabChain;

/// How far past the jump patch we scan for instructions that branch back
/// into it.
const INBOUND_SCAN_WINDOW: usize = 4096;

/// Prepared, not-yet-committed state for one hook.
pub struct HookInternal<O> {
    /// Mode-bit-stripped target address.
    pub target: usize,
    pub pc_low_bit: bool,
    pub jump_patch: Vec<u8>,
    /// End of the region in the target that the jump patch will overwrite.
    pub patch_end: usize,
    /// Writable address of this hook's trampoline slot.
    pub trampoline_write: usize,
    /// Executable (mirror) address of this hook's trampoline slot; this is
    /// what gets published as the hook's `old_ptr` after a successful
    /// commit.
    pub trampoline_exec: usize,
    /// Backing allocation this trampoline slot's `alloc()` call freshly
    /// created, if any — needs sealing exactly once before the patch that
    /// jumps into it is committed.
    pub fresh_allocation: Option<Allocation<O>>,
    /// This hook's policy blob, forwarded to the target's forward-patch
    /// foreign write and, if recording is enabled, into its restoration
    /// record.
    pub opt: O,
}

/// Prepare one hook: relocate its prologue into a trampoline slot drawn
/// from `chain` and assemble (but do not yet apply) its forward jump patch.
///
/// On any error, the caller is responsible for rolling back this and any
/// prior successfully prepared hooks in the batch via [`rollback`].
pub fn prepare_one<A: Arch, M: ExecutableMemory>(
    target: usize,
    replacement: usize,
    opt: M::Opt,
    options: HookOptions,
    chain: &mut SlabChain<M>,
) -> Result<HookInternal<M::Opt>, HookError> {
    let (target, pc_low_bit) = A::strip_mode_bit(target);

    let patch_len = A::jump_patch_size(target, replacement, false);
    let mut jump_patch = vec![0u8; patch_len];
    A::make_jump_patch(&mut jump_patch, target, replacement, false);

    let (trampoline_write, trampoline_exec) = chain.alloc(opt)?;
    let fresh_allocation = chain.take_last_grown();

    let flags = if options.contains(HookOptions::NO_THREAD_SAFETY) {
        TransformFlags::empty()
    } else {
        TransformFlags::BAN_CALLS
    };
    let flags = if options.contains(HookOptions::RELAXED) {
        flags
    } else {
        flags | TransformFlags::FORBID_RELATIVE_JUMPS
    };

    let mut trampoline_buf = vec![0u8; A::TD_MAX_REWRITTEN_SIZE + A::MAX_JUMP_PATCH_SIZE];
    let mut ctx = ArchContext::default();
    let transform = unsafe {
        A::transform_prologue(
            target as *const u8,
            patch_len,
            &mut trampoline_buf,
            trampoline_exec,
            flags,
            &mut ctx,
        )
    };
    let transform = match transform {
        Ok(t) => t,
        Err(e) => {
            unsafe { chain.free(trampoline_write) };
            return Err(e);
        }
    };

    if let Err(e) = unsafe {
        A::scan_inbound_jumps(
            target as *const u8,
            INBOUND_SCAN_WINDOW,
            target,
            transform.patch_end,
        )
    } {
        unsafe { chain.free(trampoline_write) };
        return Err(e);
    }

    let back_jump_from = trampoline_exec + transform.written;
    let back_jump_to = A::apply_mode_bit(transform.patch_end, pc_low_bit);
    let back_jump_len = A::jump_patch_size(back_jump_from, back_jump_to, true);
    if transform.written + back_jump_len > trampoline_buf.len() {
        unsafe { chain.free(trampoline_write) };
        return Err(HookError::UnrecoverableInstruction(
            "relocated prologue plus back-jump exceeds trampoline capacity".into(),
        ));
    }
    A::make_jump_patch(
        &mut trampoline_buf[transform.written..],
        back_jump_from,
        back_jump_to,
        true,
    );
    let trampoline_len = transform.written + back_jump_len;
    trampoline_buf.truncate(trampoline_len);

    // `trampoline_write` is this process's own dual-mapped writable alias —
    // nothing else can be executing through its executable mirror yet, so a
    // plain copy suffices. `foreign_write_with_pc_patch` is reserved for
    // patching already-sealed, possibly concurrently-executing target code.
    unsafe {
        std::ptr::copy_nonoverlapping(
            trampoline_buf.as_ptr(),
            trampoline_write as *mut u8,
            trampoline_buf.len(),
        );
    }

    log::debug!(
        "prepared hook: target={target:#x} -> replacement={replacement:#x}, trampoline={trampoline_exec:#x}"
    );

    Ok(HookInternal {
        target,
        pc_low_bit,
        jump_patch,
        patch_end: transform.patch_end,
        trampoline_write,
        trampoline_exec,
        fresh_allocation,
        opt,
    })
}

/// Undo the trampoline allocation for a partially prepared batch. Safe to
/// call on hooks that were fully prepared but whose patch was never
/// committed.
pub fn rollback<M: ExecutableMemory>(prepared: &[HookInternal<M::Opt>], chain: &mut SlabChain<M>) {
    for hook in prepared {
        unsafe { chain.free(hook.trampoline_write) };
    }
}
