//! Batch hook installer.
//!
//! Grounded directly on `substitute_hook_functions` in the original C
//! source: a prepare loop that can fail and roll back cleanly, followed by
//! a commit phase that seals newly allocated trampoline pages and applies
//! every target's jump patch as one atomic foreign write.

use crate::arch::Arch;
use crate::error::HookError;
use crate::main_thread::is_main_thread;
use crate::memory::{ExecutableMemory, ForeignWrite};
use crate::options::HookOptions;
use crate::record::RecordBlock;
use crate::request::{HookHandle, HookRequest};
use crate::slab::SlabChain;
use crate::trampoline::{self, HookInternal};

/// Install a batch of hooks against a shared trampoline slab chain.
///
/// `chain` must have been created with an item size of
/// `A::TD_MAX_REWRITTEN_SIZE + A::MAX_JUMP_PATCH_SIZE` (see
/// [`crate::new_chain`]).
///
/// If `record_out` is `Some`, a restoration record is produced for every
/// hook in the batch on success.
///
/// On success, returns one [`HookHandle`] per request, in the same order.
/// On failure, no target in the batch has been modified and every
/// trampoline slot this call allocated has been freed.
pub fn install<A: Arch, M: ExecutableMemory>(
    chain: &mut SlabChain<M>,
    requests: &[HookRequest<M::Opt>],
    options: HookOptions,
    mut record_out: Option<&mut RecordBlock<M::Opt>>,
) -> Result<Vec<HookHandle>, HookError> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    if !options.contains(HookOptions::NO_THREAD_SAFETY) && !is_main_thread() {
        return Err(HookError::NotOnMainThread);
    }

    let mut prepared: Vec<HookInternal<M::Opt>> = Vec::with_capacity(requests.len());
    for req in requests {
        match trampoline::prepare_one::<A, M>(req.target, req.replacement, req.opt, options, chain)
        {
            Ok(hook) => prepared.push(hook),
            Err(e) => {
                log::warn!("hook preparation failed, rolling back batch: {e}");
                trampoline::rollback(&prepared, chain);
                return Err(e);
            }
        }
    }

    // Seal every backing allocation any hook in this batch freshly created,
    // deduplicated by base address (several hooks may land in the same
    // allocation). Must happen before the forward patches are committed, so
    // nothing ever observes a target jumping into writable-but-not-yet-
    // executable memory.
    let mut sealed: Vec<usize> = Vec::new();
    for hook in &prepared {
        if let Some(alloc) = hook.fresh_allocation {
            if !sealed.contains(&alloc.writable) {
                if let Err(e) = unsafe { M::seal(&alloc) } {
                    log::warn!("sealing trampoline page failed, rolling back batch: {e}");
                    trampoline::rollback(&prepared, chain);
                    return Err(e);
                }
                sealed.push(alloc.writable);
            }
        }
    }

    let mut saved_bytes: Vec<Vec<u8>> = Vec::with_capacity(prepared.len());
    if record_out.is_some() {
        for hook in &prepared {
            let bytes =
                unsafe { std::slice::from_raw_parts(hook.target as *const u8, hook.jump_patch.len()) };
            saved_bytes.push(bytes.to_vec());
        }
    }

    let writes: Vec<ForeignWrite<M::Opt>> = prepared
        .iter()
        .map(|h| ForeignWrite {
            dst: h.target,
            bytes: h.jump_patch.clone(),
            opt: h.opt,
        })
        .collect();

    if let Err(e) = unsafe { M::foreign_write_with_pc_patch(&writes) } {
        // Per spec this is terminal: some patches in the batch may already
        // be visible, so trampoline pages are intentionally not freed here
        // (a thread may already have a PC inside one).
        return Err(HookError::AtomicWriteFailed(e.to_string()));
    }

    if let Some(out) = record_out.as_deref_mut() {
        for (hook, bytes) in prepared.iter().zip(saved_bytes) {
            out.push(hook.target, hook.opt, bytes.into_boxed_slice());
        }
    }

    let handles = prepared
        .iter()
        .map(|h| HookHandle {
            old_ptr: A::apply_mode_bit(h.trampoline_exec, h.pc_low_bit),
        })
        .collect();

    log::info!("installed {} hook(s)", prepared.len());
    Ok(handles)
}
