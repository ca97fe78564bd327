//! Restoration: undo a previously installed batch of hooks.
//!
//! Grounded on `substitute_free_hooks`: replays each record's saved bytes
//! as one atomic foreign write, then drops the record block. Trampoline
//! pages are intentionally not freed here — see the crate-level docs for
//! why a thread parked inside a trampoline makes that unsafe in general.

use crate::error::HookError;
use crate::memory::{ExecutableMemory, ForeignWrite};
use crate::record::RecordBlock;

/// Restore every target named in `records` to its pre-hook bytes.
pub fn restore<M: ExecutableMemory>(records: RecordBlock<M::Opt>) -> Result<(), HookError> {
    if records.is_empty() {
        return Ok(());
    }

    let writes: Vec<ForeignWrite<M::Opt>> = records
        .records
        .iter()
        .map(|r| ForeignWrite {
            dst: r.target,
            bytes: r.saved_bytes.to_vec(),
            opt: r.opt,
        })
        .collect();

    unsafe { M::foreign_write_with_pc_patch(&writes) }?;

    log::info!("restored {} hook(s)", records.len());
    Ok(())
}
