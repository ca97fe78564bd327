//! Flat error type for the hooking engine.
//!
//! Errors are intentionally non-hierarchical: each variant names a single
//! classification from the install/restore protocol, not a wrapped source
//! chain of subsystem-specific error types. Callers match on the variant to
//! decide whether a retry makes sense, never on a message string.

use thiserror::Error;

/// Everything that can go wrong installing or restoring hooks.
#[derive(Debug, Error)]
pub enum HookError {
    /// `install` was called off the main thread without
    /// [`crate::options::HookOptions::NO_THREAD_SAFETY`].
    #[error("install must run on the main thread unless NO_THREAD_SAFETY is set")]
    NotOnMainThread,

    /// The executable memory manager could not satisfy an allocation.
    #[error("out of executable memory")]
    OutOfMemory,

    /// Changing a page's protection bits failed (mprotect/VirtualProtect).
    #[error("failed to change page protection: {0}")]
    PageProtectionFailed(String),

    /// The target's prologue contains an instruction this backend cannot
    /// safely relocate into a trampoline (e.g. an indirect branch).
    #[error("prologue contains an instruction that cannot be relocated: {0}")]
    UnrecoverableInstruction(String),

    /// Some instruction elsewhere in the target function branches back into
    /// the bytes that would be overwritten by the jump patch.
    #[error("a branch in the target jumps into the patched region")]
    JumpIntoPatchedRegion,

    /// The atomic cross-thread patch submission failed partway through.
    /// Unlike the other variants, this is not guaranteed safe to roll back
    /// from: some patches in the batch may already be visible.
    #[error("atomic patch submission failed: {0}")]
    AtomicWriteFailed(String),

    /// A restoration record referenced a target that is no longer mapped,
    /// or whose saved bytes no longer match what's expected.
    #[error("hook record is stale or invalid")]
    StaleRecord,
}
