//! Per-install option flags.

use bitflags::bitflags;

bitflags! {
    /// Policy flags controlling how [`crate::install::install`] behaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HookOptions: u32 {
        /// Skip the main-thread check and allow the disassembler to relocate
        /// call instructions out of the prologue. Without this flag, a call
        /// in the prologue is rejected outright: its return address would be
        /// captured before the jump patch lands, and a thread that later
        /// returns into the original code would skip the redirect.
        const NO_THREAD_SAFETY = 1 << 0;

        /// Permit the trampoline builder to emit PC-relative jumps rather
        /// than only position-independent absolute ones. Faster trampolines,
        /// but rejects some prologues a stricter pass would accept.
        const RELAXED = 1 << 1;
    }
}
