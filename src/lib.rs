//! substrate-hook: an in-process function-hooking engine.
//!
//! Given a batch of `(target, replacement)` pairs, [`install`] atomically
//! redirects calls to each target into its replacement, while preserving a
//! callable trampoline for the original behavior. Hooks are reversible via
//! a recorded [`RecordBlock`], replayed by [`restore`].
//!
//! The engine is built from two pieces:
//! - an executable [`slab`] allocator that serves trampolines a fixed-item
//!   slot at a time, with a writable and an executable view of each slot;
//! - a [`trampoline`]/[`install`] pipeline that relocates a target's
//!   prologue into a trampoline, validates no other instruction branches
//!   back into the patched region, and commits every target's jump patch
//!   in one call to the platform [`memory`] manager.
//!
//! Both the disassembler (how a prologue is measured, relocated, and
//! scanned) and the memory manager (how executable pages are obtained and
//! patched) are traits ([`arch::Arch`], [`memory::ExecutableMemory`]); this
//! crate ships one concrete implementation of each, for x86-64 on Unix and
//! Windows.
//!
//! # Usage
//!
//! ```ignore
//! use substrate_hook::{HookEngine, HookRequest};
//!
//! let engine = HookEngine::new();
//! let handles = engine.install(&[HookRequest::new(target as usize, replacement as usize)])?;
//! // handles[0].old_ptr now calls the original `target`.
//! ```

pub mod arch;
pub mod error;
pub mod install;
pub mod main_thread;
pub mod memory;
pub mod options;
pub mod record;
pub mod request;
pub mod restore;
pub mod slab;
pub mod sync;
pub mod trampoline;

use arch::Arch;
use memory::ExecutableMemory;

pub use error::HookError;
pub use options::HookOptions;
pub use record::RecordBlock;
pub use request::{HookHandle, HookRequest};
pub use slab::SlabChain;
pub use sync::SpinMutex;

pub use arch::DefaultArch;
pub use memory::DefaultMemory;

/// Item size the trampoline slab chain must use for a given architecture:
/// worst-case relocated prologue plus its jump-back.
const fn trampoline_item_size<A: Arch>() -> usize {
    A::TD_MAX_REWRITTEN_SIZE + A::MAX_JUMP_PATCH_SIZE
}

/// Build a fresh trampoline slab chain sized for architecture `A`.
pub fn new_chain<A: Arch, M: ExecutableMemory>() -> SlabChain<M> {
    SlabChain::new(trampoline_item_size::<A>())
}

/// A process-wide hooking engine bundling a trampoline slab chain behind a
/// spinlock, so `install`/`restore` can be called from any thread (subject
/// to the main-thread check in [`HookOptions`]) without the caller having
/// to manage a `SlabChain` directly.
pub struct HookEngine<A: Arch = DefaultArch, M: ExecutableMemory = DefaultMemory> {
    chain: SpinMutex<SlabChain<M>>,
    _arch: std::marker::PhantomData<A>,
}

impl<A: Arch, M: ExecutableMemory> Default for HookEngine<A, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Arch, M: ExecutableMemory> HookEngine<A, M> {
    pub fn new() -> Self {
        Self {
            chain: SpinMutex::new(new_chain::<A, M>()),
            _arch: std::marker::PhantomData,
        }
    }

    /// Install a batch of hooks. See [`install::install`] for the exact
    /// atomicity and rollback guarantees.
    pub fn install(
        &self,
        requests: &[HookRequest<M::Opt>],
        options: HookOptions,
        record_out: Option<&mut RecordBlock<M::Opt>>,
    ) -> Result<Vec<HookHandle>, HookError> {
        let mut chain = self.chain.lock();
        install::install::<A, M>(&mut chain, requests, options, record_out)
    }

    /// Restore a batch of hooks previously installed by this engine.
    pub fn restore(&self, records: RecordBlock<M::Opt>) -> Result<(), HookError> {
        restore::restore::<M>(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_rejects_empty_batch_as_noop() {
        let engine: HookEngine = HookEngine::new();
        let handles = engine
            .install(&[], HookOptions::empty(), None)
            .expect("empty batch is a no-op, not an error");
        assert!(handles.is_empty());
    }
}
