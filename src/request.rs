//! Hook request type: the install API's per-target input.

/// One function to redirect.
///
/// `target` and `replacement` must have matching calling conventions and
/// signatures; this crate has no way to check that and trusts the caller.
#[derive(Debug, Clone, Copy)]
pub struct HookRequest<O = ()> {
    /// Address of the function to intercept. On architectures with a
    /// pointer mode bit (ARM32 Thumb), the bit should be set exactly as it
    /// would be when calling the function normally.
    pub target: usize,
    /// Address of the function execution should transfer to instead.
    pub replacement: usize,
    /// Opaque per-backend policy blob, forwarded verbatim to the memory
    /// manager's `alloc_unsealed`/`foreign_write_with_pc_patch` calls for
    /// this hook. The shipped backends don't use it (`O = ()`).
    pub opt: O,
}

impl HookRequest<()> {
    pub fn new(target: usize, replacement: usize) -> Self {
        Self {
            target,
            replacement,
            opt: (),
        }
    }
}

impl<O> HookRequest<O> {
    pub fn with_opt(target: usize, replacement: usize, opt: O) -> Self {
        Self {
            target,
            replacement,
            opt,
        }
    }
}

/// Per-hook result handed back after a successful [`crate::install::install`]
/// call.
#[derive(Debug, Clone, Copy)]
pub struct HookHandle {
    /// Address at which the original target's displaced prologue, followed
    /// by a jump back into the unmodified remainder of the function, can be
    /// invoked as if it were the original function.
    pub old_ptr: usize,
}
