//! Main-thread detection.
//!
//! The original implementation compares the caller's thread id against the
//! process id on Unix (true only for the first/main thread under
//! glibc-style thread numbering) and calls `pthread_main_np` on platforms
//! that provide it. Neither check has a portable stable equivalent in std,
//! so this crate approximates it: the first thread that ever calls into
//! this crate is remembered as "main" and all later callers are compared
//! against it. This is documented as an approximation, not a guarantee —
//! see `DESIGN.md` Open Question OQ-5.

use std::sync::OnceLock;
use std::thread::ThreadId;

static MAIN_THREAD: OnceLock<ThreadId> = OnceLock::new();

/// True if the calling thread is considered "main" for the purpose of the
/// thread-safety check in [`crate::install::install`].
pub fn is_main_thread() -> bool {
    let this = std::thread::current().id();
    *MAIN_THREAD.get_or_init(|| this) == this
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_is_stable_for_the_same_thread() {
        // Whichever thread in the test binary happens to call this first
        // becomes "main"; we only assert the identity check is consistent
        // for repeated calls from one thread, since test binaries run
        // multiple threads concurrently and the real first caller is not
        // under this test's control.
        let first = is_main_thread();
        let second = is_main_thread();
        assert_eq!(first, second);
    }
}
