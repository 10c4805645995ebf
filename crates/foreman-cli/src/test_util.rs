//! Test-only helpers shared across this crate's `#[cfg(test)]` modules.

use std::sync::{Mutex, MutexGuard, OnceLock};

/// Tests that mutate process-wide environment variables (config resolution)
/// must not run concurrently with each other, or one test's env changes
/// leak into another's assertions. Acquire this lock for the duration of
/// any such test.
pub fn lock_env() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    match LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
