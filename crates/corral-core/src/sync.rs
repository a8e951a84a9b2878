//! Synchronization utilities for handling poisoned locks.

use std::sync::{Mutex, MutexGuard};

/// Extension trait for `Mutex` that ignores lock poisoning.
///
/// Lock poisoning occurs when a thread panics while holding a lock. In that
/// case the original panic is the real error, not the poisoned lock state,
/// so reporter bookkeeping and similar state can safely keep going with
/// whatever value the lock holds.
pub trait IgnoreLock<T> {
    /// Lock the mutex, ignoring any poison error.
    ///
    /// If the lock is poisoned, the guard is returned anyway.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnoreLock<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        match self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test code is allowed to use unwrap")]
mod tests {
    use super::*;
    use std::panic::catch_unwind;
    use std::sync::Arc;

    #[test]
    fn test_lock_ignore_poison_recovers_guard() {
        let shared = Arc::new(Mutex::new(7usize));
        let poisoner = Arc::clone(&shared);
        let result = catch_unwind(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        });
        assert!(matches!(result, Err(_)));
        assert!(shared.is_poisoned());
        assert_eq!(*shared.lock_ignore_poison(), 7);
    }
}
