use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the inner state if a panicking holder poisoned it.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
