use std::sync::{Mutex, MutexGuard};

// A panicking holder cannot leave these guards half-updated, so we keep going on poison.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
