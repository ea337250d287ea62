use std::sync::{Mutex, MutexGuard};

use tracing::warn;

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned store lock"
            );
            poisoned.into_inner()
        }
    }
}
