use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

/// Cooperative cancellation flag shared between a monitoring loop and its
/// owner. `wait_timeout` doubles as the loop's interval sleep so a cancel
/// request interrupts the sleep immediately instead of waiting for the next
/// tick.
#[derive(Clone, Default)]
pub struct Cancel {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Cancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, condvar) = &*self.inner;
        if let Ok(mut cancelled) = lock.lock() {
            *cancelled = true;
            condvar.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        lock.lock().map(|cancelled| *cancelled).unwrap_or(true)
    }

    /// Sleep for up to `timeout`. Returns true once cancelled, either before
    /// or during the wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let Ok(mut cancelled) = lock.lock() else {
            return true;
        };
        let mut remaining = timeout;
        let start = std::time::Instant::now();
        while !*cancelled {
            let (guard, result) = match condvar.wait_timeout(cancelled, remaining) {
                Ok(pair) => pair,
                Err(_) => return true,
            };
            cancelled = guard;
            if result.timed_out() {
                return *cancelled;
            }
            // Spurious wakeup: keep waiting for the remainder of the interval.
            match timeout.checked_sub(start.elapsed()) {
                Some(left) => remaining = left,
                None => return *cancelled,
            }
        }
        true
    }
}

/// Identifier of the work unit presently executing.
///
/// Single-writer discipline: only the owning [`Supervisor`] writes it (on unit
/// start); the session timeout controller reads it to annotate its report.
///
/// [`Supervisor`]: crate::monitor::Supervisor
#[derive(Clone, Default)]
pub struct CurrentUnit {
    inner: Arc<RwLock<Option<String>>>,
}

impl CurrentUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, unit: &str) {
        if let Ok(mut current) = self.inner.write() {
            *current = Some(unit.to_string());
        }
    }

    pub fn get(&self) -> Option<String> {
        self.inner.read().ok().and_then(|current| current.clone())
    }
}
