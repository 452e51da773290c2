//! Condvar-backed state cell with timed waits.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Holds a value updated from one thread while another blocks until the value
/// matches what it expects, with a timeout cap.
///
/// Used by the radio workers to wait for the driver's service-state
/// notification after an enable/disable call settles.
pub struct StateNotifier<T> {
    state: Mutex<T>,
    notify: Condvar,
}

impl<T: Clone + PartialEq> StateNotifier<T> {
    pub fn new(initial: T) -> Self {
        Self { state: Mutex::new(initial), notify: Condvar::new() }
    }

    /// Stores a new value and wakes all waiters.
    pub fn update(&self, value: T) {
        *self.state.lock().unwrap() = value;
        self.notify.notify_all();
    }

    pub fn get(&self) -> T {
        self.state.lock().unwrap().clone()
    }

    /// Blocks until the stored value equals `expected` or `timeout` elapses.
    /// Returns false on timeout.
    pub fn wait_for(&self, expected: T, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        let (guard, result) = self
            .notify
            .wait_timeout_while(guard, timeout, |state| *state != expected)
            .unwrap();
        drop(guard);
        !result.timed_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_returns_immediately_when_already_matching() {
        let notifier = StateNotifier::new(true);
        assert!(notifier.wait_for(true, Duration::from_millis(10)));
    }

    #[test]
    fn test_update_wakes_waiter() {
        let notifier = Arc::new(StateNotifier::new(false));
        let cloned = notifier.clone();

        let updater = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cloned.update(true);
        });

        assert!(notifier.wait_for(true, Duration::from_secs(5)));
        assert!(notifier.get());
        updater.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let notifier = StateNotifier::new(0u32);
        assert!(!notifier.wait_for(1, Duration::from_millis(20)));
    }
}
