//! A cancelable timed wait, used by every background loop.
//!
//! Shutdown latency of a background thread is bounded by scheduling overhead, not by its
//! configured interval: `stop()` paths call [`Sleeper::interrupt`] which wakes any in-progress
//! sleep immediately.
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// An interruptible sleeper built from a mutex-guarded flag and a condvar.
#[derive(Debug, Default)]
pub struct Sleeper {
    interrupted: Mutex<bool>,
    condvar: Condvar,
}

impl Sleeper {
    /// Create a new sleeper.
    pub fn new() -> Sleeper {
        Sleeper::default()
    }

    /// Sleep for up to `timeout`. Returns `true` if the sleep was cut short by
    /// [`Sleeper::interrupt`].
    ///
    /// A pending interrupt delivered while no one was sleeping wakes the next sleep immediately;
    /// the interrupt is consumed either way.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let interrupted = self
            .interrupted
            .lock()
            .expect("thread holding sleeper lock should not panic");

        let (mut interrupted, _timeout_result) = self
            .condvar
            .wait_timeout_while(interrupted, timeout, |interrupted| !*interrupted)
            .expect("thread holding sleeper lock should not panic");

        let was_interrupted = *interrupted;
        *interrupted = false;
        was_interrupted
    }

    /// Wake the current (or next) sleep.
    pub fn interrupt(&self) {
        let mut interrupted = self
            .interrupted
            .lock()
            .expect("thread holding sleeper lock should not panic");
        *interrupted = true;
        self.condvar.notify_all();
    }
}
