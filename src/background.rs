//! A generic "run one iteration on a timer" driver for background tasks.
//!
//! [`PeriodicTaskRunner`] owns one dedicated thread per instance, registers it with the
//! [`Watchdog`](crate::watchdog::Watchdog) and keeps running through iteration failures, which go
//! to the error boundary. Between iterations the thread sleeps on an interruptible
//! [`Sleeper`](crate::sleeper::Sleeper), so stopping it never waits out the interval.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::sleeper::Sleeper;
use crate::watchdog::Watchdog;
use crate::{Error, ErrorBoundary, Result};

/// One iteration of a background task.
pub trait Runnable: Send {
    /// Run a single iteration. Errors are reported to the error boundary; they do not stop the
    /// loop.
    fn run_iteration(&mut self) -> Result<()>;
}

struct RunnerState {
    join_handle: std::thread::JoinHandle<()>,
    watchdog_id: Option<u64>,
}

/// Drives a [`Runnable`] on a dedicated thread at a fixed interval until stopped.
///
/// Starting an already-running runner is a no-op; stopping is idempotent.
pub struct PeriodicTaskRunner {
    name: String,
    interval: Duration,
    jitter: Duration,
    running: Arc<AtomicBool>,
    sleeper: Arc<Sleeper>,
    state: Mutex<Option<RunnerState>>,
    watchdog: Option<Arc<Watchdog>>,
    watchdog_timeout: Duration,
    boundary: ErrorBoundary,
}

impl PeriodicTaskRunner {
    /// Create a stopped runner.
    ///
    /// `jitter` randomizes each sleep subtractively, which keeps fleets of clients from
    /// synchronizing their polls. Pass [`Duration::ZERO`] for a strict cadence. When `watchdog`
    /// is given, the thread registers under `name` with `watchdog_timeout` and checks in every
    /// iteration.
    pub fn new(
        name: &str,
        interval: Duration,
        jitter: Duration,
        watchdog: Option<Arc<Watchdog>>,
        watchdog_timeout: Duration,
        boundary: ErrorBoundary,
    ) -> PeriodicTaskRunner {
        PeriodicTaskRunner {
            name: name.to_owned(),
            interval,
            jitter,
            running: Arc::new(AtomicBool::new(false)),
            sleeper: Arc::new(Sleeper::new()),
            state: Mutex::new(None),
            watchdog,
            watchdog_timeout,
            boundary,
        }
    }

    /// Start driving `task`. A no-op if the runner is already running.
    ///
    /// The first iteration runs immediately, not after the first interval.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start(&self, task: impl Runnable + 'static) -> std::io::Result<()> {
        let mut state = self
            .state
            .lock()
            .expect("thread holding runner lock should not panic");
        if state.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let watchdog_id = self
            .watchdog
            .as_ref()
            .map(|watchdog| watchdog.register(&self.name, self.watchdog_timeout));

        let join_handle = {
            let name = self.name.clone();
            let interval = self.interval;
            let jitter_limit = self.jitter;
            let running = Arc::clone(&self.running);
            let sleeper = Arc::clone(&self.sleeper);
            let watchdog = self.watchdog.clone();
            let boundary = self.boundary.clone();
            let mut task = task;

            std::thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        while running.load(Ordering::SeqCst) {
                            if let (Some(watchdog), Some(id)) = (&watchdog, watchdog_id) {
                                watchdog.check_in(id);
                            }
                            if let Err(err) = task.run_iteration() {
                                boundary.report(&err, &name);
                            }
                            sleeper.sleep(jitter(interval, jitter_limit));
                        }
                    }));
                    if result.is_err() {
                        running.store(false, Ordering::SeqCst);
                        boundary.report(&Error::BackgroundThreadPanicked, &name);
                    }
                })?
        };

        *state = Some(RunnerState {
            join_handle,
            watchdog_id,
        });

        Ok(())
    }

    /// Stop the task thread without waiting for it to exit. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sleeper.interrupt();
    }

    /// Stop the task thread and block waiting for it to exit. Idempotent.
    ///
    /// Unregistration from the watchdog happens only after the thread has fully joined, so the
    /// watchdog cannot flag an already-stopped thread.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();

        let state = self
            .state
            .lock()
            .expect("thread holding runner lock should not panic")
            .take();
        let Some(state) = state else {
            return Ok(());
        };

        let join_result = state.join_handle.join();

        if let (Some(watchdog), Some(id)) = (&self.watchdog, state.watchdog_id) {
            watchdog.unregister(id);
        }

        join_result.map_err(|_| Error::BackgroundThreadPanicked)?;
        Ok(())
    }
}

impl std::fmt::Debug for PeriodicTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTaskRunner")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

/// Apply randomized subtractive `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
