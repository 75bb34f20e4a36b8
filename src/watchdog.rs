//! A liveness registry for background threads.
//!
//! Every background thread registers with a name and a timeout, then checks in from its loop. A
//! dedicated polling thread compares check-in times against timeouts and reports overruns through
//! the error boundary. With no callback configured, an overrun sets the boundary's sticky flag
//! and the request path fails closed.
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};

use crate::sleeper::Sleeper;
use crate::{Error, ErrorBoundary, Result};

/// Registration record for one monitored thread.
#[derive(Debug)]
struct ThreadRegistration {
    name: String,
    timeout: Duration,
    last_check_in: Instant,
    /// When this registration was last reported unresponsive. Throttles reporting to once per
    /// timeout window.
    last_report: Option<Instant>,
}

#[derive(Debug, Default)]
struct Registry {
    threads: HashMap<u64, ThreadRegistration>,
    next_id: u64,
}

/// Monitors registered background threads and reports the unresponsive ones.
pub struct Watchdog {
    registry: Mutex<Registry>,
    sleeper: Sleeper,
    running: AtomicBool,
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    boundary: ErrorBoundary,
}

impl Watchdog {
    /// Poll interval used while no thread is registered. Registration tightens it to the
    /// smallest registered timeout.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Start the watchdog polling thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the polling thread failed to start.
    pub fn start(boundary: ErrorBoundary) -> std::io::Result<Arc<Watchdog>> {
        let watchdog = Arc::new(Watchdog {
            registry: Mutex::new(Registry::default()),
            sleeper: Sleeper::new(),
            running: AtomicBool::new(true),
            join_handle: Mutex::new(None),
            boundary,
        });

        let join_handle = {
            let watchdog = Arc::clone(&watchdog);
            std::thread::Builder::new()
                .name("bandit-watchdog".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        while watchdog.running.load(Ordering::SeqCst) {
                            let interval = watchdog.poll_once(Instant::now());
                            watchdog.sleeper.sleep(interval);
                        }
                    }));
                    if result.is_err() {
                        watchdog
                            .boundary
                            .report(&Error::BackgroundThreadPanicked, "watchdog");
                    }
                })?
        };

        *watchdog
            .join_handle
            .lock()
            .expect("thread holding watchdog lock should not panic") = Some(join_handle);

        Ok(watchdog)
    }

    /// Register a thread for monitoring. Returns the id the thread must check in with.
    ///
    /// Registration counts as the first check-in and wakes the polling loop so it can adopt the
    /// (possibly tighter) poll interval.
    pub fn register(&self, name: &str, timeout: Duration) -> u64 {
        let id = {
            let mut registry = self
                .registry
                .lock()
                .expect("thread holding watchdog lock should not panic");
            let id = registry.next_id;
            registry.next_id += 1;
            registry.threads.insert(
                id,
                ThreadRegistration {
                    name: name.to_owned(),
                    timeout,
                    last_check_in: Instant::now(),
                    last_report: None,
                },
            );
            id
        };
        self.sleeper.interrupt();
        id
    }

    /// Record that the thread is alive. A check-in also re-arms reporting, so a thread that
    /// recovers and stalls again is reported again.
    pub fn check_in(&self, id: u64) {
        let mut registry = self
            .registry
            .lock()
            .expect("thread holding watchdog lock should not panic");
        if let Some(registration) = registry.threads.get_mut(&id) {
            registration.last_check_in = Instant::now();
            registration.last_report = None;
        }
    }

    /// Remove a thread from monitoring.
    ///
    /// Must only be called after the thread has fully joined; unregistering earlier races with
    /// the polling loop flagging an already-stopped thread.
    pub fn unregister(&self, id: u64) {
        let mut registry = self
            .registry
            .lock()
            .expect("thread holding watchdog lock should not panic");
        registry.threads.remove(&id);
    }

    /// Returns `false` once an overrun was reported with no callback configured.
    pub fn is_healthy(&self) -> bool {
        self.boundary.is_healthy()
    }

    /// One polling pass. Returns the interval to sleep until the next pass.
    fn poll_once(&self, now: Instant) -> Duration {
        let mut overruns = Vec::new();

        let interval = {
            let mut registry = self
                .registry
                .lock()
                .expect("thread holding watchdog lock should not panic");

            let mut interval = Watchdog::DEFAULT_POLL_INTERVAL;
            for registration in registry.threads.values_mut() {
                interval = interval.min(registration.timeout);

                let overdue = now.duration_since(registration.last_check_in) > registration.timeout;
                if !overdue {
                    continue;
                }
                let report_due = registration
                    .last_report
                    .map_or(true, |at| now.duration_since(at) >= registration.timeout);
                if report_due {
                    registration.last_report = Some(now);
                    overruns.push(registration.name.clone());
                }
            }
            interval
        };

        // Reporting happens outside the registry lock.
        for name in overruns {
            log::warn!(target: "bandit", thread_name = name.as_str(); "background thread is unresponsive");
            self.boundary
                .report(&Error::UnresponsiveThread { name }, "watchdog");
        }

        interval
    }

    /// Stop the polling thread without waiting for it to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.sleeper.interrupt();
    }

    /// Stop the polling thread and block waiting for it to exit. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();

        let join_handle = self
            .join_handle
            .lock()
            .expect("thread holding watchdog lock should not panic")
            .take();
        if let Some(join_handle) = join_handle {
            join_handle
                .join()
                .map_err(|_| Error::BackgroundThreadPanicked)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("boundary", &self.boundary)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use crate::error::{Error, ErrorBoundary};

    use super::Watchdog;

    fn counting_boundary() -> (ErrorBoundary, Arc<AtomicUsize>) {
        let reports = Arc::new(AtomicUsize::new(0));
        let boundary = {
            let reports = reports.clone();
            ErrorBoundary::with_callback(Arc::new(move |error, _context| {
                assert!(matches!(error, Error::UnresponsiveThread { .. }));
                reports.fetch_add(1, Ordering::Relaxed);
            }))
        };
        (boundary, reports)
    }

    #[test]
    fn responsive_thread_is_never_reported() {
        let (boundary, reports) = counting_boundary();
        let watchdog = Watchdog::start(boundary).unwrap();

        let id = watchdog.register("responsive", Duration::from_millis(50));
        for _ in 0..1000 {
            watchdog.check_in(id);
            std::thread::sleep(Duration::from_micros(100));
        }

        assert_eq!(reports.load(Ordering::Relaxed), 0);
        watchdog.unregister(id);
        watchdog.shutdown().unwrap();
    }

    #[test]
    fn stale_thread_is_reported_once_per_window() {
        let (boundary, reports) = counting_boundary();
        let watchdog = Watchdog::start(boundary).unwrap();

        let timeout = Duration::from_millis(20);
        let _id = watchdog.register("stale", timeout);
        std::thread::sleep(Duration::from_millis(200));

        let count = reports.load(Ordering::Relaxed);
        assert!(count >= 1, "stale thread was never reported");
        // Reporting is throttled to once per timeout window; 200ms / 20ms allows at most 10
        // windows (plus one for scheduling slop).
        assert!(count <= 11, "reported {count} times in 10 windows");

        watchdog.shutdown().unwrap();
    }

    #[test]
    fn unregistered_thread_is_no_longer_reported() {
        let (boundary, reports) = counting_boundary();
        let watchdog = Watchdog::start(boundary).unwrap();

        let id = watchdog.register("stale", Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        watchdog.unregister(id);

        let count_at_unregister = reports.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(reports.load(Ordering::Relaxed), count_at_unregister);

        watchdog.shutdown().unwrap();
    }

    #[test]
    fn overrun_without_callback_sets_the_sticky_flag() {
        let watchdog = Watchdog::start(ErrorBoundary::new()).unwrap();
        assert!(watchdog.is_healthy());

        let _id = watchdog.register("stale", Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(100));

        assert!(!watchdog.is_healthy());
        watchdog.shutdown().unwrap();
    }

    #[test]
    fn check_in_re_arms_reporting() {
        let (boundary, reports) = counting_boundary();
        let watchdog = Watchdog::start(boundary).unwrap();

        let id = watchdog.register("flaky", Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(40));
        let first_stall = reports.load(Ordering::Relaxed);
        assert!(first_stall >= 1);

        watchdog.check_in(id);
        std::thread::sleep(Duration::from_millis(40));
        assert!(
            reports.load(Ordering::Relaxed) > first_stall,
            "second stall after recovery was not reported"
        );

        watchdog.shutdown().unwrap();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let watchdog = Watchdog::start(ErrorBoundary::new()).unwrap();
        watchdog.shutdown().unwrap();
        watchdog.shutdown().unwrap();
    }
}
