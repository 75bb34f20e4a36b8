//! Coalesces telemetry payloads into size-bounded batches and ships them from a background
//! thread.
//!
//! Delivery is at-most-once: a failed batch goes to the error boundary and is dropped, never
//! retried or requeued. The producer side never blocks; a full queue rejects the offending item
//! after an optional statistical pruning pass over the backlog.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crate::background::{PeriodicTaskRunner, Runnable};
use crate::event_queue::EventQueue;
use crate::watchdog::Watchdog;
use crate::{Error, ErrorBoundary, Result};

/// Byte-oriented delivery capability consumed by the batcher.
pub trait Sender: Send + Sync {
    /// Deliver one batch. Called only from the batcher's background thread.
    fn send(&self, batch: Vec<u8>) -> Result<()>;
}

/// Configuration for [`AsyncBatcher`].
#[derive(Debug, Clone)]
pub struct AsyncBatcherConfig {
    /// Maximum size of a single batch in bytes. An item that would push the running batch over
    /// this mark is deferred to the next batch.
    ///
    /// Defaults to [`AsyncBatcherConfig::DEFAULT_BATCH_HIGH_WATER_MARK`].
    pub batch_high_water_mark: usize,
    /// Interval between background flushes.
    ///
    /// Defaults to [`AsyncBatcherConfig::DEFAULT_FLUSH_INTERVAL`].
    pub flush_interval: Duration,
    /// Maximum number of queued items before pushes are rejected.
    ///
    /// Defaults to [`AsyncBatcherConfig::DEFAULT_QUEUE_MAX_SIZE`].
    pub queue_max_size: usize,
    /// Per-item survival probability of one pruning pass, run when the queue is full. The
    /// default of 1 disables statistical thinning and overload degrades to rejecting the newest
    /// item deterministically.
    pub prune_pass_probability: f64,
}

impl AsyncBatcherConfig {
    /// Default value for [`AsyncBatcherConfig::batch_high_water_mark`].
    pub const DEFAULT_BATCH_HIGH_WATER_MARK: usize = 64 * 1024;
    /// Default value for [`AsyncBatcherConfig::flush_interval`].
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
    /// Default value for [`AsyncBatcherConfig::queue_max_size`].
    pub const DEFAULT_QUEUE_MAX_SIZE: usize = 10_000;

    /// Create a new `AsyncBatcherConfig` using default configuration.
    pub fn new() -> AsyncBatcherConfig {
        AsyncBatcherConfig::default()
    }

    /// Update the batch high-water mark.
    pub fn with_batch_high_water_mark(mut self, batch_high_water_mark: usize) -> Self {
        self.batch_high_water_mark = batch_high_water_mark;
        self
    }

    /// Update the flush interval.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Update the queue capacity.
    pub fn with_queue_max_size(mut self, queue_max_size: usize) -> Self {
        self.queue_max_size = queue_max_size;
        self
    }

    /// Update the pruning pass probability.
    pub fn with_prune_pass_probability(mut self, prune_pass_probability: f64) -> Self {
        self.prune_pass_probability = prune_pass_probability;
        self
    }
}

impl Default for AsyncBatcherConfig {
    fn default() -> AsyncBatcherConfig {
        AsyncBatcherConfig {
            batch_high_water_mark: AsyncBatcherConfig::DEFAULT_BATCH_HIGH_WATER_MARK,
            flush_interval: AsyncBatcherConfig::DEFAULT_FLUSH_INTERVAL,
            queue_max_size: AsyncBatcherConfig::DEFAULT_QUEUE_MAX_SIZE,
            prune_pass_probability: 1.0,
        }
    }
}

/// The background flush task driven by the periodic runner.
struct BatchFlusher {
    queue: Arc<EventQueue<Vec<u8>>>,
    sender: Arc<dyn Sender>,
    high_water_mark: usize,
    boundary: ErrorBoundary,
}

impl Runnable for BatchFlusher {
    fn run_iteration(&mut self) -> Result<()> {
        flush_queue(
            &self.queue,
            &*self.sender,
            self.high_water_mark,
            &self.boundary,
        );
        Ok(())
    }
}

/// Drain the queue into size-bounded batches and hand each to the sender.
///
/// Items are joined with a newline separator in enqueue order. Send failures are reported and the
/// batch is dropped.
fn flush_queue(
    queue: &EventQueue<Vec<u8>>,
    sender: &dyn Sender,
    high_water_mark: usize,
    boundary: &ErrorBoundary,
) {
    loop {
        // The first item seeds the batch unconditionally, so an oversized item still ships as a
        // batch of one.
        let Some(seed) = queue.pop() else {
            return;
        };
        let mut batch = seed.item;

        while let Some(entry) = queue.pop() {
            if batch.len() + 1 + entry.item.len() > high_water_mark {
                queue.push_front(entry);
                break;
            }
            batch.push(b'\n');
            batch.extend_from_slice(&entry.item);
        }

        if let Err(err) = sender.send(batch) {
            boundary.report(&err, "batch send");
        }
    }
}

/// An asynchronous batching pipeline: a bounded queue, one background flush thread and a
/// pluggable [`Sender`].
pub struct AsyncBatcher {
    queue: Arc<EventQueue<Vec<u8>>>,
    sender: Arc<dyn Sender>,
    config: AsyncBatcherConfig,
    runner: PeriodicTaskRunner,
    boundary: ErrorBoundary,
    dropped: AtomicU64,
}

impl AsyncBatcher {
    /// Start the batcher's background flush thread.
    ///
    /// When `watchdog` is given, the flush thread registers under `name` with
    /// `watchdog_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the flush thread failed to start.
    pub fn start(
        name: &str,
        sender: Arc<dyn Sender>,
        config: AsyncBatcherConfig,
        boundary: ErrorBoundary,
        watchdog: Option<Arc<Watchdog>>,
        watchdog_timeout: Duration,
    ) -> std::io::Result<AsyncBatcher> {
        let queue = Arc::new(EventQueue::new());

        let runner = PeriodicTaskRunner::new(
            name,
            config.flush_interval,
            Duration::ZERO,
            watchdog,
            watchdog_timeout,
            boundary.clone(),
        );
        runner.start(BatchFlusher {
            queue: Arc::clone(&queue),
            sender: Arc::clone(&sender),
            high_water_mark: config.batch_high_water_mark,
            boundary: boundary.clone(),
        })?;

        Ok(AsyncBatcher {
            queue,
            sender,
            config,
            runner,
            boundary,
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueue one payload for batched delivery. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if the queue is at capacity and a pruning pass freed no
    /// room. The offending payload is dropped and counted.
    pub fn enqueue(&self, payload: Vec<u8>) -> Result<()> {
        if self.queue.len() >= self.config.queue_max_size {
            let removed = self.queue.prune(self.config.prune_pass_probability);
            if removed > 0 {
                self.dropped.fetch_add(removed as u64, Ordering::Relaxed);
                log::debug!(target: "bandit", removed; "pruned telemetry backlog");
            }
            if self.queue.len() >= self.config.queue_max_size {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(Error::QueueFull);
            }
        }

        self.queue.push(payload);
        Ok(())
    }

    /// Number of payloads dropped due to overload, including pruned ones.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Approximate number of queued payloads.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Stop the flush thread without waiting for it to exit.
    pub fn stop(&self) {
        self.runner.stop();
    }

    /// Stop the flush thread, join it, then synchronously flush any remainder. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.runner.shutdown()?;

        // Drain-on-shutdown: anything enqueued while the thread was stopping still ships.
        flush_queue(
            &self.queue,
            &*self.sender,
            self.config.batch_high_water_mark,
            &self.boundary,
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::error::{Error, ErrorBoundary, Result};

    use super::{AsyncBatcher, AsyncBatcherConfig, Sender};

    #[derive(Default)]
    struct MockSender {
        batches: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl Sender for MockSender {
        fn send(&self, batch: Vec<u8>) -> Result<()> {
            if self.fail {
                return Err(Error::InvalidArgument("send failed"));
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn items(sender: &MockSender) -> Vec<String> {
        sender
            .batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| {
                String::from_utf8(batch.clone())
                    .unwrap()
                    .split('\n')
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn round_trip_preserves_order_and_batch_bounds() {
        let sender = Arc::new(MockSender::default());
        let config = AsyncBatcherConfig::new()
            .with_batch_high_water_mark(32)
            .with_flush_interval(Duration::from_secs(3600))
            .with_queue_max_size(100);
        let batcher = AsyncBatcher::start(
            "test-batcher",
            sender.clone(),
            config,
            ErrorBoundary::new(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();

        let expected: Vec<String> = (0..20).map(|i| format!("event-{i:02}")).collect();
        for item in &expected {
            batcher.enqueue(item.clone().into_bytes()).unwrap();
        }
        batcher.shutdown().unwrap();

        assert_eq!(items(&sender), expected);
        let batches = sender.batches.lock().unwrap();
        assert!(batches.len() > 1, "high-water mark should split batches");
        for batch in batches.iter() {
            assert!(batch.len() <= 32, "batch of {} bytes exceeds mark", batch.len());
        }
    }

    #[test]
    fn overflow_rejects_the_offending_item_and_flushes_the_rest() {
        let sender = Arc::new(MockSender::default());
        let config = AsyncBatcherConfig::new()
            .with_queue_max_size(3)
            .with_flush_interval(Duration::from_secs(3600));
        let batcher = AsyncBatcher::start(
            "test-batcher",
            sender.clone(),
            config,
            ErrorBoundary::new(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        // Let the immediate first flush pass before filling the queue.
        std::thread::sleep(Duration::from_millis(50));

        for i in 0..3 {
            batcher.enqueue(format!("event-{i}").into_bytes()).unwrap();
        }
        assert!(matches!(
            batcher.enqueue(b"event-3".to_vec()),
            Err(Error::QueueFull)
        ));
        assert_eq!(batcher.dropped_count(), 1);

        batcher.shutdown().unwrap();
        assert_eq!(items(&sender), vec!["event-0", "event-1", "event-2"]);
    }

    #[test]
    fn pruning_thins_the_backlog_under_sustained_overload() {
        let sender = Arc::new(MockSender::default());
        let config = AsyncBatcherConfig::new()
            .with_queue_max_size(100)
            .with_prune_pass_probability(0.5)
            .with_flush_interval(Duration::from_secs(3600));
        let batcher = AsyncBatcher::start(
            "test-batcher",
            sender.clone(),
            config,
            ErrorBoundary::new(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        // Let the immediate first flush pass before filling the queue.
        std::thread::sleep(Duration::from_millis(50));

        for i in 0..100 {
            batcher.enqueue(format!("event-{i}").into_bytes()).unwrap();
        }
        // The queue is full; this push triggers a pruning pass that statistically frees room.
        batcher.enqueue(b"straggler".to_vec()).unwrap();

        assert!(batcher.dropped_count() > 0);
        assert!(batcher.queue_len() < 100);
        batcher.shutdown().unwrap();
    }

    #[test]
    fn failed_batches_are_dropped_not_retried() {
        let sender = Arc::new(MockSender {
            batches: Mutex::new(Vec::new()),
            fail: true,
        });
        let reports = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let boundary = {
            let reports = reports.clone();
            ErrorBoundary::with_callback(Arc::new(move |_error, _context| {
                reports.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }))
        };
        let config = AsyncBatcherConfig::new().with_flush_interval(Duration::from_millis(10));
        let batcher = AsyncBatcher::start(
            "test-batcher",
            sender.clone(),
            config,
            boundary,
            None,
            Duration::from_secs(1),
        )
        .unwrap();

        batcher.enqueue(b"doomed".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        assert!(reports.load(std::sync::atomic::Ordering::Relaxed) >= 1);
        // The failed batch was not requeued.
        assert_eq!(batcher.queue_len(), 0);
        batcher.stop();
    }

    #[test]
    fn flushes_on_the_interval_without_shutdown() {
        let sender = Arc::new(MockSender::default());
        let config = AsyncBatcherConfig::new().with_flush_interval(Duration::from_millis(10));
        let batcher = AsyncBatcher::start(
            "test-batcher",
            sender.clone(),
            config,
            ErrorBoundary::new(),
            None,
            Duration::from_secs(1),
        )
        .unwrap();

        batcher.enqueue(b"tick".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(items(&sender), vec!["tick"]);
        batcher.shutdown().unwrap();
    }
}
