//! A periodic task that polls the model transport and hot-swaps the scorer pool's factory.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::background::Runnable;
use crate::model::{ModelMetadata, ModelTransport};
use crate::object_pool::VersionedPool;
use crate::scorer::{Scorer, ScorerFactory};
use crate::Result;

/// Keeps the scorer pool fresh.
///
/// Runs on a [`PeriodicTaskRunner`](crate::background::PeriodicTaskRunner) cadence: probe the
/// transport first, fetch the body only when the metadata changed since the last success, and
/// install the new blob by swapping the pool's factory. Transient errors propagate to the
/// runner's error boundary and the next tick retries from scratch.
pub struct ModelDownloader {
    transport: Arc<dyn ModelTransport>,
    scorer_factory: Arc<dyn ScorerFactory>,
    pool: Arc<VersionedPool<Box<dyn Scorer>>>,
    refresh_count: Arc<AtomicU64>,
    last_success: Option<ModelMetadata>,
}

impl ModelDownloader {
    /// Create a downloader that feeds `pool` from `transport`.
    ///
    /// `refresh_count` is shared with the orchestrator and incremented once per installed model.
    pub fn new(
        transport: Arc<dyn ModelTransport>,
        scorer_factory: Arc<dyn ScorerFactory>,
        pool: Arc<VersionedPool<Box<dyn Scorer>>>,
        refresh_count: Arc<AtomicU64>,
    ) -> ModelDownloader {
        ModelDownloader {
            transport,
            scorer_factory,
            pool,
            refresh_count,
            last_success: None,
        }
    }
}

impl Runnable for ModelDownloader {
    fn run_iteration(&mut self) -> Result<()> {
        let metadata = self.transport.probe()?;
        if self.last_success == Some(metadata) {
            log::trace!(target: "bandit", "model unchanged since last download");
            return Ok(());
        }

        let blob = self.transport.fetch()?;
        if blob.bytes.is_empty() {
            // The endpoint exists but has no model yet. Not an error, nothing to install.
            log::debug!(target: "bandit", "model endpoint returned an empty body");
            return Ok(());
        }
        let blob = Arc::new(blob);

        // Hydrate once up front so a blob the factory rejects never reaches the pool.
        self.scorer_factory.hydrate(Some(&blob))?;

        let factory = {
            let scorer_factory = Arc::clone(&self.scorer_factory);
            let blob = Arc::clone(&blob);
            Arc::new(move || scorer_factory.hydrate(Some(&blob)))
        };
        self.pool.update_factory(factory);

        self.last_success = Some(blob.metadata());
        let refreshes = self.refresh_count.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!(
            target: "bandit",
            refreshes, model_size = blob.size;
            "installed new model"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    };

    use chrono::{TimeZone, Utc};

    use crate::background::Runnable;
    use crate::error::{Error, Result};
    use crate::model::{ModelBlob, ModelMetadata, ModelTransport};
    use crate::object_pool::VersionedPool;
    use crate::scorer::{Prediction, Scorer, ScorerFactory};

    use super::ModelDownloader;

    struct MockTransport {
        bytes: Mutex<Vec<u8>>,
        version: Mutex<i64>,
        probes: AtomicU64,
        fetches: AtomicU64,
        fail_probe: Mutex<bool>,
    }

    impl MockTransport {
        fn new(bytes: &[u8]) -> MockTransport {
            MockTransport {
                bytes: Mutex::new(bytes.to_vec()),
                version: Mutex::new(1),
                probes: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
                fail_probe: Mutex::new(false),
            }
        }

        fn publish(&self, bytes: &[u8]) {
            *self.bytes.lock().unwrap() = bytes.to_vec();
            *self.version.lock().unwrap() += 1;
        }

        fn metadata(&self) -> ModelMetadata {
            ModelMetadata {
                last_modified: Utc
                    .timestamp_opt(*self.version.lock().unwrap(), 0)
                    .unwrap(),
                size: self.bytes.lock().unwrap().len() as u64,
            }
        }
    }

    impl ModelTransport for MockTransport {
        fn probe(&self) -> Result<ModelMetadata> {
            self.probes.fetch_add(1, Ordering::Relaxed);
            if *self.fail_probe.lock().unwrap() {
                return Err(Error::InvalidArgument("probe failed"));
            }
            Ok(self.metadata())
        }

        fn fetch(&self) -> Result<ModelBlob> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            let metadata = self.metadata();
            Ok(ModelBlob {
                bytes: self.bytes.lock().unwrap().clone(),
                last_modified: metadata.last_modified,
                size: metadata.size,
            })
        }
    }

    struct ByteScorer {
        model_id: String,
    }

    impl Scorer for ByteScorer {
        fn predict(&mut self, _context: &[u8]) -> Result<Prediction> {
            Ok(Prediction {
                action_ids: vec![0],
                scores: vec![1.0],
            })
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }
    }

    struct ByteScorerFactory;

    impl ScorerFactory for ByteScorerFactory {
        fn hydrate(&self, model: Option<&ModelBlob>) -> Result<Box<dyn Scorer>> {
            let model_id = match model {
                Some(blob) => String::from_utf8_lossy(&blob.bytes).into_owned(),
                None => "cold-start".to_owned(),
            };
            Ok(Box::new(ByteScorer { model_id }))
        }
    }

    fn downloader(
        transport: &Arc<MockTransport>,
    ) -> (
        ModelDownloader,
        Arc<VersionedPool<Box<dyn Scorer>>>,
        Arc<AtomicU64>,
    ) {
        let factory: Arc<dyn ScorerFactory> = Arc::new(ByteScorerFactory);
        let pool = Arc::new(VersionedPool::with_factory({
            let factory = Arc::clone(&factory);
            Arc::new(move || factory.hydrate(None))
                as crate::object_pool::PoolFactory<Box<dyn Scorer>>
        }));
        let refresh_count = Arc::new(AtomicU64::new(0));
        let downloader = ModelDownloader::new(
            Arc::clone(transport) as Arc<dyn ModelTransport>,
            factory,
            Arc::clone(&pool),
            Arc::clone(&refresh_count),
        );
        (downloader, pool, refresh_count)
    }

    #[test]
    fn installs_a_new_model_and_bumps_the_refresh_counter() {
        let transport = Arc::new(MockTransport::new(b"model-v1"));
        let (mut downloader, pool, refresh_count) = downloader(&transport);

        assert_eq!(pool.get_or_create().unwrap().model_id(), "cold-start");

        downloader.run_iteration().unwrap();

        assert_eq!(refresh_count.load(Ordering::Relaxed), 1);
        assert_eq!(pool.generation(), 1);
        assert_eq!(pool.get_or_create().unwrap().model_id(), "model-v1");
    }

    #[test]
    fn unchanged_probe_skips_the_fetch() {
        let transport = Arc::new(MockTransport::new(b"model-v1"));
        let (mut downloader, _pool, refresh_count) = downloader(&transport);

        downloader.run_iteration().unwrap();
        downloader.run_iteration().unwrap();
        downloader.run_iteration().unwrap();

        assert_eq!(transport.probes.load(Ordering::Relaxed), 3);
        assert_eq!(transport.fetches.load(Ordering::Relaxed), 1);
        assert_eq!(refresh_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn changed_metadata_triggers_a_refetch() {
        let transport = Arc::new(MockTransport::new(b"model-v1"));
        let (mut downloader, pool, refresh_count) = downloader(&transport);

        downloader.run_iteration().unwrap();
        transport.publish(b"model-v2");
        downloader.run_iteration().unwrap();

        assert_eq!(transport.fetches.load(Ordering::Relaxed), 2);
        assert_eq!(refresh_count.load(Ordering::Relaxed), 2);
        assert_eq!(pool.get_or_create().unwrap().model_id(), "model-v2");
    }

    #[test]
    fn empty_body_is_not_installed() {
        let transport = Arc::new(MockTransport::new(b""));
        let (mut downloader, pool, refresh_count) = downloader(&transport);

        downloader.run_iteration().unwrap();

        assert_eq!(refresh_count.load(Ordering::Relaxed), 0);
        assert_eq!(pool.generation(), 0);
        assert_eq!(pool.get_or_create().unwrap().model_id(), "cold-start");
    }

    #[test]
    fn probe_failure_propagates_and_the_next_tick_recovers() {
        let transport = Arc::new(MockTransport::new(b"model-v1"));
        let (mut downloader, _pool, refresh_count) = downloader(&transport);

        *transport.fail_probe.lock().unwrap() = true;
        assert!(downloader.run_iteration().is_err());
        assert_eq!(refresh_count.load(Ordering::Relaxed), 0);

        *transport.fail_probe.lock().unwrap() = false;
        downloader.run_iteration().unwrap();
        assert_eq!(refresh_count.load(Ordering::Relaxed), 1);
    }
}
