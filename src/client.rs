//! The decision orchestrator: composes the exploration engine, the scorer pool, the telemetry
//! batchers, the model downloader and the watchdog into a `choose_rank` / `report_outcome`
//! serving surface.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;

use crate::async_batcher::{AsyncBatcher, AsyncBatcherConfig, Sender};
use crate::background::PeriodicTaskRunner;
use crate::events::{OutcomeEvent, OutcomeValue, RankedAction, RankingEvent};
use crate::explore;
use crate::model::ModelTransport;
use crate::model_downloader::ModelDownloader;
use crate::object_pool::VersionedPool;
use crate::prng;
use crate::scorer::{Scorer, ScorerFactory};
use crate::watchdog::Watchdog;
use crate::{Error, ErrorBoundary, ErrorCallback, Result};

/// How the orchestrator turns per-action scores into a sampling distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExplorationStrategy {
    /// Epsilon-greedy over the highest-scored action, using
    /// [`BanditClientConfig::initial_epsilon`].
    EpsilonGreedy,
    /// Softmax over the raw scores.
    Softmax {
        /// Softmax temperature parameter.
        lambda: f64,
    },
    /// Bagging: scores are interpreted as (rounded, non-negative) ensemble votes.
    Bag,
}

/// Configuration for [`BanditClient`]. Every option has a documented default and is
/// independently settable.
#[derive(Debug, Clone)]
pub struct BanditClientConfig {
    /// Maximum queued telemetry events per stream before pushes are rejected.
    ///
    /// Defaults to [`BanditClientConfig::DEFAULT_QUEUE_MAX_SIZE`].
    pub queue_max_size: usize,
    /// Maximum telemetry batch size in bytes.
    ///
    /// Defaults to [`BanditClientConfig::DEFAULT_BATCH_HIGH_WATER_MARK`].
    pub batch_high_water_mark: usize,
    /// Interval between telemetry flushes.
    ///
    /// Defaults to [`BanditClientConfig::DEFAULT_FLUSH_INTERVAL`].
    pub flush_interval: Duration,
    /// Interval between model refresh polls.
    ///
    /// Defaults to [`BanditClientConfig::DEFAULT_MODEL_REFRESH_INTERVAL`].
    pub model_refresh_interval: Duration,
    /// Subtractive jitter applied to each model refresh sleep, so fleets of clients don't
    /// synchronize their polls.
    ///
    /// Defaults to [`BanditClientConfig::DEFAULT_MODEL_REFRESH_JITTER`].
    pub model_refresh_jitter: Duration,
    /// Exploration rate for the epsilon-greedy strategy.
    ///
    /// Defaults to [`BanditClientConfig::DEFAULT_INITIAL_EPSILON`].
    pub initial_epsilon: f64,
    /// A background thread is considered unresponsive after missing check-ins for this multiple
    /// of its loop interval.
    ///
    /// Defaults to [`BanditClientConfig::DEFAULT_WATCHDOG_TIMEOUT_MULTIPLIER`].
    pub watchdog_timeout_multiplier: u32,
    /// Strategy used to build the sampling distribution.
    ///
    /// Defaults to [`ExplorationStrategy::EpsilonGreedy`].
    pub exploration: ExplorationStrategy,
    /// When positive, every action keeps at least this much probability mass, spread uniformly.
    /// Zero disables the floor.
    ///
    /// Defaults to 0.
    pub minimum_action_probability: f64,
    /// Offset mixed into every sampling seed. De-correlates applications that reuse event ids.
    ///
    /// Defaults to 0.
    pub app_seed_shift: u64,
    /// Per-item survival probability of one overload pruning pass. 1 disables statistical
    /// thinning.
    ///
    /// Defaults to 1.
    pub prune_pass_probability: f64,
}

impl BanditClientConfig {
    /// Default value for [`BanditClientConfig::queue_max_size`].
    pub const DEFAULT_QUEUE_MAX_SIZE: usize = 10_000;
    /// Default value for [`BanditClientConfig::batch_high_water_mark`].
    pub const DEFAULT_BATCH_HIGH_WATER_MARK: usize = 64 * 1024;
    /// Default value for [`BanditClientConfig::flush_interval`].
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
    /// Default value for [`BanditClientConfig::model_refresh_interval`].
    pub const DEFAULT_MODEL_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`BanditClientConfig::model_refresh_jitter`].
    pub const DEFAULT_MODEL_REFRESH_JITTER: Duration = Duration::from_secs(3);
    /// Default value for [`BanditClientConfig::initial_epsilon`].
    pub const DEFAULT_INITIAL_EPSILON: f64 = 0.2;
    /// Default value for [`BanditClientConfig::watchdog_timeout_multiplier`].
    pub const DEFAULT_WATCHDOG_TIMEOUT_MULTIPLIER: u32 = 3;

    /// Create a new `BanditClientConfig` using default configuration.
    pub fn new() -> BanditClientConfig {
        BanditClientConfig::default()
    }

    /// Update the telemetry queue capacity.
    pub fn with_queue_max_size(mut self, queue_max_size: usize) -> Self {
        self.queue_max_size = queue_max_size;
        self
    }

    /// Update the batch high-water mark.
    pub fn with_batch_high_water_mark(mut self, batch_high_water_mark: usize) -> Self {
        self.batch_high_water_mark = batch_high_water_mark;
        self
    }

    /// Update the telemetry flush interval.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Update the model refresh interval.
    pub fn with_model_refresh_interval(mut self, model_refresh_interval: Duration) -> Self {
        self.model_refresh_interval = model_refresh_interval;
        self
    }

    /// Update the model refresh jitter.
    pub fn with_model_refresh_jitter(mut self, model_refresh_jitter: Duration) -> Self {
        self.model_refresh_jitter = model_refresh_jitter;
        self
    }

    /// Update the epsilon-greedy exploration rate.
    pub fn with_initial_epsilon(mut self, initial_epsilon: f64) -> Self {
        self.initial_epsilon = initial_epsilon;
        self
    }

    /// Update the watchdog timeout multiplier.
    pub fn with_watchdog_timeout_multiplier(mut self, watchdog_timeout_multiplier: u32) -> Self {
        self.watchdog_timeout_multiplier = watchdog_timeout_multiplier;
        self
    }

    /// Update the exploration strategy.
    pub fn with_exploration(mut self, exploration: ExplorationStrategy) -> Self {
        self.exploration = exploration;
        self
    }

    /// Update the minimum action probability floor.
    pub fn with_minimum_action_probability(mut self, minimum_action_probability: f64) -> Self {
        self.minimum_action_probability = minimum_action_probability;
        self
    }

    /// Update the application seed shift.
    pub fn with_app_seed_shift(mut self, app_seed_shift: u64) -> Self {
        self.app_seed_shift = app_seed_shift;
        self
    }

    /// Update the overload pruning pass probability.
    pub fn with_prune_pass_probability(mut self, prune_pass_probability: f64) -> Self {
        self.prune_pass_probability = prune_pass_probability;
        self
    }
}

impl Default for BanditClientConfig {
    fn default() -> BanditClientConfig {
        BanditClientConfig {
            queue_max_size: BanditClientConfig::DEFAULT_QUEUE_MAX_SIZE,
            batch_high_water_mark: BanditClientConfig::DEFAULT_BATCH_HIGH_WATER_MARK,
            flush_interval: BanditClientConfig::DEFAULT_FLUSH_INTERVAL,
            model_refresh_interval: BanditClientConfig::DEFAULT_MODEL_REFRESH_INTERVAL,
            model_refresh_jitter: BanditClientConfig::DEFAULT_MODEL_REFRESH_JITTER,
            initial_epsilon: BanditClientConfig::DEFAULT_INITIAL_EPSILON,
            watchdog_timeout_multiplier: BanditClientConfig::DEFAULT_WATCHDOG_TIMEOUT_MULTIPLIER,
            exploration: ExplorationStrategy::EpsilonGreedy,
            minimum_action_probability: 0.0,
            app_seed_shift: 0,
            prune_pass_probability: 1.0,
        }
    }
}

/// Result of one decision. The chosen action is always at position 0 of `ranking`, and the
/// probabilities sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingResponse {
    /// Event id the decision was served under.
    pub event_id: String,
    /// The full ranking, chosen action first.
    pub ranking: Vec<RankedAction>,
    /// Identifier of the chosen action. Equal to `ranking[0].action_id`.
    pub chosen_action_id: usize,
    /// Identifier of the model that produced the scores.
    pub model_id: String,
}

/// A contextual-bandit decision client.
///
/// Constructed with [`BanditClient::start`], which spawns the watchdog, two telemetry batchers
/// (ranking and outcome streams) and the model downloader. The request path
/// ([`BanditClient::choose_rank`] / [`BanditClient::report_outcome`]) runs on the caller's
/// thread and never blocks on network I/O: it performs an in-memory queue push and a pool
/// borrow, nothing else.
pub struct BanditClient {
    config: BanditClientConfig,
    boundary: ErrorBoundary,
    watchdog: Arc<Watchdog>,
    pool: Arc<VersionedPool<Box<dyn Scorer>>>,
    ranking_batcher: AsyncBatcher,
    outcome_batcher: AsyncBatcher,
    downloader_runner: PeriodicTaskRunner,
    refresh_count: Arc<AtomicU64>,
}

impl BanditClient {
    /// Start the client and all of its background threads.
    ///
    /// `error_callback` receives every background error; without one, background errors set a
    /// sticky flag and the request path fails closed with [`Error::Unhealthy`].
    ///
    /// # Errors
    ///
    /// Returns an IO error if any background thread failed to start.
    pub fn start(
        config: BanditClientConfig,
        scorer_factory: Arc<dyn ScorerFactory>,
        transport: Arc<dyn ModelTransport>,
        ranking_sender: Arc<dyn Sender>,
        outcome_sender: Arc<dyn Sender>,
        error_callback: Option<ErrorCallback>,
    ) -> std::io::Result<BanditClient> {
        let boundary = match error_callback {
            Some(callback) => ErrorBoundary::with_callback(callback),
            None => ErrorBoundary::new(),
        };

        let watchdog = Watchdog::start(boundary.clone())?;

        // Seeded with the cold-start factory so decisions work before the first download.
        let cold_start: crate::object_pool::PoolFactory<Box<dyn Scorer>> = {
            let scorer_factory = Arc::clone(&scorer_factory);
            Arc::new(move || scorer_factory.hydrate(None))
        };
        let pool = Arc::new(VersionedPool::with_factory(cold_start));

        let batcher_config = AsyncBatcherConfig::new()
            .with_batch_high_water_mark(config.batch_high_water_mark)
            .with_flush_interval(config.flush_interval)
            .with_queue_max_size(config.queue_max_size)
            .with_prune_pass_probability(config.prune_pass_probability);
        let batcher_timeout = config.flush_interval * config.watchdog_timeout_multiplier;

        let ranking_batcher = AsyncBatcher::start(
            "bandit-ranking-batcher",
            ranking_sender,
            batcher_config.clone(),
            boundary.clone(),
            Some(Arc::clone(&watchdog)),
            batcher_timeout,
        )?;
        let outcome_batcher = AsyncBatcher::start(
            "bandit-outcome-batcher",
            outcome_sender,
            batcher_config,
            boundary.clone(),
            Some(Arc::clone(&watchdog)),
            batcher_timeout,
        )?;

        let refresh_count = Arc::new(AtomicU64::new(0));
        let downloader = ModelDownloader::new(
            transport,
            scorer_factory,
            Arc::clone(&pool),
            Arc::clone(&refresh_count),
        );
        let downloader_runner = PeriodicTaskRunner::new(
            "bandit-model-downloader",
            config.model_refresh_interval,
            config.model_refresh_jitter,
            Some(Arc::clone(&watchdog)),
            config.model_refresh_interval * config.watchdog_timeout_multiplier,
            boundary.clone(),
        );
        downloader_runner.start(downloader)?;

        Ok(BanditClient {
            config,
            boundary,
            watchdog,
            pool,
            ranking_batcher,
            outcome_batcher,
            downloader_runner,
            refresh_count,
        })
    }

    /// Choose an action for the given event and context.
    ///
    /// Returns the full ranking with the chosen action at position 0, and asynchronously logs a
    /// [`RankingEvent`] for learning. A full telemetry queue drops the event (counted and
    /// reported) but the decision itself still succeeds.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] on an empty event id or context.
    /// - [`Error::Unhealthy`] once a background thread has been flagged unresponsive and no
    ///   error callback is configured.
    /// - [`Error::SizeMismatch`] if the scorer returns mismatched ids and scores.
    /// - Any error returned by the scorer factory or the scorer itself.
    pub fn choose_rank(&self, event_id: &str, context: &[u8]) -> Result<RankingResponse> {
        if event_id.is_empty() {
            return Err(Error::InvalidArgument("event_id must not be empty"));
        }
        if context.is_empty() {
            return Err(Error::InvalidArgument("context must not be empty"));
        }
        if !self.boundary.is_healthy() {
            return Err(Error::Unhealthy);
        }

        // Scoped borrow: the instance returns to the pool on every exit path, and the pool lock
        // is not held across the predict call.
        let (prediction, model_id) = {
            let mut scorer = self.pool.get_or_create()?;
            let prediction = scorer.predict(context)?;
            let model_id = scorer.model_id().to_owned();
            (prediction, model_id)
        };

        if prediction.action_ids.len() != prediction.scores.len() {
            return Err(Error::SizeMismatch {
                expected: prediction.action_ids.len(),
                actual: prediction.scores.len(),
            });
        }
        if prediction.scores.is_empty() {
            return Err(Error::BadRange("scorer returned no actions"));
        }

        let mut pdf = vec![0.0; prediction.scores.len()];
        match self.config.exploration {
            ExplorationStrategy::EpsilonGreedy => {
                let top_action = argmax(&prediction.scores);
                explore::epsilon_greedy(self.config.initial_epsilon, top_action, &mut pdf)?;
            }
            ExplorationStrategy::Softmax { lambda } => {
                explore::softmax(lambda, &prediction.scores, &mut pdf)?;
            }
            ExplorationStrategy::Bag => {
                let votes: Vec<u32> = prediction
                    .scores
                    .iter()
                    .map(|&score| score.max(0.0).round() as u32)
                    .collect();
                explore::bag(&votes, &mut pdf)?;
            }
        }
        if self.config.minimum_action_probability > 0.0 {
            explore::enforce_minimum_probability(
                self.config.minimum_action_probability,
                true,
                &mut pdf,
            )?;
        }

        let seed = prng::event_seed(event_id, self.config.app_seed_shift);
        let ranking_order = explore::sample_ranking(seed, &pdf, &prediction.scores)?;

        let ranking: Vec<RankedAction> = ranking_order
            .iter()
            .map(|&index| RankedAction {
                action_id: prediction.action_ids[index],
                probability: pdf[index],
            })
            .collect();

        let response = RankingResponse {
            event_id: event_id.to_owned(),
            chosen_action_id: ranking[0].action_id,
            ranking,
            model_id,
        };

        let event = RankingEvent {
            event_id: response.event_id.clone(),
            context: context.to_vec(),
            ranking: response.ranking.clone(),
            model_id: response.model_id.clone(),
            timestamp: Utc::now(),
        };
        match event.to_json_bytes() {
            Ok(payload) => {
                if let Err(err) = self.ranking_batcher.enqueue(payload) {
                    self.boundary.report(&err, "ranking event dropped");
                }
            }
            Err(err) => self.boundary.report(&err, "ranking event serialization"),
        }

        Ok(response)
    }

    /// Report the outcome of an earlier decision.
    ///
    /// The outcome ships asynchronously on the outcome stream. A full queue drops the event
    /// (counted and reported) but the call still succeeds.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] on an empty event id.
    /// - [`Error::Unhealthy`] once background threads have been flagged unresponsive.
    pub fn report_outcome(&self, event_id: &str, outcome: impl Into<OutcomeValue>) -> Result<()> {
        if event_id.is_empty() {
            return Err(Error::InvalidArgument("event_id must not be empty"));
        }
        if !self.boundary.is_healthy() {
            return Err(Error::Unhealthy);
        }

        let event = OutcomeEvent {
            event_id: event_id.to_owned(),
            outcome: outcome.into(),
            timestamp: Utc::now(),
        };
        let payload = event.to_json_bytes()?;
        if let Err(err) = self.outcome_batcher.enqueue(payload) {
            self.boundary.report(&err, "outcome event dropped");
        }

        Ok(())
    }

    /// How many models the downloader has installed since startup.
    pub fn model_refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::Relaxed)
    }

    /// Returns `false` once a background error was reported with no callback configured.
    pub fn is_healthy(&self) -> bool {
        self.boundary.is_healthy()
    }

    /// Stop all background threads without waiting for them to exit.
    pub fn stop(&self) {
        self.downloader_runner.stop();
        self.ranking_batcher.stop();
        self.outcome_batcher.stop();
        self.watchdog.stop();
    }

    /// Stop all background threads, join them and flush remaining telemetry.
    ///
    /// The watchdog stops last, after every monitored thread has joined and unregistered.
    pub fn shutdown(self) -> Result<()> {
        self.downloader_runner.shutdown()?;
        self.ranking_batcher.shutdown()?;
        self.outcome_batcher.shutdown()?;
        self.watchdog.shutdown()?;
        Ok(())
    }
}

impl std::fmt::Debug for BanditClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BanditClient")
            .field("config", &self.config)
            .field("healthy", &self.is_healthy())
            .field("model_refresh_count", &self.model_refresh_count())
            .finish()
    }
}

fn argmax(scores: &[f64]) -> usize {
    scores
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(index, _)| index)
        .unwrap_or(0)
}
