//! Building blocks for serving contextual-bandit decisions inside an application process.
//!
//! The crate is organized as a set of independently usable pieces:
//! - [`explore`] and [`prng`] implement deterministic exploration: score-to-probability
//!   transforms and seeded sampling keyed by event id.
//! - [`object_pool`] holds scorer instances behind a generation counter, so a model swap
//!   invalidates every outstanding instance without blocking in-flight predictions.
//! - [`event_queue`], [`async_batcher`], [`background`] and [`sleeper`] form the telemetry
//!   pipeline: bounded queues drained by periodic flush threads that batch events up to a
//!   high-water mark.
//! - [`watchdog`] monitors every background thread and reports the ones that stop checking in.
//! - [`model_downloader`] and [`http_transport`] poll a model endpoint and install new models
//!   into the pool.
//! - [`client`] ties all of the above into [`client::BanditClient`], the recommended entry
//!   point. Use the individual modules directly only when embedding the pieces into an
//!   existing runtime.
//!
//! Background errors are routed through [`ErrorBoundary`]: install a callback to observe them,
//! or let the default sticky flag fail the request path closed.

pub mod async_batcher;
pub mod background;
pub mod client;
pub mod event_queue;
pub mod explore;
pub mod http_transport;
pub mod model_downloader;
pub mod object_pool;
pub mod prng;
pub mod sleeper;
pub mod watchdog;

mod error;
mod events;
mod model;
mod scorer;

pub use client::{BanditClient, BanditClientConfig, ExplorationStrategy, RankingResponse};
pub use error::{Error, ErrorBoundary, ErrorCallback, Result};
pub use events::{OutcomeEvent, OutcomeValue, RankedAction, RankingEvent};
pub use model::{ModelBlob, ModelMetadata, ModelTransport};
pub use scorer::{Prediction, Scorer, ScorerFactory};
