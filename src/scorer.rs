//! The opaque scoring capability consumed by the orchestrator.
//!
//! How feature context turns into per-action scores is entirely the integrator's business; this
//! crate only moves the bytes and the numbers around.
use crate::model::ModelBlob;
use crate::Result;

/// Per-action output of one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Identifiers of the scored actions, parallel to `scores`.
    pub action_ids: Vec<usize>,
    /// Raw per-action scores. Higher is better.
    pub scores: Vec<f64>,
}

/// A hydrated scoring model.
///
/// Instances are not required to be thread-safe; the orchestrator hands each request an
/// exclusively borrowed instance from the versioned pool.
pub trait Scorer: Send {
    /// Score every candidate action for the given opaque context bytes.
    fn predict(&mut self, context: &[u8]) -> Result<Prediction>;

    /// Identifier of the model this scorer was hydrated from, echoed into ranking responses and
    /// telemetry.
    fn model_id(&self) -> &str {
        ""
    }
}

/// Hydrates [`Scorer`] instances from model bytes.
///
/// `model` is `None` before the first successful download; integrators return their cold-start
/// scorer there, or [`Error::ModelNotReady`](crate::Error::ModelNotReady) if they have none.
pub trait ScorerFactory: Send + Sync {
    /// Construct a scorer from the given model, or from nothing.
    fn hydrate(&self, model: Option<&ModelBlob>) -> Result<Box<dyn Scorer>>;
}
