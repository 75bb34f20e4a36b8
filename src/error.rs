use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Represents a result type for operations in the bandit client.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the bandit client.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An input to the exploration engine was empty or outside its valid range.
    #[error("{0}")]
    BadRange(&'static str),

    /// Two parallel arrays (pdf/scores/ranking) disagree in length.
    #[error("length mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// A request-path argument failed validation.
    #[error("{0}")]
    InvalidArgument(&'static str),

    /// The telemetry queue is at capacity and the offending item was dropped.
    #[error("queue is at capacity, event dropped")]
    QueueFull,

    /// A background thread missed its liveness deadline and no error callback was configured. The
    /// request path fails closed once this is observed.
    #[error("background threads are unhealthy")]
    Unhealthy,

    /// The object pool was asked to construct an instance before a factory was configured.
    #[error("object pool has no factory configured")]
    FactoryNotConfigured,

    /// No model has been downloaded yet and the scorer factory has no cold-start fallback.
    #[error("no model has been downloaded yet")]
    ModelNotReady,

    /// Indicates that a background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    BackgroundThreadPanicked,

    /// A registered background thread stopped checking in with the watchdog.
    #[error("thread {name:?} missed its liveness deadline")]
    UnresponsiveThread {
        /// Name the thread registered under.
        name: String,
    },

    /// Invalid model URL configuration.
    #[error("invalid model URL")]
    InvalidUrl(#[source] url::ParseError),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// A telemetry event failed to serialize.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// Error produced by an integrator-provided capability (scorer, sender or transport).
    #[error("{0}")]
    External(Arc<dyn std::error::Error + Send + Sync>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}

/// Callback invoked from background threads when they encounter an error. It must be non-blocking
/// and reentrant-safe: it may be called concurrently from several threads, including while an
/// earlier invocation is still running.
pub type ErrorCallback = Arc<dyn Fn(&Error, &str) + Send + Sync>;

/// Routes background errors out of the library without unwinding across thread boundaries.
///
/// When a callback is configured, every reported error is handed to it together with a short
/// context string. Without a callback, reporting sets a sticky per-instance flag that the request
/// path checks opportunistically (fail closed).
///
/// Cloning is cheap and clones share the sticky flag.
#[derive(Clone, Default)]
pub struct ErrorBoundary {
    callback: Option<ErrorCallback>,
    unhandled: Arc<AtomicBool>,
}

impl ErrorBoundary {
    /// Create an error boundary without a callback. Reported errors set the sticky flag.
    pub fn new() -> ErrorBoundary {
        ErrorBoundary::default()
    }

    /// Create an error boundary that forwards every reported error to `callback`.
    pub fn with_callback(callback: ErrorCallback) -> ErrorBoundary {
        ErrorBoundary {
            callback: Some(callback),
            unhandled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Report a background error. Never blocks and never panics.
    pub fn report(&self, error: &Error, context: &str) {
        log::warn!(target: "bandit", context; "background error: {error}");
        match &self.callback {
            Some(callback) => callback(error, context),
            None => self.unhandled.store(true, Ordering::Relaxed),
        }
    }

    /// Returns `false` once an error has been reported with no callback configured.
    pub fn is_healthy(&self) -> bool {
        !self.unhandled.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ErrorBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBoundary")
            .field("has_callback", &self.callback.is_some())
            .field("is_healthy", &self.is_healthy())
            .finish()
    }
}
