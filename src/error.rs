use std::any::Any;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use thiserror::Error;

/// The outcome of a single logical load: a value, an absent value, or the error of the physical
/// batch call the load was coalesced into.
pub type LoadResult<V> = Result<Option<V>, LoadError>;

/// Errors surfaced to callers of [`crate::DataLoader::load`].
///
/// A `LoadError` is cloned to every caller whose key was part of the failing physical call, so
/// all of them observe the same error.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// The batch function returned an error. Displays as the original error.
    #[error("{0}")]
    Batch(Arc<anyhow::Error>),

    /// The batch function panicked while loading.
    #[error("batch function panicked: {0}")]
    Panicked(Arc<str>),

    /// The pending entry was dropped before its batch produced a result.
    #[error("load was abandoned before its batch completed")]
    Abandoned,
}

impl LoadError {
    pub(crate) fn batch(error: anyhow::Error) -> Self {
        LoadError::Batch(Arc::new(error))
    }

    /// Returns the error produced by the batch function, if that is what failed.
    pub fn batch_error(&self) -> Option<&anyhow::Error> {
        match self {
            LoadError::Batch(error) => Some(error),
            _ => None,
        }
    }

    /// Attempts to downcast the batch function's error to its original type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.batch_error().and_then(|error| error.downcast_ref::<E>())
    }
}

/// Failures of deferred (next-tick) work, reported to the scheduler's error handler.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("deferred work failed on tick {tick}: {error}")]
    Failed { tick: u64, error: anyhow::Error },

    #[error("deferred work panicked on tick {tick}: {message}")]
    Panicked { tick: u64, message: String },
}

impl TickError {
    /// Index of the tick whose deferred work failed.
    pub fn tick(&self) -> u64 {
        match self {
            TickError::Failed { tick, .. } | TickError::Panicked { tick, .. } => *tick,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no tokio runtime available to drive the scheduler: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
