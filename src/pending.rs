use std::fmt;
use std::sync::Arc;

use futures::future::{FutureExt, Shared};
use tokio::sync::oneshot;

use crate::{
    error::{LoadError, LoadResult},
    instrumentation::BatchState,
};

/// Write side of a pending entry, held by whichever dispatch strategy owns the key.
///
/// Completing it fulfils every [`PendingResult`] clone exactly once.
#[derive(Debug)]
pub struct BatchResult<V> {
    value_tx: oneshot::Sender<LoadResult<V>>,
    batch_state_tx: Option<oneshot::Sender<Arc<BatchState>>>,
}

/// Read side of a pending entry. Cloned into the cache and out to every caller that maps to it.
pub struct PendingResult<V> {
    value: Shared<oneshot::Receiver<LoadResult<V>>>,
    batch_state: Shared<oneshot::Receiver<Arc<BatchState>>>,
}

impl<V> fmt::Debug for PendingResult<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResult").finish_non_exhaustive()
    }
}

impl<V: Clone> Clone for PendingResult<V> {
    fn clone(&self) -> Self {
        Self { value: self.value.clone(), batch_state: self.batch_state.clone() }
    }
}

impl<V: Clone> BatchResult<V> {
    pub fn channel() -> (BatchResult<V>, PendingResult<V>) {
        let (value_tx, value_rx) = oneshot::channel();
        let (batch_state_tx, batch_state_rx) = oneshot::channel();
        let pending =
            PendingResult { value: value_rx.shared(), batch_state: batch_state_rx.shared() };
        (BatchResult { value_tx, batch_state_tx: Some(batch_state_tx) }, pending)
    }

    /// Publishes the batch state this entry was added to. Only the first call has an effect.
    pub fn attach_batch_state(&mut self, state: Arc<BatchState>) {
        if let Some(tx) = self.batch_state_tx.take() {
            let _ = tx.send(state);
        }
    }

    pub fn complete(self, result: LoadResult<V>) {
        if self.value_tx.send(result).is_err() {
            tracing::trace!("pending result dropped before completion");
        }
    }
}

impl<V: Clone> PendingResult<V> {
    /// A pending entry that is already fulfilled with `value`.
    pub fn resolved(value: V) -> Self {
        let (mut result, pending) = BatchResult::channel();
        result.attach_batch_state(Arc::new(BatchState::new()));
        result.complete(Ok(Some(value)));
        pending
    }

    pub async fn wait(&self) -> LoadResult<V> {
        self.value.clone().await.unwrap_or(Err(LoadError::Abandoned))
    }

    /// The batch state of the batch this entry was dispatched in.
    pub async fn batch_state(&self) -> Arc<BatchState> {
        match self.batch_state.clone().await {
            Ok(state) => state,
            Err(_) => Arc::new(BatchState::new()),
        }
    }
}
