use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::{
    batch_function::{BatchFunction, KeyContext},
    error::{panic_message, LoadResult},
};

/// Callback returned by [`DataLoaderInstrumentation::begin_load`], invoked once with the outcome
/// of the logical load.
pub type OnCompleteLoad<V> = Box<dyn FnOnce(&LoadResult<V>) + Send>;

/// Correlation token shared by every instrumentation hook of one batch.
///
/// Instrumentations may stash typed data on it when it is created and read it back in later
/// hooks. Every instrumentation of a chain sees the same instance.
pub struct BatchState {
    id: u64,
    created_at: Instant,
    extensions: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl BatchState {
    pub(crate) fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
            extensions: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Stores `value`, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        self.extensions.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.extensions
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }
}

impl fmt::Debug for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchState")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Observer hooks invoked at the lifecycle points of a loader. Every hook defaults to a no-op.
pub trait DataLoaderInstrumentation<K, V>: Send + Sync {
    /// A new batch was opened.
    fn on_create_batch_state(&self, _state: &BatchState) {}

    /// A logical load of `key` started. The returned callback runs when it completes, including
    /// loads served from the cache.
    fn begin_load(
        &self,
        _key: &K,
        _key_context: Option<&KeyContext>,
        _state: &BatchState,
    ) -> OnCompleteLoad<V> {
        Box::new(|_: &LoadResult<V>| {})
    }

    /// `key` was added to the batch identified by `state`.
    fn on_add_batch_entry(
        &self,
        _key: &K,
        _key_context: Option<&KeyContext>,
        _state: &BatchState,
    ) {
    }

    /// Wraps or replaces the batch function used for one physical call.
    fn instrument_batch_load(
        &self,
        batch_fn: Arc<dyn BatchFunction<K, V>>,
        _state: &Arc<BatchState>,
    ) -> Arc<dyn BatchFunction<K, V>> {
        batch_fn
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl<K, V> DataLoaderInstrumentation<K, V> for NoopInstrumentation {}

/// Fans each hook out to a list of instrumentations in registration order.
///
/// A panic in one instrumentation's hook is logged and does not prevent the same hook from
/// running on the others. For `instrument_batch_load` each instrumentation wraps the function
/// produced by the previous one, so the last registered is the outermost.
pub struct ChainedInstrumentation<K, V> {
    instrumentations: Vec<Arc<dyn DataLoaderInstrumentation<K, V>>>,
}

impl<K, V> ChainedInstrumentation<K, V> {
    pub fn new(instrumentations: Vec<Arc<dyn DataLoaderInstrumentation<K, V>>>) -> Self {
        Self { instrumentations }
    }

    pub fn push(&mut self, instrumentation: Arc<dyn DataLoaderInstrumentation<K, V>>) {
        self.instrumentations.push(instrumentation);
    }

    pub fn len(&self) -> usize {
        self.instrumentations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrumentations.is_empty()
    }
}

impl<K, V> Default for ChainedInstrumentation<K, V> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn isolated<T>(hook: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::warn!(
                hook,
                panic = %panic_message(&*payload),
                "instrumentation hook panicked"
            );
            None
        }
    }
}

impl<K, V> DataLoaderInstrumentation<K, V> for ChainedInstrumentation<K, V>
where
    K: 'static,
    V: 'static,
{
    fn on_create_batch_state(&self, state: &BatchState) {
        for instrumentation in &self.instrumentations {
            isolated("on_create_batch_state", || instrumentation.on_create_batch_state(state));
        }
    }

    fn begin_load(
        &self,
        key: &K,
        key_context: Option<&KeyContext>,
        state: &BatchState,
    ) -> OnCompleteLoad<V> {
        let callbacks: Vec<OnCompleteLoad<V>> = self
            .instrumentations
            .iter()
            .filter_map(|instrumentation| {
                isolated("begin_load", || instrumentation.begin_load(key, key_context, state))
            })
            .collect();
        Box::new(move |result: &LoadResult<V>| {
            for callback in callbacks {
                isolated("on_complete_load", || callback(result));
            }
        })
    }

    fn on_add_batch_entry(&self, key: &K, key_context: Option<&KeyContext>, state: &BatchState) {
        for instrumentation in &self.instrumentations {
            isolated("on_add_batch_entry", || {
                instrumentation.on_add_batch_entry(key, key_context, state)
            });
        }
    }

    fn instrument_batch_load(
        &self,
        batch_fn: Arc<dyn BatchFunction<K, V>>,
        state: &Arc<BatchState>,
    ) -> Arc<dyn BatchFunction<K, V>> {
        self.instrumentations.iter().fold(batch_fn, |batch_fn, instrumentation| {
            isolated("instrument_batch_load", || {
                instrumentation.instrument_batch_load(batch_fn.clone(), state)
            })
            .unwrap_or(batch_fn)
        })
    }
}

/// Announces a new batch to `instrumentation`.
///
/// A panic in the hook is logged rather than failing whichever load happened to open the batch.
pub(crate) fn announce_batch_state<K, V>(
    instrumentation: &dyn DataLoaderInstrumentation<K, V>,
    state: &BatchState,
) {
    isolated("on_create_batch_state", || instrumentation.on_create_batch_state(state));
}
