use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};
use std::time::Instant;

use futures::future::{self, BoxFuture, FutureExt};
use tracing_futures::Instrument;

use crate::{
    batch_function::{BatchFunction, BatchLoaderEnvironment, KeyContext},
    batch_queue::BatchQueue,
    error::{panic_message, LoadError, LoadResult},
    instrumentation::{
        announce_batch_state, BatchState, DataLoaderInstrumentation, NoopInstrumentation,
    },
    pending::BatchResult,
    scheduler::Scheduler,
    stats::{LoaderInfo, NoopStatsCollector, StatsCollector},
    tick::TickDescriptor,
};

/// Called with the keys of a physical call that failed, before its pending entries are rejected.
pub type OnFailedDispatch<K> = Arc<dyn Fn(&[K], &LoadError) + Send + Sync>;

/// Policy deciding how pending load requests become physical batch calls.
pub trait DispatchStrategy<K, V>: Send + Sync {
    fn instrumentation(&self) -> &Arc<dyn DataLoaderInstrumentation<K, V>>;

    /// Takes ownership of the write side of a pending entry for `key` and arranges for it to be
    /// completed by a physical call.
    fn schedule_result(
        &self,
        key: K,
        key_context: Option<KeyContext>,
        result: BatchResult<V>,
        on_failed: OnFailedDispatch<K>,
    );
}

/// Everything a dispatch strategy needs to issue physical calls.
pub struct DispatchConfig<K, V> {
    batch_fn: Arc<dyn BatchFunction<K, V>>,
    instrumentation: Arc<dyn DataLoaderInstrumentation<K, V>>,
    stats: Arc<dyn StatsCollector>,
    loader: LoaderInfo,
    max_batch_size: usize,
}

impl<K, V> DispatchConfig<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(batch_fn: Arc<dyn BatchFunction<K, V>>) -> Self {
        Self {
            batch_fn,
            instrumentation: Arc::new(NoopInstrumentation),
            stats: Arc::new(NoopStatsCollector),
            loader: LoaderInfo::new("dataloader", "dataloader"),
            max_batch_size: usize::MAX,
        }
    }

    pub fn instrumentation(
        mut self,
        instrumentation: Arc<dyn DataLoaderInstrumentation<K, V>>,
    ) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    pub fn stats_collector(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = stats;
        self
    }

    pub fn loader(mut self, loader: LoaderInfo) -> Self {
        self.loader = loader;
        self
    }

    /// Upper bound on the entries of one physical call. Zero is treated as one.
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Issues one physical call for `entries` and completes every entry with its outcome.
    async fn dispatch(
        &self,
        entries: Vec<BatchEntry<K, V>>,
        batch_state: Arc<BatchState>,
        tick: TickDescriptor,
    ) {
        let mut keys = Vec::with_capacity(entries.len());
        let mut key_contexts = HashMap::with_capacity(entries.len());
        for entry in &entries {
            if let Entry::Vacant(slot) = key_contexts.entry(entry.key.clone()) {
                slot.insert(entry.key_context.clone());
                keys.push(entry.key.clone());
            }
        }
        self.stats.log_total_key_count(&self.loader, &tick, entries.len());
        self.stats.log_actual_loads(&self.loader, &tick, keys.len());
        tracing::debug!(
            loader = %self.loader,
            tick = tick.index,
            requested = entries.len(),
            ?keys,
            "dispatching batch"
        );

        let span =
            tracing::trace_span!("batch_load", loader = %self.loader.name, tick = tick.index);
        let env = BatchLoaderEnvironment::new(
            key_contexts,
            entries.len(),
            tick,
            self.loader.clone(),
            self.max_batch_size,
        );
        let batch_fn =
            self.instrumentation.instrument_batch_load(self.batch_fn.clone(), &batch_state);
        let outcome = AssertUnwindSafe(batch_fn.try_load(&keys, &env))
            .catch_unwind()
            .instrument(span)
            .await;

        let error = match outcome {
            Ok(Ok(values)) => return self.complete_each(entries, values),
            Ok(Err(error)) => LoadError::batch(error),
            Err(payload) => LoadError::Panicked(panic_message(&*payload).into()),
        };
        tracing::warn!(loader = %self.loader, %error, ?keys, "batch load failed");
        if let Some(first) = entries.first() {
            (first.on_failed)(keys.as_slice(), &error);
        }
        for entry in entries {
            entry.result.complete(Err(error.clone()));
        }
    }

    /// Routes per-key outcomes to their entries. Every entry of a key sees the same outcome.
    fn complete_each(
        &self,
        entries: Vec<BatchEntry<K, V>>,
        values: HashMap<K, anyhow::Result<V>>,
    ) {
        let outcomes: HashMap<K, LoadResult<V>> = values
            .into_iter()
            .map(|(key, value)| (key, value.map(Some).map_err(LoadError::batch)))
            .collect();
        if let Some(first) = entries.first() {
            for (key, outcome) in &outcomes {
                if let Err(error) = outcome {
                    tracing::debug!(loader = %self.loader, ?key, %error, "key failed to load");
                    (first.on_failed)(std::slice::from_ref(key), error);
                }
            }
        }
        for entry in entries {
            let outcome = outcomes.get(&entry.key).cloned().unwrap_or(Ok(None));
            entry.result.complete(outcome);
        }
    }
}

struct BatchEntry<K, V> {
    key: K,
    key_context: Option<KeyContext>,
    result: BatchResult<V>,
    on_failed: OnFailedDispatch<K>,
}

/// Dispatches every request as its own single-key physical call, without coalescing.
///
/// The physical call runs as ordinary work on the scheduler and is not cancelled when the caller
/// stops waiting for it.
pub struct ImmediateStrategy<K, V> {
    config: Arc<DispatchConfig<K, V>>,
    scheduler: Scheduler,
}

impl<K, V> ImmediateStrategy<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: DispatchConfig<K, V>, scheduler: &Scheduler) -> Self {
        Self { config: Arc::new(config), scheduler: scheduler.clone() }
    }
}

impl<K, V> DispatchStrategy<K, V> for ImmediateStrategy<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn instrumentation(&self) -> &Arc<dyn DataLoaderInstrumentation<K, V>> {
        &self.config.instrumentation
    }

    fn schedule_result(
        &self,
        key: K,
        key_context: Option<KeyContext>,
        mut result: BatchResult<V>,
        on_failed: OnFailedDispatch<K>,
    ) {
        let instrumentation = &*self.config.instrumentation;
        let batch_state = Arc::new(BatchState::new());
        result.attach_batch_state(batch_state.clone());
        announce_batch_state(instrumentation, &batch_state);
        let added = panic::catch_unwind(AssertUnwindSafe(|| {
            instrumentation.on_add_batch_entry(&key, key_context.as_ref(), &batch_state)
        }));

        let config = self.config.clone();
        let entry = BatchEntry { key, key_context, result, on_failed };
        self.scheduler.spawn(async move {
            config.dispatch(vec![entry], batch_state, TickDescriptor::immediate()).await;
        });
        // The entry is dispatched either way; the hook's panic still reaches the caller.
        if let Err(payload) = added {
            panic::resume_unwind(payload);
        }
    }
}

struct RoundState {
    batch: Arc<RoundBatch>,
    opened_at: Instant,
}

/// Batch state shared by every chunk of one round.
struct RoundBatch {
    state: Arc<BatchState>,
    announced: Once,
}

impl RoundBatch {
    /// Runs `on_create_batch_state` exactly once, before any caller proceeds past it.
    ///
    /// The hook must not schedule loads on this strategy itself: they would join this round and
    /// wait on the announcement in progress.
    fn announce<K, V>(&self, instrumentation: &dyn DataLoaderInstrumentation<K, V>) {
        self.announced.call_once(|| announce_batch_state(instrumentation, &self.state));
    }
}

type EntryQueue<K, V> = BatchQueue<BatchEntry<K, V>, RoundState, BoxFuture<'static, ()>>;

/// Coalesces every request scheduled before the next tick into physical calls of at most
/// `max_batch_size` entries each.
///
/// The first request of a round defers a drain to the scheduler's next tick. The drain splits the
/// round into chunks in enqueue order and runs them concurrently. All chunks share the round's
/// batch state; each chunk fails or succeeds on its own.
pub struct BatchedStrategy<K, V> {
    shared: Arc<BatchedShared<K, V>>,
}

struct BatchedShared<K, V> {
    config: Arc<DispatchConfig<K, V>>,
    queue: EntryQueue<K, V>,
    scheduler: Scheduler,
}

impl<K, V> BatchedStrategy<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: DispatchConfig<K, V>, scheduler: &Scheduler) -> Self {
        let config = Arc::new(config);
        let drain_config = config.clone();
        let queue = BatchQueue::with_round_state(
            || RoundState {
                batch: Arc::new(RoundBatch {
                    state: Arc::new(BatchState::new()),
                    announced: Once::new(),
                }),
                opened_at: Instant::now(),
            },
            move |round: RoundState, entries: Vec<BatchEntry<K, V>>, tick: TickDescriptor| {
                drain(drain_config.clone(), round, entries, tick).boxed()
            },
        );
        Self { shared: Arc::new(BatchedShared { config, queue, scheduler: scheduler.clone() }) }
    }

    /// Number of requests waiting for the next drain.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

async fn drain<K, V>(
    config: Arc<DispatchConfig<K, V>>,
    round: RoundState,
    entries: Vec<BatchEntry<K, V>>,
    tick: TickDescriptor,
) where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    config.stats.log_schedule_latency(&config.loader, &tick, round.opened_at.elapsed());
    round.batch.announce(&*config.instrumentation);
    let mut entries = entries.into_iter();
    let mut chunks = Vec::new();
    loop {
        let chunk: Vec<_> = entries.by_ref().take(config.max_batch_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(config.dispatch(chunk, round.batch.state.clone(), tick.clone()));
    }
    tracing::trace!(
        loader = %config.loader,
        tick = tick.index,
        chunks = chunks.len(),
        "draining batch"
    );
    future::join_all(chunks).await;
    config.stats.log_total_latency(&config.loader, &tick, round.opened_at.elapsed());
}

impl<K, V> DispatchStrategy<K, V> for BatchedStrategy<K, V>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn instrumentation(&self) -> &Arc<dyn DataLoaderInstrumentation<K, V>> {
        &self.shared.config.instrumentation
    }

    fn schedule_result(
        &self,
        key: K,
        key_context: Option<KeyContext>,
        mut result: BatchResult<V>,
        on_failed: OnFailedDispatch<K>,
    ) {
        let mut batch = None;
        let enqueued = self.shared.queue.enqueue_with(|round: &RoundState| {
            result.attach_batch_state(round.batch.state.clone());
            batch = Some(round.batch.clone());
            BatchEntry { key: key.clone(), key_context: key_context.clone(), result, on_failed }
        });

        // Hooks run outside the queue lock, so they may call back into the loader.
        let instrumentation = &*self.shared.config.instrumentation;
        let added = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(batch) = &batch {
                batch.announce(instrumentation);
                instrumentation.on_add_batch_entry(&key, key_context.as_ref(), &batch.state);
            }
        }));
        if enqueued.opened_round {
            let shared = self.shared.clone();
            self.shared.scheduler.defer_to_next_tick(move |tick| async move {
                if let Some(drain) = shared.queue.flush(tick) {
                    drain.await;
                }
                Ok(())
            });
        }
        if let Err(payload) = added {
            panic::resume_unwind(payload);
        }
    }
}
