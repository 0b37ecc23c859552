use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::{Arc, Weak};

use futures::future;
use parking_lot::Mutex;

use crate::{
    batch_function::{BatchFunction, KeyContext},
    cache::{CacheKeyFn, CacheKeyMatchFn, EntryCache, Lookup},
    dispatch_strategy::{
        BatchedStrategy, DispatchConfig, DispatchStrategy, ImmediateStrategy, OnFailedDispatch,
    },
    error::{LoadError, LoadResult},
    instrumentation::{DataLoaderInstrumentation, NoopInstrumentation},
    pending::PendingResult,
    scheduler::Scheduler,
    stats::{LoaderInfo, NoopStatsCollector, StatsCollector},
};

/// How a loader turns cache misses into physical calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Coalesce every miss of one tick, see [`BatchedStrategy`].
    #[default]
    Batched,
    /// One physical call per miss, see [`ImmediateStrategy`].
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLoaderOptions {
    /// Upper bound on the distinct requests sent in a single physical call. Zero is treated as
    /// one.
    pub max_batch_size: usize,
    pub dispatch: DispatchMode,
}

impl Default for DataLoaderOptions {
    fn default() -> Self {
        Self { max_batch_size: 1000, dispatch: DispatchMode::Batched }
    }
}

/// Batch loads values from some expensive resource, primarily intended for mitigating GraphQL's
/// N+1 problem.
///
/// Users can call [`DataLoader::load`] and [`DataLoader::load_many`] from any number of tasks
/// running under the loader's [`Scheduler`]. Every load maps its key to a cache key; requests
/// whose cache keys match share a single pending entry, so each distinct cache key is loaded at
/// most once for the lifetime of the loader. Misses are handed to the loader's dispatch strategy,
/// which with the default batched mode coalesces all misses of one tick into as few physical
/// calls as `max_batch_size` allows.
///
/// The cache can be cleared with [`DataLoader::clear`], [`DataLoader::clear_many`] and
/// [`DataLoader::clear_all`], and values can be added to it out-of-band through
/// [`DataLoader::prime`] and [`DataLoader::prime_many`]. Keys whose physical call failed are
/// evicted, so loading them again issues a new call.
///
/// `DataLoader` is a cheap handle; clones share the same cache.
pub struct DataLoader<K, V, C = K> {
    inner: Arc<LoaderInner<K, V, C>>,
}

struct LoaderInner<K, V, C> {
    info: LoaderInfo,
    cache: Mutex<EntryCache<C, V>>,
    cache_key_fn: CacheKeyFn<K, C>,
    cache_key_match_fn: Option<CacheKeyMatchFn<C>>,
    strategy: Box<dyn DispatchStrategy<K, V>>,
    on_failed: OnFailedDispatch<K>,
}

impl<K, V, C> Clone for DataLoader<K, V, C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<K, V, C> Debug for DataLoader<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLoader").field("info", &self.inner.info).finish_non_exhaustive()
    }
}

impl<K, V> DataLoader<K, V, K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a batched loader with default options.
    pub fn new<F>(batch_fn: F, scheduler: &Scheduler) -> Self
    where
        F: BatchFunction<K, V> + 'static,
    {
        Self::builder(batch_fn).build(scheduler)
    }

    pub fn builder<F>(batch_fn: F) -> DataLoaderBuilder<K, V, K>
    where
        F: BatchFunction<K, V> + 'static,
    {
        DataLoaderBuilder {
            batch_fn: Arc::new(batch_fn),
            name: None,
            kind: std::any::type_name::<F>(),
            options: DataLoaderOptions::default(),
            cache_key_fn: Arc::new(|key: &K| key.clone()),
            cache_key_match_fn: None,
            instrumentation: Arc::new(NoopInstrumentation),
            stats: Arc::new(NoopStatsCollector),
        }
    }
}

impl<K, V, C> DataLoader<K, V, C>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Loads a value from the underlying resource.
    ///
    /// Returns `Ok(None)` if the batch function did not return a value for `key`, and the batch
    /// function's error if the physical call `key` was part of failed.
    pub async fn load(&self, key: K) -> LoadResult<V> {
        self.load_with_context(key, None).await
    }

    /// Loads a value, attaching `key_context` to the key in the batch environment.
    ///
    /// The context is only seen by the batch function when this call is the one that creates the
    /// pending entry for the key's cache key.
    #[tracing::instrument(skip(self, key_context), fields(loader = %self.inner.info.name))]
    pub async fn load_with_context(
        &self,
        key: K,
        key_context: Option<KeyContext>,
    ) -> LoadResult<V> {
        let cache_key = (self.inner.cache_key_fn)(&key);
        let matcher = self.inner.cache_key_match_fn.as_ref();
        let lookup = self.inner.cache.lock().get_or_create(cache_key, matcher);
        let pending = match lookup {
            Lookup::Hit(pending) => {
                tracing::trace!("cache hit");
                pending
            }
            Lookup::Miss(pending, result) => {
                self.inner.strategy.schedule_result(
                    key.clone(),
                    key_context.clone(),
                    result,
                    self.inner.on_failed.clone(),
                );
                pending
            }
        };

        let batch_state = pending.batch_state().await;
        let on_complete = self.inner.strategy.instrumentation().begin_load(
            &key,
            key_context.as_ref(),
            &batch_state,
        );
        let result = pending.wait().await;
        on_complete(&result);
        result
    }

    /// Loads many values at once, in the order of `keys`.
    ///
    /// Fails with the first error encountered if any of the loads fails. An empty `keys` resolves
    /// immediately without scheduling anything.
    pub async fn load_many(&self, keys: Vec<K>) -> Result<Vec<Option<V>>, LoadError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        future::try_join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    /// Like [`DataLoader::load_many`], attaching a context to each key.
    pub async fn load_many_with_contexts(
        &self,
        keys: Vec<(K, Option<KeyContext>)>,
    ) -> Result<Vec<Option<V>>, LoadError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let loads = keys
            .into_iter()
            .map(|(key, key_context)| self.load_with_context(key, key_context));
        future::try_join_all(loads).await
    }

    /// Adds a value to the cache, replacing any entry stored under the same cache key.
    pub fn prime(&self, key: K, value: V) {
        let cache_key = (self.inner.cache_key_fn)(&key);
        self.inner.cache.lock().insert(cache_key, PendingResult::resolved(value));
    }

    /// Adds many values to the cache at once.
    pub fn prime_many(&self, key_vals: Vec<(K, V)>) {
        let mut cache = self.inner.cache.lock();
        for (key, value) in key_vals {
            cache.insert((self.inner.cache_key_fn)(&key), PendingResult::resolved(value));
        }
    }

    /// Removes a value from the cache.
    ///
    /// This key will be reloaded when it is next requested. Callers already waiting on it are
    /// unaffected.
    pub fn clear(&self, key: &K) {
        let cache_key = (self.inner.cache_key_fn)(key);
        self.inner.cache.lock().remove(&cache_key);
    }

    /// Removes multiple values from the cache at once.
    pub fn clear_many(&self, keys: &[K]) {
        self.inner.evict(keys);
    }

    pub fn clear_all(&self) {
        self.inner.cache.lock().clear();
    }

    pub fn info(&self) -> &LoaderInfo {
        &self.inner.info
    }

    /// Number of entries, in flight or resolved, currently cached.
    pub fn cached(&self) -> usize {
        self.inner.cache.lock().len()
    }
}

impl<K, V, C> LoaderInner<K, V, C>
where
    C: Clone + Eq + Hash,
    V: Clone,
{
    fn evict(&self, keys: &[K]) {
        let mut cache = self.cache.lock();
        for key in keys {
            cache.remove(&(self.cache_key_fn)(key));
        }
    }
}

pub struct DataLoaderBuilder<K, V, C = K> {
    batch_fn: Arc<dyn BatchFunction<K, V>>,
    name: Option<String>,
    kind: &'static str,
    options: DataLoaderOptions,
    cache_key_fn: CacheKeyFn<K, C>,
    cache_key_match_fn: Option<CacheKeyMatchFn<C>>,
    instrumentation: Arc<dyn DataLoaderInstrumentation<K, V>>,
    stats: Arc<dyn StatsCollector>,
}

impl<K, V, C> DataLoaderBuilder<K, V, C>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Name reported in stats and logs. Defaults to the loader's kind.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the loader's kind, which defaults to the type name of its batch function.
    pub fn kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    pub fn options(mut self, options: DataLoaderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.options.max_batch_size = max_batch_size;
        self
    }

    pub fn immediate(mut self) -> Self {
        self.options.dispatch = DispatchMode::Immediate;
        self
    }

    /// Derives cache keys with `f` instead of using the key itself.
    ///
    /// Resets any cache key match function, so call this first.
    pub fn cache_key_fn<C2, F>(self, f: F) -> DataLoaderBuilder<K, V, C2>
    where
        F: Fn(&K) -> C2 + Send + Sync + 'static,
    {
        DataLoaderBuilder {
            batch_fn: self.batch_fn,
            name: self.name,
            kind: self.kind,
            options: self.options,
            cache_key_fn: Arc::new(f),
            cache_key_match_fn: None,
            instrumentation: self.instrumentation,
            stats: self.stats,
        }
    }

    /// Lets a request be served by an existing entry whose cache key does not equal its own.
    ///
    /// `f` is called as `f(new_cache_key, existing_cache_key)`; the first existing entry, in
    /// insertion order, for which it returns `true` is used.
    pub fn cache_key_match_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&C, &C) -> bool + Send + Sync + 'static,
    {
        self.cache_key_match_fn = Some(Arc::new(f));
        self
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

    pub fn build(self, scheduler: &Scheduler) -> DataLoader<K, V, C> {
        let info = LoaderInfo::new(self.name.unwrap_or_else(|| self.kind.to_owned()), self.kind);
        let config = DispatchConfig::new(self.batch_fn)
            .instrumentation(self.instrumentation)
            .stats_collector(self.stats)
            .loader(info.clone())
            .max_batch_size(self.options.max_batch_size);
        let strategy: Box<dyn DispatchStrategy<K, V>> = match self.options.dispatch {
            DispatchMode::Batched => Box::new(BatchedStrategy::new(config, scheduler)),
            DispatchMode::Immediate => Box::new(ImmediateStrategy::new(config, scheduler)),
        };
        let cache_key_fn = self.cache_key_fn;
        let cache_key_match_fn = self.cache_key_match_fn;

        let inner = Arc::new_cyclic(|weak: &Weak<LoaderInner<K, V, C>>| {
            let weak = weak.clone();
            let on_failed: OnFailedDispatch<K> = Arc::new(move |keys: &[K], error: &LoadError| {
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!(loader = %inner.info, %error, "evicting failed keys");
                    inner.evict(keys);
                }
            });
            LoaderInner {
                info,
                cache: Mutex::new(EntryCache::new()),
                cache_key_fn,
                cache_key_match_fn,
                strategy,
                on_failed,
            }
        });
        DataLoader { inner }
    }
}
