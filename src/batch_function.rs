use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{stats::LoaderInfo, tick::TickDescriptor};

/// Opaque per-key context attached by [`crate::DataLoader::load_with_context`].
pub type KeyContext = Arc<dyn Any + Send + Sync>;

/// A `BatchFunction` defines the method through which a `DataLoader` fetches batched data from
/// some resource. It receives the distinct keys requested during one tick (at most
/// `max_batch_size` of them) and an environment describing the call.
///
/// The batch function is not required to return a value for every key it was given, and may
/// return entries in any order. Requesters of keys missing from the returned map receive `None`.
/// Returning an error fails every key of the call with the same error; entries for those keys
/// are evicted from the loader's cache so a later load retries them. Batch functions that can
/// fail individual keys override [`BatchFunction::try_load`] instead (see [`from_try_fn`]).
///
/// Multiple loaders may share the same batch function through an `Arc`.
#[async_trait]
pub trait BatchFunction<K, V>: Send + Sync {
    async fn load(
        &self,
        keys: &[K],
        env: &BatchLoaderEnvironment<K>,
    ) -> anyhow::Result<HashMap<K, V>>;

    /// Loads `keys` with an outcome per key. This is what the loader calls.
    ///
    /// A key mapped to an error fails only the loads of that key, and only its cache entry is
    /// evicted. The default implementation succeeds every key returned by `load`. Wrappers
    /// installed through instrumentation should forward this method to keep per-key failures.
    async fn try_load(
        &self,
        keys: &[K],
        env: &BatchLoaderEnvironment<K>,
    ) -> anyhow::Result<HashMap<K, anyhow::Result<V>>>
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + 'static,
    {
        let values = self.load(keys, env).await?;
        Ok(values.into_iter().map(|(key, value)| (key, Ok(value))).collect())
    }
}

/// Per-call information handed to a [`BatchFunction`].
#[derive(Clone)]
pub struct BatchLoaderEnvironment<K> {
    key_contexts: HashMap<K, Option<KeyContext>>,
    total_key_count: usize,
    tick: TickDescriptor,
    loader: LoaderInfo,
    max_batch_size: usize,
}

impl<K> BatchLoaderEnvironment<K>
where
    K: Eq + Hash,
{
    pub(crate) fn new(
        key_contexts: HashMap<K, Option<KeyContext>>,
        total_key_count: usize,
        tick: TickDescriptor,
        loader: LoaderInfo,
        max_batch_size: usize,
    ) -> Self {
        Self { key_contexts, total_key_count, tick, loader, max_batch_size }
    }

    /// Context attached to `key` by the first load that requested it in this call.
    pub fn key_context(&self, key: &K) -> Option<&KeyContext> {
        self.key_contexts.get(key).and_then(Option::as_ref)
    }

    /// Context attached to `key`, downcast to `T`.
    pub fn key_context_as<T>(&self, key: &K) -> Option<&T>
    where
        T: Any,
    {
        self.key_context(key).and_then(|context| context.downcast_ref::<T>())
    }

    pub fn key_contexts(&self) -> &HashMap<K, Option<KeyContext>> {
        &self.key_contexts
    }

    /// Number of load requests this call resolves, duplicates included.
    pub fn total_key_count(&self) -> usize {
        self.total_key_count
    }

    pub fn tick(&self) -> &TickDescriptor {
        &self.tick
    }

    pub fn loader(&self) -> &LoaderInfo {
        &self.loader
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

impl<K: fmt::Debug> fmt::Debug for BatchLoaderEnvironment<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchLoaderEnvironment")
            .field("keys", &self.key_contexts.keys().collect::<Vec<_>>())
            .field("total_key_count", &self.total_key_count)
            .field("tick", &self.tick)
            .field("loader", &self.loader)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

/// Adapts an async closure into a [`BatchFunction`].
pub fn from_fn<K, V, F, Fut>(f: F) -> FnBatchFunction<K, V, F>
where
    F: Fn(Vec<K>, BatchLoaderEnvironment<K>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HashMap<K, V>>> + Send + 'static,
{
    FnBatchFunction { f, _marker: PhantomData }
}

/// See [`from_fn`].
pub struct FnBatchFunction<K, V, F> {
    f: F,
    _marker: PhantomData<fn(Vec<K>) -> V>,
}

#[async_trait]
impl<K, V, F, Fut> BatchFunction<K, V> for FnBatchFunction<K, V, F>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + 'static,
    F: Fn(Vec<K>, BatchLoaderEnvironment<K>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HashMap<K, V>>> + Send + 'static,
{
    async fn load(
        &self,
        keys: &[K],
        env: &BatchLoaderEnvironment<K>,
    ) -> anyhow::Result<HashMap<K, V>> {
        (self.f)(keys.to_vec(), env.clone()).await
    }
}

/// Adapts an async closure producing an outcome per key into a [`BatchFunction`].
///
/// Keys mapped to an error fail on their own; their siblings in the same call still resolve.
pub fn from_try_fn<K, V, F, Fut>(f: F) -> FnTryBatchFunction<K, V, F>
where
    F: Fn(Vec<K>, BatchLoaderEnvironment<K>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HashMap<K, anyhow::Result<V>>>> + Send + 'static,
{
    FnTryBatchFunction { f, _marker: PhantomData }
}

/// See [`from_try_fn`].
pub struct FnTryBatchFunction<K, V, F> {
    f: F,
    _marker: PhantomData<fn(Vec<K>) -> V>,
}

#[async_trait]
impl<K, V, F, Fut> BatchFunction<K, V> for FnTryBatchFunction<K, V, F>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + 'static,
    F: Fn(Vec<K>, BatchLoaderEnvironment<K>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HashMap<K, anyhow::Result<V>>>> + Send + 'static,
{
    /// Drops failed keys, which then read as absent.
    async fn load(
        &self,
        keys: &[K],
        env: &BatchLoaderEnvironment<K>,
    ) -> anyhow::Result<HashMap<K, V>> {
        let outcomes = self.try_load(keys, env).await?;
        Ok(outcomes.into_iter().filter_map(|(key, value)| Some((key, value.ok()?))).collect())
    }

    async fn try_load(
        &self,
        keys: &[K],
        env: &BatchLoaderEnvironment<K>,
    ) -> anyhow::Result<HashMap<K, anyhow::Result<V>>> {
        (self.f)(keys.to_vec(), env.clone()).await
    }
}
