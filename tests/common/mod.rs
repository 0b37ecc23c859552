#![allow(dead_code)]

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tickload_rs::{BatchFunction, BatchLoaderEnvironment};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DummyData(pub String);

#[derive(Debug, Error)]
#[error("backend unavailable: {0}")]
pub struct BackendError(pub String);

/// Keys of every physical call, in call order.
pub type LoadCalls<K> = Arc<Mutex<Vec<Vec<K>>>>;

type Lookup<K, V> = Box<dyn Fn(&K) -> Option<V> + Send + Sync>;
type FailWhen<K> = Box<dyn Fn(&[K]) -> bool + Send + Sync>;

/// Batch function that records the keys of each call and resolves them through `lookup`.
pub struct RecordingBatchFn<K, V> {
    lookup: Lookup<K, V>,
    fail_when: Option<FailWhen<K>>,
    calls: LoadCalls<K>,
}

impl<K, V> RecordingBatchFn<K, V> {
    pub fn new<F>(lookup: F) -> Self
    where
        F: Fn(&K) -> Option<V> + Send + Sync + 'static,
    {
        Self { lookup: Box::new(lookup), fail_when: None, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn from_map(map: HashMap<K, V>) -> Self
    where
        K: Eq + Hash + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        Self::new(move |key| map.get(key).cloned())
    }

    /// Fails every call whose keys satisfy `fail_when` with a [`BackendError`].
    pub fn failing_when<F>(mut self, fail_when: F) -> Self
    where
        F: Fn(&[K]) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Box::new(fail_when));
        self
    }

    pub fn calls(&self) -> LoadCalls<K> {
        self.calls.clone()
    }
}

#[async_trait]
impl<K, V> BatchFunction<K, V> for RecordingBatchFn<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn load(
        &self,
        keys: &[K],
        _env: &BatchLoaderEnvironment<K>,
    ) -> anyhow::Result<HashMap<K, V>> {
        self.calls.lock().push(keys.to_vec());
        if self.fail_when.as_ref().map_or(false, |fail_when| fail_when(keys)) {
            return Err(BackendError(format!("{} keys rejected", keys.len())).into());
        }
        Ok(keys
            .iter()
            .filter_map(|key| (self.lookup)(key).map(|value| (key.clone(), value)))
            .collect())
    }
}

pub fn calls<K: Clone>(calls: &LoadCalls<K>) -> Vec<Vec<K>> {
    calls.lock().clone()
}

/// Every call with its keys sorted, calls sorted.
pub fn sorted_calls<K: Clone + Ord>(calls: &LoadCalls<K>) -> Vec<Vec<K>> {
    let mut calls = self::calls(calls);
    for call in &mut calls {
        call.sort();
    }
    calls.sort();
    calls
}

pub fn fish() -> HashMap<i64, DummyData> {
    let mut map = HashMap::new();
    map.insert(42, DummyData("one fish".to_owned()));
    map.insert(12, DummyData("two fish".to_owned()));
    map.insert(5, DummyData("red fish".to_owned()));
    map.insert(8, DummyData("blue fish".to_owned()));
    map
}
