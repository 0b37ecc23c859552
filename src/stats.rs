use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::tick::TickDescriptor;

/// Identity of a loader, used to tag stats and batch environments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoaderInfo {
    /// Human readable name used to identify the loader when it is reported.
    pub name: Arc<str>,
    /// Kind of the loader, by default the type name of its batch function.
    pub kind: &'static str,
}

impl LoaderInfo {
    pub fn new(name: impl Into<Arc<str>>, kind: &'static str) -> Self {
        Self { name: name.into(), kind }
    }
}

impl fmt::Display for LoaderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// Observability sink for physical batch calls. All hooks default to no-ops.
pub trait StatsCollector: Send + Sync {
    /// Number of load requests resolved by one physical call, duplicates included.
    fn log_total_key_count(&self, _loader: &LoaderInfo, _tick: &TickDescriptor, _count: usize) {}

    /// Number of distinct keys actually sent to the batch function.
    fn log_actual_loads(&self, _loader: &LoaderInfo, _tick: &TickDescriptor, _count: usize) {}

    /// Time between the first enqueue of a round and the start of its drain.
    fn log_schedule_latency(
        &self,
        _loader: &LoaderInfo,
        _tick: &TickDescriptor,
        _latency: Duration,
    ) {
    }

    /// Time between the first enqueue of a round and the completion of its last chunk.
    fn log_total_latency(&self, _loader: &LoaderInfo, _tick: &TickDescriptor, _latency: Duration) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatsCollector;

impl StatsCollector for NoopStatsCollector {}

/// Point-in-time view of a [`LoaderStats`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StatsSnapshot {
    /// Number of physical batch calls.
    pub batches: u64,
    /// The total number of keys that were requested for loading (not necessarily unique).
    pub keys_requested: u64,
    /// The total number of distinct keys sent to the batch function.
    pub keys_loaded: u64,
    /// The min number of distinct keys sent in a single call.
    pub min_batch_size: Option<usize>,
    /// The max number of distinct keys sent in a single call.
    pub max_batch_size: usize,
    /// The average number of distinct keys sent per call.
    pub average_batch_size: f64,
    /// The longest observed round latency.
    pub max_total_latency: Duration,
}

/// A [`StatsCollector`] aggregating everything it receives, reported through `tracing` when
/// dropped.
#[derive(Debug)]
pub struct LoaderStats {
    tag: &'static str,
    stats: Mutex<StatsSnapshot>,
}

impl LoaderStats {
    pub fn new(tag: &'static str) -> Self {
        Self { tag, stats: Mutex::new(StatsSnapshot::default()) }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.lock().clone()
    }
}

impl StatsCollector for LoaderStats {
    fn log_total_key_count(&self, _loader: &LoaderInfo, _tick: &TickDescriptor, count: usize) {
        self.stats.lock().keys_requested += count as u64;
    }

    fn log_actual_loads(&self, _loader: &LoaderInfo, _tick: &TickDescriptor, count: usize) {
        let mut stats = self.stats.lock();
        let batches = stats.batches + 1;
        stats.average_batch_size =
            (stats.average_batch_size * stats.batches as f64 + count as f64) / batches as f64;
        stats.batches = batches;
        stats.keys_loaded += count as u64;
        stats.max_batch_size = stats.max_batch_size.max(count);
        stats.min_batch_size = Some(stats.min_batch_size.map_or(count, |min| min.min(count)));
    }

    fn log_total_latency(&self, _loader: &LoaderInfo, _tick: &TickDescriptor, latency: Duration) {
        let mut stats = self.stats.lock();
        stats.max_total_latency = stats.max_total_latency.max(latency);
    }
}

impl Drop for LoaderStats {
    fn drop(&mut self) {
        tracing::debug!(tag = self.tag, loader_stats = ?self.stats.get_mut());
    }
}
