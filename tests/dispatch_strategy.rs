mod common;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use common::{calls, sorted_calls, RecordingBatchFn};
use parking_lot::Mutex;
use tickload_rs::{
    from_fn, BatchFunction, BatchLoaderEnvironment, BatchResult, BatchState, BatchedStrategy,
    DataLoaderInstrumentation, DispatchConfig, DispatchStrategy, ImmediateStrategy, KeyContext,
    LoadError, OnFailedDispatch, Scheduler,
};

fn ignore_failures() -> OnFailedDispatch<u32> {
    Arc::new(|_keys: &[u32], _error: &LoadError| {})
}

#[tokio::test]
async fn immediate_strategy_dispatches_each_key_alone() {
    let scheduler = Scheduler::new();
    let batch_fn = RecordingBatchFn::new(|key: &u32| Some(key * 10));
    let load_calls = batch_fn.calls();
    let batch_fn: Arc<dyn BatchFunction<u32, u32>> = Arc::new(batch_fn);
    let strategy = ImmediateStrategy::new(DispatchConfig::new(batch_fn), &scheduler);

    let (first, first_pending) = BatchResult::channel();
    let (second, second_pending) = BatchResult::channel();
    strategy.schedule_result(1, None, first, ignore_failures());
    strategy.schedule_result(2, None, second, ignore_failures());

    assert_eq!(first_pending.wait().await.unwrap(), Some(10));
    assert_eq!(second_pending.wait().await.unwrap(), Some(20));
    assert_eq!(sorted_calls(&load_calls), vec![vec![1], vec![2]]);
}

#[tokio::test]
async fn immediate_strategy_reports_failures() {
    let scheduler = Scheduler::new();
    let batch_fn: Arc<dyn BatchFunction<u32, u32>> =
        Arc::new(RecordingBatchFn::new(|key: &u32| Some(*key)).failing_when(|_| true));
    let strategy = ImmediateStrategy::new(DispatchConfig::new(batch_fn), &scheduler);

    let failed = Arc::new(Mutex::new(Vec::new()));
    let recorded = failed.clone();
    let on_failed: OnFailedDispatch<u32> = Arc::new(move |keys: &[u32], error: &LoadError| {
        recorded.lock().push((keys.to_vec(), error.to_string()));
    });
    let (result, pending) = BatchResult::channel();
    strategy.schedule_result(3, None, result, on_failed);

    let error = pending.wait().await.unwrap_err();
    assert_eq!(error.to_string(), "backend unavailable: 1 keys rejected");
    assert_eq!(*failed.lock(), vec![(vec![3], error.to_string())]);
}

#[tokio::test]
async fn missing_keys_resolve_to_none() {
    let scheduler = Scheduler::new();
    let batch_fn: Arc<dyn BatchFunction<u32, u32>> =
        Arc::new(from_fn(|_keys: Vec<u32>, _env| async {
            Ok::<_, anyhow::Error>(HashMap::<u32, u32>::new())
        }));
    let strategy = ImmediateStrategy::new(DispatchConfig::new(batch_fn), &scheduler);

    let (result, pending) = BatchResult::channel();
    strategy.schedule_result(1, None, result, ignore_failures());

    assert_eq!(pending.wait().await.unwrap(), None);
}

#[tokio::test]
async fn environment_exposes_key_contexts_and_limits() {
    let scheduler = Scheduler::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let batch_fn: Arc<dyn BatchFunction<u32, String>> =
        Arc::new(from_fn(move |keys: Vec<u32>, env: BatchLoaderEnvironment<u32>| {
            let loader = env.loader().name.to_string();
            recorded.lock().push((env.total_key_count(), env.max_batch_size(), loader));
            async move {
                let values: HashMap<u32, String> = keys
                    .iter()
                    .filter_map(|key| {
                        env.key_context_as::<String>(key).map(|context| (*key, context.clone()))
                    })
                    .collect();
                Ok::<_, anyhow::Error>(values)
            }
        }));
    let config = DispatchConfig::new(batch_fn)
        .loader(tickload_rs::LoaderInfo::new("contexts", "test"))
        .max_batch_size(3);
    let strategy = BatchedStrategy::new(config, &scheduler);

    let pending = scheduler
        .run({
            let strategy = Arc::new(strategy);
            async move {
                let (with_context, with_context_pending) = BatchResult::channel();
                let (without_context, without_context_pending) = BatchResult::channel();
                let context: KeyContext = Arc::new("ctx-1".to_owned());
                strategy.schedule_result(1, Some(context), with_context, ignore_failures());
                strategy.schedule_result(2, None, without_context, ignore_failures());
                assert_eq!(strategy.queued(), 2);
                (with_context_pending.wait().await, without_context_pending.wait().await)
            }
        })
        .await
        .unwrap();

    assert_eq!(pending.0.unwrap(), Some("ctx-1".to_owned()));
    assert_eq!(pending.1.unwrap(), None);
    assert_eq!(*seen.lock(), vec![(2, 3, "contexts".to_owned())]);
}

#[tokio::test]
async fn batched_strategy_isolates_failing_chunks() {
    let scheduler = Scheduler::new();
    let batch_fn =
        RecordingBatchFn::new(|key: &u32| Some(*key)).failing_when(|keys| keys.contains(&1));
    let load_calls = batch_fn.calls();
    let batch_fn: Arc<dyn BatchFunction<u32, u32>> = Arc::new(batch_fn);
    let config = DispatchConfig::new(batch_fn).max_batch_size(1);
    let strategy = Arc::new(BatchedStrategy::new(config, &scheduler));

    let outcomes = scheduler
        .run(async move {
            let (first, first_pending) = BatchResult::channel();
            let (second, second_pending) = BatchResult::channel();
            strategy.schedule_result(1, None, first, ignore_failures());
            strategy.schedule_result(2, None, second, ignore_failures());
            (first_pending.wait().await, second_pending.wait().await)
        })
        .await
        .unwrap();

    assert!(outcomes.0.is_err());
    assert_eq!(outcomes.1.unwrap(), Some(2));
    assert_eq!(calls(&load_calls), vec![vec![1], vec![2]]);
}

type SharedStrategy = Arc<OnceLock<Arc<BatchedStrategy<u32, u32>>>>;

/// Reads the strategy's queue length from inside its own hooks.
struct QueueObserver {
    strategy: SharedStrategy,
    seen: Arc<Mutex<Vec<(&'static str, usize)>>>,
}

impl QueueObserver {
    fn record(&self, hook: &'static str) {
        if let Some(strategy) = self.strategy.get() {
            self.seen.lock().push((hook, strategy.queued()));
        }
    }
}

impl DataLoaderInstrumentation<u32, u32> for QueueObserver {
    fn on_create_batch_state(&self, _state: &BatchState) {
        self.record("create");
    }

    fn on_add_batch_entry(
        &self,
        _key: &u32,
        _key_context: Option<&KeyContext>,
        _state: &BatchState,
    ) {
        self.record("add");
    }
}

#[tokio::test]
async fn hooks_may_reenter_the_strategy() {
    let scheduler = Scheduler::new();
    let cell: SharedStrategy = Arc::new(OnceLock::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let batch_fn: Arc<dyn BatchFunction<u32, u32>> =
        Arc::new(RecordingBatchFn::new(|key: &u32| Some(*key)));
    let observer = QueueObserver { strategy: cell.clone(), seen: seen.clone() };
    let config = DispatchConfig::new(batch_fn).instrumentation(Arc::new(observer));
    let strategy = Arc::new(BatchedStrategy::new(config, &scheduler));
    let _ = cell.set(strategy.clone());

    let outcomes = scheduler
        .run(async move {
            let (first, first_pending) = BatchResult::channel();
            let (second, second_pending) = BatchResult::channel();
            strategy.schedule_result(1, None, first, ignore_failures());
            strategy.schedule_result(2, None, second, ignore_failures());
            (first_pending.wait().await, second_pending.wait().await)
        })
        .await
        .unwrap();

    assert_eq!(outcomes.0.unwrap(), Some(1));
    assert_eq!(outcomes.1.unwrap(), Some(2));
    assert_eq!(*seen.lock(), vec![("create", 1), ("add", 1), ("add", 2)]);
}
