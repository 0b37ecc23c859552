mod batch_function;
mod batch_queue;
mod cache;
mod dispatch_strategy;
mod error;
mod flags;
mod instrumentation;
mod loader;
mod pending;
mod scheduler;
mod stats;
mod tick;
mod tracked_task;

pub use batch_function::{
    from_fn, from_try_fn, BatchFunction, BatchLoaderEnvironment, FnBatchFunction,
    FnTryBatchFunction, KeyContext,
};
pub use batch_queue::{BatchQueue, Enqueued, FlushHandle};
pub use cache::{CacheKeyFn, CacheKeyMatchFn};
pub use dispatch_strategy::{
    BatchedStrategy, DispatchConfig, DispatchStrategy, ImmediateStrategy, OnFailedDispatch,
};
pub use error::{LoadError, LoadResult, SchedulerError, TickError};
pub use flags::{DisabledFlags, Flag, FlagManager, StaticFlags};
pub use instrumentation::{
    BatchState, ChainedInstrumentation, DataLoaderInstrumentation, NoopInstrumentation,
    OnCompleteLoad,
};
pub use loader::{DataLoader, DataLoaderBuilder, DataLoaderOptions, DispatchMode};
pub use pending::{BatchResult, PendingResult};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerFlag, TickErrorHandler};
pub use stats::{LoaderInfo, LoaderStats, NoopStatsCollector, StatsCollector, StatsSnapshot};
pub use tick::{TickDescriptor, TickMetadata};
