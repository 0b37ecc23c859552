use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing_futures::Instrument;

use crate::{
    batch_queue::{BatchQueue, FlushHandle},
    error::{panic_message, SchedulerError, TickError},
    flags::{DisabledFlags, Flag, FlagManager},
    tick::{TickDescriptor, TickMetadata},
    tracked_task::TrackedFuture,
};

/// Handler invoked with failures of deferred work.
pub type TickErrorHandler = Arc<dyn Fn(&TickError) + Send + Sync>;

type DeferredFn = Box<dyn FnOnce(TickDescriptor) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Flags consulted by the scheduler when it is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerFlag {
    /// Hands tick flushes off to the flush runtime instead of flushing inline on the worker that
    /// observed quiescence.
    KillswitchInlineFlush,
}

impl Flag for SchedulerFlag {
    fn flag_name(&self) -> &str {
        match self {
            SchedulerFlag::KillswitchInlineFlush => "dataloader.scheduler.killswitch.inline_flush",
        }
    }
}

/// Two-phase execution context for one logical execution (e.g. one request).
///
/// Ordinary work is spawned with [`Scheduler::spawn`] and runs on the wrapped tokio runtime. Work
/// registered with [`Scheduler::defer_to_next_tick`] runs only once every piece of ordinary work
/// has yielded back to the runtime: the scheduler counts ordinary tasks that are scheduled or
/// currently being polled, and when that count drops to zero it flushes the deferred queue as one
/// tick. Deferred work is itself ordinary work once it starts, so anything it spawns or defers is
/// tracked the same way and flushes on a later tick.
///
/// Tasks spawned directly with `tokio::spawn` are invisible to the scheduler. Concurrent
/// sub-tasks that should contribute to the same tick must be spawned through the scheduler.
///
/// `Scheduler` is a cheap handle; clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    name: Arc<str>,
    handle: Handle,
    flush_mode: FlushMode,
    /// Ordinary tasks currently scheduled or being polled.
    active: AtomicUsize,
    /// Deferred work registered and not yet finished.
    outstanding: AtomicUsize,
    ticks: AtomicU64,
    debug: TickDebug,
    queue: BatchQueue<Deferred>,
    drained: Notify,
    error_handler: TickErrorHandler,
}

enum FlushMode {
    Inline,
    Offload(Handle),
}

struct Deferred {
    work: DeferredFn,
    _guard: OutstandingGuard,
}

/// Keeps a deferred work item counted from registration until it finishes or is dropped.
struct OutstandingGuard(Weak<SchedulerInner>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            if inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.drained.notify_waiters();
            }
        }
    }
}

struct TickDebug {
    dispatched: AtomicU64,
    last_tick: Mutex<Instant>,
}

impl TickDebug {
    fn take(&self, scheduler: &Arc<str>) -> TickMetadata {
        let now = Instant::now();
        let tick_delay = now.duration_since(std::mem::replace(&mut *self.last_tick.lock(), now));
        TickMetadata {
            scheduler: scheduler.clone(),
            dispatched_tasks: self.dispatched.swap(0, Ordering::Relaxed),
            tick_delay,
        }
    }
}

pub struct SchedulerBuilder {
    name: Option<String>,
    handle: Option<Handle>,
    flush_handle: Option<Handle>,
    flag_manager: Arc<dyn FlagManager>,
    error_handler: Option<TickErrorHandler>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            name: None,
            handle: None,
            flush_handle: None,
            flag_manager: Arc::new(DisabledFlags),
            error_handler: None,
        }
    }
}

impl SchedulerBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Runtime on which ordinary and deferred work run. Defaults to the current runtime.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Runtime receiving offloaded tick flushes when
    /// [`SchedulerFlag::KillswitchInlineFlush`] is enabled. Defaults to the work runtime.
    pub fn flush_handle(mut self, handle: Handle) -> Self {
        self.flush_handle = Some(handle);
        self
    }

    pub fn flag_manager(mut self, flag_manager: Arc<dyn FlagManager>) -> Self {
        self.flag_manager = flag_manager;
        self
    }

    /// Handler for errors and panics raised by deferred work. Defaults to logging them.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TickError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current()?,
        };
        let flush_mode = if self.flag_manager.is_enabled(&SchedulerFlag::KillswitchInlineFlush) {
            FlushMode::Offload(self.flush_handle.unwrap_or_else(|| handle.clone()))
        } else {
            FlushMode::Inline
        };
        let name: Arc<str> = self.name.unwrap_or_else(|| "next-tick".to_owned()).into();
        let error_handler = self.error_handler.unwrap_or_else(|| {
            Arc::new(|error: &TickError| tracing::error!(%error, "deferred work failed"))
        });

        let inner = Arc::new_cyclic(|weak: &Weak<SchedulerInner>| {
            let weak = weak.clone();
            SchedulerInner {
                name,
                handle,
                flush_mode,
                active: AtomicUsize::new(0),
                outstanding: AtomicUsize::new(0),
                ticks: AtomicU64::new(0),
                debug: TickDebug {
                    dispatched: AtomicU64::new(0),
                    last_tick: Mutex::new(Instant::now()),
                },
                queue: BatchQueue::new(move |batch: Vec<Deferred>, tick| {
                    if let Some(inner) = weak.upgrade() {
                        inner.launch_tick(batch, tick);
                    }
                }),
                drained: Notify::new(),
                error_handler,
            }
        });
        Ok(Scheduler { inner })
    }
}

impl Scheduler {
    /// Creates a scheduler on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime. Use [`Scheduler::builder`] to handle that
    /// case.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(handle: Handle) -> Self {
        let mut builder = Self::builder();
        builder.handle = Some(handle);
        match builder.build() {
            Ok(scheduler) => scheduler,
            Err(SchedulerError::NoRuntime(_)) => unreachable!("runtime handle was provided"),
        }
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of ticks flushed so far.
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Acquire)
    }

    /// Runs ordinary work under this scheduler.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.spawn_tracked(future)
    }

    /// Spawns `future` as ordinary work and waits for its output.
    ///
    /// A panic inside `future` is returned as the `JoinError`.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn(future).await
    }

    /// Registers `work` to run on the next tick.
    ///
    /// All work registered before a tick starts flushing runs in that tick, whichever thread
    /// registered it; work registered afterwards runs in the following tick. Errors and panics
    /// from `work` go to the scheduler's error handler.
    ///
    /// The returned handle resolves once the tick that picked up `work` has started.
    pub fn defer_to_next_tick<F, Fut>(&self, work: F) -> FlushHandle
    where
        F: FnOnce(TickDescriptor) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = &self.inner;
        inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let deferred = Deferred {
            work: Box::new(move |tick| work(tick).boxed()),
            _guard: OutstandingGuard(Arc::downgrade(inner)),
        };
        let enqueued = inner.queue.enqueue(deferred);
        // Registered from outside any tracked work: nothing else will observe quiescence.
        if inner.active.load(Ordering::Acquire) == 0 {
            inner.on_quiescent();
        }
        enqueued.handle
    }

    /// Waits until every piece of deferred work registered so far has completed, including
    /// deferred work registered while the deferred phase was running.
    pub async fn drained(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.drained.notified());
            notified.as_mut().enable();
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .field("outstanding", &self.inner.outstanding.load(Ordering::Relaxed))
            .field("ticks", &self.inner.ticks.load(Ordering::Relaxed))
            .finish()
    }
}

impl SchedulerInner {
    pub(crate) fn acquire(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.debug.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(this: &Arc<Self>) {
        if this.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            this.on_quiescent();
        }
    }

    fn spawn_tracked<F>(self: &Arc<Self>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.acquire();
        self.handle.spawn(TrackedFuture::new(self.clone(), future))
    }

    fn on_quiescent(self: &Arc<Self>) {
        if self.queue.is_empty() {
            return;
        }
        match &self.flush_mode {
            FlushMode::Inline => self.flush(),
            FlushMode::Offload(handle) => {
                let inner = self.clone();
                handle.spawn(async move { inner.flush() });
            }
        }
    }

    fn flush(self: &Arc<Self>) {
        // Ordinary work resumed since quiescence was observed; it will flush when it yields.
        if self.active.load(Ordering::Acquire) != 0 || self.queue.is_empty() {
            return;
        }
        let index = self.ticks.fetch_add(1, Ordering::AcqRel);
        let tick = TickDescriptor::new(index, self.debug.take(&self.name));
        self.queue.flush(tick);
    }

    fn launch_tick(self: &Arc<Self>, batch: Vec<Deferred>, tick: TickDescriptor) {
        tracing::debug!(
            scheduler = %self.name,
            tick = tick.index,
            deferred = batch.len(),
            "running next tick"
        );
        for Deferred { work, _guard: guard } in batch {
            let error_handler = self.error_handler.clone();
            let tick = tick.clone();
            let index = tick.index;
            let task = async move {
                let _guard = guard;
                match AssertUnwindSafe(async move { work(tick).await }).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => error_handler(&TickError::Failed { tick: index, error }),
                    Err(payload) => error_handler(&TickError::Panicked {
                        tick: index,
                        message: panic_message(&*payload),
                    }),
                }
            };
            self.spawn_tracked(task.instrument(tracing::trace_span!("next_tick", tick = index)));
        }
    }
}
