use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::tick::TickDescriptor;

type OpenRound<S> = Box<dyn Fn() -> S + Send + Sync>;
type Consumer<T, S, R> = Box<dyn Fn(S, Vec<T>, TickDescriptor) -> R + Send + Sync>;

/// Thread-safe accumulator that hands everything enqueued since the previous flush to a single
/// consumer callback.
///
/// A round is opened lazily by the first `enqueue` after a flush. Opening a round runs the
/// `open_round` factory once; its output (`S`) is visible to every item enqueued into the round
/// and is handed to the consumer alongside the items. `flush` takes the round out from under the
/// lock before calling the consumer, so anything enqueued while the consumer runs lands in the
/// next round.
pub struct BatchQueue<T, S = (), R = ()> {
    round: Mutex<Option<Round<T, S>>>,
    open_round: OpenRound<S>,
    consumer: Consumer<T, S, R>,
}

struct Round<T, S> {
    state: S,
    items: Vec<T>,
    flushed_tx: oneshot::Sender<()>,
    handle: FlushHandle,
}

/// Returned by [`BatchQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct Enqueued {
    /// Resolves once the round this item belongs to has been flushed.
    pub handle: FlushHandle,
    /// Whether this enqueue opened a new round.
    pub opened_round: bool,
}

/// Future resolving once a particular round has been handed to the consumer.
///
/// Also resolves if the queue is dropped with the round still pending.
#[derive(Clone)]
pub struct FlushHandle(Shared<oneshot::Receiver<()>>);

impl fmt::Debug for FlushHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushHandle").finish_non_exhaustive()
    }
}

impl Future for FlushHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

impl<T, S> Round<T, S> {
    fn new(state: S) -> Self {
        let (flushed_tx, flushed_rx) = oneshot::channel();
        Self { state, items: Vec::new(), flushed_tx, handle: FlushHandle(flushed_rx.shared()) }
    }
}

impl<T, R> BatchQueue<T, (), R> {
    pub fn new<F>(consumer: F) -> Self
    where
        F: Fn(Vec<T>, TickDescriptor) -> R + Send + Sync + 'static,
    {
        Self::with_round_state(|| (), move |(), items, tick| consumer(items, tick))
    }

    pub fn enqueue(&self, item: T) -> Enqueued {
        self.enqueue_with(|_| item)
    }
}

impl<T, S, R> BatchQueue<T, S, R> {
    pub fn with_round_state<O, F>(open_round: O, consumer: F) -> Self
    where
        O: Fn() -> S + Send + Sync + 'static,
        F: Fn(S, Vec<T>, TickDescriptor) -> R + Send + Sync + 'static,
    {
        Self {
            round: Mutex::new(None),
            open_round: Box::new(open_round),
            consumer: Box::new(consumer),
        }
    }

    /// Enqueues the item built by `make` from the current round's state.
    ///
    /// `make` and the round factory run under the queue lock: they must not block or call back
    /// into the queue. If either panics, the queue is left as it was before the call.
    pub fn enqueue_with<F>(&self, make: F) -> Enqueued
    where
        F: FnOnce(&S) -> T,
    {
        let mut guard = self.round.lock();
        if let Some(round) = guard.as_mut() {
            let item = make(&round.state);
            round.items.push(item);
            return Enqueued { handle: round.handle.clone(), opened_round: false };
        }
        // The round is only published once its first item exists.
        let mut round = Round::new((self.open_round)());
        let item = make(&round.state);
        round.items.push(item);
        let handle = round.handle.clone();
        *guard = Some(round);
        Enqueued { handle, opened_round: true }
    }

    /// Takes the current round and hands it to the consumer.
    ///
    /// Returns `None` without calling the consumer when no round is open.
    pub fn flush(&self, tick: TickDescriptor) -> Option<R> {
        let round = self.round.lock().take()?;
        tracing::trace!(tick = tick.index, items = round.items.len(), "flushing batch queue");
        let output = (self.consumer)(round.state, round.items, tick);
        // Nobody awaiting the round is fine.
        let _ = round.flushed_tx.send(());
        Some(output)
    }

    /// Number of items waiting in the current round.
    pub fn len(&self) -> usize {
        self.round.lock().as_ref().map_or(0, |round| round.items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.round.lock().is_none()
    }
}
