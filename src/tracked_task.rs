use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::{waker_ref, ArcWake, AtomicWaker};

use crate::scheduler::SchedulerInner;

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const DONE: u8 = 2;

/// Per-task bookkeeping shared between a [`TrackedFuture`] and the wakers it hands out.
///
/// A task holds one unit of the scheduler's activity count for as long as it is SCHEDULED,
/// i.e. from the moment it is woken until the poll that consumes the wake returns. Every
/// IDLE -> SCHEDULED transition acquires a unit; the unit is released either after the poll that
/// observed SCHEDULED, or when the task finishes while still SCHEDULED.
struct TaskTracker {
    state: AtomicU8,
    waker: AtomicWaker,
    scheduler: Arc<SchedulerInner>,
}

impl TaskTracker {
    fn mark_scheduled(&self) {
        loop {
            if self.state.load(Ordering::Acquire) != IDLE {
                return;
            }
            // Acquire before publishing SCHEDULED so a racing poll can never release a unit
            // that was not yet counted.
            self.scheduler.acquire();
            let published =
                self.state.compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire);
            match published {
                Ok(_) => return,
                Err(_) => SchedulerInner::release(&self.scheduler),
            }
        }
    }

    /// Consumes a pending wake, returning whether this poll owns an activity unit.
    fn begin_poll(&self) -> bool {
        self.state.compare_exchange(SCHEDULED, IDLE, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn finish(&self) {
        if self.state.swap(DONE, Ordering::AcqRel) == SCHEDULED {
            SchedulerInner::release(&self.scheduler);
        }
    }
}

impl ArcWake for TaskTracker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.mark_scheduled();
        arc_self.waker.wake();
    }
}

/// Releases the activity unit owned by a poll, even if the inner future panics.
struct PollGuard<'a> {
    scheduler: &'a Arc<SchedulerInner>,
    counted: bool,
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        if self.counted {
            SchedulerInner::release(self.scheduler);
        }
    }
}

/// Wraps ordinary work so the scheduler can tell when all of it has yielded.
///
/// The inner future only ever sees the tracker's waker, so every wake-up passes through
/// [`TaskTracker::mark_scheduled`] before reaching the runtime.
pub(crate) struct TrackedFuture<F> {
    tracker: Arc<TaskTracker>,
    future: Pin<Box<F>>,
}

impl<F> TrackedFuture<F> {
    /// Creates a tracked future that starts SCHEDULED.
    ///
    /// The caller must already have acquired one activity unit on `scheduler` for it.
    pub(crate) fn new(scheduler: Arc<SchedulerInner>, future: F) -> Self {
        Self {
            tracker: Arc::new(TaskTracker {
                state: AtomicU8::new(SCHEDULED),
                waker: AtomicWaker::new(),
                scheduler,
            }),
            future: Box::pin(future),
        }
    }
}

impl<F: Future> Future for TrackedFuture<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = &mut *self;
        let counted = this.tracker.begin_poll();
        let _guard = PollGuard { scheduler: &this.tracker.scheduler, counted };
        this.tracker.waker.register(cx.waker());

        let waker = waker_ref(&this.tracker);
        let mut tracked_cx = Context::from_waker(&waker);
        let poll = this.future.as_mut().poll(&mut tracked_cx);
        if poll.is_ready() {
            this.tracker.finish();
        }
        poll
    }
}

impl<F> Drop for TrackedFuture<F> {
    fn drop(&mut self) {
        self.tracker.finish();
        self.tracker.waker.take();
    }
}
