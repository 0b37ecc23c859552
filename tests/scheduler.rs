use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future;
use parking_lot::Mutex;
use tickload_rs::{Scheduler, SchedulerFlag, StaticFlags, TickError};

fn explode() -> anyhow::Result<()> {
    panic!("deferred panic")
}

fn recorder<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn deferred_work_runs_after_ordinary_work() {
    let scheduler = Scheduler::new();
    let order = recorder();

    let (outer, log) = (scheduler.clone(), order.clone());
    scheduler
        .run(async move {
            let deferred = log.clone();
            outer.defer_to_next_tick(move |_| async move {
                deferred.lock().push(2);
                Ok(())
            });
            log.lock().push(1);
            let child = log.clone();
            outer.spawn(async move { child.lock().push(1) }).await.unwrap();
        })
        .await
        .unwrap();
    scheduler.drained().await;

    assert_eq!(*order.lock(), vec![1, 1, 2]);
    assert_eq!(scheduler.ticks(), 1);
}

#[tokio::test]
async fn deferred_failures_are_isolated() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counted = failures.clone();
    let scheduler = Scheduler::builder()
        .name("isolated")
        .error_handler(move |error: &TickError| {
            assert_eq!(error.tick(), 0);
            counted.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    let ran = recorder();

    let (outer, log) = (scheduler.clone(), ran.clone());
    scheduler
        .run(async move {
            outer.defer_to_next_tick(|_| async { Err(anyhow::anyhow!("deferred failure")) });
            outer.defer_to_next_tick(|_| async { explode() });
            outer.defer_to_next_tick(move |tick| async move {
                log.lock().push(tick.index);
                Ok(())
            });
        })
        .await
        .unwrap();
    scheduler.drained().await;

    assert_eq!(failures.load(Ordering::SeqCst), 2);
    assert_eq!(*ran.lock(), vec![0]);

    let log = ran.clone();
    scheduler.defer_to_next_tick(move |tick| async move {
        log.lock().push(tick.index);
        Ok(())
    });
    scheduler.drained().await;
    assert_eq!(*ran.lock(), vec![0, 1]);
}

#[tokio::test]
async fn work_deferred_during_a_tick_runs_on_a_later_tick() {
    let scheduler = Scheduler::new();
    let ticks = recorder();

    let (outer, log) = (scheduler.clone(), ticks.clone());
    scheduler.defer_to_next_tick(move |tick| async move {
        log.lock().push(tick.index);
        let nested = log.clone();
        outer.defer_to_next_tick(move |tick| async move {
            nested.lock().push(tick.index);
            Ok(())
        });
        Ok(())
    });
    scheduler.drained().await;

    assert_eq!(*ticks.lock(), vec![0, 1]);
    assert_eq!(scheduler.ticks(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn work_deferred_from_concurrent_tasks_shares_a_tick() {
    let scheduler = Scheduler::new();
    let ticks = recorder();

    let (outer, log) = (scheduler.clone(), ticks.clone());
    scheduler
        .run(async move {
            let tasks: Vec<_> = (0..16)
                .map(|_| {
                    let (scheduler, log) = (outer.clone(), log.clone());
                    outer.spawn(async move {
                        scheduler.defer_to_next_tick(move |tick| async move {
                            log.lock().push(tick.index);
                            Ok(())
                        });
                    })
                })
                .collect();
            future::join_all(tasks).await;
        })
        .await
        .unwrap();
    scheduler.drained().await;

    assert_eq!(*ticks.lock(), vec![0; 16]);
}

#[tokio::test]
async fn flush_handle_resolves_once_the_tick_starts() {
    let scheduler = Scheduler::new();
    let handle = scheduler.defer_to_next_tick(|tick| async move {
        assert_eq!(tick.index, 0);
        let metadata = tick.metadata.expect("scheduler ticks carry metadata");
        assert_eq!(&*metadata.scheduler, "next-tick");
        Ok(())
    });
    handle.await;
    scheduler.drained().await;
    assert_eq!(scheduler.ticks(), 1);
}

#[tokio::test]
async fn offloaded_flush_keeps_ordering() {
    let flags = StaticFlags::new().enable(&SchedulerFlag::KillswitchInlineFlush);
    let scheduler = Scheduler::builder().flag_manager(Arc::new(flags)).build().unwrap();
    let order = recorder();

    let (outer, log) = (scheduler.clone(), order.clone());
    scheduler
        .run(async move {
            let deferred = log.clone();
            outer.defer_to_next_tick(move |_| async move {
                deferred.lock().push("deferred");
                Ok(())
            });
            let child = log.clone();
            outer.spawn(async move { child.lock().push("ordinary") }).await.unwrap();
            log.lock().push("ordinary");
        })
        .await
        .unwrap();
    scheduler.drained().await;

    assert_eq!(*order.lock(), vec!["ordinary", "ordinary", "deferred"]);
    assert_eq!(scheduler.ticks(), 1);
}

#[tokio::test]
async fn panicking_ordinary_work_does_not_stall_ticks() {
    let scheduler = Scheduler::new();
    let outcome = scheduler.spawn(async { panic!("ordinary panic") }).await;
    assert!(outcome.unwrap_err().is_panic());

    let ran = recorder();
    let log = ran.clone();
    scheduler.defer_to_next_tick(move |_| async move {
        log.lock().push(());
        Ok(())
    });
    scheduler.drained().await;
    assert_eq!(ran.lock().len(), 1);
}

#[tokio::test]
async fn drained_returns_immediately_without_deferred_work() {
    let scheduler = Scheduler::new();
    scheduler.drained().await;
    assert_eq!(scheduler.ticks(), 0);
}

#[test]
fn builder_without_runtime_fails() {
    assert!(Scheduler::builder().build().is_err());
}
