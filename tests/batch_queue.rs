use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tickload_rs::{BatchQueue, TickDescriptor};

#[test]
fn first_enqueue_opens_the_round() {
    let queue = BatchQueue::new(|items: Vec<u32>, _tick| items);

    assert!(queue.enqueue(1).opened_round);
    assert!(!queue.enqueue(2).opened_round);
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.flush(TickDescriptor::immediate()), Some(vec![1, 2]));
    assert!(queue.is_empty());
    assert_eq!(queue.flush(TickDescriptor::immediate()), None);
    assert!(queue.enqueue(3).opened_round);
}

#[test]
fn flush_hands_the_tick_to_the_consumer() {
    let queue = BatchQueue::new(|items: Vec<&str>, tick: TickDescriptor| (tick.index, items));
    queue.enqueue("a");

    let tick = TickDescriptor { index: 7, metadata: None };
    assert_eq!(queue.flush(tick), Some((7, vec!["a"])));
}

#[test]
fn round_state_is_created_once_per_round() {
    let opened = Arc::new(AtomicUsize::new(0));
    let counter = opened.clone();
    let queue = BatchQueue::with_round_state(
        move || counter.fetch_add(1, Ordering::SeqCst),
        |round: usize, items: Vec<(usize, u32)>, _tick| (round, items),
    );

    queue.enqueue_with(|round| (*round, 1));
    queue.enqueue_with(|round| (*round, 2));
    assert_eq!(queue.flush(TickDescriptor::immediate()), Some((0, vec![(0, 1), (0, 2)])));

    queue.enqueue_with(|round| (*round, 3));
    assert_eq!(queue.flush(TickDescriptor::immediate()), Some((1, vec![(1, 3)])));
    assert_eq!(opened.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_enqueues_are_flushed_exactly_once() {
    let flushed = Arc::new(Mutex::new(Vec::new()));
    let sink = flushed.clone();
    let queue = Arc::new(BatchQueue::new(move |items: Vec<u32>, _tick| sink.lock().extend(items)));

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    queue.enqueue(producer * 500 + i);
                }
            })
        })
        .collect();
    let mut rounds = 0;
    while producers.iter().any(|producer| !producer.is_finished()) {
        if queue.flush(TickDescriptor { index: rounds, metadata: None }).is_some() {
            rounds += 1;
        }
    }
    for producer in producers {
        producer.join().unwrap();
    }
    queue.flush(TickDescriptor { index: rounds, metadata: None });

    let mut flushed = flushed.lock().clone();
    flushed.sort();
    assert_eq!(flushed, (0..2000).collect::<Vec<_>>());
}

#[tokio::test]
async fn flush_handle_resolves_after_flush() {
    let queue = BatchQueue::new(|_items: Vec<u32>, _tick| ());
    let first = queue.enqueue(1);
    let second = queue.enqueue(2);

    queue.flush(TickDescriptor::immediate());
    first.handle.await;
    second.handle.await;

    let next = queue.enqueue(3);
    drop(queue);
    next.handle.await;
}

#[test]
fn panicking_enqueue_leaves_no_round_behind() {
    let queue = BatchQueue::new(|items: Vec<u32>, _tick| items);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        queue.enqueue_with(|_: &()| -> u32 { panic!("item construction failed") })
    }));
    assert!(outcome.is_err());
    assert!(queue.is_empty());

    assert!(queue.enqueue(1).opened_round);
    assert_eq!(queue.flush(TickDescriptor::immediate()), Some(vec![1]));
}
