//! Integration tests for the serializing task queue and async re-entry

use otter_handles::{HandleConfig, HandleRuntime, TaskQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

fn queue() -> TaskQueue {
    TaskQueue::new("queue-test", 256, Duration::from_secs(5)).unwrap()
}

#[test]
fn test_fifo_across_pushing_threads() {
    let q = queue();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Each push comes from a different thread, one after another.
    for i in 1..=40 {
        let q = q.clone();
        let log = log.clone();
        std::thread::spawn(move || q.push(move || log.lock().push(i)))
            .join()
            .unwrap();
    }

    assert!(q.flush());
    assert_eq!(*log.lock(), (1..=40).collect::<Vec<_>>());
    q.dispose();
}

#[test]
fn test_concurrent_producers_keep_their_order() {
    let q = queue();
    let log = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let q = q.clone();
            let log = log.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let log = log.clone();
                    q.push(move || log.lock().push((p, i)));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(q.flush());
    let log = log.lock();
    assert_eq!(log.len(), 800);
    for p in 0..4 {
        let seq: Vec<_> = log.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
        assert_eq!(seq, (0..200).collect::<Vec<_>>());
    }
    q.dispose();
}

#[test]
fn test_all_tasks_run_on_one_thread() {
    let q = queue();
    let threads = Arc::new(Mutex::new(Vec::<ThreadId>::new()));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let q = q.clone();
            let threads = threads.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let threads = threads.clone();
                    q.push(move || threads.lock().push(std::thread::current().id()));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(q.flush());
    let threads = threads.lock();
    assert_eq!(threads.len(), 100);
    assert!(threads.iter().all(|id| *id == threads[0]));
    assert_ne!(threads[0], std::thread::current().id());
    q.dispose();
}

#[test]
fn test_push_after_dispose_is_noop() {
    let q = queue();
    q.dispose();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    q.push(move || flag.store(true, Ordering::SeqCst));
    std::thread::sleep(Duration::from_millis(20));

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(q.stats().snapshot().pushed, 0);
    q.dispose();
}

#[test]
fn test_failing_task_does_not_stop_stream() {
    let q = queue();
    let ran = Arc::new(AtomicUsize::new(0));

    for i in 0..10 {
        let ran = ran.clone();
        q.push(move || {
            if i % 3 == 0 {
                panic!("task {i} failed");
            }
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(q.flush());
    assert_eq!(ran.load(Ordering::SeqCst), 6);
    assert_eq!(q.stats().snapshot().panicked, 4);
    q.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_completions_reenter_through_queue() {
    let rt = HandleRuntime::new(HandleConfig::default()).unwrap();
    let table = rt.new_root_table().unwrap();
    let engine_entered = Arc::new(AtomicUsize::new(0));
    let engine_busy = Arc::new(AtomicBool::new(false));

    let mut joins = Vec::new();
    for i in 0..32u64 {
        let queue = rt.queue().clone();
        let guard = rt.drain().track();
        let table = table.clone();
        let entered = engine_entered.clone();
        let busy = engine_busy.clone();

        joins.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(i % 5)).await;
            // The completion never touches the engine from this thread.
            queue.push(move || {
                let _guard = guard;
                assert!(!busy.swap(true, Ordering::SeqCst), "engine entered concurrently");
                let res = table.new_resource(i).unwrap();
                assert_eq!(*table.get::<u64>(res.id()).unwrap(), i);
                res.dispose();
                entered.fetch_add(1, Ordering::SeqCst);
                busy.store(false, Ordering::SeqCst);
            });
        }));
    }
    for join in joins {
        join.await.unwrap();
    }

    let drain = rt.drain().clone();
    tokio::task::spawn_blocking(move || drain.wait_for_drain())
        .await
        .unwrap();

    assert_eq!(engine_entered.load(Ordering::SeqCst), 32);
    assert!(table.is_empty());

    let shutdown = rt.clone();
    tokio::task::spawn_blocking(move || shutdown.shutdown())
        .await
        .unwrap();
    assert!(table.is_disposed());
    assert!(rt.queue().is_disposed());
}
