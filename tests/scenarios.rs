//! End-to-end scenarios driving the whole runtime through its public API.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use strand::fiber::{self, channel, publisher, JoinError, JoinHandle, WaitGroup};
use strand::runtime::run;
use strand::Error;

/// Sleeping N fibers for t seconds completes in about t seconds, not N·t.
#[test]
fn five_thousand_sleepers_run_concurrently() {
    let start = Instant::now();
    run(async {
        for _ in 0..5000 {
            fiber::spawn(fiber::sleep(Duration::from_millis(10)));
        }
    })
    .unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "5000 concurrent 10ms sleeps took {:?}",
        start.elapsed()
    );
}

/// Producer fills a buffer-2 channel and closes; the consumer observes every
/// value in FIFO order, then the closed sentinel.
#[test]
fn producer_consumer_over_a_small_buffer() {
    run(async {
        let (tx, rx) = channel::channel::<String>(2);
        fiber::spawn(async move {
            for i in 0..5 {
                tx.send(format!("Task {i}")).await.unwrap();
            }
        });
        let mut seen = Vec::new();
        while let Some(task) = rx.recv().await {
            seen.push(task);
        }
        let expected: Vec<String> = (0..5).map(|i| format!("Task {i}")).collect();
        assert_eq!(seen, expected);
    })
    .unwrap();
}

/// A panic escaping a fiber nobody awaits is re-raised by `run` to its
/// caller after the context drains.
#[test]
fn unawaited_panic_is_reraised_by_run() {
    let result = catch_unwind(AssertUnwindSafe(|| {
        run(async {
            fiber::spawn(async {
                fiber::sleep(Duration::from_millis(100)).await;
                panic!("worker exploded");
            });
            "root finished first"
        })
    }));
    let payload = result.unwrap_err();
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap();
    assert_eq!(message, "worker exploded");
}

/// Three workers check in through a wait group; `wait` returns once all of
/// them are done, after roughly one sleep, not three.
#[test]
fn wait_group_joins_three_workers() {
    run(async {
        let wg = WaitGroup::new();
        for _ in 0..3 {
            wg.add(1);
            let wg = wg.clone();
            fiber::spawn(async move {
                fiber::sleep(Duration::from_millis(100)).await;
                wg.done();
            });
        }
        let start = Instant::now();
        wg.wait().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "workers ran serially: {elapsed:?}");
    })
    .unwrap();
}

/// Two fibers awaiting each other form a cycle: both fail with a deadlock
/// error, an outside awaiter observes the same error, and `run` reports the
/// deadlock that nobody handled.
#[test]
fn circular_await_fails_with_deadlock() {
    let result = run(async {
        let (tx1, rx1) = channel::channel::<JoinHandle<()>>(1);
        let (tx2, rx2) = channel::channel::<JoinHandle<()>>(1);
        let f1 = fiber::spawn(async move {
            let other = rx1.recv().await.unwrap();
            // parks forever: `other` can never complete
            let _ = other.join().await;
        });
        let f2 = fiber::spawn(async move {
            let other = rx2.recv().await.unwrap();
            let _ = other.join().await;
        });
        fiber::yield_now().await;
        tx1.send(f2.clone()).await.unwrap();
        tx2.send(f1.clone()).await.unwrap();

        let outside = f1.join().await;
        assert!(matches!(outside, Err(JoinError::Deadlock)));
        assert!(matches!(f2.join().await, Err(JoinError::Deadlock)));
    });
    // f2's failure had no live awaiter left, so the context re-raises it
    assert_eq!(result.unwrap_err(), Error::Deadlock);
}

/// Publisher fan-out: every subscriber sees the full stream in order, and a
/// subscriber that leaves early does not hold the others back.
#[test]
fn publisher_broadcasts_to_three_subscribers() {
    run(async {
        let publisher = publisher::publisher::<String>();
        let subs: Vec<_> = (0..3).map(|_| publisher.subscribe()).collect();
        fiber::spawn(async move {
            for i in 0..5 {
                publisher.publish(format!("#{i}")).await.unwrap();
            }
        });

        let mut handles = Vec::new();
        for (n, sub) in subs.into_iter().enumerate() {
            handles.push(fiber::spawn(async move {
                let mut seen = Vec::new();
                while let Some(v) = sub.recv().await {
                    seen.push(v);
                    if n == 0 && seen.len() == 2 {
                        // this subscriber gives up early
                        break;
                    }
                }
                seen
            }));
        }

        let early = handles[0].join().await.unwrap();
        assert_eq!(early, vec!["#0".to_string(), "#1".to_string()]);
        let expected: Vec<String> = (0..5).map(|i| format!("#{i}")).collect();
        for handle in &handles[1..] {
            assert_eq!(handle.join().await.unwrap(), expected);
        }
    })
    .unwrap();
}

/// A fiber keeps its context alive even when the root returns first, and
/// deferred cleanup runs before the result becomes observable.
#[test]
fn structured_concurrency_with_deferred_cleanup() {
    let cleaned = Rc::new(std::cell::Cell::new(false));
    let seen = cleaned.clone();
    run(async move {
        let handle = fiber::spawn(async move {
            fiber::defer(move || seen.set(true));
            fiber::sleep(Duration::from_millis(20)).await;
            "worker"
        });
        let value = handle.join().await.unwrap();
        assert_eq!(value, "worker");
    })
    .unwrap();
    assert!(cleaned.get());
}
