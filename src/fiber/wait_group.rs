//! Counter-based join barrier.
//!
//! A [`WaitGroup`] counts outstanding pieces of work: [`add`](WaitGroup::add)
//! before handing work to a fiber, [`done`](WaitGroup::done) when the fiber
//! finishes, [`wait`](WaitGroup::wait) to park until the counter reaches
//! zero. All waiters wake in FIFO order on the transition to zero; adding
//! after an observed zero legally reopens the group.
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use strand::fiber::{self, WaitGroup};
//!
//! strand::run(async {
//!     let wg = WaitGroup::new();
//!     for i in 0..3 {
//!         wg.add(1);
//!         let wg = wg.clone();
//!         fiber::spawn(async move {
//!             fiber::sleep(Duration::from_millis(100)).await;
//!             println!("worker {i} done");
//!             wg.done();
//!         });
//!     }
//!     wg.wait().await;
//! })
//! .unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

use crate::fiber::select::WaiterList;

////////////////////////////////////////////////////////////////////////////////
// WaitGroup
////////////////////////////////////////////////////////////////////////////////

/// Counter-based join barrier, cloneable across fibers.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Rc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: Cell<usize>,
    // bumped on every transition to zero, so a woken waiter returns even if
    // the group was reopened before it got to run
    generation: Cell<u64>,
    waiters: RefCell<WaiterList>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter by `n`.
    pub fn add(&self, n: usize) {
        self.inner.count.set(self.inner.count.get() + n);
    }

    /// Decrements the counter. On the transition to zero every parked waiter
    /// is woken, in the order it arrived.
    ///
    /// # Panics
    /// If the counter would go below zero.
    pub fn done(&self) {
        let count = self.inner.count.get();
        assert!(count > 0, "WaitGroup::done called more times than add");
        self.inner.count.set(count - 1);
        if count == 1 {
            self.inner.generation.set(self.inner.generation.get() + 1);
            self.inner.waiters.borrow_mut().wake_all();
        }
    }

    /// Current counter value.
    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    /// Parks the calling fiber until the counter reaches zero. Returns
    /// immediately if it already is zero.
    pub fn wait(&self) -> Wait<'_> {
        Wait {
            inner: &self.inner,
            state: None,
        }
    }
}

/// Future returned by [`WaitGroup::wait`].
pub struct Wait<'a> {
    inner: &'a Rc<Inner>,
    // (registration, generation observed at park time)
    state: Option<(u64, u64)>,
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some((token, generation)) = this.state.take() {
            this.inner.waiters.borrow_mut().remove(token);
            // a zero transition happened while we were parked
            if this.inner.generation.get() != generation {
                return Poll::Ready(());
            }
        }
        if this.inner.count.get() == 0 {
            return Poll::Ready(());
        }
        let token = this.inner.waiters.borrow_mut().register(cx.waker());
        this.state = Some((token, this.inner.generation.get()));
        Poll::Pending
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if let Some((token, _)) = self.state.take() {
            self.inner.waiters.borrow_mut().remove(token);
        }
    }
}

impl std::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGroup")
            .field("count", &self.inner.count.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{self, YieldResult};
    use crate::runtime::run;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_returns_once_every_worker_is_done() {
        run(async {
            let wg = WaitGroup::new();
            for _ in 0..3 {
                wg.add(1);
                let wg = wg.clone();
                fiber::spawn(async move {
                    fiber::sleep(Duration::from_millis(20)).await;
                    wg.done();
                });
            }
            let start = Instant::now();
            wg.wait().await;
            assert!(start.elapsed() >= Duration::from_millis(20));
            assert_eq!(wg.count(), 0);
        })
        .unwrap();
    }

    #[test]
    fn wait_on_zero_does_not_yield() {
        run(async {
            let wg = WaitGroup::new();
            let result = fiber::check_yield(wg.wait()).await;
            assert_eq!(result, YieldResult::DidntYield(()));
        })
        .unwrap();
    }

    #[test]
    fn add_after_zero_reopens_the_group() {
        run(async {
            let wg = WaitGroup::new();
            wg.add(1);
            let worker = wg.clone();
            fiber::spawn(async move { worker.done() });
            wg.wait().await;

            wg.add(1);
            assert_eq!(wg.count(), 1);
            let worker = wg.clone();
            fiber::spawn(async move { worker.done() });
            wg.wait().await;
            assert_eq!(wg.count(), 0);
        })
        .unwrap();
    }

    #[test]
    fn waiters_all_wake_on_the_zero_transition() {
        run(async {
            let wg = WaitGroup::new();
            wg.add(1);
            let waiters: Vec<_> = (0..3)
                .map(|i| {
                    let wg = wg.clone();
                    fiber::spawn(async move {
                        wg.wait().await;
                        i
                    })
                })
                .collect();
            fiber::yield_now().await;
            wg.done();
            for (i, handle) in waiters.into_iter().enumerate() {
                assert_eq!(handle.join().await.unwrap(), i);
            }
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "done called more times than add")]
    fn done_below_zero_panics() {
        let _ = run(async {
            let wg = WaitGroup::new();
            wg.done();
        });
    }
}
