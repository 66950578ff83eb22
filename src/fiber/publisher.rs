//! One-to-many broadcast with per-subscriber queues and backpressure.
//!
//! A [`Publisher`] fans a single stream of values out to any number of
//! independent [`Subscriber`]s. Each subscriber joins at the current tail and
//! from then on observes every published value, in the order written, from
//! its own queue.
//!
//! Backpressure: [`publish`](Publisher::publish) parks the writing fiber
//! while any live subscriber's backlog exceeds the high-water mark.
//! A subscriber that never reads therefore blocks the writer indefinitely;
//! drop the subscriber to release it.
//!
//! # Example
//! ```no_run
//! use strand::fiber;
//! use strand::fiber::publisher::publisher;
//!
//! strand::run(async {
//!     let publisher = publisher::<String>();
//!     let sub = publisher.subscribe();
//!     fiber::spawn(async move {
//!         for i in 0..5 {
//!             publisher.publish(format!("#{i}")).await.unwrap();
//!         }
//!     });
//!     while let Some(event) = sub.recv().await {
//!         println!("{event}");
//!     }
//! })
//! .unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context as TaskContext, Poll, Waker};

use futures::Stream;

use crate::fiber::select::{SelectToken, Selectable, WaiterList};
use crate::fiber::FiberId;
use crate::runtime;

const DEFAULT_HIGH_WATER: usize = 64;

/// Creates a publisher with the default high-water mark.
pub fn publisher<T: Clone>() -> Publisher<T> {
    Publisher::new()
}

////////////////////////////////////////////////////////////////////////////////
// Publisher
////////////////////////////////////////////////////////////////////////////////

struct Shared<T> {
    subscribers: RefCell<Vec<Weak<SubState<T>>>>,
    writer_waiters: RefCell<WaiterList>,
    closed: Cell<bool>,
    high_water: usize,
    creation_mark: Option<(FiberId, u64)>,
    activated: Cell<bool>,
}

struct SubState<T> {
    queue: RefCell<VecDeque<T>>,
    waiters: RefCell<WaiterList>,
    select: RefCell<WaiterList>,
}

impl<T> Shared<T> {
    /// Prunes dropped subscribers and reports the longest live backlog.
    fn prune(&self) -> usize {
        let mut max_backlog = 0;
        self.subscribers.borrow_mut().retain(|weak| match weak.upgrade() {
            Some(sub) => {
                max_backlog = max_backlog.max(sub.queue.borrow().len());
                true
            }
            None => false,
        });
        max_backlog
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for weak in self.subscribers.borrow().iter() {
            if let Some(sub) = weak.upgrade() {
                sub.waiters.borrow_mut().wake_all();
                sub.select.borrow_mut().wake_all();
            }
        }
        self.writer_waiters.borrow_mut().wake_all();
    }
}

/// The writing end of a broadcast. Dropping it closes the stream: every
/// subscriber drains its queue and then observes `None`.
pub struct Publisher<T> {
    shared: Rc<Shared<T>>,
}

impl<T: Clone> Publisher<T> {
    pub fn new() -> Self {
        Self::with_high_water(DEFAULT_HIGH_WATER)
    }

    /// A publisher that parks its writer once any subscriber's backlog
    /// exceeds `high_water` unread values.
    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            shared: Rc::new(Shared {
                subscribers: RefCell::new(Vec::new()),
                writer_waiters: RefCell::new(WaiterList::default()),
                closed: Cell::new(false),
                high_water,
                creation_mark: runtime::driver().and_then(|d| d.current_resume_mark()),
                activated: Cell::new(false),
            }),
        }
    }

    /// Creates a subscriber positioned at the current tail: it observes every
    /// value published from now on, none of the earlier ones.
    pub fn subscribe(&self) -> Subscriber<T> {
        let sub = Rc::new(SubState {
            queue: RefCell::new(VecDeque::new()),
            waiters: RefCell::new(WaiterList::default()),
            select: RefCell::new(WaiterList::default()),
        });
        self.shared
            .subscribers
            .borrow_mut()
            .push(Rc::downgrade(&sub));
        Subscriber {
            shared: Rc::clone(&self.shared),
            sub,
            stream_token: Cell::new(None),
        }
    }

    /// Appends `value` to every live subscriber's queue, then parks the
    /// calling fiber while any subscriber's backlog exceeds the high-water
    /// mark.
    ///
    /// Fails with [`PublishError::Closed`] after [`close`](Self::close), and
    /// with [`PublishError::Misuse`] when this is the first publish, issued
    /// from the fiber that created the publisher with no context switch in
    /// between.
    pub fn publish(&self, value: T) -> Publish<'_, T> {
        Publish {
            shared: &self.shared,
            value: Some(value),
            token: None,
        }
    }

    /// Marks the stream done. Subscribers drain their queues and then
    /// observe `None`.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.prune();
        self.shared.subscribers.borrow().len()
    }
}

impl<T: Clone> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Future returned by [`Publisher::publish`].
pub struct Publish<'a, T> {
    shared: &'a Rc<Shared<T>>,
    value: Option<T>,
    token: Option<u64>,
}

impl<T> Unpin for Publish<'_, T> {}

impl<T: Clone> Future for Publish<'_, T> {
    type Output = Result<(), PublishError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let shared = this.shared;

        if let Some(value) = this.value.take() {
            if !shared.activated.get() {
                if let Some(mark) = shared.creation_mark {
                    if runtime::driver().and_then(|d| d.current_resume_mark()) == Some(mark) {
                        return Poll::Ready(Err(PublishError::Misuse(value)));
                    }
                }
                shared.activated.set(true);
            }
            if shared.closed.get() {
                return Poll::Ready(Err(PublishError::Closed(value)));
            }
            shared.prune();
            for weak in shared.subscribers.borrow().iter() {
                if let Some(sub) = weak.upgrade() {
                    sub.queue.borrow_mut().push_back(value.clone());
                    sub.waiters.borrow_mut().wake_one();
                    sub.select.borrow_mut().wake_all();
                }
            }
        }

        if let Some(token) = this.token.take() {
            shared.writer_waiters.borrow_mut().remove(token);
        }
        if shared.prune() > shared.high_water && !shared.closed.get() {
            this.token = Some(shared.writer_waiters.borrow_mut().register(cx.waker()));
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

impl<T> Drop for Publish<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.shared.writer_waiters.borrow_mut().remove(token);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Subscriber
////////////////////////////////////////////////////////////////////////////////

/// An independent cursor over the published stream.
///
/// Dropping a subscriber removes it from the broadcast; a writer parked on
/// its backlog is released.
pub struct Subscriber<T> {
    shared: Rc<Shared<T>>,
    sub: Rc<SubState<T>>,
    stream_token: Cell<Option<u64>>,
}

impl<T> Subscriber<T> {
    /// Reads the next value, parking while the queue is empty. Resolves to
    /// `None` once the publisher closed and the queue drained.
    pub fn recv(&self) -> SubRecv<'_, T> {
        SubRecv {
            subscriber: self,
            token: None,
        }
    }

    fn poll_recv(&self, cx: &mut TaskContext<'_>, token: &mut Option<u64>) -> Poll<Option<T>> {
        if let Some(t) = token.take() {
            self.sub.waiters.borrow_mut().remove(t);
        }
        let value = self.sub.queue.borrow_mut().pop_front();
        if let Some(value) = value {
            if self.sub.queue.borrow().len() <= self.shared.high_water {
                self.shared.writer_waiters.borrow_mut().wake_all();
            }
            return Poll::Ready(Some(value));
        }
        if self.shared.closed.get() {
            return Poll::Ready(None);
        }
        *token = Some(self.sub.waiters.borrow_mut().register(cx.waker()));
        Poll::Pending
    }

    /// Unread values currently queued for this subscriber.
    pub fn backlog(&self) -> usize {
        self.sub.queue.borrow().len()
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if let Some(token) = self.stream_token.take() {
            self.sub.waiters.borrow_mut().remove(token);
        }
        // prune the dead weak reference and release a parked writer
        drop(std::mem::take(&mut *self.sub.queue.borrow_mut()));
        self.shared.prune();
        self.shared.writer_waiters.borrow_mut().wake_all();
    }
}

/// Future returned by [`Subscriber::recv`].
pub struct SubRecv<'a, T> {
    subscriber: &'a Subscriber<T>,
    token: Option<u64>,
}

impl<T> Future for SubRecv<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.subscriber.poll_recv(cx, &mut this.token)
    }
}

impl<T> Drop for SubRecv<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.subscriber.sub.waiters.borrow_mut().remove(token);
        }
    }
}

impl<T> Stream for Subscriber<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<T>> {
        let mut token = self.stream_token.take();
        let poll = self.poll_recv(cx, &mut token);
        self.stream_token.set(token);
        poll
    }
}

impl<T> Selectable for Subscriber<T> {
    fn would_block(&self) -> bool {
        self.sub.queue.borrow().is_empty() && !self.shared.closed.get()
    }

    fn register(&self, waker: &Waker) -> SelectToken {
        SelectToken(self.sub.select.borrow_mut().register(waker))
    }

    fn deregister(&self, token: SelectToken) {
        self.sub.select.borrow_mut().remove(token.0);
    }
}

////////////////////////////////////////////////////////////////////////////////
// errors
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PublishError<T> {
    /// The publisher was closed.
    Closed(T),
    /// First publish issued from the creating fiber with no context switch
    /// since the publisher's creation.
    Misuse(T),
}

impl<T> PublishError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(v) | Self::Misuse(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use crate::runtime::run;
    use std::time::Duration;

    #[test]
    fn every_subscriber_sees_every_value_in_order() {
        run(async {
            let publisher = publisher::<i32>();
            let subs: Vec<_> = (0..3).map(|_| publisher.subscribe()).collect();
            fiber::spawn(async move {
                for i in 0..5 {
                    publisher.publish(i).await.unwrap();
                }
            });
            for sub in &subs {
                for i in 0..5 {
                    assert_eq!(sub.recv().await, Some(i));
                }
                assert_eq!(sub.recv().await, None);
            }
        })
        .unwrap();
    }

    #[test]
    fn subscribers_join_at_the_current_tail() {
        run(async {
            let publisher = publisher::<i32>();
            let early = publisher.subscribe();
            fiber::yield_now().await;
            publisher.publish(1).await.unwrap();
            let late = publisher.subscribe();
            publisher.publish(2).await.unwrap();
            publisher.close();
            assert_eq!(early.recv().await, Some(1));
            assert_eq!(early.recv().await, Some(2));
            assert_eq!(early.recv().await, None);
            assert_eq!(late.recv().await, Some(2));
            assert_eq!(late.recv().await, None);
        })
        .unwrap();
    }

    #[test]
    fn slow_subscriber_parks_the_writer() {
        run(async {
            let publisher = Publisher::<i32>::with_high_water(1);
            let sub = publisher.subscribe();
            let writer = fiber::spawn(async move {
                publisher.publish(1).await.unwrap();
                publisher.publish(2).await.unwrap();
                // the second publish left a backlog of 2 > 1: parked here
                publisher.publish(3).await.unwrap();
            });
            fiber::sleep(Duration::from_millis(10)).await;
            assert!(!writer.is_finished());
            assert_eq!(sub.recv().await, Some(1));
            assert_eq!(sub.recv().await, Some(2));
            writer.join().await.unwrap();
            assert_eq!(sub.recv().await, Some(3));
        })
        .unwrap();
    }

    #[test]
    fn dropping_a_slow_subscriber_releases_the_writer() {
        run(async {
            let publisher = Publisher::<i32>::with_high_water(0);
            let slow = publisher.subscribe();
            let fast = publisher.subscribe();
            let writer = fiber::spawn(async move {
                publisher.publish(1).await.unwrap();
                publisher.publish(2).await.unwrap();
            });
            fiber::sleep(Duration::from_millis(10)).await;
            assert!(!writer.is_finished());
            drop(slow);
            // the writer is still held back by `fast`'s backlog
            assert_eq!(fast.recv().await, Some(1));
            assert_eq!(fast.recv().await, Some(2));
            writer.join().await.unwrap();
        })
        .unwrap();
    }

    #[test]
    fn close_drains_then_reports_done() {
        run(async {
            let publisher = publisher::<i32>();
            let sub = publisher.subscribe();
            fiber::spawn(async move {
                publisher.publish(5).await.unwrap();
                publisher.close();
                assert_eq!(publisher.publish(6).await, Err(PublishError::Closed(6)));
            });
            assert_eq!(sub.recv().await, Some(5));
            assert_eq!(sub.recv().await, None);
        })
        .unwrap();
    }

    #[test]
    fn first_publish_from_the_creating_fiber_without_yield_is_misuse() {
        run(async {
            let publisher = publisher::<i32>();
            let sub = publisher.subscribe();
            assert_eq!(publisher.publish(1).await, Err(PublishError::Misuse(1)));
            fiber::yield_now().await;
            assert_eq!(publisher.publish(1).await, Ok(()));
            assert_eq!(sub.recv().await, Some(1));
        })
        .unwrap();
    }
}
