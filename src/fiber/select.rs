//! Choosing the first non-blocking operation among a set of selectables.
//!
//! Every rendezvous primitive in the crate keeps its parked fibers in a
//! [`WaiterList`] and additionally exposes a select manager: a second waiter
//! list that fires whenever the primitive transitions from "would block" to
//! "would not block". [`select`] registers on every candidate, parks, and on
//! wake removes the registrations it no longer needs.
//!
//! # Example
//! ```no_run
//! use strand::fiber::channel;
//! use strand::fiber::select;
//!
//! # strand::run(async {
//! let (tx, rx) = channel::channel::<i32>(1);
//! let (tx2, rx2) = channel::channel::<i32>(1);
//! # let _ = tx2.send(1).await;
//! let which = select::select(&[&rx, &rx2]).await;
//! # drop((tx, rx, rx2));
//! # }).unwrap();
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

////////////////////////////////////////////////////////////////////////////////
// WaiterList
////////////////////////////////////////////////////////////////////////////////

/// FIFO list of parked wakers with stable tokens, so a cancelled waiter can
/// remove itself without disturbing the others.
#[derive(Default)]
pub(crate) struct WaiterList {
    entries: Vec<(u64, Waker)>,
    next_token: u64,
}

impl WaiterList {
    pub fn register(&mut self, waker: &Waker) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.entries.push((token, waker.clone()));
        token
    }

    pub fn remove(&mut self, token: u64) {
        self.entries.retain(|(t, _)| *t != token);
    }

    pub fn contains(&self, token: u64) -> bool {
        self.entries.iter().any(|(t, _)| *t == token)
    }

    /// Wakes the head waiter, if any.
    pub fn wake_one(&mut self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let (_, waker) = self.entries.remove(0);
        waker.wake();
        true
    }

    pub fn wake_all(&mut self) {
        for (_, waker) in self.entries.drain(..) {
            waker.wake();
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Selectable
////////////////////////////////////////////////////////////////////////////////

/// Registration handle inside a selectable's select manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectToken(pub(crate) u64);

/// An operation endpoint [`select`] can choose among.
///
/// Implemented by [`Receiver`](super::channel::Receiver),
/// [`Sender`](super::channel::Sender) and
/// [`Subscriber`](super::publisher::Subscriber).
pub trait Selectable {
    /// Whether the endpoint's operation would park the caller right now.
    ///
    /// An endpoint whose operation would fail immediately (e.g. a closed
    /// channel) does not block and therefore reports `false`.
    fn would_block(&self) -> bool;

    /// Registers interest in the endpoint becoming non-blocking.
    fn register(&self, waker: &Waker) -> SelectToken;

    /// Removes a registration made by [`register`](Selectable::register).
    /// Unknown tokens are ignored.
    fn deregister(&self, token: SelectToken);
}

////////////////////////////////////////////////////////////////////////////////
// select
////////////////////////////////////////////////////////////////////////////////

/// Resolves to the index of the first selectable whose operation would not
/// block.
///
/// If several are ready at once the lowest index wins; the policy is stable
/// across calls. While none is ready the caller parks with a registration on
/// every candidate, and the extra registrations are removed on wake (or when
/// the future is dropped).
pub fn select<'a>(selectables: &'a [&'a dyn Selectable]) -> Select<'a> {
    Select {
        selectables,
        tokens: vec![None; selectables.len()],
    }
}

pub struct Select<'a> {
    selectables: &'a [&'a dyn Selectable],
    tokens: Vec<Option<SelectToken>>,
}

impl Select<'_> {
    fn clear_registrations(&mut self) {
        for (i, token) in self.tokens.iter_mut().enumerate() {
            if let Some(token) = token.take() {
                self.selectables[i].deregister(token);
            }
        }
    }
}

impl Future for Select<'_> {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for (i, selectable) in this.selectables.iter().enumerate() {
            if !selectable.would_block() {
                this.clear_registrations();
                return Poll::Ready(i);
            }
        }
        // Re-register from scratch: a wake may have drained any subset of the
        // old registrations.
        this.clear_registrations();
        for (i, selectable) in this.selectables.iter().enumerate() {
            this.tokens[i] = Some(selectable.register(cx.waker()));
        }
        Poll::Pending
    }
}

impl Drop for Select<'_> {
    fn drop(&mut self) {
        self.clear_registrations();
    }
}

#[cfg(test)]
mod tests {
    use crate::fiber::{self, channel};
    use crate::runtime;
    use std::time::Duration;

    #[test]
    fn immediate_lowest_index_wins() {
        runtime::run(async {
            let (tx1, rx1) = channel::channel::<i32>(1);
            let (tx2, rx2) = channel::channel::<i32>(1);
            fiber::yield_now().await;
            tx1.send(1).await.unwrap();
            tx2.send(2).await.unwrap();
            let which = super::select(&[&rx1, &rx2]).await;
            assert_eq!(which, 0);
            let which = super::select(&[&rx2, &rx1]).await;
            assert_eq!(which, 0);
        })
        .unwrap();
    }

    #[test]
    fn parks_until_a_candidate_is_ready() {
        runtime::run(async {
            // _tx1 stays open so only the second channel can fire
            let (_tx1, rx1) = channel::channel::<i32>(1);
            let (tx2, rx2) = channel::channel::<i32>(1);
            fiber::spawn(async move {
                fiber::sleep(Duration::from_millis(20)).await;
                tx2.send(7).await.unwrap();
            });
            let which = super::select(&[&rx1, &rx2]).await;
            assert_eq!(which, 1);
            assert_eq!(rx2.recv().await, Some(7));
        })
        .unwrap();
    }

    #[test]
    fn closed_endpoint_is_not_blocking() {
        runtime::run(async {
            let (tx, rx) = channel::channel::<i32>(1);
            tx.close();
            let which = super::select(&[&rx]).await;
            assert_eq!(which, 0);
            assert_eq!(rx.recv().await, None);
        })
        .unwrap();
    }
}
