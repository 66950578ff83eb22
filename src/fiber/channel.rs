//! FIFO rendezvous between writing and reading fibers.
//!
//! A channel is created with a buffer size `B >= 0`. With `B = 0` every
//! write rendezvouses with a read; with `B > 0` writes complete without
//! suspending until the buffer fills. Multiple readers and writers may share
//! a channel by cloning its endpoints; a value written is observed by exactly
//! one reader, in FIFO order.
//!
//! Dropping the last [`Sender`] closes the channel: readers drain the buffer
//! and then observe the closed sentinel (`None`). Dropping the last
//! [`Receiver`] fails parked and future writers with
//! [`SendError::Disconnected`], handing the value back. This is what allows
//! "writer is gone" detection without an explicit
//! [`close`](Sender::close).
//!
//! # Example
//! ```no_run
//! use strand::fiber;
//! use strand::fiber::channel::channel;
//!
//! strand::run(async {
//!     let (tx, rx) = channel::<String>(2);
//!     fiber::spawn(async move {
//!         for i in 0..5 {
//!             tx.send(format!("Task {i}")).await.unwrap();
//!         }
//!     });
//!     while let Some(task) = rx.recv().await {
//!         println!("{task}");
//!     }
//! })
//! .unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, Waker};

use futures::Stream;

use crate::fiber::select::{SelectToken, Selectable, WaiterList};
use crate::fiber::FiberId;
use crate::runtime;

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

/// Creates a channel with room for `buffer` values and returns its two
/// endpoints. `buffer = 0` makes every write rendezvous with a read.
pub fn channel<T>(buffer: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Rc::new(Channel::new(buffer));
    (Sender::new(Rc::clone(&chan)), Receiver::new(chan))
}

struct Channel<T> {
    state: RefCell<State<T>>,
    tx_count: Cell<usize>,
    rx_count: Cell<usize>,
}

struct State<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    // parked writers, each carrying its pending value
    writers: VecDeque<Rc<WriteSlot<T>>>,
    read_waiters: WaiterList,
    select_read: WaiterList,
    select_write: WaiterList,
    closed: bool,
    // the fiber that created the channel and its resume count at that moment
    creation_mark: Option<(FiberId, u64)>,
    activated: bool,
}

struct WriteSlot<T> {
    value: RefCell<Option<T>>,
    waker: RefCell<Option<Waker>>,
    phase: Cell<SlotPhase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotPhase {
    Parked,
    Taken,
    Closed,
    Cancelled,
}

impl<T> WriteSlot<T> {
    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

impl<T> Channel<T> {
    fn new(capacity: usize) -> Self {
        Self {
            state: RefCell::new(State {
                capacity,
                buffer: VecDeque::new(),
                writers: VecDeque::new(),
                read_waiters: WaiterList::default(),
                select_read: WaiterList::default(),
                select_write: WaiterList::default(),
                closed: false,
                creation_mark: runtime::driver().and_then(|d| d.current_resume_mark()),
                activated: false,
            }),
            tx_count: Cell::new(0),
            rx_count: Cell::new(0),
        }
    }

    /// Marks the channel closed: parked readers observe the closed sentinel
    /// once the buffer drains, parked writers fail with their value back.
    fn close(&self) {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return;
        }
        state.closed = true;
        state.read_waiters.wake_all();
        state.select_read.wake_all();
        state.select_write.wake_all();
        for slot in state.writers.drain(..) {
            if slot.phase.get() == SlotPhase::Parked {
                slot.phase.set(SlotPhase::Closed);
                slot.wake();
            }
        }
    }

    /// Takes the next value without parking: buffer head first, then the
    /// head parked writer's pending value.
    fn try_take(state: &mut State<T>) -> Option<T> {
        if let Some(value) = state.buffer.pop_front() {
            Self::refill_from_writers(state);
            state.select_write.wake_all();
            return Some(value);
        }
        while let Some(slot) = state.writers.pop_front() {
            if slot.phase.get() != SlotPhase::Parked {
                continue;
            }
            let value = slot
                .value
                .borrow_mut()
                .take()
                .expect("parked writer lost its value");
            slot.phase.set(SlotPhase::Taken);
            slot.wake();
            state.select_write.wake_all();
            return Some(value);
        }
        None
    }

    fn refill_from_writers(state: &mut State<T>) {
        while state.buffer.len() < state.capacity {
            let Some(slot) = state.writers.pop_front() else {
                break;
            };
            if slot.phase.get() != SlotPhase::Parked {
                continue;
            }
            let value = slot
                .value
                .borrow_mut()
                .take()
                .expect("parked writer lost its value");
            slot.phase.set(SlotPhase::Taken);
            slot.wake();
            state.buffer.push_back(value);
        }
    }

    fn poll_recv(&self, cx: &mut TaskContext<'_>, token: &mut Option<u64>) -> Poll<Option<T>> {
        let mut state = self.state.borrow_mut();
        if let Some(t) = token.take() {
            state.read_waiters.remove(t);
        }
        if let Some(value) = Self::try_take(&mut state) {
            return Poll::Ready(Some(value));
        }
        if state.closed || self.tx_count.get() == 0 {
            return Poll::Ready(None);
        }
        *token = Some(state.read_waiters.register(cx.waker()));
        if state.capacity == 0 {
            // a waiting reader turns a rendezvous send non-blocking
            state.select_write.wake_all();
        }
        Poll::Pending
    }

    /// `Err` with the value back when the write cannot proceed right now.
    fn check_send(&self, state: &mut State<T>, value: T) -> Result<T, TrySendError<T>> {
        if !state.activated {
            if let Some(mark) = state.creation_mark {
                if runtime::driver().and_then(|d| d.current_resume_mark()) == Some(mark) {
                    return Err(TrySendError::Misuse(value));
                }
            }
            state.activated = true;
        }
        if state.closed || self.rx_count.get() == 0 {
            return Err(TrySendError::Disconnected(value));
        }
        Ok(value)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sender
////////////////////////////////////////////////////////////////////////////////

/// The writing endpoint of a channel. Cloneable; the channel closes when the
/// last clone is dropped.
pub struct Sender<T> {
    chan: Rc<Channel<T>>,
}

impl<T> Sender<T> {
    fn new(chan: Rc<Channel<T>>) -> Self {
        chan.tx_count.set(chan.tx_count.get() + 1);
        Self { chan }
    }

    /// Writes `value` into the channel.
    ///
    /// Completes without suspending while the buffer has room. On a full (or
    /// rendezvous) channel the calling fiber parks with the value until a
    /// reader takes it. After a direct handoff to a parked reader the sender
    /// yields once, so the next write observes the reader's post-handoff
    /// state.
    ///
    /// Fails with [`SendError::Disconnected`] on a closed channel, handing
    /// the value back, and with [`SendError::Misuse`] when this is the
    /// channel's first write, issued from the fiber that created it with no
    /// context switch in between.
    pub fn send(&self, value: T) -> Send<'_, T> {
        Send {
            chan: &self.chan,
            value: Some(value),
            slot: None,
            handed_off: false,
        }
    }

    /// Non-suspending write: fails with [`TrySendError::Full`] instead of
    /// parking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.chan.state.borrow_mut();
        let value = self.chan.check_send(&mut state, value)?;
        if state.buffer.len() < state.capacity
            || (state.capacity == 0 && state.read_waiters.has_waiters())
        {
            state.buffer.push_back(value);
            state.read_waiters.wake_one();
            state.select_read.wake_all();
            Ok(())
        } else {
            Err(TrySendError::Full(value))
        }
    }

    /// Closes the channel for every endpoint. Parked readers observe the
    /// closed sentinel after the buffer drains; parked writers fail.
    pub fn close(&self) {
        self.chan.close();
    }

    pub fn is_closed(&self) -> bool {
        self.chan.state.borrow().closed || self.chan.rx_count.get() == 0
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self::new(Rc::clone(&self.chan))
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let remaining = self
            .chan
            .tx_count
            .get()
            .checked_sub(1)
            .expect("sender count went below zero");
        self.chan.tx_count.set(remaining);
        if remaining == 0 {
            self.chan.close();
        }
    }
}

/// Future returned by [`Sender::send`].
pub struct Send<'a, T> {
    chan: &'a Rc<Channel<T>>,
    value: Option<T>,
    slot: Option<Rc<WriteSlot<T>>>,
    handed_off: bool,
}

impl<T> Unpin for Send<'_, T> {}

impl<T> Future for Send<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(slot) = this.slot.take() {
            return match slot.phase.get() {
                SlotPhase::Parked => {
                    *slot.waker.borrow_mut() = Some(cx.waker().clone());
                    this.slot = Some(slot);
                    Poll::Pending
                }
                SlotPhase::Taken => Poll::Ready(Ok(())),
                SlotPhase::Closed => {
                    let value = slot
                        .value
                        .borrow_mut()
                        .take()
                        .expect("closed writer lost its value");
                    Poll::Ready(Err(SendError::Disconnected(value)))
                }
                SlotPhase::Cancelled => unreachable!("send future polled after cancellation"),
            };
        }
        if this.handed_off {
            return Poll::Ready(Ok(()));
        }

        let value = this
            .value
            .take()
            .expect("send future polled after completion");
        let mut state = this.chan.state.borrow_mut();
        let value = match this.chan.check_send(&mut state, value) {
            Ok(value) => value,
            Err(e) => return Poll::Ready(Err(e.into())),
        };

        if state.buffer.len() < state.capacity {
            state.buffer.push_back(value);
            state.read_waiters.wake_one();
            state.select_read.wake_all();
            return Poll::Ready(Ok(()));
        }

        if state.capacity == 0 && state.read_waiters.has_waiters() {
            // direct handoff to the head reader; the sender parks for one
            // end-of-tick turn after the handoff
            state.buffer.push_back(value);
            state.read_waiters.wake_one();
            state.select_read.wake_all();
            drop(state);
            this.handed_off = true;
            let waker = cx.waker().clone();
            if runtime::with_driver(|d| d.enqueue_microtask(Box::new(move || waker.wake())))
                .is_err()
            {
                cx.waker().wake_by_ref();
            }
            return Poll::Pending;
        }

        let slot = Rc::new(WriteSlot {
            value: RefCell::new(Some(value)),
            waker: RefCell::new(Some(cx.waker().clone())),
            phase: Cell::new(SlotPhase::Parked),
        });
        state.writers.push_back(Rc::clone(&slot));
        // a parked writer turns a pending recv non-blocking
        state.select_read.wake_all();
        this.slot = Some(slot);
        Poll::Pending
    }
}

impl<T> Drop for Send<'_, T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if slot.phase.get() == SlotPhase::Parked {
                slot.phase.set(SlotPhase::Cancelled);
                slot.value.borrow_mut().take();
            }
        }
    }
}

impl<T> Selectable for Sender<T> {
    fn would_block(&self) -> bool {
        let state = self.chan.state.borrow();
        if state.closed || self.chan.rx_count.get() == 0 {
            // the operation fails immediately, it does not block
            return false;
        }
        if state.buffer.len() < state.capacity {
            return false;
        }
        !(state.capacity == 0 && state.read_waiters.has_waiters())
    }

    fn register(&self, waker: &Waker) -> SelectToken {
        SelectToken(self.chan.state.borrow_mut().select_write.register(waker))
    }

    fn deregister(&self, token: SelectToken) {
        self.chan.state.borrow_mut().select_write.remove(token.0);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Receiver
////////////////////////////////////////////////////////////////////////////////

/// The reading endpoint of a channel. Cloneable; once the last clone is
/// dropped, writers fail with their value handed back.
pub struct Receiver<T> {
    chan: Rc<Channel<T>>,
    // registration owned by the `Stream` impl
    stream_token: Cell<Option<u64>>,
}

impl<T> Receiver<T> {
    fn new(chan: Rc<Channel<T>>) -> Self {
        chan.rx_count.set(chan.rx_count.get() + 1);
        Self {
            chan,
            stream_token: Cell::new(None),
        }
    }

    /// Reads the next value in FIFO order, parking the calling fiber while
    /// the channel is empty. Resolves to `None` once the channel is closed
    /// and drained.
    pub fn recv(&self) -> Recv<'_, T> {
        Recv {
            chan: &self.chan,
            token: None,
        }
    }

    /// Non-suspending read.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut state = self.chan.state.borrow_mut();
        if let Some(value) = Channel::try_take(&mut state) {
            return Ok(value);
        }
        if state.closed || self.chan.tx_count.get() == 0 {
            Err(TryRecvError::Disconnected)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.chan.state.borrow().closed || self.chan.tx_count.get() == 0
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self::new(Rc::clone(&self.chan))
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if let Some(token) = self.stream_token.take() {
            self.chan.state.borrow_mut().read_waiters.remove(token);
        }
        let remaining = self
            .chan
            .rx_count
            .get()
            .checked_sub(1)
            .expect("receiver count went below zero");
        self.chan.rx_count.set(remaining);
        if remaining == 0 {
            self.chan.close();
        }
    }
}

/// Future returned by [`Receiver::recv`].
pub struct Recv<'a, T> {
    chan: &'a Rc<Channel<T>>,
    token: Option<u64>,
}

impl<T> Future for Recv<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.chan.poll_recv(cx, &mut this.token)
    }
}

impl<T> Drop for Recv<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.chan.state.borrow_mut().read_waiters.remove(token);
        }
    }
}

impl<T> Stream for Receiver<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<T>> {
        let mut token = self.stream_token.take();
        let poll = self.chan.poll_recv(cx, &mut token);
        self.stream_token.set(token);
        poll
    }
}

impl<T> Selectable for Receiver<T> {
    fn would_block(&self) -> bool {
        let state = self.chan.state.borrow();
        if !state.buffer.is_empty() {
            return false;
        }
        if state
            .writers
            .iter()
            .any(|slot| slot.phase.get() == SlotPhase::Parked)
        {
            return false;
        }
        !(state.closed || self.chan.tx_count.get() == 0)
    }

    fn register(&self, waker: &Waker) -> SelectToken {
        SelectToken(self.chan.state.borrow_mut().select_read.register(waker))
    }

    fn deregister(&self, token: SelectToken) {
        self.chan.state.borrow_mut().select_read.remove(token.0);
    }
}

////////////////////////////////////////////////////////////////////////////////
// errors
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    /// The channel is closed, or every receiver is gone.
    Disconnected(T),
    /// First write issued from the creating fiber with no context switch
    /// since the channel's creation.
    Misuse(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Disconnected(v) | Self::Misuse(v) => v,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
    Misuse(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Disconnected(v) | Self::Misuse(v) => v,
        }
    }
}

impl<T> From<TrySendError<T>> for SendError<T> {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Disconnected(v) | TrySendError::Full(v) => Self::Disconnected(v),
            TrySendError::Misuse(v) => Self::Misuse(v),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use crate::fiber::YieldResult;
    use crate::runtime::run;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn buffered_writes_preserve_fifo_order() {
        run(async {
            let (tx, rx) = channel::<i32>(3);
            fiber::spawn(async move {
                for i in 0..3 {
                    tx.send(i).await.unwrap();
                }
            });
            assert_eq!(rx.recv().await, Some(0));
            assert_eq!(rx.recv().await, Some(1));
            assert_eq!(rx.recv().await, Some(2));
            assert_eq!(rx.recv().await, None);
        })
        .unwrap();
    }

    #[test]
    fn buffered_send_does_not_yield() {
        run(async {
            let (tx, rx) = channel::<i32>(1);
            fiber::yield_now().await;
            let result = fiber::check_yield(tx.send(5)).await;
            assert_eq!(result, YieldResult::DidntYield(Ok(())));
            assert_eq!(rx.try_recv(), Ok(5));
        })
        .unwrap();
    }

    #[test]
    fn rendezvous_send_parks_until_a_reader_arrives() {
        run(async {
            let (tx, rx) = channel::<i32>(0);
            fiber::spawn(async move {
                fiber::sleep(Duration::from_millis(20)).await;
                assert_eq!(rx.recv().await, Some(9));
            });
            fiber::yield_now().await;
            let result = fiber::check_yield(tx.send(9)).await;
            assert_eq!(result, YieldResult::Yielded(Ok(())));
        })
        .unwrap();
    }

    #[test]
    fn handoff_to_a_parked_reader_yields_once() {
        run(async {
            let (tx, rx) = channel::<i32>(0);
            let reader = fiber::spawn(async move { rx.recv().await });
            // let the reader park first
            fiber::yield_now().await;
            let result = fiber::check_yield(tx.send(1)).await;
            assert_eq!(result, YieldResult::Yielded(Ok(())));
            assert_eq!(reader.join().await.unwrap(), Some(1));
        })
        .unwrap();
    }

    #[test]
    fn dropping_the_last_sender_closes_after_drain() {
        run(async {
            let (tx, rx) = channel::<i32>(2);
            fiber::spawn(async move {
                tx.send(1).await.unwrap();
                tx.send(2).await.unwrap();
            });
            fiber::sleep(Duration::from_millis(10)).await;
            assert_eq!(rx.recv().await, Some(1));
            assert_eq!(rx.recv().await, Some(2));
            assert_eq!(rx.recv().await, None);
        })
        .unwrap();
    }

    #[test]
    fn dropping_the_last_receiver_fails_parked_writers() {
        run(async {
            let (tx, rx) = channel::<i32>(0);
            let writer = fiber::spawn(async move {
                // no reader will ever arrive
                tx.send(42).await
            });
            fiber::sleep(Duration::from_millis(10)).await;
            drop(rx);
            assert_eq!(writer.join().await.unwrap(), Err(SendError::Disconnected(42)));
        })
        .unwrap();
    }

    #[test]
    fn send_on_closed_channel_hands_the_value_back() {
        run(async {
            let (tx, rx) = channel::<i32>(1);
            fiber::yield_now().await;
            tx.close();
            assert_eq!(tx.send(3).await, Err(SendError::Disconnected(3)));
            assert_eq!(rx.recv().await, None);
        })
        .unwrap();
    }

    #[test]
    fn first_send_from_the_creating_fiber_without_yield_is_misuse() {
        run(async {
            let (tx, rx) = channel::<i32>(1);
            assert_eq!(tx.send(1).await, Err(SendError::Misuse(1)));
            // after a context switch the same fiber may write
            fiber::yield_now().await;
            assert_eq!(tx.send(1).await, Ok(()));
            assert_eq!(rx.recv().await, Some(1));
        })
        .unwrap();
    }

    #[test]
    fn try_send_and_try_recv_do_not_park() {
        run(async {
            let (tx, rx) = channel::<i32>(1);
            fiber::yield_now().await;
            assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
            assert_eq!(tx.try_send(1), Ok(()));
            assert_eq!(tx.try_send(2), Err(TrySendError::Full(2)));
            assert_eq!(rx.try_recv(), Ok(1));
            tx.close();
            assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
            assert_eq!(tx.try_send(3), Err(TrySendError::Disconnected(3)));
        })
        .unwrap();
    }

    #[test]
    fn values_are_point_to_point_across_readers() {
        run(async {
            let (tx, rx1) = channel::<i32>(0);
            let rx2 = rx1.clone();
            let r1 = fiber::spawn(async move { rx1.recv().await });
            let r2 = fiber::spawn(async move { rx2.recv().await });
            fiber::yield_now().await;
            tx.send(1).await.unwrap();
            tx.send(2).await.unwrap();
            let (a, b) = (r1.join().await.unwrap(), r2.join().await.unwrap());
            // readers are served in FIFO parking order
            assert_eq!((a, b), (Some(1), Some(2)));
        })
        .unwrap();
    }

    #[test]
    fn receiver_is_a_stream() {
        run(async {
            let (tx, rx) = channel::<i32>(2);
            fiber::spawn(async move {
                for i in 0..4 {
                    tx.send(i).await.unwrap();
                }
            });
            let collected: Vec<i32> = rx.collect().await;
            assert_eq!(collected, vec![0, 1, 2, 3]);
        })
        .unwrap();
    }
}
