//! Cooperative multitasking module.
//!
//! With the fiber module you can:
//! - spawn fibers and join their results ([`spawn`], [`Builder`],
//!   [`JoinHandle`]),
//! - suspend at designated points ([`sleep`], [`yield_now`], [`preempt`],
//!   [`idle`], [`readable`], [`writable`]),
//! - register LIFO cleanup on the calling fiber ([`defer`]),
//! - synchronize fibers through [`channel`]s, [`publisher`]s,
//!   [`WaitGroup`]s and [`select`].
//!
//! A fiber is a suspendable unit of computation owned by a
//! [`Context`](crate::runtime::Context). Exactly one fiber runs at a time;
//! between two suspension points code runs to completion without observable
//! interleaving, so no locks are needed for in-process state.
//!
//! # Example
//! ```no_run
//! use strand::fiber;
//! use std::time::Duration;
//!
//! strand::run(async {
//!     let handle = fiber::spawn(async {
//!         fiber::sleep(Duration::from_millis(10)).await;
//!         "done"
//!     });
//!     assert_eq!(handle.join().await.unwrap(), "done");
//! })
//! .unwrap();
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;

use crate::error::{Error, Result};
use crate::runtime::{self, Context, Direction, Driver};
use crate::time::deadline_after;

use self::select::WaiterList;

pub mod channel;
pub mod csw;
pub mod publisher;
pub mod select;
pub mod wait_group;

pub use channel::channel;
pub use csw::{check_yield, csw, YieldResult};
pub use publisher::publisher;
pub use select::{select, Selectable};
pub use wait_group::WaitGroup;

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Opaque fiber handle, unique for the lifetime of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub(crate) u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// Id of the calling fiber.
///
/// # Panics
/// If called from outside a running fiber.
pub fn current() -> FiberId {
    runtime::driver()
        .and_then(|d| d.current_fiber())
        .expect("fiber::current must be called from within a running fiber")
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// The [`spawn`](Self::spawn) method takes ownership of the builder and
/// returns a [`Result`] to the fiber's [`JoinHandle`]. The [`fiber::spawn`]
/// free function uses a `Builder` with the default configuration and unwraps
/// its return value.
///
/// [`fiber::spawn`]: spawn()
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    context: Option<Context>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber-to-be. Names show up in runtime diagnostics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawns the fiber into `context` instead of the caller's own.
    pub fn context(mut self, context: &Context) -> Self {
        self.context = Some(context.clone());
        self
    }

    /// Spawns a new fiber running `fut`, enqueued at the tail of the ready
    /// queue, and returns its [`JoinHandle`].
    ///
    /// Fails with [`Error::NoRuntime`] outside of an active context.
    pub fn spawn<F>(self, fut: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let driver = runtime::driver().ok_or(Error::NoRuntime)?;
        let context = match &self.context {
            Some(context) => context.clone(),
            None => driver.current_context().ok_or(Error::NoRuntime)?,
        };
        self.spawn_with(&driver, &context, fut)
    }

    pub(crate) fn spawn_with<F>(
        self,
        driver: &Rc<Driver>,
        context: &Context,
        fut: F,
    ) -> Result<JoinHandle<F::Output>>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = driver.allocate_fiber_id();
        let slot = Rc::new(ResultSlot::new(context.clone()));

        let task = {
            let slot = Rc::clone(&slot);
            async move {
                let result = panic::AssertUnwindSafe(fut).catch_unwind().await;
                // the deferred stack runs before the result is published
                if let Ok(driver) = runtime::with_driver(|d| d.clone()) {
                    driver.drain_current_deferred();
                }
                match result {
                    Ok(value) => slot.complete(Ok(value)),
                    Err(payload) => {
                        slot.complete(Err(JoinError::Panicked(PanicPayload::new(payload))))
                    }
                }
            }
        };
        let on_abort = {
            let slot = Rc::clone(&slot);
            Box::new(move || slot.complete(Err(JoinError::Deadlock)))
        };

        driver.insert_fiber(
            id,
            context.clone(),
            self.name.unwrap_or_else(|| "<fiber>".into()),
            Box::pin(task),
            on_abort,
        );
        Ok(JoinHandle {
            id,
            slot,
            await_token: Cell::new(None),
        })
    }
}

/// Spawns a new fiber in the caller's context and returns its
/// [`JoinHandle`]. This is the `go` of the runtime.
///
/// # Panics
/// If called outside of an active runtime context. Use
/// [`Builder::spawn`] for the non-panicking variant.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Builder::new()
        .spawn(fut)
        .expect("fiber::spawn must be called from within an active runtime context")
}

////////////////////////////////////////////////////////////////////////////////
// JoinError
////////////////////////////////////////////////////////////////////////////////

/// Why a joined fiber produced no value.
#[derive(Clone, Debug, thiserror::Error)]
pub enum JoinError {
    /// The fiber's body panicked. Every awaiter receives the same payload
    /// object.
    #[error("fiber panicked: {0}")]
    Panicked(PanicPayload),

    /// The fiber was torn down by the deadlock scan, or a fiber tried to
    /// join itself.
    #[error("deadlock: the awaited fiber can no longer be resumed")]
    Deadlock,
}

impl JoinError {
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// A panic captured from a fiber body, shared between every awaiter.
#[derive(Clone)]
pub struct PanicPayload(Rc<Box<dyn Any + Send + 'static>>);

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self(Rc::new(payload))
    }

    /// The panic message, when the payload is a string.
    pub fn message(&self) -> &str {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            s
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s
        } else {
            "<non-string panic payload>"
        }
    }

    /// Whether two handles refer to the same captured panic.
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Re-raises the panic on the calling thread. The original payload is
    /// restored when this is the last handle to it.
    pub fn resume(self) -> ! {
        match Rc::try_unwrap(self.0) {
            Ok(payload) => panic::resume_unwind(payload),
            Err(shared) => {
                let message: String = if let Some(s) = shared.downcast_ref::<&'static str>() {
                    (*s).into()
                } else if let Some(s) = shared.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "<non-string panic payload>".into()
                };
                panic::resume_unwind(Box::new(message))
            }
        }
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicPayload").field(&self.message()).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// JoinHandle
////////////////////////////////////////////////////////////////////////////////

enum SlotState<T> {
    Pending(WaiterList),
    Done(std::result::Result<T, JoinError>),
    Taken,
}

pub(crate) struct ResultSlot<T> {
    state: RefCell<SlotState<T>>,
    context: Context,
}

impl<T> ResultSlot<T> {
    fn new(context: Context) -> Self {
        Self {
            state: RefCell::new(SlotState::Pending(WaiterList::default())),
            context,
        }
    }

    /// Publishes the fiber's terminal state exactly once and wakes every
    /// awaiter. A failure with no awaiter parked at this moment goes to the
    /// owning context's unhandled-exception sink instead.
    pub(crate) fn complete(&self, result: std::result::Result<T, JoinError>) {
        let mut state = self.state.borrow_mut();
        let mut waiters = match &mut *state {
            SlotState::Pending(waiters) => std::mem::take(waiters),
            _ => return,
        };
        if !waiters.has_waiters() {
            if let Err(e) = &result {
                self.context.report_unhandled(e);
            }
        }
        *state = SlotState::Done(result);
        drop(state);
        waiters.wake_all();
    }

    fn remove_waiter(&self, token: u64) {
        if let SlotState::Pending(waiters) = &mut *self.state.borrow_mut() {
            waiters.remove(token);
        }
    }
}

/// An owned permission to join a fiber: the result-slot view of the fiber.
///
/// Cloneable; every clone observes the same value or the same exception
/// object. Joining a handle after the fiber completed resolves immediately.
/// The handle also implements [`Future`] directly, so `handle.await` is the
/// same as `handle.join().await`.
pub struct JoinHandle<T> {
    id: FiberId,
    slot: Rc<ResultSlot<T>>,
    // registration owned by the handle's own `Future` impl
    await_token: Cell<Option<u64>>,
}

impl<T> Clone for JoinHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            slot: Rc::clone(&self.slot),
            await_token: Cell::new(None),
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if let Some(token) = self.await_token.take() {
            self.slot.remove_waiter(token);
        }
    }
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        !matches!(&*self.slot.state.borrow(), SlotState::Pending(_))
    }

    /// Parks the caller until the fiber resolves, then delivers its value or
    /// re-raises its error. A fiber joining itself fails with
    /// [`JoinError::Deadlock`] immediately.
    pub fn join(&self) -> Join<'_, T> {
        Join {
            handle: self,
            token: None,
        }
    }

    fn poll_join(
        &self,
        cx: &mut TaskContext<'_>,
        token: &mut Option<u64>,
    ) -> Poll<std::result::Result<T, JoinError>>
    where
        T: Clone,
    {
        let driver = runtime::driver();
        if let Some(driver) = &driver {
            if driver.current_fiber() == Some(self.id) {
                return Poll::Ready(Err(JoinError::Deadlock));
            }
        }
        let mut state = self.slot.state.borrow_mut();
        match &mut *state {
            SlotState::Done(result) => {
                token.take();
                Poll::Ready(result.clone())
            }
            SlotState::Taken => unreachable!("fiber result was already taken"),
            SlotState::Pending(waiters) => {
                if let Some(t) = token.take() {
                    waiters.remove(t);
                }
                *token = Some(waiters.register(cx.waker()));
                drop(state);
                if let Some(driver) = &driver {
                    if let Some(current) = driver.current_fiber() {
                        driver.mark_awaiting(current, self.id);
                    }
                }
                Poll::Pending
            }
        }
    }

    /// Removes the completed result from the slot. Only the root fiber's
    /// result is consumed this way, by `run` after the context drained.
    pub(crate) fn take_result(&self) -> std::result::Result<T, JoinError> {
        let mut state = self.slot.state.borrow_mut();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Done(result) => result,
            _ => unreachable!("root fiber result consumed before the context drained"),
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: Clone> Future for JoinHandle<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut token = self.await_token.take();
        let poll = self.poll_join(cx, &mut token);
        self.await_token.set(token);
        poll
    }
}

pub struct Join<'a, T> {
    handle: &'a JoinHandle<T>,
    token: Option<u64>,
}

impl<T: Clone> Future for Join<'_, T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.handle.poll_join(cx, &mut this.token)
    }
}

impl<T> Drop for Join<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.handle.slot.remove_waiter(token);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// sleep / yield
////////////////////////////////////////////////////////////////////////////////

/// Parks the calling fiber for `timeout`. A zero timeout enqueues the fiber
/// at the tail of the ready queue, i.e. yields.
///
/// Sleeping fibers wake in deadline order; equal deadlines wake in the order
/// the sleeps were registered.
pub fn sleep(timeout: Duration) -> Sleep {
    Sleep {
        timeout,
        state: SleepState::Unregistered,
    }
}

/// Reschedules the calling fiber at the tail of the ready queue.
pub fn yield_now() -> Sleep {
    sleep(Duration::ZERO)
}

enum SleepState {
    Unregistered,
    Yielded,
    Waiting(Instant),
}

pub struct Sleep {
    timeout: Duration,
    state: SleepState,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.state {
            SleepState::Unregistered => {
                if this.timeout.is_zero() {
                    this.state = SleepState::Yielded;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                let deadline = deadline_after(Instant::now(), this.timeout);
                runtime::with_driver(|d| d.register_timer(deadline, cx.waker()))
                    .expect("fiber::sleep requires an active runtime context");
                this.state = SleepState::Waiting(deadline);
                Poll::Pending
            }
            SleepState::Yielded => Poll::Ready(()),
            SleepState::Waiting(deadline) => {
                if Instant::now() >= deadline {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// preempt
////////////////////////////////////////////////////////////////////////////////

/// Cooperative preemption point for CPU-bound code.
///
/// Cheap no-op while the calling fiber is under its preemption budget
/// (20 ms by default, see
/// [`Runtime::preemption_budget`](crate::runtime::Runtime::preemption_budget));
/// one yield once the budget is exceeded. The budget resets on every resume.
pub fn preempt() -> Preempt {
    Preempt { yielded: false }
}

pub struct Preempt {
    yielded: bool,
}

impl Future for Preempt {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        let over_budget = runtime::driver()
            .and_then(|d| {
                let running_for = d.current_running_for()?;
                Some(running_for >= d.preemption_budget())
            })
            .unwrap_or(false);
        if over_budget {
            this.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// idle
////////////////////////////////////////////////////////////////////////////////

/// Parks the calling fiber until the event loop is about to block on I/O or
/// timers, or until `max_wait` elapses, whichever comes first.
///
/// Use this to schedule low-priority work into the loop's quiet moments.
pub fn idle(max_wait: Duration) -> Idle {
    Idle {
        max_wait,
        token: None,
    }
}

pub struct Idle {
    max_wait: Duration,
    token: Option<u64>,
}

impl Future for Idle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.token {
            None => {
                let deadline = deadline_after(Instant::now(), this.max_wait);
                let token = runtime::with_driver(|d| d.register_idle(deadline, cx.waker()))
                    .expect("fiber::idle requires an active runtime context");
                this.token = Some(token);
                Poll::Pending
            }
            Some(token) => {
                let parked = runtime::with_driver(|d| d.idle_pending(token)).unwrap_or(false);
                if parked {
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            }
        }
    }
}

impl Drop for Idle {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let _ = runtime::with_driver(|d| d.remove_idle(token));
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// readable / writable
////////////////////////////////////////////////////////////////////////////////

/// Parks the calling fiber until the OS reports `fd` readable.
///
/// The handle stays owned by the application; the runtime only watches it.
/// A handle closed behind the runtime's back wakes the fiber spuriously so
/// that its next syscall observes the closed handle.
pub fn readable(fd: RawFd) -> IoWait {
    IoWait {
        direction: Direction::Read,
        fd,
        token: None,
    }
}

/// Parks the calling fiber until the OS reports `fd` writable.
///
/// See [`readable`].
pub fn writable(fd: RawFd) -> IoWait {
    IoWait {
        direction: Direction::Write,
        fd,
        token: None,
    }
}

pub struct IoWait {
    direction: Direction,
    fd: RawFd,
    token: Option<u64>,
}

impl Future for IoWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.token {
            None => {
                let token = runtime::with_driver(|d| {
                    d.register_io(this.direction, this.fd, cx.waker())
                })
                .expect("fiber::readable/writable requires an active runtime context");
                this.token = Some(token);
                Poll::Pending
            }
            Some(token) => {
                let parked = runtime::with_driver(|d| d.io_pending(this.direction, this.fd, token))
                    .unwrap_or(false);
                if parked {
                    Poll::Pending
                } else {
                    this.token = None;
                    Poll::Ready(())
                }
            }
        }
    }
}

impl Drop for IoWait {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let _ = runtime::with_driver(|d| d.remove_io(self.direction, self.fd, token));
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// defer
////////////////////////////////////////////////////////////////////////////////

/// Pushes a cleanup callback onto the calling fiber.
///
/// Deferred callbacks run exactly once, in LIFO order, on the fiber's
/// terminal path (normal return, panic, or runtime teardown), before the
/// fiber's result is published to awaiters. A callback that panics is
/// reported to the exception log and the remaining callbacks still run.
///
/// # Panics
/// If called from outside a running fiber.
pub fn defer(f: impl FnOnce() + 'static) {
    runtime::with_driver(|d| d.push_deferred(Box::new(f)))
        .and_then(|r| r)
        .expect("fiber::defer must be called from within a running fiber");
}

////////////////////////////////////////////////////////////////////////////////
// waker
////////////////////////////////////////////////////////////////////////////////

pub(crate) mod waker {
    //! `Rc`-based waker plumbing. The runtime is single-threaded and wakers
    //! never leave it, so an `Rc` payload behind the `RawWaker` vtable is
    //! sound here the same way a thread-bound condvar waker is.

    use super::FiberId;
    use crate::runtime::Driver;
    use std::mem::ManuallyDrop;
    use std::rc::{Rc, Weak};
    use std::task::{RawWaker, RawWakerVTable, Waker};

    /// Wakes a fiber by moving it to the tail of the driver's ready queue.
    pub(crate) struct FiberWaker {
        driver: Weak<Driver>,
        id: FiberId,
    }

    impl FiberWaker {
        pub fn new(driver: Weak<Driver>, id: FiberId) -> Self {
            Self { driver, id }
        }
    }

    impl RcWake for FiberWaker {
        fn wake_by_ref(self: &Rc<Self>) {
            if let Some(driver) = self.driver.upgrade() {
                driver.schedule(self.id);
            }
        }
    }

    pub(crate) trait RcWake {
        fn wake_by_ref(self: &Rc<Self>);

        fn wake(self: Rc<Self>) {
            self.wake_by_ref()
        }

        fn into_waker(self: Rc<Self>) -> Waker
        where
            Self: Sized,
        {
            unsafe { Waker::from_raw(raw_waker(self)) }
        }
    }

    fn raw_waker<W>(w: Rc<W>) -> RawWaker
    where
        W: RcWake,
    {
        RawWaker::new(Rc::into_raw(w).cast(), raw_waker_vt::<W>())
    }

    fn raw_waker_vt<W>() -> &'static RawWakerVTable
    where
        W: RcWake,
    {
        &RawWakerVTable::new(
            raw_clone::<W>,
            raw_wake::<W>,
            raw_wake_by_ref::<W>,
            raw_drop::<W>,
        )
    }

    unsafe fn raw_clone<W>(data: *const ()) -> RawWaker
    where
        W: RcWake,
    {
        // ManuallyDrop means don't touch the refcount for the current reference
        let rc = ManuallyDrop::new(Rc::from_raw(data.cast::<W>()));
        raw_waker::<W>(Rc::clone(&rc))
    }

    unsafe fn raw_wake<W>(data: *const ())
    where
        W: RcWake,
    {
        W::wake(Rc::from_raw(data.cast::<W>()))
    }

    unsafe fn raw_wake_by_ref<W>(data: *const ())
    where
        W: RcWake,
    {
        let rc = ManuallyDrop::new(Rc::from_raw(data.cast::<W>()));
        W::wake_by_ref(&rc);
    }

    unsafe fn raw_drop<W>(data: *const ()) {
        drop(Rc::<W>::from_raw(data.cast::<W>()))
    }
}
