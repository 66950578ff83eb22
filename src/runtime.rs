//! The event loop driver.
//!
//! There is one driver per thread, installed by the outermost
//! [`run`] and shared by every nested `run` on the same thread. The driver
//! owns the ready queue, the timer heap, the I/O readiness sets, the idle
//! watchers and the end-of-tick microtask queue; one [`tick`](Driver::tick)
//! advances all of them.
//!
//! ```no_run
//! use std::time::Duration;
//! use strand::fiber;
//!
//! let total = strand::run(async {
//!     let a = fiber::spawn(async { 1 });
//!     let b = fiber::spawn(async {
//!         fiber::sleep(Duration::from_millis(10)).await;
//!         2
//!     });
//!     a.join().await.unwrap() + b.join().await.unwrap()
//! })
//! .unwrap();
//! assert_eq!(total, 3);
//! ```

pub mod context;
pub(crate) mod poller;
pub(crate) mod timer;

pub use context::{Context, ContextKey};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fiber::waker::{FiberWaker, RcWake};
use crate::fiber::{FiberId, JoinHandle};
use crate::time::min_deadline;

pub(crate) use poller::Direction;

const DEFAULT_PREEMPTION_BUDGET: Duration = Duration::from_millis(20);

// upper bound on a single readiness wait, so a stale far-future deadline
// cannot park the loop for good
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

thread_local! {
    static DRIVER: RefCell<Option<Rc<Driver>>> = const { RefCell::new(None) };
}

pub(crate) fn driver() -> Option<Rc<Driver>> {
    DRIVER.with(|d| d.borrow().clone())
}

pub(crate) fn with_driver<R>(f: impl FnOnce(&Rc<Driver>) -> R) -> Result<R> {
    match driver() {
        Some(d) => Ok(f(&d)),
        None => Err(Error::NoRuntime),
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberCell
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct FiberCell {
    // None while the fiber is being polled
    task: Option<Pin<Box<dyn Future<Output = ()>>>>,
    context: Context,
    name: String,
    queued: bool,
    // woken while running; re-queued after its poll returns
    repoll: bool,
    resumed_at: Instant,
    // number of times this fiber has been resumed
    csw: u64,
    deferred: Vec<Box<dyn FnOnce()>>,
    // set while the fiber is parked in `join` on another fiber
    awaiting: Option<FiberId>,
    // publishes the Deadlock result if the fiber is torn down by the runtime
    on_abort: Option<Box<dyn FnOnce()>>,
}

struct IdleEntry {
    token: u64,
    deadline: Instant,
    waker: Waker,
}

////////////////////////////////////////////////////////////////////////////////
// Driver
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Driver {
    fibers: RefCell<HashMap<FiberId, FiberCell>>,
    ready: RefCell<VecDeque<FiberId>>,
    timers: RefCell<timer::TimerQueue>,
    io: RefCell<poller::IoWaiters>,
    idle: RefCell<Vec<IdleEntry>>,
    microtasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    // stack of contexts driven by nested `run`s; the innermost is current
    contexts: RefCell<Vec<Context>>,
    current: Cell<Option<FiberId>>,
    next_fiber: Cell<u64>,
    next_idle_token: Cell<u64>,
    preemption_budget: Cell<Duration>,
}

impl Driver {
    fn new(preemption_budget: Duration) -> Rc<Self> {
        Rc::new(Self {
            fibers: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            timers: RefCell::new(timer::TimerQueue::new()),
            io: RefCell::new(poller::IoWaiters::new()),
            idle: RefCell::new(Vec::new()),
            microtasks: RefCell::new(VecDeque::new()),
            contexts: RefCell::new(Vec::new()),
            current: Cell::new(None),
            next_fiber: Cell::new(1),
            next_idle_token: Cell::new(0),
            preemption_budget: Cell::new(preemption_budget),
        })
    }

    ////////////////////////////////////////////////////////////////////////////
    // fiber bookkeeping
    ////////////////////////////////////////////////////////////////////////////

    pub(crate) fn allocate_fiber_id(&self) -> FiberId {
        let id = self.next_fiber.get();
        self.next_fiber.set(id + 1);
        FiberId(id)
    }

    pub(crate) fn insert_fiber(
        &self,
        id: FiberId,
        context: Context,
        name: String,
        task: Pin<Box<dyn Future<Output = ()>>>,
        on_abort: Box<dyn FnOnce()>,
    ) {
        let now = Instant::now();
        context.add_fiber(id, now);
        self.fibers.borrow_mut().insert(
            id,
            FiberCell {
                task: Some(task),
                context,
                name,
                queued: false,
                repoll: false,
                resumed_at: now,
                csw: 0,
                deferred: Vec::new(),
                awaiting: None,
                on_abort: Some(on_abort),
            },
        );
        self.schedule(id);
    }

    /// Moves a fiber to the tail of the ready queue. Waking a fiber that is
    /// mid-poll marks it for an immediate re-poll instead; waking a dead
    /// fiber is a no-op.
    pub(crate) fn schedule(&self, id: FiberId) {
        {
            let mut fibers = self.fibers.borrow_mut();
            let Some(cell) = fibers.get_mut(&id) else {
                return;
            };
            if cell.task.is_none() {
                cell.repoll = true;
                return;
            }
            if cell.queued {
                return;
            }
            cell.queued = true;
        }
        self.ready.borrow_mut().push_back(id);
    }

    pub(crate) fn current_fiber(&self) -> Option<FiberId> {
        self.current.get()
    }

    pub(crate) fn current_context(&self) -> Option<Context> {
        if let Some(id) = self.current.get() {
            if let Some(cell) = self.fibers.borrow().get(&id) {
                return Some(cell.context.clone());
            }
        }
        self.contexts.borrow().last().cloned()
    }

    /// `(fiber, resume count)` of the running fiber; the pair identifies a
    /// single uninterrupted stretch of execution.
    pub(crate) fn current_resume_mark(&self) -> Option<(FiberId, u64)> {
        let id = self.current.get()?;
        let fibers = self.fibers.borrow();
        fibers.get(&id).map(|cell| (id, cell.csw))
    }

    pub(crate) fn fiber_csw(&self, id: FiberId) -> u64 {
        self.fibers.borrow().get(&id).map(|c| c.csw).unwrap_or(0)
    }

    /// Wall time the running fiber has held the thread since its resume.
    pub(crate) fn current_running_for(&self) -> Option<Duration> {
        let id = self.current.get()?;
        let fibers = self.fibers.borrow();
        fibers.get(&id).map(|cell| cell.resumed_at.elapsed())
    }

    pub(crate) fn preemption_budget(&self) -> Duration {
        self.preemption_budget.get()
    }

    pub(crate) fn mark_awaiting(&self, id: FiberId, target: FiberId) {
        if let Some(cell) = self.fibers.borrow_mut().get_mut(&id) {
            cell.awaiting = Some(target);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // deferred cleanup
    ////////////////////////////////////////////////////////////////////////////

    pub(crate) fn push_deferred(&self, f: Box<dyn FnOnce()>) -> Result<()> {
        let id = self.current.get().ok_or(Error::NoRuntime)?;
        let mut fibers = self.fibers.borrow_mut();
        let cell = fibers.get_mut(&id).ok_or(Error::NoRuntime)?;
        cell.deferred.push(f);
        Ok(())
    }

    /// Runs the current fiber's deferred callbacks, LIFO, including the ones
    /// they register themselves. A panicking callback goes to the exception
    /// log and the rest still run.
    pub(crate) fn drain_current_deferred(&self) {
        let Some(id) = self.current.get() else {
            return;
        };
        loop {
            let next = {
                let mut fibers = self.fibers.borrow_mut();
                match fibers.get_mut(&id) {
                    Some(cell) => cell.deferred.pop(),
                    None => None,
                }
            };
            let Some(f) = next else { break };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                log::error!(
                    "deferred callback panicked: {}",
                    crate::fiber::PanicPayload::new(payload)
                );
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // parking surfaces
    ////////////////////////////////////////////////////////////////////////////

    pub(crate) fn enqueue_microtask(&self, f: Box<dyn FnOnce()>) {
        self.microtasks.borrow_mut().push_back(f);
    }

    pub(crate) fn register_timer(&self, deadline: Instant, waker: &Waker) {
        self.timers.borrow_mut().register(deadline, waker);
    }

    pub(crate) fn register_io(&self, direction: Direction, fd: RawFd, waker: &Waker) -> u64 {
        self.io.borrow_mut().register(direction, fd, waker)
    }

    pub(crate) fn remove_io(&self, direction: Direction, fd: RawFd, token: u64) {
        self.io.borrow_mut().remove(direction, fd, token);
    }

    pub(crate) fn io_pending(&self, direction: Direction, fd: RawFd, token: u64) -> bool {
        self.io.borrow().pending(direction, fd, token)
    }

    pub(crate) fn register_idle(&self, deadline: Instant, waker: &Waker) -> u64 {
        let token = self.next_idle_token.get();
        self.next_idle_token.set(token + 1);
        self.idle.borrow_mut().push(IdleEntry {
            token,
            deadline,
            waker: waker.clone(),
        });
        token
    }

    pub(crate) fn remove_idle(&self, token: u64) {
        self.idle.borrow_mut().retain(|e| e.token != token);
    }

    pub(crate) fn idle_pending(&self, token: u64) -> bool {
        self.idle.borrow().iter().any(|e| e.token == token)
    }

    ////////////////////////////////////////////////////////////////////////////
    // the tick
    ////////////////////////////////////////////////////////////////////////////

    /// One step of the event loop: resume one ready fiber, or service timers,
    /// wake idle watchers and perform a single readiness wait. Microtasks
    /// drain at the end of every tick.
    fn tick(self: &Rc<Self>) {
        let next = self.ready.borrow_mut().pop_front();
        if let Some(id) = next {
            self.poll_fiber(id);
            self.drain_microtasks();
            return;
        }

        let now = Instant::now();
        self.timers.borrow_mut().service(now);
        if !self.ready.borrow().is_empty() {
            self.drain_microtasks();
            return;
        }

        // The loop is about to block: give idle watchers their shot. Watchers
        // whose deadline elapsed fire regardless.
        let pending_io = self.io.borrow().has_fds();
        let pending_timers = !self.timers.borrow().is_empty();
        {
            let mut idle = self.idle.borrow_mut();
            if pending_io || pending_timers {
                for entry in idle.drain(..) {
                    entry.waker.wake();
                }
            } else {
                idle.retain(|entry| {
                    if entry.deadline <= now {
                        entry.waker.wake_by_ref();
                        false
                    } else {
                        true
                    }
                });
            }
        }
        if !self.ready.borrow().is_empty() {
            self.drain_microtasks();
            return;
        }

        // single readiness wait over R ∪ W with the nearest deadline
        let timer_deadline = self.timers.borrow().next_deadline();
        let idle_deadline = self.idle.borrow().iter().map(|e| e.deadline).min();
        let has_fds = self.io.borrow().has_fds();
        if has_fds || timer_deadline.is_some() || idle_deadline.is_some() {
            let deadline = min_deadline(timer_deadline, idle_deadline);
            let timeout = deadline
                .map(|d| d.saturating_duration_since(now))
                .unwrap_or(MAX_POLL_WAIT)
                .min(MAX_POLL_WAIT);
            self.io.borrow_mut().wait(timeout);
            self.drain_microtasks();
            return;
        }

        // nothing to run, nothing to wait for
        if !self.fibers.borrow().is_empty() {
            self.deadlock_scan();
        }
        self.drain_microtasks();
    }

    fn poll_fiber(self: &Rc<Self>, id: FiberId) {
        let mut task = {
            let mut fibers = self.fibers.borrow_mut();
            let Some(cell) = fibers.get_mut(&id) else {
                // woken and then torn down before its turn
                return;
            };
            cell.queued = false;
            let Some(task) = cell.task.take() else {
                return;
            };
            cell.resumed_at = Instant::now();
            cell.csw += 1;
            cell.awaiting = None;
            task
        };

        let waker = Rc::new(FiberWaker::new(Rc::downgrade(self), id)).into_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        let previous = self.current.replace(Some(id));
        let poll = task.as_mut().poll(&mut cx);
        self.current.set(previous);

        match poll {
            Poll::Ready(()) => self.finish_fiber(id),
            Poll::Pending => {
                let repoll = {
                    let mut fibers = self.fibers.borrow_mut();
                    match fibers.get_mut(&id) {
                        Some(cell) => {
                            cell.task = Some(task);
                            std::mem::take(&mut cell.repoll)
                        }
                        None => false,
                    }
                };
                if repoll {
                    self.schedule(id);
                }
            }
        }
    }

    /// Normal completion: the task wrapper has already drained the deferred
    /// stack and published the result.
    fn finish_fiber(&self, id: FiberId) {
        let Some(cell) = self.fibers.borrow_mut().remove(&id) else {
            return;
        };
        debug_assert!(cell.deferred.is_empty());
        cell.context.remove_fiber(id);
    }

    ////////////////////////////////////////////////////////////////////////////
    // deadlock detection
    ////////////////////////////////////////////////////////////////////////////

    /// Called when every queue and wait set is empty yet live fibers remain:
    /// nothing external can resume anyone. Fibers forming an await cycle are
    /// failed with a deadlock error; with no cycle, every blocked fiber is.
    fn deadlock_scan(&self) {
        let (blocked, edges) = {
            let fibers = self.fibers.borrow();
            let mut blocked: Vec<FiberId> = Vec::new();
            let mut edges: HashMap<FiberId, FiberId> = HashMap::new();
            for (&id, cell) in fibers.iter() {
                // a fiber mid-poll (nested `run`) can still make progress
                if cell.task.is_none() || cell.queued {
                    continue;
                }
                blocked.push(id);
                if let Some(target) = cell.awaiting {
                    edges.insert(id, target);
                }
            }
            (blocked, edges)
        };
        if blocked.is_empty() {
            return;
        }

        let mut victims = cycle_members(&blocked, &edges);
        if victims.is_empty() {
            victims = blocked;
        }
        victims.sort_unstable();
        log::warn!(
            "deadlock detected: failing {} blocked fiber(s) with no external resumer",
            victims.len()
        );

        // Tear all victims down before publishing any result, so a victim
        // never observes another victim's error instead of its own.
        let mut aborted = Vec::with_capacity(victims.len());
        for id in victims {
            let Some(mut cell) = self.fibers.borrow_mut().remove(&id) else {
                continue;
            };
            if let Some(task) = cell.task.take() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| drop(task))) {
                    log::error!(
                        "fiber '{}' panicked during deadlock teardown: {}",
                        cell.name,
                        crate::fiber::PanicPayload::new(payload)
                    );
                }
            }
            while let Some(f) = cell.deferred.pop() {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                    log::error!(
                        "deferred callback panicked: {}",
                        crate::fiber::PanicPayload::new(payload)
                    );
                }
            }
            aborted.push((id, cell));
        }
        for (id, mut cell) in aborted {
            if let Some(abort) = cell.on_abort.take() {
                abort();
            }
            cell.context.remove_fiber(id);
        }
    }

    fn drain_microtasks(&self) {
        loop {
            let next = self.microtasks.borrow_mut().pop_front();
            match next {
                Some(f) => f(),
                None => break,
            }
        }
    }
}

/// Fibers lying on a cycle of `awaiting` edges. Each fiber has at most one
/// outgoing edge, so a simple colored walk suffices.
fn cycle_members(blocked: &[FiberId], edges: &HashMap<FiberId, FiberId>) -> Vec<FiberId> {
    let mut members = Vec::new();
    // 0 = unvisited, walk id otherwise; u64::MAX = fully explored
    let mut mark: HashMap<FiberId, u64> = HashMap::new();
    let mut walk = 0u64;

    let mut order: Vec<FiberId> = blocked.to_vec();
    order.sort_unstable();
    for &start in &order {
        if mark.contains_key(&start) {
            continue;
        }
        walk += 1;
        let mut path = Vec::new();
        let mut node = start;
        loop {
            match mark.get(&node) {
                Some(&m) if m == walk => {
                    // found a cycle: everything from `node`'s position on
                    let pos = path.iter().position(|&n| n == node).unwrap();
                    members.extend_from_slice(&path[pos..]);
                    break;
                }
                Some(_) => break,
                None => {
                    mark.insert(node, walk);
                    path.push(node);
                    match edges.get(&node) {
                        // only edges into still-blocked fibers can be stuck
                        Some(&next) if edges.contains_key(&next) || blocked.contains(&next) => {
                            node = next;
                        }
                        _ => break,
                    }
                }
            }
        }
        for n in path {
            mark.insert(n, u64::MAX);
        }
    }
    members
}

////////////////////////////////////////////////////////////////////////////////
// Runtime
////////////////////////////////////////////////////////////////////////////////

/// Configuration for the event loop installed by the outermost
/// [`run`](Runtime::run) on a thread.
#[derive(Debug, Clone)]
pub struct Runtime {
    preemption_budget: Duration,
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            preemption_budget: DEFAULT_PREEMPTION_BUDGET,
        }
    }

    /// Wall time a fiber may hold the thread before
    /// [`preempt`](crate::fiber::preempt) yields. Default 20 ms.
    ///
    /// A nested `run` shares the already-installed driver, so only the
    /// outermost `run` on a thread applies its budget.
    pub fn preemption_budget(mut self, budget: Duration) -> Self {
        self.preemption_budget = budget;
        self
    }

    /// Creates a context, spawns `fut` as its root fiber and drives the event
    /// loop until the context is terminal, i.e. until the root fiber *and
    /// every fiber spawned within the context* have finished.
    ///
    /// A panic that escaped a fiber nobody awaited is re-raised to the
    /// caller; if several occurred, the first is re-raised and the rest were
    /// logged. Returns [`Error::Deadlock`] when the fibers of the context
    /// could only be torn down by the deadlock scan.
    ///
    /// Calling `run` from inside a fiber creates a nested context: other
    /// fibers keep running while the calling fiber is blocked until the
    /// nested context is terminal.
    pub fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (driver, _guard) = match driver() {
            Some(driver) => (driver, None),
            None => {
                let driver = Driver::new(self.preemption_budget);
                DRIVER.with(|d| *d.borrow_mut() = Some(driver.clone()));
                (driver, Some(DriverGuard))
            }
        };

        let context = Context::new();
        context.activate()?;
        driver.contexts.borrow_mut().push(context.clone());

        let spawned = crate::fiber::Builder::new()
            .name("main")
            .spawn_with(&driver, &context, fut);
        let handle: JoinHandle<F::Output> = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                driver.contexts.borrow_mut().pop();
                return Err(e);
            }
        };

        while !context.is_terminal() {
            driver.tick();
        }
        driver.contexts.borrow_mut().pop();

        if let Some(unhandled) = context.take_unhandled() {
            match unhandled {
                context::Unhandled::Panic(payload) => payload.resume(),
                context::Unhandled::Deadlock => return Err(Error::Deadlock),
            }
        }

        match handle.take_result() {
            Ok(value) => Ok(value),
            Err(crate::fiber::JoinError::Deadlock) => Err(Error::Deadlock),
            Err(crate::fiber::JoinError::Panicked(payload)) => payload.resume(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

struct DriverGuard;

impl Drop for DriverGuard {
    fn drop(&mut self) {
        DRIVER.with(|d| *d.borrow_mut() = None);
    }
}

/// Runs `fut` to completion on this thread's event loop with the default
/// configuration. See [`Runtime::run`].
pub fn run<F>(fut: F) -> Result<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Runtime::new().run(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber;
    use std::rc::Rc;

    #[test]
    fn run_returns_root_value() {
        assert_eq!(run(async { 40 + 2 }).unwrap(), 42);
    }

    #[test]
    fn run_waits_for_every_spawned_fiber() {
        let done = Rc::new(Cell::new(false));
        let seen = done.clone();
        run(async move {
            fiber::spawn(async move {
                fiber::sleep(Duration::from_millis(20)).await;
                seen.set(true);
            });
            // root returns immediately; run must still wait
        })
        .unwrap();
        assert!(done.get());
    }

    #[test]
    fn nested_run_blocks_only_the_caller() {
        let result = run(async {
            let outer = fiber::spawn(async {
                fiber::sleep(Duration::from_millis(10)).await;
                "outer"
            });
            let inner = Runtime::new()
                .run(async {
                    fiber::sleep(Duration::from_millis(30)).await;
                    "inner"
                })
                .unwrap();
            // the outer fiber finished while the nested context was running
            assert!(outer.is_finished());
            let outer = outer.join().await.unwrap();
            (inner, outer)
        })
        .unwrap();
        assert_eq!(result, ("inner", "outer"));
    }

    #[test]
    fn fiber_spawned_into_the_parent_context_outlives_a_nested_run() {
        run(async {
            let parent = Context::current().unwrap();
            let handle = Runtime::new()
                .run(async move {
                    // belongs to the parent: the nested context does not
                    // wait for it
                    fiber::Builder::new()
                        .context(&parent)
                        .spawn(async {
                            fiber::sleep(Duration::from_millis(20)).await;
                            7
                        })
                        .unwrap()
                })
                .unwrap();
            assert!(!handle.is_finished());
            assert_eq!(handle.join().await.unwrap(), 7);
        })
        .unwrap();
    }

    #[test]
    fn spawn_outside_runtime_fails() {
        let err = fiber::Builder::new()
            .spawn(async {})
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, Error::NoRuntime);
    }

    #[test]
    fn context_is_single_use() {
        let context = Context::new();
        context.activate().unwrap();
        assert_eq!(context.activate().unwrap_err(), Error::ContextReused);
    }

    #[test]
    fn context_store_by_scalar_and_identity() {
        run(async {
            let context = Context::current().unwrap();
            context.set(1i64, "one".to_string());
            context.set("greeting", 7u32);
            let shared = Rc::new(());
            context.set(ContextKey::identity(&shared), vec![1u8, 2, 3]);

            assert_eq!(context.get::<String>(1i64).unwrap(), "one");
            assert_eq!(context.get::<u32>("greeting").unwrap(), 7);
            assert_eq!(
                context.get::<Vec<u8>>(ContextKey::identity(&shared)).unwrap(),
                vec![1, 2, 3]
            );
            assert!(!context.contains("missing"));
            assert_eq!(context.take::<u32>("greeting"), Some(7));
            assert!(!context.contains("greeting"));
        })
        .unwrap();
    }

    #[test]
    fn channel_deadlock_is_detected() {
        let result = run(async {
            let (tx, rx) = crate::fiber::channel::channel::<i32>(0);
            fiber::spawn(async move {
                // parked forever: the only sender is kept alive inside
                // this very fiber and never sends
                let _keep = tx;
                rx.recv().await;
            });
        });
        assert_eq!(result.unwrap_err(), Error::Deadlock);
    }
}
