//! Timer heap: fibers parked in [`sleep`](crate::fiber::sleep) and idle
//! watchers with a maximum deadline.
//!
//! Entries fire in deadline order; entries with equal deadlines fire in
//! insertion order.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::task::Waker;
use std::time::Instant;

pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

struct TimerEntry {
    deadline: Instant,
    // insertion order breaks deadline ties
    seq: u64,
    waker: Waker,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn register(&mut self, deadline: Instant, waker: &Waker) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline,
            seq,
            waker: waker.clone(),
        }));
    }

    /// Wakes every entry with `deadline <= now`. Returns how many fired.
    pub fn service(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            entry.waker.wake();
            fired += 1;
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::waker::RcWake;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    fn counting_waker() -> (Waker, Rc<Cell<usize>>) {
        struct Count(Rc<Cell<usize>>);
        impl RcWake for Count {
            fn wake_by_ref(self: &Rc<Self>) {
                self.0.set(self.0.get() + 1);
            }
        }
        let count = Rc::new(Cell::new(0));
        (Rc::new(Count(count.clone())).into_waker(), count)
    }

    #[test]
    fn fires_in_deadline_order_with_fifo_ties() {
        let (waker, _count) = counting_waker();
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let later = now + Duration::from_secs(1);

        // two entries share a deadline, one comes earlier
        q.register(later, &waker);
        q.register(now, &waker);
        q.register(later, &waker);

        assert_eq!(q.next_deadline(), Some(now));
        assert_eq!(q.service(now), 1);
        assert_eq!(q.next_deadline(), Some(later));
        assert_eq!(q.service(later), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn service_wakes_only_due_entries() {
        let (waker, count) = counting_waker();
        let mut q = TimerQueue::new();
        let now = Instant::now();
        q.register(now, &waker);
        q.register(now + Duration::from_secs(5), &waker);
        assert_eq!(q.service(now), 1);
        assert_eq!(count.get(), 1);
        assert!(!q.is_empty());
    }
}
