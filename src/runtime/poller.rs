//! Readiness wait over `poll(2)`.
//!
//! The driver performs at most one readiness wait per tick, covering every
//! handle some fiber is parked on plus a timeout derived from the nearest
//! timer or idle deadline. Error conditions (`POLLERR`, `POLLHUP`,
//! `POLLNVAL`) wake the parked fiber too, so that a handle closed behind the
//! runtime's back is reported by the fiber's next syscall instead of leaving
//! it parked forever.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::task::Waker;
use std::time::Duration;

use crate::fiber::select::WaiterList;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

pub(crate) struct IoWaiters {
    read: HashMap<RawFd, WaiterList>,
    write: HashMap<RawFd, WaiterList>,
}

impl IoWaiters {
    pub fn new() -> Self {
        Self {
            read: HashMap::new(),
            write: HashMap::new(),
        }
    }

    fn map(&mut self, direction: Direction) -> &mut HashMap<RawFd, WaiterList> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    pub fn register(&mut self, direction: Direction, fd: RawFd, waker: &Waker) -> u64 {
        self.map(direction).entry(fd).or_default().register(waker)
    }

    pub fn remove(&mut self, direction: Direction, fd: RawFd, token: u64) {
        let map = self.map(direction);
        if let Some(list) = map.get_mut(&fd) {
            list.remove(token);
            if list.is_empty() {
                map.remove(&fd);
            }
        }
    }

    /// Whether `token` is still parked on `fd`. A drained registration means
    /// the readiness wait reported the handle.
    pub fn pending(&self, direction: Direction, fd: RawFd, token: u64) -> bool {
        let map = match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        };
        map.get(&fd).is_some_and(|list| list.contains(token))
    }

    pub fn has_fds(&self) -> bool {
        !self.read.is_empty() || !self.write.is_empty()
    }

    /// One readiness wait over every registered handle. Wakes the waiters of
    /// each handle that became ready (or failed) within `timeout`.
    pub fn wait(&mut self, timeout: Duration) {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(self.read.len() + self.write.len());
        for &fd in self.read.keys() {
            pollfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        for &fd in self.write.keys() {
            if let Some(slot) = pollfds.iter_mut().find(|p| p.fd == fd) {
                slot.events |= libc::POLLOUT;
            } else {
                pollfds.push(libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                });
            }
        }

        let timeout_ms = if timeout.is_zero() {
            0
        } else {
            // round sub-millisecond remainders up so we never spin
            let ms = timeout.as_millis();
            ms.clamp(1, i32::MAX as u128) as i32
        };

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::error!("readiness wait failed: {err}");
            }
            return;
        }
        if rc == 0 {
            return;
        }

        const FAILURE: libc::c_short = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
        for pollfd in &pollfds {
            if pollfd.revents & (libc::POLLIN | FAILURE) != 0 {
                if let Some(mut list) = self.read.remove(&pollfd.fd) {
                    list.wake_all();
                }
            }
            if pollfd.revents & (libc::POLLOUT | FAILURE) != 0 {
                if let Some(mut list) = self.write.remove(&pollfd.fd) {
                    list.wake_all();
                }
            }
        }
    }
}
