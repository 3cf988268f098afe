/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! Wakeup primitives: the counting semaphore each state machine blocks on,
//! and the eventfd-backed channel that breaks the event loop out of its
//! readiness wait from signal context.

use crate::sys;
use std::io::Error;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Condvar, Mutex};

/// A counting semaphore.
///
/// Each state machine waits on one of these; `set_state` posts it after
/// every write of the state value, so the post count matches the number of
/// pending observations.  There is exactly one waiter per semaphore.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: u32) -> Semaphore {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    /// Blocks until the count is positive, then consumes one unit.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Consumes one unit if the count is positive, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            false
        } else {
            *count -= 1;
            true
        }
    }
}

/// The wakeup channel: an eventfd the event loop includes in its readiness
/// set.  Signal handlers write to it; the event loop drains it and exits.
pub struct WakeupFd(OwnedFd);

impl WakeupFd {
    pub fn new() -> Result<WakeupFd, Error> {
        sys::eventfd().map(WakeupFd)
    }

    pub fn signal(&self) {
        signal_raw(self.0.as_raw_fd());
    }

    /// Reads the counter to clear readiness, returning the number of
    /// signals accumulated since the last drain.
    pub fn drain(&self) -> Result<u64, Error> {
        sys::eventfd_read(self.0.as_raw_fd())
    }
}

impl AsRawFd for WakeupFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Adds 1 to the eventfd counter.  Async-signal-safe: a single `write(2)`
/// of a fixed-size value, no allocation, no locking.
pub fn signal_raw(fd: RawFd) {
    let value: u64 = 1;
    unsafe {
        libc::write(
            fd,
            &value as *const u64 as *const libc::c_void,
            mem::size_of::<u64>(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn initial_count_is_consumed_without_blocking() {
        let sem = Semaphore::new(1);
        sem.wait();
    }

    #[test]
    fn post_wakes_a_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(20));
        sem.post();
        waiter.join().unwrap();
    }

    #[test]
    fn posts_accumulate() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();
        sem.wait();
        assert!(!sem.try_wait());
    }

    #[test]
    fn try_wait_does_not_block() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn wakeup_fd_signal_and_drain() {
        let wakeup = WakeupFd::new().unwrap();
        wakeup.signal();
        wakeup.signal();
        assert_eq!(wakeup.drain().unwrap(), 2);
    }
}
