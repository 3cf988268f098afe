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

//! Signal handling.
//!
//! `SIGTERM` and `SIGINT` flip the process-wide need-exit flag and poke the
//! supervisor's wakeup channel so the event loop leaves its readiness wait.
//! `SIGCHLD` reaps finished children on the spot.  Handler bodies are
//! restricted to async-signal-safe work: an atomic store, a single
//! `write(2)` of a fixed-size value, and a `WNOHANG` wait loop that
//! preserves `errno`.

use crate::wakeup;
use lazy_static::lazy_static;
use signal_hook::consts::signal::{SIGCHLD, SIGINT, SIGTERM};
use signal_hook::low_level;
use signal_hook::SigId;
use std::io::Error;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

static NEED_EXIT: AtomicBool = AtomicBool::new(false);

/// Raw fd of the supervisor's wakeup channel, for use from signal context.
static TERMINATOR_FD: AtomicI32 = AtomicI32::new(-1);

lazy_static! {
    static ref SIG_IDS: Mutex<Vec<SigId>> = Mutex::new(Vec::new());
}

pub fn need_exit() -> bool {
    NEED_EXIT.load(Ordering::SeqCst)
}

pub fn set_need_exit() {
    NEED_EXIT.store(true, Ordering::SeqCst);
}

#[cfg(test)]
pub fn reset_need_exit() {
    NEED_EXIT.store(false, Ordering::SeqCst);
}

/// Installs the termination and child-reaping handlers, pointing the
/// termination path at `wakeup_fd`.  Registration happens once per
/// process; later calls merely retarget the wakeup fd.
pub fn install(wakeup_fd: std::os::unix::io::RawFd) -> Result<(), Error> {
    TERMINATOR_FD.store(wakeup_fd, Ordering::SeqCst);

    let mut ids = SIG_IDS.lock().unwrap();
    if !ids.is_empty() {
        return Ok(());
    }
    for signal in [SIGTERM, SIGINT] {
        ids.push(unsafe { low_level::register(signal, on_terminate)? });
    }
    ids.push(unsafe { low_level::register(SIGCHLD, reap_zombies)? });
    Ok(())
}

/// Removes the handlers installed by [`install`] and forgets the wakeup
/// fd.  The supervisor calls this before closing the wakeup channel.
pub fn uninstall() {
    let mut ids = SIG_IDS.lock().unwrap();
    for id in ids.drain(..) {
        low_level::unregister(id);
    }
    TERMINATOR_FD.store(-1, Ordering::SeqCst);
}

fn on_terminate() {
    NEED_EXIT.store(true, Ordering::SeqCst);
    let fd = TERMINATOR_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        wakeup::signal_raw(fd);
    }
}

/// Reaps finished children without blocking until none are left, keeping
/// `errno` unchanged for whatever syscall the signal interrupted.
pub fn reap_zombies() {
    unsafe {
        let errno = *libc::__errno_location();
        loop {
            let mut status = 0;
            if libc::waitpid(-1, &mut status as *mut libc::c_int, libc::WNOHANG) < 1 {
                break;
            }
        }
        *libc::__errno_location() = errno;
    }
}
