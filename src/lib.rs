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

//! A small Linux process supervisor.
//!
//! `nyx` keeps a set of configured programs ("watches") alive.  Each watch is
//! driven by its own state machine running on a dedicated thread, moving
//! through the lifecycle `init → unmonitored → {starting, running, stopping,
//! stopped}` until the supervisor asks it to quit.  The main thread listens
//! on the Linux process connector (a netlink multicast feed of fork and exit
//! notifications from the kernel) and multiplexes it with an [`eventfd`]-based
//! wakeup channel, so a termination signal can break the event loop out of
//! its wait from signal context.
//!
//! The pieces fit together as follows:
//!
//!   - [`event`] opens and decodes the kernel process-event feed and runs the
//!     epoll-based event loop.
//!
//!   - [`state`] owns the per-watch lifecycle: the transition table, the
//!     transition actions, and the fork/exec spawn path.
//!
//!   - [`nyx`] is the supervisor gluing it all together: it selects the PID
//!     directory, builds one [`state::State`] per configured [`watch::Watch`],
//!     installs the signal handlers, runs the event loop and performs the
//!     orderly teardown.
//!
//! [`eventfd`]: https://man7.org/linux/man-pages/man2/eventfd.2.html

pub mod config;
pub mod event;
pub mod fs;
pub mod log;
pub mod nyx;
pub mod pidfile;
pub mod signals;
pub mod state;
pub mod sys;
pub mod wakeup;
pub mod watch;

pub use crate::nyx::{Nyx, Options};
pub use crate::watch::Watch;
